//! Async runtime around a [`Hive`].
//!
//! One task owns the hive and applies requests and events strictly in
//! arrival order. Handles talk to it over a channel; effects are either
//! turned into delayed events (timers) or passed to an [`Outbox`].
//!
//! ```text
//!   HiveHandle ──(mpsc)──► HiveRuntime::run ──► Hive
//!        ▲                        │
//!        └──── oneshot reply ─────┤
//!                                 ├──► timers ──► tokio::time::sleep ──► Event::Timer
//!                                 └──► Outbox::deliver (node commands, notifications,
//!                                                      inter-hive messages)
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hive_core::{NodeId, Status, TabletId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::error::{HiveError, HiveResult};
use crate::hive::Hive;
use crate::messages::{Effect, Event, InfoFilter, Request, Response, TabletInfo};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Where non-timer effects go.
pub trait Outbox: Send + 'static {
    fn deliver(&self, effect: Effect);
}

/// Forwards effects into a channel, for embedding and tests.
pub struct ChannelOutbox(pub mpsc::UnboundedSender<Effect>);

impl Outbox for ChannelOutbox {
    fn deliver(&self, effect: Effect) {
        if self.0.send(effect).is_err() {
            debug!("effect receiver dropped");
        }
    }
}

/// Logs effects. Used by the daemon when no node transport is attached.
pub struct LogOutbox;

impl Outbox for LogOutbox {
    fn deliver(&self, effect: Effect) {
        match &effect {
            Effect::Node { node_id, command } => info!(node_id, ?command, "node command"),
            Effect::Notify(notification) => info!(?notification, "notification"),
            Effect::Hive { hive_id, message } => info!(hive_id, ?message, "inter-hive message"),
            Effect::Timer { .. } => {}
        }
    }
}

enum Command {
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Event(Event),
}

/// Cheap, cloneable access to a running hive.
#[derive(Clone)]
pub struct HiveHandle {
    tx: mpsc::Sender<Command>,
}

impl HiveHandle {
    pub async fn request(&self, request: Request) -> HiveResult<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request { request, reply })
            .await
            .map_err(|_| HiveError::Stopped)?;
        rx.await.map_err(|_| HiveError::Stopped)
    }

    pub async fn send_event(&self, event: Event) -> HiveResult<()> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| HiveError::Stopped)
    }

    /// Snapshot of one tablet with followers, metrics and channels.
    pub async fn tablet(&self, tablet_id: TabletId) -> HiveResult<TabletInfo> {
        let filter = InfoFilter {
            tablet_id: Some(tablet_id),
            return_followers: true,
            return_metrics: true,
            return_channel_history: true,
        };
        match self.request(Request::RequestHiveInfo(filter)).await? {
            Response::HiveInfo { tablets } => tablets
                .into_iter()
                .next()
                .ok_or(HiveError::UnknownTablet(tablet_id)),
            other => Err(HiveError::Runtime(anyhow::anyhow!(
                "unexpected reply to tablet info: {other:?}"
            ))),
        }
    }

    /// Start draining a node; returns the number of replicas to move.
    pub async fn drain(&self, node_id: NodeId) -> HiveResult<Response> {
        let response = self.request(Request::DrainNode { node_id }).await?;
        if response.status_code() == Status::Error {
            return Err(HiveError::UnknownNode(node_id));
        }
        Ok(response)
    }
}

pub struct HiveRuntime<O: Outbox> {
    hive: Hive,
    outbox: O,
    rx: mpsc::Receiver<Command>,
    /// Loopback for timer events.
    tx: mpsc::Sender<Command>,
}

impl<O: Outbox> HiveRuntime<O> {
    pub fn new(hive: Hive, outbox: O) -> (Self, HiveHandle) {
        let (tx, rx) = mpsc::channel(1024);
        let handle = HiveHandle { tx: tx.clone() };
        (
            Self {
                hive,
                outbox,
                rx,
                tx,
            },
            handle,
        )
    }

    /// Apply commands until shutdown is signalled. Returns the hive so the
    /// caller can inspect or reload it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Hive {
        info!(hive_id = self.hive.hive_id(), "hive runtime started");
        // Effects produced while loading.
        self.flush();
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.apply(command);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("hive runtime shutting down");
                        break;
                    }
                }
            }
        }
        self.hive
    }

    fn apply(&mut self, command: Command) {
        let now_ms = epoch_ms();
        match command {
            Command::Request { request, reply } => {
                let response = self.hive.request(request, now_ms);
                if reply.send(response).is_err() {
                    debug!("requester went away before the reply");
                }
            }
            Command::Event(event) => self.hive.event(event, now_ms),
        }
        self.flush();
    }

    fn flush(&mut self) {
        for effect in self.hive.take_effects() {
            match effect {
                Effect::Timer { after_ms, timer } => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(after_ms)).await;
                        if tx.send(Command::Event(Event::Timer(timer))).await.is_err() {
                            debug!(?timer, "timer fired after shutdown");
                        }
                    });
                }
                other => self.outbox.deliver(other),
            }
        }
    }
}

//! Scale recommender: target-utilization node counts.

use std::collections::{HashMap, VecDeque};

use hive_core::SubDomainKey;
use hive_core::config::ScaleRecommenderConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-domain scaling policy set by `ConfigureScaleRecommender`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ScalePolicy {
    TargetTracking { target_utilization: f64 },
}

impl ScalePolicy {
    fn target(&self) -> f64 {
        match self {
            ScalePolicy::TargetTracking { target_utilization } => target_utilization.clamp(0.01, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recommendation {
    /// Not enough history yet.
    NotReady,
    Nodes { count: u32 },
}

#[derive(Debug, Default)]
struct DomainState {
    policy: Option<ScalePolicy>,
    history: VecDeque<f64>,
    last_sample_ms: u64,
}

pub struct ScaleRecommender {
    history_size: usize,
    sample_interval_ms: u64,
    default_policy: ScalePolicy,
    domains: HashMap<SubDomainKey, DomainState>,
}

impl ScaleRecommender {
    pub fn new(config: &ScaleRecommenderConfig) -> Self {
        Self {
            history_size: config.history_size.max(1),
            sample_interval_ms: config.sample_interval_ms,
            default_policy: ScalePolicy::TargetTracking {
                target_utilization: config.default_target_utilization,
            },
            domains: HashMap::new(),
        }
    }

    pub fn configure(&mut self, domain: SubDomainKey, policy: ScalePolicy) {
        debug!(%domain, ?policy, "scale recommender configured");
        self.domains.entry(domain).or_default().policy = Some(policy);
    }

    pub fn policy(&self, domain: SubDomainKey) -> ScalePolicy {
        self.domains
            .get(&domain)
            .and_then(|d| d.policy)
            .unwrap_or(self.default_policy)
    }

    /// Record the domain's average node usage. Samples closer together than
    /// the sample interval are dropped.
    pub fn record(&mut self, domain: SubDomainKey, usage: f64, now_ms: u64) {
        let history_size = self.history_size;
        let state = self.domains.entry(domain).or_default();
        if !state.history.is_empty()
            && now_ms.saturating_sub(state.last_sample_ms) < self.sample_interval_ms
        {
            return;
        }
        state.last_sample_ms = now_ms;
        state.history.push_back(usage.max(0.0));
        while state.history.len() > history_size {
            state.history.pop_front();
        }
    }

    pub fn recommend(&self, domain: SubDomainKey, current_nodes: u32) -> Recommendation {
        let Some(state) = self.domains.get(&domain) else {
            return Recommendation::NotReady;
        };
        if state.history.len() < self.history_size {
            return Recommendation::NotReady;
        }
        let usage = state.history.iter().copied().fold(0.0, f64::max);
        let target = self.policy(domain).target();
        let count = ((f64::from(current_nodes.max(1)) * usage) / target).ceil().max(1.0) as u32;
        debug!(%domain, usage, target, current_nodes, count, "scale recommendation");
        Recommendation::Nodes { count }
    }
}

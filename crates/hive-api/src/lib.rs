//! hive-api: admin and monitoring HTTP surface for a running hive.
//!
//! Every handler turns into one request on the hive's [`HiveHandle`], so
//! the API sees the same serialized view as node and client traffic.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/tablets` | All tablets with followers and usage |
//! | GET | `/api/v1/tablets/{id}` | One tablet, including channel history |
//! | POST | `/api/v1/tablets/{id}/reassign` | Move channels to other groups |
//! | GET | `/api/v1/nodes` | Node summaries |
//! | POST | `/api/v1/nodes/{id}/drain` | Drain a node |
//! | GET | `/api/v1/scale-recommendation` | Node count for the root domain |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use hive_core::SubDomainKey;
use hive_scheduler::HiveHandle;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub hive: HiveHandle,
    /// Domain the scale recommendation is computed for.
    pub root_domain: SubDomainKey,
}

/// Build the complete API router.
pub fn build_router(hive: HiveHandle, root_domain: SubDomainKey) -> Router {
    let state = ApiState { hive, root_domain };

    let api_routes = Router::new()
        .route("/tablets", get(handlers::list_tablets))
        .route("/tablets/{id}", get(handlers::get_tablet))
        .route("/tablets/{id}/reassign", post(handlers::reassign_tablet))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}/drain", post(handlers::drain_node))
        .route("/scale-recommendation", get(handlers::scale_recommendation))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}

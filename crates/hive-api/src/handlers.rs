//! REST API handlers.
//!
//! Each handler sends one request to the hive and wraps the reply in the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use hive_core::{GroupId, NodeId, Status, TabletId};
use hive_scheduler::{HiveError, InfoFilter, Request, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn hive_error(e: HiveError) -> axum::response::Response {
    let status = match e {
        HiveError::UnknownTablet(_) | HiveError::UnknownNode(_) => StatusCode::NOT_FOUND,
        HiveError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        HiveError::State(_) | HiveError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn unexpected(reply: &Response) -> axum::response::Response {
    warn!(?reply, "unexpected hive reply");
    error_response("unexpected hive reply", StatusCode::INTERNAL_SERVER_ERROR)
}

/// Outcome of a command that only reports a status.
#[derive(Serialize)]
struct StatusBody {
    status: Status,
}

// ── Tablets ────────────────────────────────────────────────────

/// GET /api/v1/tablets
pub async fn list_tablets(State(state): State<ApiState>) -> impl IntoResponse {
    let filter = InfoFilter {
        tablet_id: None,
        return_followers: true,
        return_metrics: true,
        return_channel_history: false,
    };
    match state.hive.request(Request::RequestHiveInfo(filter)).await {
        Ok(Response::HiveInfo { tablets }) => ApiResponse::ok(tablets).into_response(),
        Ok(other) => unexpected(&other),
        Err(e) => hive_error(e),
    }
}

/// GET /api/v1/tablets/{id}
pub async fn get_tablet(
    State(state): State<ApiState>,
    Path(id): Path<TabletId>,
) -> impl IntoResponse {
    match state.hive.tablet(id).await {
        Ok(info) => ApiResponse::ok(info).into_response(),
        Err(e) => hive_error(e),
    }
}

/// Reassign request body. Empty `channels` means every channel.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReassignRequest {
    pub channels: Vec<u32>,
    pub forced_groups: Vec<GroupId>,
}

/// POST /api/v1/tablets/{id}/reassign
pub async fn reassign_tablet(
    State(state): State<ApiState>,
    Path(id): Path<TabletId>,
    Json(req): Json<ReassignRequest>,
) -> impl IntoResponse {
    let request = Request::ReassignTablet {
        tablet_id: id,
        channels: req.channels,
        forced_groups: req.forced_groups,
    };
    match state.hive.request(request).await {
        Ok(Response::Forward { hive_id }) => error_response(
            &format!("tablet {id} is owned by hive {hive_id}"),
            StatusCode::MISDIRECTED_REQUEST,
        ),
        Ok(reply) => match reply.status_code() {
            status if status.is_success() => ApiResponse::ok(StatusBody { status }).into_response(),
            _ => error_response(&format!("reassign of tablet {id} rejected"), StatusCode::BAD_REQUEST),
        },
        Err(e) => hive_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.hive.request(Request::RequestNodeInfo).await {
        Ok(Response::NodeInfo { nodes }) => ApiResponse::ok(nodes).into_response(),
        Ok(other) => unexpected(&other),
        Err(e) => hive_error(e),
    }
}

#[derive(Serialize)]
struct DrainBody {
    status: Status,
    movements: usize,
}

/// POST /api/v1/nodes/{id}/drain
pub async fn drain_node(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> impl IntoResponse {
    match state.hive.drain(id).await {
        Ok(Response::Drain { status, movements }) => {
            ApiResponse::ok(DrainBody { status, movements }).into_response()
        }
        Ok(other) => unexpected(&other),
        Err(e) => hive_error(e),
    }
}

// ── Scale ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct RecommendationBody {
    status: Status,
    recommended_nodes: Option<u32>,
}

/// GET /api/v1/scale-recommendation
pub async fn scale_recommendation(State(state): State<ApiState>) -> impl IntoResponse {
    let request = Request::RequestScaleRecommendation {
        domain: state.root_domain,
    };
    match state.hive.request(request).await {
        Ok(Response::ScaleRecommendation {
            status,
            recommended_nodes,
        }) => ApiResponse::ok(RecommendationBody {
            status,
            recommended_nodes,
        })
        .into_response(),
        Ok(other) => unexpected(&other),
        Err(e) => hive_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_omits_data() {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some("boom".into()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn hive_errors_map_to_http_status() {
        assert_eq!(hive_error(HiveError::UnknownTablet(4)).status(), StatusCode::NOT_FOUND);
        assert_eq!(hive_error(HiveError::UnknownNode(4)).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            hive_error(HiveError::Stopped).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn reassign_body_defaults_to_all_channels() {
        let req: ReassignRequest = serde_json::from_str("{}").unwrap();
        assert!(req.channels.is_empty());
        assert!(req.forced_groups.is_empty());
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let resp = healthz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

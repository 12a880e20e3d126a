//! Router tests against a live hive runtime.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hive_api::build_router;
use hive_core::{ChannelBinding, HiveConfig, OwnerKey, TabletId, TabletType};
use hive_scheduler::{
    CreateTablet, Hive, HiveHandle, HiveRuntime, LogOutbox, RegisterNode, Request as HiveRequest,
    Response as HiveResponse, StorageGroupReport, epoch_ms,
};
use hive_state::StateStore;
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

struct TestHive {
    handle: HiveHandle,
    router: Router,
    _shutdown: watch::Sender<bool>,
}

fn start() -> TestHive {
    let config = HiveConfig::default();
    let root = config.root_domain;
    let hive = Hive::load(config, StateStore::open_in_memory().unwrap(), epoch_ms()).unwrap();
    let (runtime, handle) = HiveRuntime::new(hive, LogOutbox);
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(runtime.run(shutdown_rx));
    TestHive {
        router: build_router(handle.clone(), root),
        handle,
        _shutdown: shutdown,
    }
}

async fn create_tablet(handle: &HiveHandle) -> TabletId {
    handle
        .request(HiveRequest::UpdateStoragePool {
            pool: "ssd".into(),
            groups: vec![StorageGroupReport {
                group_id: 1,
                capacity: 100,
                allocated: 0,
            }],
        })
        .await
        .unwrap();
    handle
        .request(HiveRequest::RegisterNode(RegisterNode::new(1)))
        .await
        .unwrap();
    let created = handle
        .request(HiveRequest::CreateTablet(CreateTablet::new(
            OwnerKey::new(3, 1),
            TabletType::DataShard,
            vec![ChannelBinding::new("ssd")],
        )))
        .await
        .unwrap();
    match created {
        HiveResponse::CreateTablet { tablet_id, .. } => tablet_id,
        other => panic!("unexpected {other:?}"),
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, req).await
}

async fn post(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(router, req).await
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn healthz_answers() {
    let hive = start();
    let (status, body) = get(&hive.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "ok");
}

#[tokio::test]
async fn tablets_are_listed_and_fetched() {
    let hive = start();
    let tablet_id = create_tablet(&hive.handle).await;

    let (status, body) = get(&hive.router, "/api/v1/tablets").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["tablet_id"], tablet_id);

    let (status, body) = get(&hive.router, &format!("/api/v1/tablets/{tablet_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["owner"]["owner_id"], 3);
    assert!(body["data"]["channels"].is_array());

    let (status, body) = get(&hive.router, "/api/v1/tablets/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn reassign_validates_channels() {
    let hive = start();
    let tablet_id = create_tablet(&hive.handle).await;

    let uri = format!("/api/v1/tablets/{tablet_id}/reassign");
    let (status, _) = post(&hive.router, &uri, serde_json::json!({"channels": [5]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(&hive.router, &uri, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["status"] == "ok" || body["data"]["status"] == "already");
}

#[tokio::test]
async fn nodes_are_listed_and_drained() {
    let hive = start();
    create_tablet(&hive.handle).await;

    let (status, body) = get(&hive.router, "/api/v1/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["node_id"], 1);

    let (status, body) = post(&hive.router, "/api/v1/nodes/1/drain", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");

    let (status, body) = post(&hive.router, "/api/v1/nodes/1/drain", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "already");

    let (status, _) = post(&hive.router, "/api/v1/nodes/42/drain", Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scale_recommendation_needs_history() {
    let hive = start();
    let (status, body) = get(&hive.router, "/api/v1/scale-recommendation").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "not_ready");
    assert!(body["data"]["recommended_nodes"].is_null());
}

// ABOUTME: End-to-end tests of the HTTP router over in-memory stores and a fake node agent
// ABOUTME: Covers authentication, rate limiting, drain gating and the main sandbox flows

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use sandchest_api::{
    create_router, ApiKeys, AppState, DrainController, RateLimiter, RateLimits, StaticQuotas,
};
use sandchest_coordination::{LeaseManager, MemoryCoordinationStore};
use sandchest_core::ManualClock;
use sandchest_sandbox::{
    FakeNodeClient, ManagerConfig, ManagerDeps, ReplayNotifier, ReplayRecorder, SandboxManager,
};
use sandchest_storage::{MemoryObjectStore, SqliteRepository};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const KEY_A: &str = "sk_test_alpha";
const KEY_B: &str = "sk_test_bravo";
const INTERNAL_TOKEN: &str = "node-secret";

struct TestApp {
    router: Router,
    manager: SandboxManager,
    coordination: Arc<MemoryCoordinationStore>,
    drain: DrainController,
}

async fn app_with(limits: RateLimits) -> TestApp {
    let clock = ManualClock::new(1_767_225_600_000);
    let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
    let coordination = Arc::new(MemoryCoordinationStore::new(Arc::new(clock.clone())));
    let objects = Arc::new(MemoryObjectStore::new());
    let recorder = Arc::new(ReplayRecorder::new(
        coordination.clone(),
        objects.clone(),
        Arc::new(clock.clone()),
    ));
    let (notifier, _worker) = ReplayNotifier::spawn(recorder.clone());
    let manager = SandboxManager::new(
        ManagerDeps {
            repo,
            nodes: Arc::new(FakeNodeClient::new()),
            coordination: coordination.clone(),
            leases: LeaseManager::new(coordination.clone(), 60),
            objects,
            recorder,
            notifier,
            clock: Arc::new(clock.clone()),
        },
        ManagerConfig {
            flush_timeout_secs: 5,
            ..ManagerConfig::default()
        },
    );

    let mut keys = ApiKeys::new();
    keys.insert(KEY_A, "org_alpha");
    keys.insert(KEY_B, "org_bravo");
    let limiter = RateLimiter::new(
        coordination.clone(),
        Arc::new(StaticQuotas::new(limits)),
        Arc::new(clock),
    );
    let drain = DrainController::new();
    let state = AppState::new(
        manager.clone(),
        keys,
        Some(INTERNAL_TOKEN.to_string()),
        limiter,
        drain.clone(),
    );

    TestApp {
        router: create_router(state),
        manager,
        coordination,
        drain,
    }
}

async fn app() -> TestApp {
    app_with(RateLimits::default()).await
}

fn request(method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn call(&self, method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let response = self.send(request(method, uri, key, body)).await;
        let status = response.status();
        (status, json_body(response).await)
    }

    async fn add_node(&self, node_id: &str, slots: u32) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/internal/nodes/{}/heartbeat", node_id))
            .header("x-internal-token", INTERNAL_TOKEN)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "slots_total": slots }).to_string()))
            .unwrap();
        assert_eq!(self.send(request).await.status(), StatusCode::OK);
    }

    async fn create_running(&self) -> String {
        let (status, body) = self
            .call(Method::POST, "/v1/sandboxes", Some(KEY_A), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "running");
        body["sandbox_id"].as_str().unwrap().to_string()
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn json_body(response: Response) -> Value {
    let bytes = body_bytes(response).await;
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_probes_need_no_key() {
    let app = app().await;
    let (status, body) = app.call(Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, _) = app.call(Method::GET, "/readyz", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_missing_or_unknown_key_is_unauthorized() {
    let app = app().await;
    let (status, body) = app.call(Method::GET, "/v1/sandboxes", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = app
        .call(Method::GET, "/v1/sandboxes", Some("sk_test_unknown"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_without_capacity_is_queued() {
    let app = app().await;
    let (status, body) = app
        .call(
            Method::POST,
            "/v1/sandboxes",
            Some(KEY_A),
            Some(json!({ "image": "ubuntu-22.04", "profile": "small" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "queued");
    let id = body["sandbox_id"].as_str().unwrap();
    assert_eq!(body["replay_url"], format!("/v1/sandboxes/{}/replay", id));
}

#[tokio::test]
async fn test_invalid_profile_is_a_validation_error() {
    let app = app().await;
    let (status, body) = app
        .call(
            Method::POST,
            "/v1/sandboxes",
            Some(KEY_A),
            Some(json!({ "profile": "gigantic" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_sixth_create_in_a_window_is_rate_limited() {
    let app = app_with(RateLimits {
        sandbox_create_per_min: 5,
        ..RateLimits::default()
    })
    .await;

    for _ in 0..5 {
        let response = app
            .send(request(Method::POST, "/v1/sandboxes", Some(KEY_A), Some(json!({}))))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
    }

    let response = app
        .send(request(Method::POST, "/v1/sandboxes", Some(KEY_A), Some(json!({}))))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "5");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limited");
    assert!(body["retry_after"].as_u64().unwrap() >= 1);

    // Other tenants and other categories have their own counters.
    let (status, _) = app
        .call(Method::POST, "/v1/sandboxes", Some(KEY_B), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app.call(Method::GET, "/v1/sandboxes", Some(KEY_A), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_store_outage_fails_open() {
    let app = app_with(RateLimits {
        read_per_min: 1,
        ..RateLimits::default()
    })
    .await;
    app.coordination.set_unavailable(true);

    for _ in 0..3 {
        let (status, body) = app.call(Method::GET, "/v1/sandboxes", Some(KEY_A), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sandboxes"], json!([]));
    }
}

#[tokio::test]
async fn test_drain_rejects_work_but_serves_probes() {
    let app = app().await;
    app.drain.begin_drain();

    let response = app
        .send(request(Method::GET, "/v1/sandboxes", Some(KEY_A), None))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["connection"], "close");
    assert_eq!(json_body(response).await["error"], "service_unavailable");

    let (status, _) = app.call(Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.call(Method::GET, "/readyz", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "draining");
    assert_eq!(app.drain.active_connections(), 0);
}

#[tokio::test]
async fn test_heartbeat_requires_the_internal_token() {
    let app = app().await;
    let (status, _) = app
        .call(
            Method::POST,
            "/internal/nodes/node_1/heartbeat",
            None,
            Some(json!({ "slots_total": 4 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    app.add_node("node_1", 4).await;
}

#[tokio::test]
async fn test_sandbox_is_invisible_to_other_tenants() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;

    let (status, body) = app
        .call(Method::GET, &format!("/v1/sandboxes/{}", id), Some(KEY_A), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandbox_id"], id.as_str());

    let (status, body) = app
        .call(Method::GET, &format!("/v1/sandboxes/{}", id), Some(KEY_B), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_malformed_ids_are_bad_requests() {
    let app = app().await;
    let (status, body) = app
        .call(Method::GET, "/v1/sandboxes/not-an-id", Some(KEY_A), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_exec_with_shell_string_and_stream() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/v1/sandboxes/{}/exec", id),
            Some(KEY_A),
            Some(json!({ "cmd": "echo hi", "wait": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "done");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"], "sh -c echo hi\n");
    let exec_id = body["exec_id"].as_str().unwrap().to_string();

    app.manager.notifier().sync().await;
    let response = app
        .send(request(
            Method::GET,
            &format!("/v1/sandboxes/{}/exec/{}/stream", id, exec_id),
            Some(KEY_A),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains(r#""t":"stdout""#), "{}", text);
    assert!(text.contains(r#""t":"exit""#), "{}", text);
    assert!(text.contains(r#""code":0"#), "{}", text);
    assert_eq!(app.drain.active_connections(), 0);
}

#[tokio::test]
async fn test_background_exec_is_accepted() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/v1/sandboxes/{}/exec", id),
            Some(KEY_A),
            Some(json!({ "cmd": ["true"], "wait": false })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let exec_id = body["exec_id"].as_str().unwrap();

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/v1/sandboxes/{}/exec/{}", id, exec_id),
            Some(KEY_A),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exec_id"], exec_id);
}

#[tokio::test]
async fn test_files_round_trip_as_raw_bytes() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;
    let uri = format!("/v1/sandboxes/{}/files?path=/work/data.bin", id);

    let put = Request::builder()
        .method(Method::PUT)
        .uri(&uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", KEY_A))
        .body(Body::from(vec![0u8, 159, 146, 150]))
        .unwrap();
    assert_eq!(app.send(put).await.status(), StatusCode::OK);

    let response = app.send(request(Method::GET, &uri, Some(KEY_A), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, vec![0u8, 159, 146, 150]);

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/v1/sandboxes/{}/files?path=/work&list=true", id),
            Some(KEY_A),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files"][0]["name"], "data.bin");

    let (status, body) = app
        .call(Method::GET, &format!("/v1/sandboxes/{}/files", id), Some(KEY_A), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_fork_and_tree() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;

    let (status, child) = app
        .call(
            Method::POST,
            &format!("/v1/sandboxes/{}/fork", id),
            Some(KEY_A),
            Some(json!({ "ttl_seconds": 600 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(child["forked_from"], id.as_str());
    assert_eq!(child["ttl_seconds"], 600);

    let (status, tree) = app
        .call(Method::GET, &format!("/v1/sandboxes/{}/forks", id), Some(KEY_A), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["root"], id.as_str());
    assert_eq!(tree["tree"][0]["children"], json!([child["sandbox_id"]]));
    assert_eq!(tree["tree"][1]["forked_from"], id.as_str());
}

#[tokio::test]
async fn test_stop_then_public_replay_requires_opt_in() {
    let app = app().await;
    app.add_node("node_1", 4).await;
    let id = app.create_running().await;

    let (status, body) = app
        .call(Method::POST, &format!("/v1/sandboxes/{}/stop", id), Some(KEY_A), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let public_uri = format!("/v1/public/replay/{}", id);
    let (status, _) = app.call(Method::GET, &public_uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .call(
            Method::PATCH,
            &format!("/v1/sandboxes/{}", id),
            Some(KEY_A),
            Some(json!({ "replay_public": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replay_public"], true);

    let (status, body) = app.call(Method::GET, &public_uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(kinds.contains(&"sandbox.created"), "{:?}", kinds);
}

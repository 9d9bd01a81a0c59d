// End-to-end tests over the assembled router with deterministic fake
// providers standing in for the upstreams.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use chatmux_core::config::ChatmuxConfig;
use chatmux_credits::CreditLedger;
use chatmux_dispatch::provider::{DispatchError, Lease, Provider, Reply};
use chatmux_dispatch::relay::{relay_sse, RelayFault};
use chatmux_dispatch::ProviderRouter;
use chatmux_gateway::app::{build_router, AppState};
use futures_util::stream;
use serde_json::{json, Value};
use tower::util::ServiceExt;

enum Behavior {
    Json(Value),
    Stream(Vec<&'static [u8]>),
    StreamThenDrop(Vec<&'static [u8]>),
    RateLimited,
}

struct FakeProvider {
    behavior: Behavior,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn available(&self, _now: i64) -> bool {
        true
    }

    async fn acquire(&self, _now: i64) -> Result<Lease, DispatchError> {
        Ok(Lease::StaticKey)
    }

    async fn execute(
        &self,
        _lease: &Lease,
        _body: &Value,
        _endpoint: Option<&str>,
        _accept: &str,
        stream_mode: bool,
    ) -> Result<Reply, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Json(body) => {
                assert!(!stream_mode);
                let tokens = chatmux_dispatch::usage::response_tokens(body);
                Ok(Reply::Json { body: body.clone(), tokens })
            }
            Behavior::Stream(chunks) => {
                assert!(stream_mode);
                let chunks: Vec<Result<Bytes, RelayFault>> =
                    chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
                Ok(Reply::Stream(relay_sse(stream::iter(chunks))))
            }
            Behavior::StreamThenDrop(chunks) => {
                let mut items: Vec<Result<Bytes, RelayFault>> =
                    chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
                items.push(Err(RelayFault::Connection("connection reset".into())));
                Ok(Reply::Stream(relay_sse(stream::iter(items))))
            }
            Behavior::RateLimited => Err(DispatchError::RateLimited),
        }
    }

    async fn models(&self) -> Result<Value, DispatchError> {
        match &self.behavior {
            Behavior::RateLimited => Err(DispatchError::RateLimited),
            _ => Ok(json!({"object": "list", "data": [{"id": "gpt-4"}]})),
        }
    }

    async fn on_rate_limit(&self, _lease: &Lease, _now: i64) {}
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    calls: Arc<AtomicU32>,
}

fn app_with(behavior: Behavior) -> TestApp {
    let calls = Arc::new(AtomicU32::new(0));
    let provider = FakeProvider { behavior, calls: calls.clone() };
    let state = Arc::new(AppState {
        config: ChatmuxConfig::default(),
        router: ProviderRouter::new(vec![(1, Box::new(provider))]),
        ledger: CreditLedger::new(),
    });
    TestApp {
        router: build_router(state.clone()),
        state,
        calls,
    }
}

fn app_without_providers() -> TestApp {
    let state = Arc::new(AppState {
        config: ChatmuxConfig::default(),
        router: ProviderRouter::new(Vec::new()),
        ledger: CreditLedger::new(),
    });
    TestApp {
        router: build_router(state.clone()),
        state,
        calls: Arc::new(AtomicU32::new(0)),
    }
}

fn chat_request(key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/chat/completions")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let app = app_with(Behavior::Json(json!({})));
    let resp = app
        .router
        .oneshot(chat_request(None, &json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_key_is_unauthorized() {
    let app = app_with(Behavior::Json(json!({})));
    let resp = app
        .router
        .oneshot(chat_request(Some("cm-unknown"), &json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn disabled_key_is_forbidden() {
    let app = app_with(Behavior::Json(json!({})));
    let key = app.state.ledger.create("u", 10.0);
    app.state.ledger.disable(&key);

    let resp = app
        .router
        .oneshot(chat_request(Some(&key), &json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn insufficient_credits_rejects_before_dispatch() {
    let app = app_with(Behavior::Json(json!({})));
    let key = app.state.ledger.create("u", 0.000001);

    // ~1000 estimated tokens cost 0.002 credits — far above the balance.
    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hello"}]});
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(app.calls.load(Ordering::SeqCst), 0, "no upstream call may be issued");
}

#[tokio::test]
async fn non_text_content_part_is_a_bad_request() {
    let app = app_with(Behavior::Json(json!({})));
    let key = app.state.ledger.create("u", 10.0);

    let body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": [{"type": "image_url"}]}]
    });
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_streaming_relays_the_body_and_debits_actual_usage() {
    let upstream_body = json!({
        "choices": [{"message": {"role": "assistant", "content": "hello"}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
    });
    let app = app_with(Behavior::Json(upstream_body.clone()));
    let key = app.state.ledger.create("u", 1.0);

    let body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 50
    });
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, upstream_body);

    let info = app.state.ledger.info(&key).unwrap();
    assert_eq!(info.total_tokens_used, 7);
    assert!((info.credits - (1.0 - 7.0 / 500_000.0)).abs() < 1e-12);
}

#[tokio::test]
async fn streaming_relays_chunks_with_one_done_and_debits_the_estimate() {
    let app = app_with(Behavior::Stream(vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
        b"data: [DONE]\n\n",
    ]));
    let key = app.state.ledger.create("u", 1.0);

    let body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "hello"}],
        "max_tokens": 40,
        "stream": true
    });
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");

    let bytes = body_bytes(resp).await;
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.contains("\"content\":\"he\""));
    assert!(text.contains("\"content\":\"llo\""));
    assert_eq!(text.matches("data: [DONE]").count(), 1);

    // Estimate: 5 chars / 4 = 1 message token, plus the 40-token budget.
    let info = app.state.ledger.info(&key).unwrap();
    assert_eq!(info.total_tokens_used, 41);
    assert!((info.credits - (1.0 - 41.0 / 500_000.0)).abs() < 1e-12);
}

#[tokio::test]
async fn mid_stream_fault_becomes_an_inband_error_frame() {
    let app = app_with(Behavior::StreamThenDrop(vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
    ]));
    let key = app.state.ledger.create("u", 1.0);

    let body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 10,
        "stream": true
    });
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body_bytes(resp).await;
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.contains("\"content\":\"partial\""));
    assert!(text.contains("\"type\":\"connection_error\""));
    assert!(text.contains("\"code\":503"));
    assert_eq!(text.matches("data: [DONE]").count(), 1);
}

#[tokio::test]
async fn rate_limit_exhaustion_maps_to_429() {
    let app = app_with(Behavior::RateLimited);
    let key = app.state.ledger.create("u", 10.0);

    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn no_provider_maps_to_503() {
    let app = app_without_providers();
    let key = app.state.ledger.create("u", 10.0);

    let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    let resp = app.router.oneshot(chat_request(Some(&key), &body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn models_require_a_valid_key() {
    let app = app_with(Behavior::Json(json!({})));
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let key = app.state.ledger.create("u", 1.0);
    let resp = app
        .router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/models")
                .header("authorization", format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"][0]["id"], "gpt-4");
}

#[tokio::test]
async fn key_admin_lifecycle() {
    let app = app_with(Behavior::Json(json!({})));

    // Create.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/api-keys")
                .header("content-type", "application/json")
                .body(Body::from(json!({"initial_credits": 2.5}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = body_json(resp).await;
    let key = created["key"].as_str().unwrap().to_string();
    assert!(key.starts_with("cm-"));
    assert_eq!(created["credits"], 2.5);
    assert_eq!(created["enabled"], true);

    // Balance.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/balance")
                .header("authorization", format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let balance = body_json(resp).await;
    assert_eq!(balance["credits"], 2.5);
    assert_eq!(balance["total_tokens_used"], 0);

    // Top-up rejects non-positive amounts.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/add-credits")
                .header("authorization", format!("Bearer {key}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({"amount": -1.0}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Top-up.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/add-credits")
                .header("authorization", format!("Bearer {key}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({"amount": 1.5}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.state.ledger.info(&key).unwrap().credits, 4.0);

    // Disable, then enable.
    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/disable")
                .header("authorization", format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!app.state.ledger.info(&key).unwrap().enabled);

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/enable")
                .header("authorization", format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(app.state.ledger.info(&key).unwrap().enabled);
}

#[tokio::test]
async fn health_reports_provider_count() {
    let app = app_with(Behavior::Json(json!({})));
    let resp = app
        .router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["providers"], 1);
}

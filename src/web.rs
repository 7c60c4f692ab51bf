use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::agent::Agent;
use crate::config::Config;
use crate::error::ChatRelayError;
use crate::rate_limit::{LimiterRegistry, RateLimitTier, CLAUDE_CHAT};

mod admission;
mod chat;
mod client_key;
pub mod session;
pub mod sink;

pub use admission::{with_rate_limit, Admission, Rejection};

#[derive(Clone)]
pub struct WebState {
    registry: Arc<LimiterRegistry>,
    agent: Arc<dyn Agent>,
    stream_deadline: Duration,
}

impl WebState {
    pub fn new(registry: Arc<LimiterRegistry>, agent: Arc<dyn Agent>, stream_deadline: Duration) -> Self {
        Self {
            registry,
            agent,
            stream_deadline,
        }
    }
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Client-advisory tier of every preset, for clients that throttle themselves.
async fn api_rate_limits(State(state): State<WebState>) -> Json<serde_json::Value> {
    let limits = state
        .registry
        .presets()
        .iter()
        .filter_map(|preset| {
            let client = preset.tier(RateLimitTier::Client)?;
            Some((
                preset.feature.clone(),
                json!({
                    "max_requests": client.max_requests,
                    "window_ms": client.window_ms,
                    "rationale": client.rationale,
                }),
            ))
        })
        .collect::<serde_json::Map<_, _>>();
    Json(json!({"ok": true, "rate_limits": limits}))
}

pub fn build_router(state: WebState) -> Result<Router, ChatRelayError> {
    let chat_admission = Admission::for_feature(&state.registry, CLAUDE_CHAT)?;
    Ok(Router::new()
        .route("/api/health", get(api_health))
        .route("/api/rate_limits", get(api_rate_limits))
        .route(
            "/api/chat",
            with_rate_limit(chat_admission, post(chat::api_chat))
                .route_layer(from_fn(chat::validate_chat_request)),
        )
        .with_state(state))
}

pub async fn start_web_server<F>(
    config: &Config,
    state: WebState,
    shutdown: F,
) -> Result<(), ChatRelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state)?;
    let addr = config.web_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!("Failed to bind web server at {}: {}", addr, e);
        e
    })?;

    info!("Chat relay listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Web server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStream;
    use crate::agent_types::{AgentMessage, ChatRequest};
    use crate::rate_limit::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::{stream, StreamExt};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    /// Replays a fixed script of messages and remembers what it was given.
    struct ScriptedAgent {
        script: Vec<AgentMessage>,
        hang_after_script: bool,
        requests: Mutex<Vec<ChatRequest>>,
        cancels: Mutex<Vec<CancellationToken>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<AgentMessage>) -> Self {
            Self {
                script,
                hang_after_script: false,
                requests: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
            }
        }

        fn hanging(script: Vec<AgentMessage>) -> Self {
            Self {
                hang_after_script: true,
                ..Self::new(script)
            }
        }
    }

    #[async_trait::async_trait]
    impl Agent for ScriptedAgent {
        async fn start(
            &self,
            request: ChatRequest,
            cancel: CancellationToken,
        ) -> Result<AgentStream, ChatRelayError> {
            self.requests.lock().unwrap().push(request);
            self.cancels.lock().unwrap().push(cancel);
            let items = stream::iter(
                self.script
                    .clone()
                    .into_iter()
                    .map(Ok::<AgentMessage, ChatRelayError>),
            );
            if self.hang_after_script {
                Ok(Box::pin(items.chain(stream::pending())))
            } else {
                Ok(Box::pin(items))
            }
        }
    }

    struct BrokenAgent;

    #[async_trait::async_trait]
    impl Agent for BrokenAgent {
        async fn start(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<AgentStream, ChatRelayError> {
            Err(ChatRelayError::Agent("connection refused".into()))
        }
    }

    /// Accepts the request but never produces a stream.
    #[derive(Default)]
    struct StalledAgent {
        cancels: Mutex<Vec<CancellationToken>>,
    }

    #[async_trait::async_trait]
    impl Agent for StalledAgent {
        async fn start(
            &self,
            _request: ChatRequest,
            cancel: CancellationToken,
        ) -> Result<AgentStream, ChatRelayError> {
            self.cancels.lock().unwrap().push(cancel);
            std::future::pending().await
        }
    }

    fn default_script() -> Vec<AgentMessage> {
        vec![
            AgentMessage::new("system").with_field("session_id", "sess-42"),
            AgentMessage::new("assistant").with_field("text", "hello"),
            AgentMessage::new("result").with_field("subtype", "success"),
        ]
    }

    fn test_web_state(agent: Arc<dyn Agent>) -> WebState {
        let registry = Arc::new(LimiterRegistry::with_builtin_presets(Arc::new(
            ManualClock::new(1_700_000_000_000),
        )));
        WebState::new(registry, agent, Duration::from_secs(120))
    }

    fn chat_request(body: &str, ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .header("x-forwarded-for", ip)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_chat_streams_sse_frames_to_done() {
        let agent = Arc::new(ScriptedAgent::new(default_script()));
        let app = build_router(test_web_state(agent.clone())).unwrap();

        let resp = app
            .oneshot(chat_request(
                r#"{"message":"  hi there ","session_id":"sess-41"}"#,
                "10.1.1.1",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["cache-control"], "no-cache");
        assert_eq!(resp.headers()["connection"], "keep-alive");

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let frames = text
            .split_terminator("\n\n")
            .map(|f| f.strip_prefix("data: ").unwrap())
            .collect::<Vec<_>>();
        assert_eq!(frames.len(), 5);
        let init: serde_json::Value = serde_json::from_str(frames[0]).unwrap();
        assert_eq!(init, json!({"type": "session_init", "session_id": "sess-42"}));
        assert_eq!(frames[4], "[DONE]");

        let requests = agent.requests.lock().unwrap();
        assert_eq!(requests[0].message, "hi there");
        assert_eq!(requests[0].session_id.as_deref(), Some("sess-41"));
    }

    #[tokio::test]
    async fn test_chat_missing_message_is_400() {
        let agent = Arc::new(ScriptedAgent::new(default_script()));
        let app = build_router(test_web_state(agent.clone())).unwrap();

        for body in [r#"{"session_id":"x"}"#, r#"{"message":"   "}"#, "not json"] {
            let resp = app
                .clone()
                .oneshot(chat_request(body, "10.1.1.2"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert!(v["error"].is_string());
        }
        assert!(agent.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_requests_do_not_spend_quota() {
        let agent = Arc::new(ScriptedAgent::new(default_script()));
        let app = build_router(test_web_state(agent.clone())).unwrap();

        let mut statuses = Vec::new();
        for _ in 0..11 {
            let resp = app
                .clone()
                .oneshot(chat_request("not json", "1.2.3.4"))
                .await
                .unwrap();
            statuses.push(resp.status());
        }
        assert_eq!(statuses, vec![StatusCode::BAD_REQUEST; 11]);

        let resp = app
            .oneshot(chat_request(r#"{"message":"hi"}"#, "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(agent.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_that_never_starts_is_500_after_deadline() {
        let agent = Arc::new(StalledAgent::default());
        let app = build_router(test_web_state(agent.clone())).unwrap();

        let started = tokio::time::Instant::now();
        let resp = app
            .oneshot(chat_request(r#"{"message":"hi"}"#, "10.1.1.5"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(started.elapsed() >= Duration::from_secs(120));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], "Internal server error");
        assert!(agent.cancels.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_chat_upstream_start_failure_is_500() {
        let app = build_router(test_web_state(Arc::new(BrokenAgent))).unwrap();
        let resp = app
            .oneshot(chat_request(r#"{"message":"hi"}"#, "10.1.1.3"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_chat_is_rate_limited_per_caller() {
        let agent = Arc::new(ScriptedAgent::new(default_script()));
        let app = build_router(test_web_state(agent.clone())).unwrap();

        for _ in 0..10 {
            let resp = app
                .clone()
                .oneshot(chat_request(r#"{"message":"hi"}"#, "192.168.1.2"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app
            .clone()
            .oneshot(chat_request(r#"{"message":"hi"}"#, "192.168.1.2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "10");
        assert_eq!(agent.requests.lock().unwrap().len(), 10);

        let resp = app
            .oneshot(chat_request(r#"{"message":"hi"}"#, "192.168.1.9"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dropping_response_body_cancels_upstream() {
        let agent = Arc::new(ScriptedAgent::hanging(vec![
            AgentMessage::new("assistant").with_field("text", "partial"),
        ]));
        let app = build_router(test_web_state(agent.clone())).unwrap();

        let resp = app
            .oneshot(chat_request(r#"{"message":"hi"}"#, "10.1.1.4"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("partial"));
        drop(body);

        let cancel = agent.cancels.lock().unwrap()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("upstream should be cancelled after client disconnect");
    }

    #[tokio::test]
    async fn test_rate_limits_endpoint_lists_client_tier() {
        let app = build_router(test_web_state(Arc::new(BrokenAgent))).unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/rate_limits")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["rate_limits"]["claude-chat"]["max_requests"], 5);
        assert_eq!(v["rate_limits"]["message"]["window_ms"], 60_000);
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_web_state(Arc::new(BrokenAgent))).unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

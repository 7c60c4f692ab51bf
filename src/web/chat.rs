use super::*;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tokio_util::sync::CancellationToken;

use super::session::StreamSession;
use super::sink::ChannelSink;
use crate::agent_types::ChatRequest;

/// Largest chat request body accepted before it is rejected as malformed.
const MAX_CHAT_BODY_BYTES: usize = 1024 * 1024;

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn internal_error() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error"})),
    )
}

/// Decodes and checks the chat body before the request reaches the limiter.
///
/// The parsed [`ChatRequest`] travels to the handler as an extension, so a
/// malformed request never touches a caller's quota.
pub(super) async fn validate_chat_request(request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CHAT_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return bad_request(&format!("Failed to read request body: {e}")).into_response(),
    };
    let Json(mut chat) = match Json::<ChatRequest>::from_bytes(&bytes) {
        Ok(chat) => chat,
        Err(rejection) => return bad_request(&rejection.body_text()).into_response(),
    };
    chat.message = chat.message.trim().to_string();
    if chat.message.is_empty() {
        return bad_request("message is required").into_response();
    }

    parts.extensions.insert(chat);
    next.run(Request::from_parts(parts, Body::empty())).await
}

pub(super) async fn api_chat(
    State(state): State<WebState>,
    Extension(request): Extension<ChatRequest>,
) -> Result<Response, (StatusCode, Json<serde_json::Value>)> {
    let start = Instant::now();
    let stream_id = uuid::Uuid::new_v4().to_string();
    let upstream_cancel = CancellationToken::new();

    let started = tokio::time::timeout(
        state.stream_deadline,
        state.agent.start(request, upstream_cancel.clone()),
    )
    .await
    .unwrap_or_else(|_| {
        Err(ChatRelayError::Agent(format!(
            "upstream did not start within {}ms",
            state.stream_deadline.as_millis()
        )))
    });
    let source = started.map_err(|e| {
        upstream_cancel.cancel();
        error!(
            target: "web",
            endpoint = "/api/chat",
            stream_id = %stream_id,
            error = %e,
            "Failed to start upstream agent"
        );
        internal_error()
    })?;

    let (sink, mut rx) = ChannelSink::new();
    let client_abort = CancellationToken::new();
    let session = StreamSession::new(
        stream_id.clone(),
        sink,
        state.stream_deadline,
        client_abort.clone(),
        upstream_cancel,
    );
    tokio::spawn(session.run(source));

    // Dropping the body (client disconnect or normal end) trips the abort.
    let abort_on_drop = client_abort.drop_guard();
    let events = async_stream::stream! {
        let _abort_on_drop = abort_on_drop;
        while let Some(event) = rx.recv().await {
            yield Ok::<Event, Infallible>(event);
        }
    };

    info!(
        target: "web",
        endpoint = "/api/chat",
        stream_id = %stream_id,
        latency_ms = start.elapsed().as_millis(),
        "Stream session started"
    );

    Ok(([(header::CONNECTION, "keep-alive")], Sse::new(events)).into_response())
}

//! HTTP API: the live event stream, the client reply endpoint, the
//! reconnect catch-up listing, and prompt cancellation.
//!
//! Spawned as a background task by the engine, same pattern as the
//! detector and dispatcher loops.

use crate::engine::{Engine, ReplyRequest};
use crate::registry::ConnectionRegistry;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures::Stream;
use nudge_core::config::ApiConfig;
use nudge_core::error::{NudgeError, ReplyRejection};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    engine: Arc<Engine>,
    api_key: Option<String>,
}

/// Constant-time string comparison to prevent timing attacks on API token
/// validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)`
/// if rejected.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Option<(StatusCode, Json<Value>)> {
    let key = match api_key {
        Some(k) => k,
        None => return None, // No auth configured — allow all.
    };

    let header = match headers.get("authorization") {
        Some(h) => h,
        None => {
            return Some((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing Authorization header"})),
            ));
        }
    };

    let value = match header.to_str() {
        Ok(v) => v,
        Err(_) => {
            return Some((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid Authorization header"})),
            ));
        }
    };

    match value.strip_prefix("Bearer ") {
        Some(token) if constant_time_eq(token, key) => None, // Authorized.
        _ => Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        )),
    }
}

fn require_user_id(
    params: &HashMap<String, String>,
) -> Result<String, (StatusCode, Json<Value>)> {
    params
        .get("user_id")
        .filter(|u| !u.trim().is_empty())
        .cloned()
        .ok_or((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing user_id parameter"})),
        ))
}

/// `GET /api/health` — status, uptime, connection count.
async fn health(
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.engine.uptime().elapsed().as_secs(),
        "active_connections": state.engine.registry().active_connections().await,
        "oldest_connection_secs": state.engine.registry().oldest_connection_secs().await,
    })))
}

/// Unregisters the connection when the client's stream is dropped,
/// cleanly or not.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    user_id: String,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let user_id = std::mem::take(&mut self.user_id);
        let connection_id = std::mem::take(&mut self.connection_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.unregister(&user_id, &connection_id).await;
            });
        }
    }
}

/// `GET /api/events?user_id=` — the per-user live delivery stream.
///
/// Emits named SSE events: `coaching_prompt`, `response_result`,
/// `heartbeat`, `error`. Clients are expected to reconnect after drops
/// and fetch `/api/prompts/unacknowledged` to catch up.
async fn events(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let user_id = require_user_id(&params)?;

    let registry = Arc::clone(state.engine.registry());
    let (connection_id, mut rx) = registry.register(&user_id).await;
    info!("event stream opened for user {user_id} ({connection_id})");

    let guard = ConnectionGuard {
        registry,
        user_id,
        connection_id: connection_id.clone(),
    };

    let stream = async_stream::stream! {
        let _guard = guard;

        // Initial heartbeat doubles as the connection acknowledgement.
        yield Ok::<_, Infallible>(
            Event::default()
                .event("heartbeat")
                .data(json!({"connected": connection_id}).to_string()),
        );

        while let Some(ev) = rx.recv().await {
            yield Ok(Event::default().event(ev.event).data(ev.data));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// `POST /api/replies` — the client reply endpoint.
async fn reply(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Result<Json<ReplyRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    let Json(request) = body.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid request: {e}")})),
        )
    })?;

    if request.prompt_id.trim().is_empty()
        || request.user_id.trim().is_empty()
        || request.value.trim().is_empty()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "prompt_id, user_id, and value must not be empty"})),
        ));
    }

    match state.engine.handle_reply(&request).await {
        Ok(outcome) => Ok(Json(json!({
            "success": true,
            "result": outcome.result,
            "follow_up_scheduled": outcome.follow_up_scheduled,
        }))),
        Err(NudgeError::Reply(rejection)) => {
            let status = match &rejection {
                ReplyRejection::NotFound => StatusCode::NOT_FOUND,
                ReplyRejection::OwnershipMismatch => StatusCode::FORBIDDEN,
                ReplyRejection::Stale { .. } => StatusCode::CONFLICT,
            };
            Err((
                status,
                Json(json!({
                    "success": false,
                    "code": rejection.code(),
                    "error": rejection.to_string(),
                })),
            ))
        }
        Err(e) => {
            error!("reply handling failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            ))
        }
    }
}

/// `GET /api/prompts/unacknowledged?user_id=` — delivered-but-unanswered
/// prompts, for clients catching up after a reconnect.
async fn unacknowledged(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let user_id = require_user_id(&params)?;

    let prompts = state
        .engine
        .store()
        .unacknowledged_for_user(&user_id)
        .await
        .map_err(|e| {
            error!("unacknowledged query failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        })?;

    let items: Vec<Value> = prompts
        .iter()
        .map(|p| {
            json!({
                "prompt_id": p.id,
                "timing_type": p.timing_type,
                "priority": p.priority,
                "title": p.content.title,
                "body": p.content.body,
                "quick_replies": p.content.quick_replies,
                "delivered_at": p.delivered_at,
            })
        })
        .collect();

    Ok(Json(json!({"prompts": items})))
}

/// `POST /api/prompts/{id}/cancel` — external cancellation, e.g. the
/// triggering habit was deleted.
async fn cancel(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    match state.engine.cancel_prompt(&prompt_id).await {
        Ok(true) => Ok(Json(json!({"success": true}))),
        Ok(false) => Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "prompt is not cancellable"})),
        )),
        Err(e) => {
            error!("cancel failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            ))
        }
    }
}

/// Build the axum router with shared state.
fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(events))
        .route("/api/replies", post(reply))
        .route("/api/prompts/unacknowledged", get(unacknowledged))
        .route("/api/prompts/{id}/cancel", post(cancel))
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Start the API server. Called from `Engine::run()`.
pub async fn serve(config: ApiConfig, engine: Arc<Engine>) {
    let api_key = if config.api_key.is_empty() {
        None
    } else {
        Some(config.api_key.clone())
    };

    let state = ApiState { engine, api_key };
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("API server failed to bind to {addr}: {e}");
            return;
        }
    };

    info!("API server listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("API server error: {e}");
    }
}

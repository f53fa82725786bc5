//! HTTP transport.
//!
//! A single JSON-RPC endpoint (`POST /mcp`) plus a health probe. Each
//! client session is keyed by the `Mcp-Session-Id` header the server hands
//! out in the `initialize` response; requests without one run in a
//! throwaway session. When the client advertised SSE support in its
//! handshake and sends `Accept: text/event-stream`, the response streams as
//! Server-Sent Events (one `result` event, then `done`).

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use super::{McpServer, Session};
use crate::error::{Result, SemIndexError};

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
struct AppState {
    server: Arc<McpServer>,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<Session>>>>>,
}

pub async fn serve(server: Arc<McpServer>, bind: &str) -> Result<()> {
    let state = AppState {
        server,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(%bind, "MCP server listening on http");
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| SemIndexError::Other(format!("failed to bind {bind}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SemIndexError::Other(e.to_string()))?;
    Ok(())
}

async fn session_for(state: &AppState, headers: &HeaderMap) -> Arc<Mutex<Session>> {
    let key = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match key {
        Some(key) => {
            let mut sessions = state.sessions.lock().await;
            Arc::clone(sessions.entry(key).or_insert_with(|| {
                Arc::new(Mutex::new(Session::new()))
            }))
        }
        None => Arc::new(Mutex::new(Session::new())),
    }
}

async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session = session_for(&state, &headers).await;
    let response = state.server.handle_message(&session, &body).await;

    let Some(response) = response else {
        // Notification: acknowledge with no body.
        return StatusCode::ACCEPTED.into_response();
    };

    // Register the session under the id minted by initialize so follow-up
    // requests can reference it.
    let session_id = response
        .pointer("/result/sessionId")
        .and_then(|v| v.as_str())
        .map(String::from);
    if let Some(id) = &session_id {
        state
            .sessions
            .lock()
            .await
            .insert(id.clone(), Arc::clone(&session));
    }

    let wants_sse = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false);
    let negotiated_sse = session.lock().await.supports_sse;

    let mut response_headers = HeaderMap::new();
    if let Some(id) = &session_id {
        if let Ok(value) = id.parse() {
            response_headers.insert(SESSION_HEADER, value);
        }
    }

    if wants_sse && negotiated_sse {
        // One `result` event carrying the full response, then `done`.
        let events = futures_util::stream::iter(vec![
            Ok::<Event, std::convert::Infallible>(
                Event::default().event("result").data(response.to_string()),
            ),
            Ok(Event::default().event("done").data("")),
        ]);
        return (response_headers, Sse::new(events)).into_response();
    }

    (response_headers, Json(response)).into_response()
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

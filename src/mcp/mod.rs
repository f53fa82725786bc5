//! MCP server core.
//!
//! JSON-RPC 2.0 dispatch shared by both transports ([`stdio`] and
//! [`http`]). The handshake follows MCP 2025-06-18: `initialize` negotiates
//! capabilities, `tools/list` returns the registry with JSON-schema
//! parameter specs, `tools/call` dispatches a tool, `shutdown` ends the
//! session. `$/cancelRequest` propagates a cancellation token into the
//! in-flight retrieval operation; the partial result is discarded.
//!
//! Session state machine:
//!
//! ```text
//! New → Initialized → Ready ⇄ Serving → Closing → Closed
//! ```
//!
//! Error codes: `-32700` parse error, `-32600` invalid request, `-32601`
//! method not found, `-32602` invalid params, `-32800` request cancelled,
//! `-32000` tool failure.

pub mod http;
pub mod stdio;
pub mod tools;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::retrieval::RetrievalEngine;
use tools::{validate_params, ToolRegistry};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const REQUEST_CANCELLED: i64 = -32800;
pub const TOOL_ERROR: i64 = -32000;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Initialized,
    Ready,
    Serving,
    Closing,
    Closed,
}

/// One transport connection. Sessions are stateless beyond the capability
/// handshake; concurrent sessions share the engine and tool registry.
pub struct Session {
    pub id: String,
    pub state: SessionState,
    /// Set when the client's `initialize` advertised SSE support.
    pub supports_sse: bool,
    /// In-flight request id → cancellation token.
    inflight: HashMap<String, CancellationToken>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::New,
            supports_sse: false,
            inflight: HashMap::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared server core dispatched against by every transport.
pub struct McpServer {
    pub engine: RetrievalEngine,
    pub tools: ToolRegistry,
}

impl McpServer {
    pub fn new(engine: RetrievalEngine) -> Self {
        Self {
            engine,
            tools: ToolRegistry::with_builtins(),
        }
    }

    /// Handle one raw JSON-RPC message. `None` means no response is due
    /// (notifications).
    pub async fn handle_message(&self, session: &Arc<Mutex<Session>>, raw: &str) -> Option<Value> {
        let request: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    &format!("Parse error: {e}"),
                ))
            }
        };

        if request.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
            return Some(error_response(
                request.get("id").cloned().unwrap_or(Value::Null),
                INVALID_REQUEST,
                "missing jsonrpc 2.0 envelope",
            ));
        }

        let id = request.get("id").cloned();
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(json!({}));

        match method {
            "initialize" => Some(self.handle_initialize(session, id, &params).await),
            "notifications/initialized" | "initialized" => {
                let mut guard = session.lock().await;
                if guard.state == SessionState::Initialized {
                    guard.state = SessionState::Ready;
                }
                None
            }
            "ping" => Some(result_response(id, json!({}))),
            "tools/list" => Some(result_response(id, json!({ "tools": self.tools.list() }))),
            "tools/call" => Some(self.handle_tool_call(session, id, &params).await),
            "$/cancelRequest" => {
                let cancel_id = params.get("id").map(value_key);
                if let Some(key) = cancel_id {
                    let guard = session.lock().await;
                    if let Some(token) = guard.inflight.get(&key) {
                        token.cancel();
                    }
                }
                None
            }
            "shutdown" => {
                let mut guard = session.lock().await;
                guard.state = SessionState::Closing;
                Some(result_response(id, Value::Null))
            }
            "exit" => {
                let mut guard = session.lock().await;
                guard.state = SessionState::Closed;
                None
            }
            other => Some(error_response(
                id.unwrap_or(Value::Null),
                METHOD_NOT_FOUND,
                &format!("Method not found: {other}"),
            )),
        }
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Mutex<Session>>,
        id: Option<Value>,
        params: &Value,
    ) -> Value {
        let supports_sse = params
            .pointer("/capabilities/experimental/sse")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut guard = session.lock().await;
        guard.state = SessionState::Initialized;
        guard.supports_sse = supports_sse;
        let session_id = guard.id.clone();
        drop(guard);

        result_response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "semindex",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "sessionId": session_id,
            }),
        )
    }

    async fn handle_tool_call(
        &self,
        session: &Arc<Mutex<Session>>,
        id: Option<Value>,
        params: &Value,
    ) -> Value {
        {
            let mut guard = session.lock().await;
            match guard.state {
                SessionState::Ready | SessionState::Serving | SessionState::Initialized => {
                    guard.state = SessionState::Serving;
                }
                state => {
                    return error_response(
                        id.unwrap_or(Value::Null),
                        INVALID_REQUEST,
                        &format!("session not ready (state {state:?})"),
                    )
                }
            }
        }

        let response = self.dispatch_tool(session, id.clone(), params).await;

        let mut guard = session.lock().await;
        if guard.state == SessionState::Serving {
            guard.state = SessionState::Ready;
        }
        response
    }

    async fn dispatch_tool(
        &self,
        session: &Arc<Mutex<Session>>,
        id: Option<Value>,
        params: &Value,
    ) -> Value {
        let rpc_id = id.clone().unwrap_or(Value::Null);
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let Some(tool) = self.tools.find(name) else {
            return error_response(rpc_id, METHOD_NOT_FOUND, &format!("Unknown tool: {name}"));
        };

        if let Err(detail) = validate_params(&tool.input_schema(), &arguments) {
            return error_response(
                rpc_id,
                INVALID_PARAMS,
                &format!("Invalid params: {detail}"),
            );
        }

        // Register a token under the request id so $/cancelRequest can
        // reach this call.
        let token = CancellationToken::new();
        let key = id.as_ref().map(value_key);
        if let Some(key) = &key {
            session.lock().await.inflight.insert(key.clone(), token.clone());
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(REQUEST_CANCELLED),
            result = tool.call(&arguments, &self.engine) => Ok(result),
        };

        if let Some(key) = &key {
            session.lock().await.inflight.remove(key);
        }

        match outcome {
            Err(code) => error_response(rpc_id, code, "Request cancelled"),
            Ok(Ok(value)) => {
                let text = serde_json::to_string(&value).unwrap_or_default();
                result_response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "structuredContent": value,
                        "isError": false,
                    }),
                )
            }
            Ok(Err(e)) => {
                let code = match &e {
                    crate::error::SemIndexError::Protocol(_) => INVALID_PARAMS,
                    _ => TOOL_ERROR,
                };
                error_response(rpc_id, code, &e.to_string())
            }
        }
    }
}

/// Stable map key for a JSON-RPC id (number or string).
fn value_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn result_response(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "result": result,
    })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

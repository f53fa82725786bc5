//! stdio transport.
//!
//! One JSON-RPC message per line on stdin/stdout. stdout is reserved for
//! protocol frames: logging must already be routed to stderr or a file
//! (see [`crate::logging`]) before this loop starts.
//!
//! Requests are dispatched concurrently so a `$/cancelRequest` arriving
//! mid-call can reach the in-flight operation; responses are serialized
//! through a single writer task.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use super::{McpServer, Session, SessionState};
use crate::error::Result;

pub async fn serve(server: Arc<McpServer>) -> Result<()> {
    let session = Arc::new(Mutex::new(Session::new()));
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!("MCP server listening on stdio");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        // Cancellation must not queue behind the in-flight call it is
        // trying to cancel, so notifications are handled inline.
        if line.contains("$/cancelRequest") {
            if let Some(response) = server.handle_message(&session, &line).await {
                let _ = out_tx.send(response.to_string()).await;
            }
            continue;
        }

        let server = Arc::clone(&server);
        let session_ref = Arc::clone(&session);
        let out = out_tx.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_message(&session_ref, &line).await {
                let _ = out.send(response.to_string()).await;
            }
        });

        if session.lock().await.state == SessionState::Closed {
            break;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

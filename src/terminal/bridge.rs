use crate::terminal::pty_process::PtyProcess;
use crate::terminal::registry::SessionRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

pub const NO_CWD_MESSAGE: &str =
    "\r\n\x1b[31mError: No working directory specified. Connect with ?cwd=<directory> to start a terminal.\x1b[0m\r\n";

/// What an inbound WebSocket frame asks the terminal to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Resize { cols: u16, rows: u16 },
    Input(Vec<u8>),
    Ignored,
}

/// Decodes a client frame. Anything that is not a recognised control message is
/// keyboard input and goes to the shell verbatim.
///
/// A `resize` object is never typed into the shell: it is applied when both
/// dimensions are positive integers that fit a terminal size, and dropped otherwise.
pub fn parse_inbound(raw: &[u8]) -> InboundFrame {
    let Ok(Value::Object(frame)) = serde_json::from_slice::<Value>(raw) else {
        return InboundFrame::Input(raw.to_vec());
    };
    match frame.get("type").and_then(Value::as_str) {
        Some("resize") => match (dimension(frame.get("cols")), dimension(frame.get("rows"))) {
            (Some(cols), Some(rows)) => InboundFrame::Resize { cols, rows },
            _ => InboundFrame::Ignored,
        },
        Some("input") => match frame.get("data").and_then(Value::as_str) {
            Some(data) => InboundFrame::Input(data.as_bytes().to_vec()),
            None => InboundFrame::Input(raw.to_vec()),
        },
        _ => InboundFrame::Input(raw.to_vec()),
    }
}

fn dimension(value: Option<&Value>) -> Option<u16> {
    value?
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| u16::try_from(n).ok())
}

async fn apply(process: &PtyProcess, frame: InboundFrame) {
    match frame {
        InboundFrame::Resize { cols, rows } => {
            process.resize(cols, rows);
        }
        InboundFrame::Input(bytes) => {
            if let Err(e) = process.write(bytes).await {
                debug!(error = %e, "Dropping input for closed terminal");
            }
        }
        InboundFrame::Ignored => {}
    }
}

/// Drives one terminal connection: spawns the session, relays output to the client
/// and client frames to the shell, and closes the session when either side ends.
#[instrument(skip(socket, registry))]
pub async fn run_terminal_socket(
    mut socket: WebSocket,
    registry: Arc<SessionRegistry>,
    cwd: Option<String>,
) {
    let Some(cwd) = cwd.filter(|c| !c.trim().is_empty()) else {
        warn!("Terminal connection without a working directory");
        hold_inert(socket).await;
        return;
    };

    let session = match registry.create_session(Path::new(&cwd)) {
        Ok(session) => session,
        Err(e) => {
            let message = format!("\r\n\x1b[31m{}\x1b[0m\r\n", e);
            let _ = socket.send(Message::Text(message)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut output_rx = session.process().take_output();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Ok(bytes) => {
                    // The peer may already be gone; the read side notices that.
                    let _ = ws_tx.send(Message::Binary(bytes.to_vec())).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Terminal connection lagged behind output");
                }
                Err(RecvError::Closed) => {
                    info!(session_id = %session.id(), "Terminal process ended, closing connection");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => apply(session.process(), parse_inbound(text.as_bytes())).await,
                Some(Ok(Message::Binary(data))) => apply(session.process(), parse_inbound(&data)).await,
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = %session.id(), "Terminal connection closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Terminal connection error");
                    break;
                }
            },
        }
    }

    registry.close_session(&session);
}

/// Keeps a connection without a working directory open but unbound until the client leaves.
async fn hold_inert(mut socket: WebSocket) {
    if socket.send(Message::Text(NO_CWD_MESSAGE.to_string())).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

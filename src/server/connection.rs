//! Duplex connection handling
//!
//! A connection must authenticate with the shared bearer token inside the
//! grace window, then attaches to its session actor. Inbound frames are
//! forwarded to the actor in arrival order; the actor's outbound frames
//! are pumped back through a dedicated sender task.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ServerState;
use crate::protocol::{parse_client_frame, ClientEnvelope};
use crate::session::SessionMsg;

/// Auth handshake grace window
const AUTH_GRACE: Duration = Duration::from_secs(5);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The peer must open with an auth envelope within the grace window
    let first = match tokio::time::timeout(AUTH_GRACE, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            debug!("Connection closed before auth");
            return;
        }
        Err(_) => {
            warn!("Auth handshake timed out");
            let _ = ws_tx
                .send(Message::Text(
                    r#"{"type":"error","message":"Authentication timeout"}"#.into(),
                ))
                .await;
            return;
        }
    };

    let (session_id, last_server_seq) = match parse_client_frame(&first) {
        Ok((_, ClientEnvelope::Auth { token, session_id, last_server_seq })) => {
            let expected = &state.config.auth.token;
            if !expected.is_empty() && token != *expected {
                warn!("Rejected connection with bad token");
                let _ = ws_tx
                    .send(Message::Text(
                        r#"{"type":"error","message":"Authentication failed"}"#.into(),
                    ))
                    .await;
                return;
            }
            (session_id, last_server_seq.unwrap_or(0))
        }
        Ok(_) => {
            warn!("First envelope was not auth, closing");
            return;
        }
        Err(e) => {
            warn!("Malformed auth envelope: {:#}", e);
            return;
        }
    };

    // Outbound pump: the session actor writes frames, this task owns the
    // socket sink
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let pump = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let (sid, session_tx) = state.sessions.attach(session_id, last_server_seq, out_tx).await;
    info!("Connection attached to session {}", sid);

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_client_frame(&text) {
                Ok((cseq, envelope)) => {
                    if session_tx.send(SessionMsg::Inbound { cseq, envelope }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Protocol error: close, no retry
                    warn!("Malformed envelope on session {}: {:#}", sid, e);
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                debug!("Session {} connection closed by peer", sid);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} socket error: {}", sid, e);
                break;
            }
        }
    }

    let _ = session_tx.send(SessionMsg::Detach);
    pump.abort();
    info!("Connection detached from session {}", sid);
}

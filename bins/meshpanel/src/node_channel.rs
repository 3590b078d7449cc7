//! Node control channel over WebSocket
//!
//! A local node connects with its secret and declared capabilities in the
//! query string. Frames queued by the session registry are written out by a
//! writer task; inbound frames go back to the registry. A node that stays
//! silent for the pong wait is dropped.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meshpanel_core::store::nodes;
use meshpanel_core::{Node, NodeCapabilities};

use crate::state::AppState;

pub const NODE_CHANNEL_PATH: &str = "/ws/node";

/// Query parameters a node connects with
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub tls: Option<String>,
    #[serde(default)]
    pub socks: Option<String>,
}

impl ConnectParams {
    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            version: self
                .version
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            http: flag(self.http.as_deref()),
            tls: flag(self.tls.as_deref()),
            socks: flag(self.socks.as_deref()),
        }
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

pub async fn node_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let node = match identify(&state, &params.secret) {
        Ok(node) => node,
        Err(status) => return status.into_response(),
    };
    let caps = params.capabilities();
    ws.on_upgrade(move |socket| run_session(socket, state, node, caps))
}

/// Resolve the connecting node from its secret
pub(crate) fn identify(state: &AppState, secret: &str) -> Result<Node, StatusCode> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match state.store.read(|conn| nodes::find_node_by_secret(conn, secret)) {
        Ok(Some(node)) if !node.is_remote => Ok(node),
        Ok(_) => {
            warn!("Node connect rejected: unknown secret");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(e) => {
            warn!("Node lookup failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn run_session(socket: WebSocket, state: AppState, node: Node, caps: NodeCapabilities) {
    let node_id = node.id;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(state.control.send_queue);

    let generation = match state.sessions.attach(node_id, &node.secret, outbound_tx) {
        Ok(generation) => generation,
        Err(e) => {
            warn!("Node {} session rejected: {}", node_id, e);
            return;
        }
    };
    if let Err(e) = state.store.write(|tx| nodes::mark_node_online(tx, node_id, &caps)) {
        warn!("Could not mark node {} online: {}", node_id, e);
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    let ping_interval = state.control.ping_interval();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let pong_wait = state.control.pong_wait();
    loop {
        let message = match tokio::time::timeout(pong_wait, ws_rx.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Node {} read error: {}", node_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Node {} silent for {:?}, dropping session", node_id, pong_wait);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if let Some(unsolicited) = state.sessions.handle_inbound(node_id, &text) {
                    debug!("Node {} sent {}", node_id, unsolicited);
                }
            }
            Message::Close(_) => break,
            // pings and pongs only refresh the deadline
            _ => {}
        }
    }

    writer.abort();
    if state.sessions.detach(node_id, generation) {
        if let Err(e) = state.store.write(|tx| nodes::mark_node_offline(tx, node_id)) {
            warn!("Could not mark node {} offline: {}", node_id, e);
        }
    } else {
        info!("Node {} session {} superseded", node_id, generation);
    }
}

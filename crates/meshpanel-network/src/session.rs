//! Node Session Registry
//!
//! Tracks the live control session of every connected local node and
//! correlates command responses with their callers. A caller waits on a
//! oneshot channel for a bounded time that covers queueing the frame too.
//! Its entry is removed whenever the caller stops waiting, so a late reply is
//! dropped as stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meshpanel_core::ProbeResult;
use meshpanel_crypto::PayloadKey;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{
    commands, decode_frame, encode_command, probe_result_from, response_type, ControlCommand,
    ControlResponse, InboundFrame, RequestIdGenerator, TcpPingRequest,
};

/// Sends commands to local nodes
#[async_trait]
pub trait NodeCommander: Send + Sync {
    /// Whether the node has a live session
    fn is_online(&self, node_id: i64) -> bool;

    /// Send a command and wait for its response
    async fn send_command(&self, node_id: i64, command_type: &str, data: Value) -> NetworkResult<ControlResponse>;

    /// Run a TCP reachability probe from the node
    async fn tcp_ping(&self, node_id: i64, request: TcpPingRequest) -> NetworkResult<ProbeResult> {
        let data = serde_json::to_value(&request)?;
        let response = self.send_command(node_id, commands::TCP_PING, data).await?;
        Ok(probe_result_from(&response))
    }
}

struct NodeSession {
    generation: u64,
    key: Option<PayloadKey>,
    outbound: mpsc::Sender<String>,
}

struct PendingRequest {
    node_id: i64,
    expected_type: String,
    response_tx: oneshot::Sender<NetworkResult<ControlResponse>>,
}

/// Removes a pending entry once its caller stops waiting, however that happens
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

/// Live node sessions and their in-flight requests
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, NodeSession>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    request_ids: RequestIdGenerator,
    next_generation: AtomicU64,
    command_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            request_ids: RequestIdGenerator::new(),
            next_generation: AtomicU64::new(1),
            command_timeout,
        }
    }

    /// Register a connected node, replacing any previous session.
    ///
    /// Frames for the node are pushed to `outbound`; the returned generation
    /// identifies this session when it later detaches.
    pub fn attach(&self, node_id: i64, secret: &str, outbound: mpsc::Sender<String>) -> NetworkResult<u64> {
        let key = if secret.trim().is_empty() {
            None
        } else {
            Some(PayloadKey::derive(secret)?)
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let replaced = self.sessions.write().insert(
            node_id,
            NodeSession {
                generation,
                key,
                outbound,
            },
        );
        match replaced {
            Some(old) => info!(
                "Node {} reconnected (session {} replaces {})",
                node_id, generation, old.generation
            ),
            None => info!("Node {} connected (session {})", node_id, generation),
        }
        Ok(generation)
    }

    /// Drop a session if it is still the current one for the node.
    ///
    /// Returns `true` when the node went offline; its pending requests fail
    /// with `Disconnected`.
    pub fn detach(&self, node_id: i64, generation: u64) -> bool {
        {
            let mut sessions = self.sessions.write();
            match sessions.get(&node_id) {
                Some(current) if current.generation == generation => {
                    sessions.remove(&node_id);
                }
                _ => return false,
            }
        }

        let failed = self.fail_pending(node_id);
        info!("Node {} disconnected, {} pending requests failed", node_id, failed);
        true
    }

    fn fail_pending(&self, node_id: i64) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = drained.len();
        for request in drained {
            let _ = request.response_tx.send(Err(NetworkError::Disconnected(node_id)));
        }
        count
    }

    /// Ids of nodes with a live session
    pub fn online_nodes(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Process a frame received from a node.
    ///
    /// Responses resolve their pending request; other frames are returned for
    /// the caller to forward. Undecodable frames are logged and dropped.
    pub fn handle_inbound(&self, node_id: i64, frame: &str) -> Option<Value> {
        let key = self
            .sessions
            .read()
            .get(&node_id)
            .and_then(|s| s.key.clone());

        match decode_frame(frame, key.as_ref()) {
            Ok(InboundFrame::Response(response)) => {
                self.resolve(node_id, response);
                None
            }
            Ok(InboundFrame::Message(value)) => Some(value),
            Err(e) => {
                warn!("Dropping frame from node {}: {}", node_id, e);
                None
            }
        }
    }

    fn resolve(&self, node_id: i64, response: ControlResponse) {
        let request = {
            let mut pending = self.pending.lock();
            let accepted = match pending.get(&response.request_id) {
                None => {
                    debug!(
                        "Ignoring stale {} {} from node {}",
                        response.response_type, response.request_id, node_id
                    );
                    false
                }
                Some(p) if p.node_id != node_id => {
                    debug!(
                        "Ignoring response {} from node {}, addressed to node {}",
                        response.request_id, node_id, p.node_id
                    );
                    false
                }
                Some(p) if !p.expected_type.eq_ignore_ascii_case(response.response_type.trim()) => {
                    debug!(
                        "Ignoring {} for {}, expected {}",
                        response.response_type, response.request_id, p.expected_type
                    );
                    false
                }
                Some(_) => true,
            };
            if !accepted {
                return;
            }
            pending.remove(&response.request_id)
        };

        let Some(request) = request else {
            return;
        };

        let result = if response.success {
            Ok(response)
        } else {
            let message = if response.message.trim().is_empty() {
                "command failed".to_string()
            } else {
                response.message
            };
            Err(NetworkError::CommandFailed(message))
        };
        let _ = request.response_tx.send(result);
    }

    /// Send a command with an explicit bounded wait
    pub async fn send_command_with_timeout(
        &self,
        node_id: i64,
        command_type: &str,
        data: Value,
        wait: Duration,
    ) -> NetworkResult<ControlResponse> {
        if command_type.trim().is_empty() {
            return Err(NetworkError::InvalidCommand("command type is empty".into()));
        }

        let (outbound, key) = self
            .sessions
            .read()
            .get(&node_id)
            .map(|s| (s.outbound.clone(), s.key.clone()))
            .ok_or(NetworkError::NodeOffline(node_id))?;

        let command = ControlCommand {
            command_type: command_type.to_string(),
            request_id: self.request_ids.next(node_id),
            data,
        };
        let frame = encode_command(&command, key.as_ref())?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().insert(
            command.request_id.clone(),
            PendingRequest {
                node_id,
                expected_type: response_type(command_type),
                response_tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: command.request_id.clone(),
        };

        let exchange = async {
            if outbound.send(frame).await.is_err() {
                return Err(NetworkError::Disconnected(node_id));
            }
            debug!("Sent {} {} to node {}", command_type, command.request_id, node_id);
            match response_rx.await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Disconnected(node_id)),
            }
        };

        match timeout(wait, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} {} to node {} timed out", command_type, command.request_id, node_id);
                Err(NetworkError::Timeout(response_type(command_type)))
            }
        }
    }
}

#[async_trait]
impl NodeCommander for SessionRegistry {
    fn is_online(&self, node_id: i64) -> bool {
        self.sessions.read().contains_key(&node_id)
    }

    async fn send_command(&self, node_id: i64, command_type: &str, data: Value) -> NetworkResult<ControlResponse> {
        self.send_command_with_timeout(node_id, command_type, data, self.command_timeout)
            .await
    }
}

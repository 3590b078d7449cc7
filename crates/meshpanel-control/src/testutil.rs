//! In-process fakes of the node channel and the federation API

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use meshpanel_core::store::{nodes, topology};
use meshpanel_core::{IpPreference, NewNode, NewTunnel, Node, ProbeResult, Store, TunnelType};
use meshpanel_federation::{
    ApplyLeaseRequest, ApplyLeaseResponse, DiagnoseRequest, FederationError, FederationResult,
    LeaseClient, ReleaseLeaseRequest, RemoteEndpoint, RemoteProber, RemoteShareInfo, ShareConnector,
};
use meshpanel_network::protocol::response_type;
use meshpanel_network::{commands, ControlResponse, NetworkError, NetworkResult, NodeCommander};

pub fn make_store() -> Store {
    Store::open_in_memory().unwrap()
}

pub fn make_node(store: &Store, name: &str, port: &str) -> Node {
    make_dual_stack_node(store, name, port, None, None)
}

pub fn make_dual_stack_node(store: &Store, name: &str, port: &str, v4: Option<&str>, v6: Option<&str>) -> Node {
    store
        .write(|tx| {
            nodes::insert_node(
                tx,
                &NewNode {
                    name: name.into(),
                    server_ip: format!("{}.example.net", name),
                    server_ip_v4: v4.map(str::to_string),
                    server_ip_v6: v6.map(str::to_string),
                    port: port.into(),
                    ..Default::default()
                },
            )
        })
        .unwrap()
}

/// Remote node as created by an import, leased through `url`
pub fn make_remote_node(store: &Store, name: &str, url: &str) -> Node {
    store
        .write(|tx| {
            nodes::insert_node(
                tx,
                &NewNode {
                    name: name.into(),
                    server_ip: format!("{}.peer.example", name),
                    port: "40000-40010".into(),
                    is_remote: true,
                    remote_url: Some(url.into()),
                    remote_token: Some(format!("token-{}", name)),
                    remote_config: Some(r#"{"shareId":1}"#.into()),
                    ..Default::default()
                },
            )
        })
        .unwrap()
}

pub fn make_new_tunnel(name: &str, tunnel_type: TunnelType, preference: IpPreference) -> NewTunnel {
    NewTunnel {
        name: name.into(),
        tunnel_type,
        traffic_ratio: 1.0,
        ip_preference: preference,
        in_ip: None,
    }
}

pub fn count_rows(store: &Store, table: &str) -> i64 {
    store
        .read(|conn| Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?))
        .unwrap()
}

pub fn tunnel_ports(store: &Store, tunnel_id: i64) -> Vec<u16> {
    store
        .read(|conn| topology::list_chain_hops(conn, tunnel_id))
        .unwrap()
        .into_iter()
        .map(|hop| hop.port)
        .collect()
}

/// Node channel double: records commands, answers pings from a script
#[derive(Default)]
pub struct FakeNodes {
    online: Mutex<HashSet<i64>>,
    failing: Mutex<HashSet<String>>,
    pings: Mutex<HashMap<String, ProbeResult>>,
    pub sent: Mutex<Vec<(i64, String, Value)>>,
}

impl FakeNodes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, node_id: i64) {
        self.online.lock().insert(node_id);
    }

    pub fn fail_command(&self, command_type: &str) {
        self.failing.lock().insert(command_type.to_string());
    }

    pub fn script_ping(&self, ip: &str, result: ProbeResult) {
        self.pings.lock().insert(ip.to_string(), result);
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl NodeCommander for FakeNodes {
    fn is_online(&self, node_id: i64) -> bool {
        self.online.lock().contains(&node_id)
    }

    async fn send_command(&self, node_id: i64, command_type: &str, data: Value) -> NetworkResult<ControlResponse> {
        if !self.is_online(node_id) {
            return Err(NetworkError::NodeOffline(node_id));
        }
        self.sent.lock().push((node_id, command_type.to_string(), data.clone()));
        if self.failing.lock().contains(command_type) {
            return Err(NetworkError::CommandFailed(format!("{} rejected", command_type)));
        }

        // probe replies carry their outcome in data only
        let is_ping = command_type == commands::TCP_PING;
        let data = if is_ping {
            let ip = data["ip"].as_str().unwrap_or_default().to_string();
            let result = self.pings.lock().get(&ip).cloned().unwrap_or(ProbeResult {
                success: true,
                average_time: 12.5,
                packet_loss: 0.0,
                message: String::new(),
            });
            Some(serde_json::to_value(result)?)
        } else {
            None
        };

        Ok(ControlResponse {
            response_type: response_type(command_type),
            request_id: format!("{}_1", node_id),
            success: true,
            message: if is_ping { String::new() } else { "OK".into() },
            data,
        })
    }
}

/// Provider panel double: hands out ports from 40000 per endpoint URL
#[derive(Default)]
pub struct FakeLeases {
    next_port: Mutex<HashMap<String, u16>>,
    fail_urls: Mutex<HashSet<String>>,
    pub applied: Mutex<Vec<(RemoteEndpoint, ApplyLeaseRequest)>>,
    pub released: Mutex<Vec<(RemoteEndpoint, ReleaseLeaseRequest)>>,
}

impl FakeLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every apply against `url` fails with capacity exhaustion
    pub fn exhaust(&self, url: &str) {
        self.fail_urls.lock().insert(url.to_string());
    }

    pub fn released_reservations(&self) -> Vec<String> {
        self.released
            .lock()
            .iter()
            .filter_map(|(_, r)| r.reservation_id.clone())
            .collect()
    }
}

#[async_trait]
impl LeaseClient for FakeLeases {
    async fn apply_lease(&self, remote: &RemoteEndpoint, request: &ApplyLeaseRequest) -> FederationResult<ApplyLeaseResponse> {
        if self.fail_urls.lock().contains(&remote.url) {
            return Err(FederationError::CapacityExhausted("No available port".into()));
        }
        let port = {
            let mut next = self.next_port.lock();
            let port = next.entry(remote.url.clone()).or_insert(40000);
            let allocated = *port;
            *port += 1;
            allocated
        };
        self.applied.lock().push((remote.clone(), request.clone()));
        Ok(ApplyLeaseResponse {
            reservation_id: request.reservation_id.clone(),
            binding_id: request.binding_id.clone(),
            allocated_port: port,
        })
    }

    async fn release_lease(&self, remote: &RemoteEndpoint, request: &ReleaseLeaseRequest) -> FederationResult<()> {
        self.released.lock().push((remote.clone(), request.clone()));
        Ok(())
    }
}

/// `connect` double returning a fixed share
pub struct FakeConnector {
    pub info: RemoteShareInfo,
}

#[async_trait]
impl ShareConnector for FakeConnector {
    async fn connect(&self, remote: &RemoteEndpoint) -> FederationResult<RemoteShareInfo> {
        if remote.token != "good-token" {
            return Err(FederationError::Unauthorized("Unauthorized".into()));
        }
        Ok(self.info.clone())
    }
}

/// Remote diagnose double recording every request
#[derive(Default)]
pub struct FakeProber {
    pub requests: Mutex<Vec<(RemoteEndpoint, DiagnoseRequest)>>,
}

#[async_trait]
impl RemoteProber for FakeProber {
    async fn diagnose(&self, remote: &RemoteEndpoint, request: &DiagnoseRequest) -> FederationResult<ProbeResult> {
        self.requests.lock().push((remote.clone(), request.clone()));
        Ok(ProbeResult {
            success: true,
            average_time: 30.0,
            packet_loss: 0.0,
            message: "remote ok".into(),
        })
    }
}

//! Capacity Lease Manager
//!
//! Provider side of federation. A reservation is first recorded in the share
//! ledger (idempotent per reservation id, one transaction), then installed on
//! the share's node: a relay service listening on the leased port and, for the
//! middle role, a chain forwarding to the consumer's next hop.
//!
//! A reservation whose install fails is released again before the error is
//! returned, so a retry with the same reservation id starts clean.

use std::net::IpAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use meshpanel_core::address::{join_host_port, node_address_v4, node_address_v6};
use meshpanel_core::store::{leases, nodes};
use meshpanel_core::{
    now_ms, CoreError, FlowSample, LeaseRole, Node, PeerShare, PeerShareRuntime, ProbeResult, Store,
    DEFAULT_STRATEGY,
};
use meshpanel_federation::types::{DEFAULT_PROBE_COUNT, DEFAULT_PROBE_TIMEOUT_MS};
use meshpanel_federation::{ApplyLeaseRequest, ApplyLeaseResponse, DiagnoseRequest, ReleaseLeaseRequest, RemoteShareInfo};
use meshpanel_network::{commands, NodeCommander, TcpPingRequest};

use crate::error::{ControlError, ControlResult};

/// Selector fail timeout pushed with every chain hop (nanoseconds)
const CHAIN_FAIL_TIMEOUT_NS: i64 = 600_000_000_000;

/// Provider-side lease handling for peer shares
pub struct LeaseManager {
    store: Store,
    nodes: Arc<dyn NodeCommander>,
}

impl LeaseManager {
    pub fn new(store: Store, nodes: Arc<dyn NodeCommander>) -> Self {
        Self { store, nodes }
    }

    /// Resolve a bearer token; the share may be disabled or expired
    pub fn authenticate(&self, token: &str, caller_ip: Option<IpAddr>) -> ControlResult<PeerShare> {
        let share = self
            .store
            .read(|conn| leases::find_share_by_token(conn, token))?
            .ok_or_else(|| ControlError::Unauthorized("Unauthorized".into()))?;
        if !share.allows_ip(caller_ip) {
            return Err(ControlError::Forbidden("IP not allowed".into()));
        }
        Ok(share)
    }

    /// Resolve a bearer token to a share that may take new work
    pub fn authorize(&self, token: &str, caller_ip: Option<IpAddr>) -> ControlResult<PeerShare> {
        Ok(self
            .store
            .read(|conn| leases::authorize_share(conn, token, caller_ip, now_ms()))?)
    }

    /// What a consumer learns when it imports the share
    pub fn share_info(&self, share: &PeerShare) -> ControlResult<RemoteShareInfo> {
        let node = self.store.read(|conn| nodes::get_node(conn, share.node_id))?;
        let server_ip = node_address_v4(&node)
            .or_else(|| node_address_v6(&node))
            .unwrap_or_default();

        Ok(RemoteShareInfo {
            share_id: share.id,
            share_name: share.name.clone(),
            node_id: node.id,
            node_name: node.name,
            server_ip,
            status: node.status,
            max_bandwidth: share.max_bandwidth,
            current_flow: share.current_flow,
            expiry_time: share.expiry_time,
            port_range_start: share.port_range_start,
            port_range_end: share.port_range_end,
        })
    }

    /// Reserve a port under the share and install the role on its node
    pub async fn apply(&self, share: &PeerShare, request: ApplyLeaseRequest) -> ControlResult<ApplyLeaseResponse> {
        if let Some(bad) = request
            .targets
            .iter()
            .find(|t| t.host.trim().is_empty() || t.port == 0)
        {
            return Err(ControlError::InvalidInput(format!(
                "invalid target {}:{}",
                bad.host, bad.port
            )));
        }

        let lease = request.into_lease_apply();
        let share_id = share.id;
        let (runtime, created, node) = self.store.write(|tx| {
            // re-read so the usability check sees committed state
            let share = leases::get_share(tx, share_id)?;
            let node = nodes::get_node(tx, share.node_id)?;
            let (runtime, created) = leases::apply_reservation(tx, &share, &lease, now_ms())?;
            Ok((runtime, created, node))
        })?;

        if created {
            self.install(&node, &runtime).await?;
        }

        Ok(ApplyLeaseResponse {
            reservation_id: runtime.reservation_id,
            binding_id: runtime.binding_id,
            allocated_port: runtime.port,
        })
    }

    /// Push the service (and chain) of a fresh reservation to its node
    async fn install(&self, node: &Node, runtime: &PeerShareRuntime) -> ControlResult<()> {
        if !self.nodes.is_online(node.id) {
            warn!(
                "Node {} offline, reservation {} kept without a running service",
                node.id, runtime.reservation_id
            );
            return Ok(());
        }

        let service_name = format!("fed_svc_{}", runtime.id);
        let chain_name = match runtime.role {
            LeaseRole::Middle => format!("fed_chain_{}", runtime.id),
            LeaseRole::Exit => String::new(),
        };

        if !chain_name.is_empty() {
            let chain = chain_payload(node, runtime, &chain_name);
            if let Err(e) = self.nodes.send_command(node.id, commands::ADD_CHAINS, chain).await {
                warn!("AddChains for reservation {} failed: {}", runtime.reservation_id, e);
                self.abandon(runtime);
                return Err(e.into());
            }
        }

        let service = service_payload(node, runtime, &service_name, &chain_name);
        if let Err(e) = self.nodes.send_command(node.id, commands::ADD_SERVICE, service).await {
            warn!("AddService for reservation {} failed: {}", runtime.reservation_id, e);
            if !chain_name.is_empty() {
                self.push_quietly(node.id, commands::DELETE_CHAINS, json!({ "chain": chain_name }))
                    .await;
            }
            self.abandon(runtime);
            return Err(e.into());
        }

        self.store
            .write(|tx| leases::set_runtime_service(tx, runtime.id, &service_name, &chain_name))?;
        info!(
            "Installed {} on node {} port {} for reservation {}",
            service_name, node.id, runtime.port, runtime.reservation_id
        );
        Ok(())
    }

    fn abandon(&self, runtime: &PeerShareRuntime) {
        if let Err(e) = self
            .store
            .write(|tx| leases::mark_runtime_released(tx, runtime.id))
        {
            warn!("Could not release reservation {}: {}", runtime.reservation_id, e);
        }
    }

    /// Release a reservation. Unknown or already released reservations succeed.
    pub async fn release(&self, share: &PeerShare, request: &ReleaseLeaseRequest) -> ControlResult<()> {
        if request.is_empty() {
            return Err(ControlError::InvalidInput(
                "bindingId or reservationId or resourceKey is required".into(),
            ));
        }

        let share_id = share.id;
        let released = self.store.write(|tx| {
            let found = leases::find_runtime_for_release(
                tx,
                share_id,
                request.binding_id.as_deref(),
                request.reservation_id.as_deref(),
                request.resource_key.as_deref(),
            )?;
            match found {
                Some(runtime) => Ok(leases::mark_runtime_released(tx, runtime.id)?.then_some(runtime)),
                None => Ok(None),
            }
        })?;

        match released {
            Some(runtime) => {
                self.uninstall(&runtime).await;
                info!(
                    "Released reservation {} on share {} port {}",
                    runtime.reservation_id, share_id, runtime.port
                );
            }
            None => debug!("Release on share {} matched no active reservation", share_id),
        }
        Ok(())
    }

    /// Remove a released reservation's service and chain from its node
    async fn uninstall(&self, runtime: &PeerShareRuntime) {
        if !self.nodes.is_online(runtime.node_id) {
            return;
        }
        if !runtime.service_name.is_empty() {
            self.push_quietly(
                runtime.node_id,
                commands::DELETE_SERVICE,
                json!({ "services": [runtime.service_name] }),
            )
            .await;
        }
        if !runtime.chain_name.is_empty() {
            self.push_quietly(
                runtime.node_id,
                commands::DELETE_CHAINS,
                json!({ "chain": runtime.chain_name }),
            )
            .await;
        }
    }

    async fn push_quietly(&self, node_id: i64, command_type: &str, data: Value) {
        if let Err(e) = self.nodes.send_command(node_id, command_type, data).await {
            warn!("{} on node {} failed: {}", command_type, node_id, e);
        }
    }

    /// Probe a target from the share's node
    pub async fn diagnose(&self, share: &PeerShare, request: &DiagnoseRequest) -> ControlResult<ProbeResult> {
        let ip = request.ip.trim();
        if ip.is_empty() || request.port == 0 {
            return Err(ControlError::InvalidInput("Invalid target".into()));
        }
        let count = if request.count == 0 { DEFAULT_PROBE_COUNT } else { request.count };
        let timeout = if request.timeout == 0 {
            DEFAULT_PROBE_TIMEOUT_MS
        } else {
            request.timeout
        };

        let result = self
            .nodes
            .tcp_ping(share.node_id, TcpPingRequest::new(ip, request.port, count, timeout))
            .await?;
        debug!(
            "Share {} probe to {} -> success={} avg={}ms",
            share.id,
            join_host_port(ip, request.port),
            result.success,
            result.average_time
        );
        Ok(result)
    }

    /// Count a node's traffic report against the shares whose reservations
    /// produced it. Returns how many samples matched a share.
    pub fn record_flow(&self, node_id: i64, samples: &[FlowSample]) -> ControlResult<usize> {
        let credited = self.store.write(|tx| {
            let mut credited = 0;
            for sample in samples.iter().filter(|s| s.total() > 0) {
                let Some(share_id) = leases::find_share_by_service(tx, node_id, &sample.service_name)? else {
                    continue;
                };
                leases::add_share_flow(tx, share_id, sample.total())?;
                credited += 1;
            }
            Ok::<_, CoreError>(credited)
        })?;
        if credited > 0 {
            debug!("Node {} reported flow for {} share services", node_id, credited);
        }
        Ok(credited)
    }

    /// Delete a share after releasing every reservation still held under it
    pub async fn delete_share(&self, share_id: i64) -> ControlResult<()> {
        let released = self.store.write(|tx| {
            leases::get_share(tx, share_id)?;
            let mut released = Vec::new();
            for runtime in leases::list_active_runtimes(tx, share_id)? {
                if leases::mark_runtime_released(tx, runtime.id)? {
                    released.push(runtime);
                }
            }
            Ok::<_, CoreError>(released)
        })?;

        for runtime in &released {
            self.uninstall(runtime).await;
        }
        self.store.write(|tx| leases::delete_share(tx, share_id))?;
        info!(
            "Deleted peer share {} ({} reservations released)",
            share_id,
            released.len()
        );
        Ok(())
    }
}

/// `AddChains` body: one hop whose nodes are the consumer's next-hop targets
fn chain_payload(node: &Node, runtime: &PeerShareRuntime, chain_name: &str) -> Value {
    let strategy = if runtime.strategy.trim().is_empty() {
        DEFAULT_STRATEGY
    } else {
        runtime.strategy.trim()
    };

    let nodes: Vec<Value> = runtime
        .targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let dialer = if target.protocol.trim().is_empty() {
                runtime.protocol.as_str()
            } else {
                target.protocol.trim()
            };
            json!({
                "name": format!("node_{}", i + 1),
                "addr": join_host_port(&target.host, target.port),
                "connector": { "type": "relay" },
                "dialer": { "type": dialer },
            })
        })
        .collect();

    let mut hop = json!({
        "name": format!("hop_{}", runtime.id),
        "selector": {
            "strategy": strategy,
            "maxFails": 1,
            "failTimeout": CHAIN_FAIL_TIMEOUT_NS,
        },
        "nodes": nodes,
    });
    if let Some(interface) = interface_of(node) {
        hop["interface"] = json!(interface);
    }

    json!({ "name": chain_name, "hops": [hop] })
}

/// `AddService` body: a relay listener on the reserved port
fn service_payload(node: &Node, runtime: &PeerShareRuntime, service_name: &str, chain_name: &str) -> Value {
    let mut service = json!({
        "name": service_name,
        "addr": format!("{}:{}", node.tcp_listen_addr, runtime.port),
        "handler": { "type": "relay" },
        "listener": { "type": runtime.protocol },
    });
    if !chain_name.is_empty() {
        service["handler"]["chain"] = json!(chain_name);
    }
    if runtime.role == LeaseRole::Exit {
        if let Some(interface) = interface_of(node) {
            service["metadata"] = json!({ "interface": interface });
        }
    }
    json!([service])
}

fn interface_of(node: &Node) -> Option<&str> {
    node.interface_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use meshpanel_core::{LeaseTarget, NewPeerShare};

    fn make_share(store: &Store, node_id: i64, start: u16, end: u16) -> PeerShare {
        store
            .write(|tx| {
                leases::create_share(
                    tx,
                    &NewPeerShare {
                        name: "partner".into(),
                        node_id,
                        port_range_start: start,
                        port_range_end: end,
                        ..Default::default()
                    },
                )
            })
            .unwrap()
    }

    fn make_apply(reservation: &str, role: LeaseRole) -> ApplyLeaseRequest {
        let targets = match role {
            LeaseRole::Middle => vec![LeaseTarget {
                host: "2001:db8::7".into(),
                port: 30001,
                protocol: "tls".into(),
            }],
            LeaseRole::Exit => Vec::new(),
        };
        ApplyLeaseRequest {
            reservation_id: reservation.into(),
            binding_id: format!("binding-{}", reservation),
            resource_key: "node:9:type:2:hop:1".into(),
            role,
            protocol: "tls".into(),
            strategy: String::new(),
            requested_port: None,
            targets,
        }
    }

    fn make_manager() -> (Store, Arc<FakeNodes>, LeaseManager, PeerShare) {
        let store = make_store();
        let node = make_node(&store, "provider", "1000-1010");
        let share = make_share(&store, node.id, 20000, 20002);
        let nodes = FakeNodes::new();
        nodes.set_online(node.id);
        let manager = LeaseManager::new(store.clone(), nodes.clone());
        (store, nodes, manager, share)
    }

    #[tokio::test]
    async fn test_reported_flow_exhausts_share_until_reset() {
        let (store, _nodes, manager, share) = make_manager();
        store
            .write(|tx| Ok(tx.execute("UPDATE peer_share SET max_bandwidth = 1000 WHERE id = ?1", [share.id])?))
            .unwrap();
        let response = manager.apply(&share, make_apply("r1", LeaseRole::Exit)).await.unwrap();
        let runtime = store
            .read(|conn| leases::find_active_runtime(conn, share.id, &response.reservation_id))
            .unwrap()
            .unwrap();

        let samples = vec![
            FlowSample {
                service_name: runtime.service_name.clone(),
                upload: 300,
                download: 700,
            },
            FlowSample {
                service_name: "unrelated".into(),
                upload: 5,
                download: 5,
            },
        ];
        assert_eq!(manager.record_flow(share.node_id, &samples).unwrap(), 1);
        assert_eq!(store.read(|conn| leases::list_shares(conn)).unwrap()[0].current_flow, 1000);
        assert!(matches!(
            manager.authorize(&share.token, None),
            Err(ControlError::Forbidden(ref m)) if m == "Share traffic exceeded"
        ));

        store.write(|tx| leases::reset_share_flow(tx, share.id)).unwrap();
        assert!(manager.authorize(&share.token, None).is_ok());
    }

    #[tokio::test]
    async fn test_apply_installs_chain_then_service() {
        let (store, nodes, manager, share) = make_manager();

        let response = manager
            .apply(&share, make_apply("r1", LeaseRole::Middle))
            .await
            .unwrap();
        assert_eq!(response.allocated_port, 20000);
        assert_eq!(nodes.sent_types(), vec!["AddChains", "AddService"]);

        let sent = nodes.sent.lock().clone();
        let chain = &sent[0].2;
        assert!(chain["name"].as_str().unwrap().starts_with("fed_chain_"));
        assert_eq!(chain["hops"][0]["nodes"][0]["addr"], "[2001:db8::7]:30001");
        assert_eq!(chain["hops"][0]["selector"]["strategy"], "round");
        let service = &sent[1].2[0];
        assert_eq!(service["addr"], "[::]:20000");
        assert_eq!(service["handler"]["chain"], chain["name"]);

        let runtimes = store.read(|conn| leases::list_runtimes(conn, share.id)).unwrap();
        assert_eq!(runtimes.len(), 1);
        assert!(runtimes[0].service_name.starts_with("fed_svc_"));
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let (store, nodes, manager, share) = make_manager();

        let first = manager.apply(&share, make_apply("r1", LeaseRole::Exit)).await.unwrap();
        let second = manager.apply(&share, make_apply("r1", LeaseRole::Exit)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(nodes.sent_types(), vec!["AddService"]);
        assert_eq!(count_rows(&store, "peer_share_runtime"), 1);
    }

    #[tokio::test]
    async fn test_failed_install_releases_reservation() {
        let (store, nodes, manager, share) = make_manager();
        nodes.fail_command(commands::ADD_SERVICE);

        let err = manager
            .apply(&share, make_apply("r1", LeaseRole::Middle))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::CommandFailed(_)));
        assert_eq!(nodes.sent_types(), vec!["AddChains", "AddService", "DeleteChains"]);

        let active = store.read(|conn| leases::list_active_runtimes(conn, share.id)).unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_offline_node_keeps_reservation() {
        let store = make_store();
        let node = make_node(&store, "provider", "1000");
        let share = make_share(&store, node.id, 20000, 20000);
        let nodes = FakeNodes::new();
        let manager = LeaseManager::new(store.clone(), nodes.clone());

        let response = manager.apply(&share, make_apply("r1", LeaseRole::Exit)).await.unwrap();
        assert_eq!(response.allocated_port, 20000);
        assert!(nodes.sent_types().is_empty());
        assert_eq!(
            store.read(|conn| leases::list_active_runtimes(conn, share.id)).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_exhausted_share_creates_no_row() {
        let (store, _nodes, manager, share) = make_manager();
        for r in ["r1", "r2", "r3"] {
            manager.apply(&share, make_apply(r, LeaseRole::Exit)).await.unwrap();
        }

        let err = manager
            .apply(&share, make_apply("r4", LeaseRole::Exit))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::CapacityExhausted(ref m) if m == "No available port"));
        assert_eq!(count_rows(&store, "peer_share_runtime"), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, nodes, manager, share) = make_manager();
        manager.apply(&share, make_apply("r1", LeaseRole::Middle)).await.unwrap();

        let request = ReleaseLeaseRequest {
            binding_id: Some("binding-r1".into()),
            ..Default::default()
        };
        manager.release(&share, &request).await.unwrap();
        manager.release(&share, &request).await.unwrap();

        assert_eq!(
            nodes.sent_types(),
            vec!["AddChains", "AddService", "DeleteService", "DeleteChains"]
        );
        let runtimes = store.read(|conn| leases::list_runtimes(conn, share.id)).unwrap();
        assert_eq!(runtimes.len(), 1);
        assert!(!runtimes[0].active);

        let unknown = ReleaseLeaseRequest {
            reservation_id: Some("never-applied".into()),
            ..Default::default()
        };
        manager.release(&share, &unknown).await.unwrap();
        assert!(manager.release(&share, &ReleaseLeaseRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_share_releases_everything() {
        let (store, nodes, manager, share) = make_manager();
        manager.apply(&share, make_apply("r1", LeaseRole::Exit)).await.unwrap();
        manager.apply(&share, make_apply("r2", LeaseRole::Exit)).await.unwrap();

        manager.delete_share(share.id).await.unwrap();

        let deletes = nodes
            .sent_types()
            .into_iter()
            .filter(|t| t == "DeleteService")
            .count();
        assert_eq!(deletes, 2);
        assert_eq!(count_rows(&store, "peer_share"), 0);
        assert_eq!(count_rows(&store, "peer_share_runtime"), 0);
    }

    #[tokio::test]
    async fn test_diagnose_runs_on_share_node() {
        let (store, nodes, manager, share) = make_manager();

        let result = manager
            .diagnose(&share, &DiagnoseRequest::new("1.1.1.1", 443))
            .await
            .unwrap();
        assert!(result.success);
        let sent = nodes.sent.lock().clone();
        assert_eq!(sent[0].0, share.node_id);
        assert_eq!(sent[0].2["count"], 4);

        let offline_node = make_node(&store, "dark", "2000");
        let offline_share = make_share(&store, offline_node.id, 21000, 21001);
        let err = manager
            .diagnose(&offline_share, &DiagnoseRequest::new("1.1.1.1", 443))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NodeOffline(_)));
    }

    #[tokio::test]
    async fn test_token_checks() {
        let (store, _nodes, manager, share) = make_manager();

        assert!(matches!(
            manager.authenticate("nope", None),
            Err(ControlError::Unauthorized(_))
        ));
        store
            .write(|tx| leases::set_share_active(tx, share.id, false))
            .unwrap();
        assert!(manager.authenticate(&share.token, None).is_ok());
        assert!(matches!(
            manager.authorize(&share.token, None),
            Err(ControlError::Forbidden(ref m)) if m == "Share is disabled"
        ));

        let info = manager.share_info(&share).unwrap();
        assert_eq!(info.share_id, share.id);
        assert_eq!(info.server_ip, "provider.example.net");
        assert_eq!((info.port_range_start, info.port_range_end), (20000, 20002));
    }
}

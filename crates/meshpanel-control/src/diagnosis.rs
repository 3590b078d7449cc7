//! Diagnosis Orchestrator
//!
//! Probes every segment of a tunnel (and, for a forward, the final segment to
//! each of its targets) with a TCP reachability test run on the segment's
//! source node. Segments are probed concurrently; results come back in
//! topology order and a failed segment never stops the others.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use meshpanel_core::address::{
    first_port_from_range, join_host_port, parse_target_address, parse_target_list,
};
use meshpanel_core::config::DiagnosisConfig;
use meshpanel_core::store::{forwards, nodes, topology};
use meshpanel_core::{
    now_ms, AddressSelector, ChainHop, ChainType, IpPreference, Node, PreferenceOrder, ProbeResult, Store,
    TunnelTopology, TunnelType,
};
use meshpanel_federation::{DiagnoseRequest, RemoteEndpoint, RemoteProber};
use meshpanel_network::{NodeCommander, TcpPingRequest};

use crate::error::{ControlError, ControlResult};

/// Port probed when a hop has no allocated port and its node no range
const FALLBACK_PROBE_PORT: u16 = 443;

/// Chooses the node that stands for a hop group in a probe pair
pub trait RepresentativePolicy: Send + Sync {
    /// Policy name used in configuration
    fn name(&self) -> &'static str;

    fn pick<'a>(&self, group: &'a [ChainHop]) -> Option<&'a ChainHop>;
}

/// First node of the group in hop order
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstInGroup;

impl RepresentativePolicy for FirstInGroup {
    fn name(&self) -> &'static str {
        "first-in-group"
    }

    fn pick<'a>(&self, group: &'a [ChainHop]) -> Option<&'a ChainHop> {
        group.first()
    }
}

/// Address policy by configured name
pub fn address_selector(name: &str) -> ControlResult<Arc<dyn AddressSelector>> {
    match name.trim() {
        "" | "preference-order" => Ok(Arc::new(PreferenceOrder)),
        other => Err(ControlError::InvalidInput(format!("unknown address policy {}", other))),
    }
}

/// Representative policy by configured name
pub fn representative_policy(name: &str) -> ControlResult<Arc<dyn RepresentativePolicy>> {
    match name.trim() {
        "" | "first-in-group" => Ok(Arc::new(FirstInGroup)),
        other => Err(ControlError::InvalidInput(format!(
            "unknown representative policy {}",
            other
        ))),
    }
}

/// Outcome of one probed segment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisItem {
    pub description: String,
    /// Node the probe ran on
    pub node_id: i64,
    pub node_name: String,
    pub target_ip: String,
    pub target_port: u16,
    pub success: bool,
    pub average_time: f64,
    pub packet_loss: f64,
    pub message: String,
    pub from_chain_type: ChainType,
    /// Absent when the destination is an address rather than a hop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_chain_type: Option<ChainType>,
    pub from_inx: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_inx: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisReport {
    pub tunnel_id: i64,
    pub tunnel_name: String,
    pub tunnel_type: TunnelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_name: Option<String>,
    pub timestamp: i64,
    pub results: Vec<DiagnosisItem>,
}

/// One segment to probe
struct Probe {
    description: String,
    source: ChainHop,
    to_chain_type: Option<ChainType>,
    to_inx: Option<i64>,
    /// Resolved target, or why none could be resolved
    target: Result<(String, u16), String>,
}

/// Runs diagnosis over tunnels and forwards
pub struct DiagnosisOrchestrator {
    store: Store,
    nodes: Arc<dyn NodeCommander>,
    remote: Arc<dyn RemoteProber>,
    config: DiagnosisConfig,
    addresses: Arc<dyn AddressSelector>,
    representatives: Arc<dyn RepresentativePolicy>,
}

impl DiagnosisOrchestrator {
    /// Build with the policies named in `config`
    pub fn new(
        store: Store,
        nodes: Arc<dyn NodeCommander>,
        remote: Arc<dyn RemoteProber>,
        config: DiagnosisConfig,
    ) -> ControlResult<Self> {
        let addresses = address_selector(&config.address_policy)?;
        let representatives = representative_policy(&config.representative_policy)?;
        Ok(Self {
            store,
            nodes,
            remote,
            config,
            addresses,
            representatives,
        })
    }

    pub fn with_address_selector(mut self, selector: Arc<dyn AddressSelector>) -> Self {
        self.addresses = selector;
        self
    }

    pub fn with_representative_policy(mut self, policy: Arc<dyn RepresentativePolicy>) -> Self {
        self.representatives = policy;
        self
    }

    /// Probe each segment of a tunnel
    pub async fn diagnose_tunnel(&self, tunnel_id: i64) -> ControlResult<DiagnosisReport> {
        let (view, node_map) = self.load(tunnel_id)?;

        let mut probes = self.segment_probes(&view, &node_map);
        if view.tunnel.tunnel_type == TunnelType::PortForward {
            let target = parse_target_address(&self.config.external_target).ok_or_else(|| {
                ControlError::InvalidInput(format!(
                    "external probe target is not host:port: {}",
                    self.config.external_target
                ))
            })?;
            if let Some(entry) = self.representatives.pick(&view.topology.entry) {
                probes.push(Probe {
                    description: format!("{} -> Internet", hop_label(entry, &node_map)),
                    source: entry.clone(),
                    to_chain_type: None,
                    to_inx: None,
                    target: Ok(target),
                });
            }
        }

        let results = self.run(probes, &node_map).await;
        info!(
            "Diagnosed tunnel {}: {}/{} segments reachable",
            tunnel_id,
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        Ok(DiagnosisReport {
            tunnel_id,
            tunnel_name: view.tunnel.name,
            tunnel_type: view.tunnel.tunnel_type,
            forward_id: None,
            forward_name: None,
            timestamp: now_ms(),
            results,
        })
    }

    /// Probe a forward's tunnel, then the last hop to each forward target
    pub async fn diagnose_forward(&self, forward_id: i64) -> ControlResult<DiagnosisReport> {
        let forward = self.store.read(|conn| forwards::get_forward(conn, forward_id))?;
        let targets = parse_target_list(&forward.remote_addr);
        if targets.is_empty() {
            return Err(ControlError::InvalidInput(format!(
                "forward {} has no valid target in {:?}",
                forward_id, forward.remote_addr
            )));
        }
        let (view, node_map) = self.load(forward.tunnel_id)?;

        let (mut probes, last_group) = match view.tunnel.tunnel_type {
            TunnelType::TunnelForward => (self.segment_probes(&view, &node_map), &view.topology.exit),
            TunnelType::PortForward => (Vec::new(), &view.topology.entry),
        };
        if let Some(last) = self.representatives.pick(last_group) {
            for (host, port) in targets {
                probes.push(Probe {
                    description: format!(
                        "{} -> Target ({})",
                        hop_label(last, &node_map),
                        join_host_port(&host, port)
                    ),
                    source: last.clone(),
                    to_chain_type: None,
                    to_inx: None,
                    target: Ok((host, port)),
                });
            }
        }

        let results = self.run(probes, &node_map).await;
        info!(
            "Diagnosed forward {}: {}/{} segments reachable",
            forward_id,
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        Ok(DiagnosisReport {
            tunnel_id: view.tunnel.id,
            tunnel_name: view.tunnel.name,
            tunnel_type: view.tunnel.tunnel_type,
            forward_id: Some(forward.id),
            forward_name: Some(forward.name),
            timestamp: now_ms(),
            results,
        })
    }

    /// Tunnel view plus every node its hops reference that still exists
    fn load(&self, tunnel_id: i64) -> ControlResult<(TunnelTopology, HashMap<i64, Node>)> {
        let loaded = self.store.read(|conn| {
            let view = topology::list_topology(conn, tunnel_id)?;
            let mut node_map = HashMap::new();
            for hop in view.topology.hops() {
                if let Some(node) = nodes::find_node(conn, hop.node_id)? {
                    node_map.insert(node.id, node);
                }
            }
            Ok((view, node_map))
        })?;

        if loaded.0.topology.entry.is_empty() {
            return Err(ControlError::InvalidInput(format!(
                "tunnel {} has no entry hops",
                tunnel_id
            )));
        }
        Ok(loaded)
    }

    /// Representative pairs along the hop chain of a tunnel forward
    fn segment_probes(&self, view: &TunnelTopology, node_map: &HashMap<i64, Node>) -> Vec<Probe> {
        if view.tunnel.tunnel_type != TunnelType::TunnelForward {
            return Vec::new();
        }

        let topology = &view.topology;
        let mut groups: Vec<&[ChainHop]> = vec![topology.entry.as_slice()];
        groups.extend(topology.relays.iter().map(Vec::as_slice));
        groups.push(topology.exit.as_slice());

        groups
            .windows(2)
            .filter_map(|pair| {
                let from = self.representatives.pick(pair[0])?;
                let to = self.representatives.pick(pair[1])?;
                Some(Probe {
                    description: format!("{} -> {}", hop_label(from, node_map), hop_label(to, node_map)),
                    source: from.clone(),
                    to_chain_type: Some(to.chain_type),
                    to_inx: (to.chain_type == ChainType::Relay).then_some(to.inx),
                    target: self.hop_target(to, node_map, view.tunnel.ip_preference),
                })
            })
            .collect()
    }

    /// Address and port a probe toward `hop` should connect to
    fn hop_target(
        &self,
        hop: &ChainHop,
        node_map: &HashMap<i64, Node>,
        preference: IpPreference,
    ) -> Result<(String, u16), String> {
        let node = node_map
            .get(&hop.node_id)
            .ok_or_else(|| format!("node {} not found", hop.node_id))?;
        let host = self
            .addresses
            .select(node, preference)
            .ok_or_else(|| format!("node {} has no address configured", node.name))?;
        let port = if hop.port > 0 {
            hop.port
        } else {
            first_port_from_range(&node.port).unwrap_or(FALLBACK_PROBE_PORT)
        };
        Ok((host, port))
    }

    async fn run(&self, probes: Vec<Probe>, node_map: &HashMap<i64, Node>) -> Vec<DiagnosisItem> {
        stream::iter(probes)
            .map(|probe| self.run_probe(probe, node_map))
            .buffered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await
    }

    async fn run_probe(&self, probe: Probe, node_map: &HashMap<i64, Node>) -> DiagnosisItem {
        let source = node_map.get(&probe.source.node_id);
        let (target_ip, target_port) = probe.target.clone().unwrap_or_default();

        let result = match (&probe.target, source) {
            (Err(reason), _) => ProbeResult::failed(reason.clone()),
            (Ok(_), None) => ProbeResult::failed(format!("node {} not found", probe.source.node_id)),
            (Ok((ip, port)), Some(node)) => self.probe_from(node, ip, *port).await,
        };
        let result = normalize(result);
        debug!(
            "{}: success={} avg={}ms loss={}%",
            probe.description, result.success, result.average_time, result.packet_loss
        );

        DiagnosisItem {
            description: probe.description,
            node_id: probe.source.node_id,
            node_name: source
                .map(|n| n.name.clone())
                .unwrap_or_else(|| format!("node_{}", probe.source.node_id)),
            target_ip,
            target_port,
            success: result.success,
            average_time: result.average_time,
            packet_loss: result.packet_loss,
            message: result.message,
            from_chain_type: probe.source.chain_type,
            to_chain_type: probe.to_chain_type,
            from_inx: probe.source.inx,
            to_inx: probe.to_inx,
        }
    }

    /// Run the probe on `node`: through its owning panel when remote, over
    /// its control session when local
    async fn probe_from(&self, node: &Node, ip: &str, port: u16) -> ProbeResult {
        if node.is_remote {
            let Some(endpoint) = RemoteEndpoint::for_node(node) else {
                return ProbeResult::failed(format!("remote node {} has no panel URL or token", node.name));
            };
            let request = DiagnoseRequest {
                ip: ip.to_string(),
                port,
                count: self.config.probe_count,
                timeout: self.config.probe_timeout_ms,
            };
            return self
                .remote
                .diagnose(&endpoint, &request)
                .await
                .unwrap_or_else(|e| ProbeResult::failed(e.to_string()));
        }

        if !self.nodes.is_online(node.id) {
            return ProbeResult::failed("node offline");
        }
        let request = TcpPingRequest::new(ip, port, self.config.probe_count, self.config.probe_timeout_ms);
        self.nodes
            .tcp_ping(node.id, request)
            .await
            .unwrap_or_else(|e| ProbeResult::failed(e.to_string()))
    }
}

/// Fill in the default message and zero out timings of failed probes
fn normalize(mut result: ProbeResult) -> ProbeResult {
    if result.message.trim().is_empty() {
        result.message = if result.success {
            "TCP connection succeeded".to_string()
        } else {
            "TCP connection failed".to_string()
        };
    }
    if !result.success {
        result.average_time = 0.0;
        result.packet_loss = 100.0;
    }
    result
}

fn hop_label(hop: &ChainHop, node_map: &HashMap<i64, Node>) -> String {
    let name = node_map
        .get(&hop.node_id)
        .map(|n| n.name.clone())
        .unwrap_or_else(|| format!("node_{}", hop.node_id));
    match hop.chain_type {
        ChainType::Entry => format!("Entry ({})", name),
        ChainType::Relay => format!("Hop {} ({})", hop.inx, name),
        ChainType::Exit => format!("Exit ({})", name),
    }
}

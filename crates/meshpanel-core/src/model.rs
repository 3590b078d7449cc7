//! Control-plane data model
//!
//! Row types for nodes, tunnels and their hop chains, forwards, federation
//! bindings, peer shares and group grants. Timestamps are unix milliseconds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default hop protocol
pub const DEFAULT_PROTOCOL: &str = "tls";

/// Default load-balancing strategy
pub const DEFAULT_STRATEGY: &str = "round";

/// Role of a hop within a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ChainType {
    /// Entry group (1)
    Entry,
    /// Relay group (2)
    Relay,
    /// Exit group (3)
    Exit,
}

impl ChainType {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Entry => 1,
            Self::Relay => 2,
            Self::Exit => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Entry),
            2 => Some(Self::Relay),
            3 => Some(Self::Exit),
            _ => None,
        }
    }

    /// Role a remote hop of this type plays on the provider panel
    pub fn lease_role(self) -> Option<LeaseRole> {
        match self {
            Self::Entry => None,
            Self::Relay => Some(LeaseRole::Middle),
            Self::Exit => Some(LeaseRole::Exit),
        }
    }
}

impl From<ChainType> for i64 {
    fn from(value: ChainType) -> Self {
        value.as_i64()
    }
}

impl TryFrom<i64> for ChainType {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_i64(value).ok_or_else(|| format!("invalid chain type {}", value))
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Relay => write!(f, "relay"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

/// Tunnel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum TunnelType {
    /// Port forward: entry nodes dial the target directly (1)
    PortForward,
    /// Tunnel forward: entry, optional relays, exit (2)
    TunnelForward,
}

impl TunnelType {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::PortForward => 1,
            Self::TunnelForward => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::PortForward),
            2 => Some(Self::TunnelForward),
            _ => None,
        }
    }
}

impl From<TunnelType> for i64 {
    fn from(value: TunnelType) -> Self {
        value.as_i64()
    }
}

impl TryFrom<i64> for TunnelType {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_i64(value).ok_or_else(|| format!("invalid tunnel type {}", value))
    }
}

/// Per-tunnel IP version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpPreference {
    /// Either family, IPv4 first
    #[default]
    #[serde(rename = "")]
    Any,
    #[serde(rename = "v4")]
    V4,
    #[serde(rename = "v6")]
    V6,
}

impl IpPreference {
    /// Lenient parse; unknown values mean no preference
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "v4" | "ipv4" => Self::V4,
            "v6" | "ipv6" => Self::V6,
            _ => Self::Any,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "",
            Self::V4 => "v4",
            Self::V6 => "v6",
        }
    }
}

/// Role a leased hop plays on the provider's node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseRole {
    /// Relay that forwards to the next hop targets
    Middle,
    /// Exit that terminates the chain
    Exit,
}

impl LeaseRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Middle => "middle",
            Self::Exit => "exit",
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "middle" => Ok(Self::Middle),
            "exit" => Ok(Self::Exit),
            other => Err(CoreError::InvalidInput(format!("invalid role: {}", other))),
        }
    }
}

/// A forwarding endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub name: String,
    /// Control channel credential
    #[serde(skip_serializing)]
    pub secret: String,
    /// Legacy single address (IP or hostname)
    pub server_ip: String,
    pub server_ip_v4: Option<String>,
    pub server_ip_v6: Option<String>,
    /// Port range spec, e.g. `"1000-2000,3000"`
    pub port: String,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: Option<String>,
    pub version: Option<String>,
    pub http: bool,
    pub tls: bool,
    pub socks: bool,
    /// 1 = online, 0 = offline
    pub status: i64,
    pub is_remote: bool,
    pub remote_url: Option<String>,
    #[serde(skip_serializing)]
    pub remote_token: Option<String>,
    pub remote_config: Option<String>,
    pub created_time: i64,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.status == 1
    }

    /// Owning panel URL and bearer token, if this node is remote and fully configured
    pub fn remote_credentials(&self) -> Option<(&str, &str)> {
        if !self.is_remote {
            return None;
        }
        let url = self.remote_url.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let token = self.remote_token.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((url, token))
    }

    /// Decoded remote config blob
    pub fn remote_node_config(&self) -> Option<RemoteNodeConfig> {
        self.remote_config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Node creation parameters
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    /// Generated when empty
    pub secret: String,
    pub server_ip: String,
    pub server_ip_v4: Option<String>,
    pub server_ip_v6: Option<String>,
    pub port: String,
    pub interface_name: Option<String>,
    pub is_remote: bool,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub remote_config: Option<String>,
}

/// Opaque config kept for imported remote nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteNodeConfig {
    pub share_id: i64,
    pub share_name: String,
    pub remote_node_id: i64,
    pub max_bandwidth: i64,
    pub expiry_time: i64,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

/// Capabilities a node declares when it connects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    pub version: Option<String>,
    pub http: bool,
    pub tls: bool,
    pub socks: bool,
}

/// A named route definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub traffic_ratio: f64,
    pub ip_preference: IpPreference,
    /// Explicit ingress override; derived from entry nodes when absent
    pub in_ip: Option<String>,
    pub status: i64,
    pub created_time: i64,
}

/// Tunnel creation parameters
#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub traffic_ratio: f64,
    pub ip_preference: IpPreference,
    pub in_ip: Option<String>,
}

/// One (tunnel, hop index, candidate node) row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHop {
    pub id: i64,
    pub tunnel_id: i64,
    pub chain_type: ChainType,
    /// 1-based relay group position; 0 for entry and exit
    pub inx: i64,
    pub node_id: i64,
    /// 0 when the hop terminates no listener
    pub port: u16,
    pub protocol: String,
    pub strategy: String,
}

/// Requested hop, as supplied by an operator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopSpec {
    pub node_id: i64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

impl HopSpec {
    pub fn node(node_id: i64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }
}

/// Requested hop set for a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    pub entry: Vec<HopSpec>,
    #[serde(default)]
    pub relays: Vec<Vec<HopSpec>>,
    #[serde(default)]
    pub exit: Vec<HopSpec>,
}

/// One hop row to be written, with its position fixed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSlot {
    pub chain_type: ChainType,
    pub inx: i64,
    pub node_id: i64,
    pub protocol: String,
    pub strategy: String,
}

impl HopSlot {
    /// Key the provider panel sees for this hop
    pub fn node_key(&self) -> String {
        format!(
            "node:{}:type:{}:hop:{}",
            self.node_id,
            self.chain_type.as_i64(),
            self.inx
        )
    }

    /// Key the local binding row is stored under
    pub fn resource_key(&self, tunnel_id: i64) -> String {
        format!(
            "tunnel:{}:node:{}:type:{}:hop:{}",
            tunnel_id,
            self.node_id,
            self.chain_type.as_i64(),
            self.inx
        )
    }
}

impl TopologySpec {
    /// Validate the hop set for a tunnel type and flatten it into ordered slots
    pub fn slots(&self, tunnel_type: TunnelType) -> CoreResult<Vec<HopSlot>> {
        if self.entry.is_empty() {
            return Err(CoreError::InvalidInput("entry group is empty".into()));
        }

        let mut slots = Vec::new();
        push_group(&mut slots, ChainType::Entry, 0, &self.entry);

        if tunnel_type == TunnelType::TunnelForward {
            if self.exit.is_empty() {
                return Err(CoreError::InvalidInput("exit group is empty".into()));
            }
            for (i, group) in self.relays.iter().enumerate() {
                if group.is_empty() {
                    return Err(CoreError::InvalidInput(format!("relay group {} is empty", i + 1)));
                }
                push_group(&mut slots, ChainType::Relay, i as i64 + 1, group);
            }
            push_group(&mut slots, ChainType::Exit, 0, &self.exit);
        }

        let mut seen = std::collections::HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.node_id) {
                return Err(CoreError::InvalidInput(format!(
                    "node {} appears more than once in the tunnel",
                    slot.node_id
                )));
            }
        }

        Ok(slots)
    }
}

fn push_group(slots: &mut Vec<HopSlot>, chain_type: ChainType, inx: i64, group: &[HopSpec]) {
    for hop in group {
        slots.push(HopSlot {
            chain_type,
            inx,
            node_id: hop.node_id,
            protocol: non_empty_or(hop.protocol.as_deref(), DEFAULT_PROTOCOL),
            strategy: non_empty_or(hop.strategy.as_deref(), DEFAULT_STRATEGY),
        });
    }
}

pub(crate) fn non_empty_or(value: Option<&str>, default: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// Hop chain of a tunnel, grouped by role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub entry: Vec<ChainHop>,
    /// Relay groups in ascending hop index
    pub relays: Vec<Vec<ChainHop>>,
    pub exit: Vec<ChainHop>,
}

impl Topology {
    /// Group flat hop rows; rows keep their insertion order within a group
    pub fn from_hops(hops: Vec<ChainHop>) -> Self {
        let mut topology = Topology::default();
        let mut relays: std::collections::BTreeMap<i64, Vec<ChainHop>> = Default::default();

        for hop in hops {
            match hop.chain_type {
                ChainType::Entry => topology.entry.push(hop),
                ChainType::Relay => relays.entry(hop.inx).or_default().push(hop),
                ChainType::Exit => topology.exit.push(hop),
            }
        }
        topology.relays = relays.into_values().collect();
        topology
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty() && self.relays.is_empty() && self.exit.is_empty()
    }

    /// All hops in chain order
    pub fn hops(&self) -> impl Iterator<Item = &ChainHop> {
        self.entry
            .iter()
            .chain(self.relays.iter().flatten())
            .chain(self.exit.iter())
    }
}

/// Tunnel with its resolved hop chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelTopology {
    pub tunnel: Tunnel,
    pub topology: Topology,
    /// Effective ingress addresses
    pub in_ip: String,
}

/// A listener bound to a tunnel's entry group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub tunnel_id: i64,
    /// Comma separated `host:port` targets
    pub remote_addr: String,
    pub strategy: String,
    pub in_flow: i64,
    pub out_flow: i64,
    pub status: i64,
    pub created_time: i64,
}

/// Forward creation parameters
#[derive(Debug, Clone, Default)]
pub struct NewForward {
    pub user_id: i64,
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    pub strategy: Option<String>,
    /// Requested entry port; picked from each entry node's range when absent
    pub in_port: Option<u16>,
}

/// Entry port of a forward on one entry node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPort {
    pub id: i64,
    pub forward_id: i64,
    pub node_id: i64,
    pub port: u16,
}

/// Consumer-side record of a remote lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationTunnelBinding {
    pub id: i64,
    pub tunnel_id: i64,
    pub node_id: i64,
    pub chain_type: ChainType,
    pub hop_inx: i64,
    pub remote_url: String,
    pub resource_key: String,
    pub remote_binding_id: String,
    pub remote_reservation_id: String,
    pub allocated_port: u16,
    pub active: bool,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Binding row to insert once the lease is held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBinding {
    pub tunnel_id: i64,
    pub node_id: i64,
    pub chain_type: ChainType,
    pub hop_inx: i64,
    pub remote_url: String,
    pub resource_key: String,
    pub remote_binding_id: String,
    pub remote_reservation_id: String,
    pub allocated_port: u16,
}

/// Provider-side capacity grant on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerShare {
    pub id: i64,
    pub name: String,
    pub node_id: i64,
    #[serde(skip_serializing)]
    pub token: String,
    /// Flow cap in bytes; 0 = unlimited
    pub max_bandwidth: i64,
    /// Expiry in ms; 0 = never
    pub expiry_time: i64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub current_flow: i64,
    pub is_active: bool,
    /// Comma separated caller IPs; empty = any
    pub allowed_ips: String,
    pub created_time: i64,
    pub updated_time: i64,
}

impl PeerShare {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    pub fn is_flow_exceeded(&self) -> bool {
        self.max_bandwidth > 0 && self.current_flow >= self.max_bandwidth
    }

    pub fn allows_ip(&self, ip: Option<std::net::IpAddr>) -> bool {
        let list: Vec<&str> = self
            .allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if list.is_empty() {
            return true;
        }
        let Some(ip) = ip else {
            return false;
        };
        list.iter()
            .filter_map(|raw| raw.parse::<std::net::IpAddr>().ok())
            .any(|allowed| allowed == ip)
    }
}

/// Peer share creation parameters
#[derive(Debug, Clone, Default)]
pub struct NewPeerShare {
    pub name: String,
    pub node_id: i64,
    pub max_bandwidth: i64,
    pub expiry_time: i64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub allowed_ips: String,
}

/// Next-hop address a middle reservation forwards to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTarget {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

/// One reservation under a peer share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerShareRuntime {
    pub id: i64,
    pub share_id: i64,
    pub node_id: i64,
    pub reservation_id: String,
    pub binding_id: String,
    pub resource_key: String,
    pub role: LeaseRole,
    pub protocol: String,
    pub strategy: String,
    pub port: u16,
    pub targets: Vec<LeaseTarget>,
    pub service_name: String,
    pub chain_name: String,
    pub applied: bool,
    /// Active reservations hold their port; released rows are kept for audit
    pub active: bool,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Reservation request as received from a consumer panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseApply {
    pub reservation_id: String,
    pub binding_id: String,
    pub resource_key: String,
    pub role: LeaseRole,
    pub protocol: String,
    pub strategy: String,
    pub requested_port: Option<u16>,
    pub targets: Vec<LeaseTarget>,
}

/// Result of a TCP reachability probe
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeResult {
    pub success: bool,
    /// Average connect round trip in milliseconds
    pub average_time: f64,
    /// Lost attempts in percent (0-100)
    pub packet_loss: f64,
    pub message: String,
}

impl ProbeResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            average_time: 0.0,
            packet_loss: 100.0,
            message: message.into(),
        }
    }
}

/// Traffic a node counted for one of its services since the last report
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowSample {
    #[serde(rename = "n")]
    pub service_name: String,
    #[serde(rename = "u", default)]
    pub upload: i64,
    #[serde(rename = "d", default)]
    pub download: i64,
}

impl FlowSample {
    pub fn total(&self) -> i64 {
        self.upload.max(0).saturating_add(self.download.max(0))
    }
}

/// Minimal user row referenced by user tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub user: String,
    pub flow: i64,
    pub num: i64,
    pub exp_time: i64,
    pub flow_reset_time: i64,
}

/// A concrete (user, tunnel) access right
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub num: i64,
    pub flow: i64,
    pub exp_time: i64,
    pub status: i64,
}

/// Grant row tying a user tunnel to the group permission that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermissionGrant {
    pub id: i64,
    pub user_group_id: i64,
    pub tunnel_group_id: i64,
    pub user_tunnel_id: i64,
    pub created_by_group: bool,
}

//! Federation API wire types
//!
//! Shared by the client and the provider-side handlers. Every response is an
//! [`ApiEnvelope`]; field names are camelCase on the wire.

use meshpanel_core::{LeaseApply, LeaseRole, LeaseTarget, Node};
use serde::{Deserialize, Serialize};

/// Path prefix of the federation API
pub const API_PREFIX: &str = "/api/v1/federation";

pub const PATH_CONNECT: &str = "/connect";
pub const PATH_APPLY: &str = "/runtime/apply";
pub const PATH_RELEASE: &str = "/runtime/release";
pub const PATH_DIAGNOSE: &str = "/runtime/diagnose";

/// Header carrying the caller's panel domain
pub const PANEL_DOMAIN_HEADER: &str = "X-Panel-Domain";

/// Envelope codes
pub mod codes {
    pub const OK: i64 = 0;
    pub const ERROR: i64 = -1;
    pub const UNAUTHORIZED: i64 = 401;
    pub const FORBIDDEN: i64 = 403;
    pub const CAPACITY_EXHAUSTED: i64 = 409;
}

pub const DEFAULT_PROBE_COUNT: u32 = 4;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;

/// `{code, msg, data}` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: codes::OK,
            msg: "success".into(),
            data: Some(data),
        }
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Where and how to reach a provider panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub url: String,
    pub token: String,
}

impl RemoteEndpoint {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    /// Endpoint of an imported remote node
    pub fn for_node(node: &Node) -> Option<Self> {
        node.remote_credentials().map(|(url, token)| Self::new(url, token))
    }
}

/// Share details returned by `connect`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteShareInfo {
    pub share_id: i64,
    pub share_name: String,
    pub node_id: i64,
    pub node_name: String,
    pub server_ip: String,
    pub status: i64,
    pub max_bandwidth: i64,
    pub current_flow: i64,
    pub expiry_time: i64,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

/// Reserve a port and apply a role on the provider node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyLeaseRequest {
    pub reservation_id: String,
    pub binding_id: String,
    #[serde(default)]
    pub resource_key: String,
    pub role: LeaseRole,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_port: Option<u16>,
    #[serde(default)]
    pub targets: Vec<LeaseTarget>,
}

impl ApplyLeaseRequest {
    /// Ledger form, with a zero port hint read as none
    pub fn into_lease_apply(self) -> LeaseApply {
        LeaseApply {
            reservation_id: self.reservation_id,
            binding_id: self.binding_id,
            resource_key: self.resource_key,
            role: self.role,
            protocol: self.protocol,
            strategy: self.strategy,
            requested_port: self.requested_port.filter(|p| *p > 0),
            targets: self.targets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyLeaseResponse {
    pub reservation_id: String,
    pub binding_id: String,
    pub allocated_port: u16,
}

/// Release a reservation; at least one key must be set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseLeaseRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,
}

impl ReleaseLeaseRequest {
    pub fn is_empty(&self) -> bool {
        [&self.binding_id, &self.reservation_id, &self.resource_key]
            .iter()
            .all(|v| v.as_deref().map(str::trim).unwrap_or("").is_empty())
    }
}

/// Probe a target from the provider's node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnoseRequest {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_probe_count")]
    pub count: u32,
    /// Milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

fn default_probe_count() -> u32 {
    DEFAULT_PROBE_COUNT
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

impl DiagnoseRequest {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            count: DEFAULT_PROBE_COUNT,
            timeout: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_request_wire_names() {
        let request = ApplyLeaseRequest {
            reservation_id: "r".into(),
            binding_id: "b".into(),
            resource_key: "node:1:type:2:hop:1".into(),
            role: LeaseRole::Middle,
            protocol: "tls".into(),
            strategy: "round".into(),
            requested_port: None,
            targets: vec![LeaseTarget {
                host: "1.2.3.4".into(),
                port: 9000,
                protocol: "tls".into(),
            }],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["reservationId"], "r");
        assert_eq!(value["role"], "middle");
        assert!(value.get("requestedPort").is_none());
        assert_eq!(value["targets"][0]["port"], 9000);
    }

    #[test]
    fn test_zero_port_hint_is_none() {
        let request: ApplyLeaseRequest = serde_json::from_value(json!({
            "reservationId": "r", "bindingId": "b", "role": "exit", "requestedPort": 0
        }))
        .unwrap();
        assert_eq!(request.into_lease_apply().requested_port, None);
    }

    #[test]
    fn test_diagnose_defaults() {
        let request: DiagnoseRequest = serde_json::from_value(json!({"ip": "a", "port": 1})).unwrap();
        assert_eq!(request.count, 4);
        assert_eq!(request.timeout, 5000);
    }

    #[test]
    fn test_release_requires_a_key() {
        assert!(ReleaseLeaseRequest::default().is_empty());
        assert!(ReleaseLeaseRequest {
            binding_id: Some("  ".into()),
            ..Default::default()
        }
        .is_empty());
        assert!(!ReleaseLeaseRequest {
            reservation_id: Some("r".into()),
            ..Default::default()
        }
        .is_empty());
    }
}

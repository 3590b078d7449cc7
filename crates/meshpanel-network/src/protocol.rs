//! Control Protocol Codec
//!
//! Frames exchanged with a node are JSON text:
//! - command: `{type, requestId, data}`
//! - response: `{type: "<Cmd>Response", requestId, success, message, data}`
//!
//! Either may travel inside an encrypted wrapper
//! `{encrypted: true, data: <sealed>, timestamp}`. The wrapper is resolved once
//! here through [`Envelope`]; handlers only ever see plain frames.

use std::sync::atomic::{AtomicU64, Ordering};

use meshpanel_core::ProbeResult;
use meshpanel_crypto::{open, seal, PayloadKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetworkError, NetworkResult};

/// Command types the panel sends to nodes
pub mod commands {
    pub const TCP_PING: &str = "TcpPing";
    pub const ADD_SERVICE: &str = "AddService";
    pub const DELETE_SERVICE: &str = "DeleteService";
    pub const ADD_CHAINS: &str = "AddChains";
    pub const DELETE_CHAINS: &str = "DeleteChains";
}

/// Suffix a node appends to the command type in its reply
pub const RESPONSE_SUFFIX: &str = "Response";

/// Expected response type for a command type
pub fn response_type(command_type: &str) -> String {
    format!("{}{}", command_type, RESPONSE_SUFFIX)
}

/// Outbound command frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound response frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub request_id: String,
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

/// Arguments of a `TcpPing` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPingRequest {
    pub ip: String,
    pub port: u16,
    pub count: u32,
    /// Per-attempt timeout in milliseconds
    pub timeout: u64,
}

impl TcpPingRequest {
    pub fn new(ip: impl Into<String>, port: u16, count: u32, timeout_ms: u64) -> Self {
        Self {
            ip: ip.into(),
            port,
            count,
            timeout: timeout_ms,
        }
    }
}

/// Read a probe result out of a `TcpPingResponse`.
///
/// Missing fields read as failure, 0 ms and 100% loss.
pub fn probe_result_from(response: &ControlResponse) -> ProbeResult {
    let data = response.data.as_ref();
    let field = |name: &str| data.and_then(|d| d.get(name));

    let success = field("success").and_then(Value::as_bool).unwrap_or(response.success);
    let average_time = field("averageTime").and_then(Value::as_f64).unwrap_or(0.0);
    let packet_loss = field("packetLoss").and_then(Value::as_f64).unwrap_or(100.0);
    let message = field("errorMessage")
        .or_else(|| field("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| response.message.clone());

    ProbeResult {
        success,
        average_time,
        packet_loss,
        message,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedWrapper {
    encrypted: bool,
    data: String,
    #[serde(default)]
    timestamp: i64,
}

/// A frame as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Plain JSON text
    Plain(String),
    /// Sealed JSON text with the sender's timestamp (ms)
    Encrypted { data: String, timestamp: i64 },
}

impl Envelope {
    /// Wrap an outbound frame, sealing it when the session has a key
    pub fn wrap(plain: String, key: Option<&PayloadKey>) -> NetworkResult<Self> {
        match key {
            Some(key) => Ok(Self::Encrypted {
                data: seal(key, plain.as_bytes())?,
                timestamp: chrono::Utc::now().timestamp_millis(),
            }),
            None => Ok(Self::Plain(plain)),
        }
    }

    /// Classify an inbound frame
    pub fn parse(frame: &str) -> Self {
        match serde_json::from_str::<EncryptedWrapper>(frame) {
            Ok(wrapper) if wrapper.encrypted && !wrapper.data.trim().is_empty() => Self::Encrypted {
                data: wrapper.data,
                timestamp: wrapper.timestamp,
            },
            _ => Self::Plain(frame.to_string()),
        }
    }

    /// Text to put on the wire
    pub fn into_frame(self) -> NetworkResult<String> {
        match self {
            Self::Plain(text) => Ok(text),
            Self::Encrypted { data, timestamp } => Ok(serde_json::to_string(&EncryptedWrapper {
                encrypted: true,
                data,
                timestamp,
            })?),
        }
    }

    /// Plain JSON text of the frame
    pub fn open(self, key: Option<&PayloadKey>) -> NetworkResult<String> {
        match self {
            Self::Plain(text) => Ok(text),
            Self::Encrypted { data, .. } => {
                let key = key.ok_or_else(|| {
                    NetworkError::Malformed("encrypted frame on a session without a key".into())
                })?;
                let plain = open(key, &data).map_err(|e| NetworkError::Malformed(e.to_string()))?;
                String::from_utf8(plain).map_err(|e| NetworkError::Malformed(e.to_string()))
            }
        }
    }
}

/// Serialize and wrap a command for the wire
pub fn encode_command(command: &ControlCommand, key: Option<&PayloadKey>) -> NetworkResult<String> {
    let plain = serde_json::to_string(command)?;
    Envelope::wrap(plain, key)?.into_frame()
}

/// Plain text of a report body a node posts over HTTP, opened with the key
/// of its secret when the body is an encrypted wrapper
pub fn open_report(body: &str, secret: &str) -> NetworkResult<String> {
    let key = if secret.trim().is_empty() {
        None
    } else {
        Some(PayloadKey::derive(secret)?)
    };
    Envelope::parse(body.trim()).open(key.as_ref())
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a pending command
    Response(ControlResponse),
    /// Anything else the node pushes (status, info, progress)
    Message(Value),
}

/// Unwrap and parse an inbound frame
pub fn decode_frame(frame: &str, key: Option<&PayloadKey>) -> NetworkResult<InboundFrame> {
    let plain = Envelope::parse(frame).open(key)?;
    let value: Value = serde_json::from_str(&plain).map_err(|e| NetworkError::Malformed(e.to_string()))?;

    let has_request_id = value
        .get("requestId")
        .and_then(Value::as_str)
        .map(|id| !id.trim().is_empty())
        .unwrap_or(false);
    if !has_request_id {
        return Ok(InboundFrame::Message(value));
    }

    let response = serde_json::from_value(value).map_err(|e| NetworkError::Malformed(e.to_string()))?;
    Ok(InboundFrame::Response(response))
}

/// Request id source: `"{nodeId}_{counter}_{nanos}"`
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, node_id: i64) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}_{}_{}", node_id, counter, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_key() -> PayloadKey {
        PayloadKey::derive("node-secret").unwrap()
    }

    fn make_command() -> ControlCommand {
        ControlCommand {
            command_type: commands::TCP_PING.into(),
            request_id: "1_1_1".into(),
            data: serde_json::to_value(TcpPingRequest::new("10.0.0.1", 443, 4, 5000)).unwrap(),
        }
    }

    #[test]
    fn test_command_wire_shape() {
        let frame = encode_command(&make_command(), None).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "TcpPing");
        assert_eq!(value["requestId"], "1_1_1");
        assert_eq!(value["data"]["timeout"], 5000);
    }

    #[test]
    fn test_encrypted_command_wrapper() {
        let key = make_key();
        let frame = encode_command(&make_command(), Some(&key)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["encrypted"], true);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert!(value.get("type").is_none());

        let plain = Envelope::parse(&frame).open(Some(&key)).unwrap();
        let command: ControlCommand = serde_json::from_str(&plain).unwrap();
        assert_eq!(command, make_command());
    }

    #[test]
    fn test_decode_encrypted_response() {
        let key = make_key();
        let reply = json!({
            "type": "TcpPingResponse",
            "requestId": "7_3_99",
            "success": true,
            "message": "",
            "data": {"success": true, "averageTime": 12.5, "packetLoss": 0.0}
        });
        let frame = Envelope::wrap(reply.to_string(), Some(&key))
            .unwrap()
            .into_frame()
            .unwrap();

        let InboundFrame::Response(response) = decode_frame(&frame, Some(&key)).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.response_type, response_type(commands::TCP_PING));
        let probe = probe_result_from(&response);
        assert!(probe.success);
        assert_eq!(probe.average_time, 12.5);
        assert_eq!(probe.packet_loss, 0.0);
    }

    #[test]
    fn test_decode_rejects_bad_ciphertext() {
        let key = make_key();
        let frame = json!({"encrypted": true, "data": "bm90LWNpcGhlcnRleHQ=", "timestamp": 1}).to_string();
        assert!(matches!(decode_frame(&frame, Some(&key)), Err(NetworkError::Malformed(_))));
        assert!(matches!(decode_frame(&frame, None), Err(NetworkError::Malformed(_))));
    }

    #[test]
    fn test_open_report() {
        let body = r#"[{"n":"fed_svc_1","u":10,"d":20}]"#;
        assert_eq!(open_report(body, "node-secret").unwrap(), body);

        let sealed = Envelope::wrap(body.to_string(), Some(&make_key()))
            .unwrap()
            .into_frame()
            .unwrap();
        assert_eq!(open_report(&sealed, "node-secret").unwrap(), body);
        assert!(open_report(&sealed, "other-secret").is_err());
    }

    #[test]
    fn test_plain_frames_without_request_id_are_messages() {
        let frame = json!({"type": "info", "memory": 12}).to_string();
        assert!(matches!(decode_frame(&frame, None).unwrap(), InboundFrame::Message(_)));
        assert!(matches!(decode_frame("not json", None), Err(NetworkError::Malformed(_))));
    }

    #[test]
    fn test_probe_defaults_when_data_missing() {
        let response = ControlResponse {
            response_type: "TcpPingResponse".into(),
            request_id: "x".into(),
            success: false,
            message: "dial failed".into(),
            data: None,
        };
        let probe = probe_result_from(&response);
        assert!(!probe.success);
        assert_eq!(probe.packet_loss, 100.0);
        assert_eq!(probe.message, "dial failed");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let ids = RequestIdGenerator::new();
        let a = ids.next(5);
        let b = ids.next(5);
        assert_ne!(a, b);
        assert!(a.starts_with("5_1_"));
        assert!(b.starts_with("5_2_"));
    }
}

//! Federation Client
//!
//! Plain HTTPS calls against a provider panel, authenticated with the share
//! token as a bearer credential. No connection state is kept between calls.
//! Failures are classified so callers know whether a retry can help.

use std::time::Duration;

use async_trait::async_trait;
use meshpanel_core::ProbeResult;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FederationError, FederationResult};
use crate::types::{
    codes, ApiEnvelope, ApplyLeaseRequest, ApplyLeaseResponse, DiagnoseRequest, ReleaseLeaseRequest,
    RemoteEndpoint, RemoteShareInfo, API_PREFIX, PANEL_DOMAIN_HEADER, PATH_APPLY, PATH_CONNECT,
    PATH_DIAGNOSE, PATH_RELEASE,
};

/// Provider message that marks share port exhaustion
const NO_AVAILABLE_PORT: &str = "No available port";

/// Lease operations against a provider panel
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Reserve a port and apply a role; idempotent per reservation id
    async fn apply_lease(&self, remote: &RemoteEndpoint, request: &ApplyLeaseRequest) -> FederationResult<ApplyLeaseResponse>;

    /// Release a reservation; releasing an unknown one succeeds
    async fn release_lease(&self, remote: &RemoteEndpoint, request: &ReleaseLeaseRequest) -> FederationResult<()>;
}

/// Share token validation against a provider panel
#[async_trait]
pub trait ShareConnector: Send + Sync {
    /// Validate a share token and fetch what it grants
    async fn connect(&self, remote: &RemoteEndpoint) -> FederationResult<RemoteShareInfo>;
}

/// Probes run by a provider panel on its own node
#[async_trait]
pub trait RemoteProber: Send + Sync {
    async fn diagnose(&self, remote: &RemoteEndpoint, request: &DiagnoseRequest) -> FederationResult<ProbeResult>;
}

/// HTTP client for the federation API
#[derive(Clone)]
pub struct FederationClient {
    /// HTTP client
    client: Client,
    /// Domain announced to providers
    panel_domain: Option<String>,
}

impl FederationClient {
    /// Create a client with a per-request timeout
    pub fn new(timeout: Duration, panel_domain: Option<String>) -> FederationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FederationError::InvalidRequest(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            panel_domain: panel_domain
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        })
    }

    fn endpoint(base_url: &str, path: &str) -> FederationResult<String> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(FederationError::InvalidRequest("remote URL is empty".into()));
        }
        Ok(format!("{}{}{}", base, API_PREFIX, path))
    }

    /// POST a JSON body and unwrap the `{code, msg, data}` envelope
    async fn call<B, T>(&self, remote: &RemoteEndpoint, path: &str, body: &B) -> FederationResult<Option<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = Self::endpoint(&remote.url, path)?;
        let token = remote.token.trim();
        if token.is_empty() {
            return Err(FederationError::Unauthorized("share token is empty".into()));
        }

        debug!("Federation call: POST {}", url);

        let mut request = self.client.post(&url).bearer_auth(token).json(body);
        if let Some(domain) = &self.panel_domain {
            request = request.header(PANEL_DOMAIN_HEADER, domain);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FederationError::RemoteUnreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FederationError::RemoteUnreachable(format!("reading {}: {}", url, e)))?;

        if !status.is_success() {
            return Err(classify_status(status, text));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| FederationError::Malformed(format!("{}: {}", url, e)))?;

        match envelope.code {
            codes::OK => Ok(envelope.data),
            code => Err(classify_code(code, envelope.msg)),
        }
    }
}

#[async_trait]
impl ShareConnector for FederationClient {
    async fn connect(&self, remote: &RemoteEndpoint) -> FederationResult<RemoteShareInfo> {
        let info: RemoteShareInfo = self
            .call(remote, PATH_CONNECT, &serde_json::json!({}))
            .await?
            .ok_or_else(|| FederationError::Malformed("empty share info".into()))?;

        info!(
            "Connected to share {} ({}) at {}",
            info.share_id, info.share_name, remote.url
        );
        Ok(info)
    }
}

#[async_trait]
impl LeaseClient for FederationClient {
    async fn apply_lease(&self, remote: &RemoteEndpoint, request: &ApplyLeaseRequest) -> FederationResult<ApplyLeaseResponse> {
        let response: ApplyLeaseResponse = self
            .call(remote, PATH_APPLY, request)
            .await?
            .ok_or_else(|| FederationError::Malformed("empty apply payload".into()))?;

        if response.allocated_port == 0 {
            return Err(FederationError::Malformed("remote allocated port 0".into()));
        }
        debug!(
            "Lease {} applied at {} port {}",
            request.reservation_id, remote.url, response.allocated_port
        );
        Ok(response)
    }

    async fn release_lease(&self, remote: &RemoteEndpoint, request: &ReleaseLeaseRequest) -> FederationResult<()> {
        if request.is_empty() {
            return Err(FederationError::InvalidRequest(
                "release needs a binding id, reservation id or resource key".into(),
            ));
        }
        self.call::<_, serde_json::Value>(remote, PATH_RELEASE, request)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteProber for FederationClient {
    async fn diagnose(&self, remote: &RemoteEndpoint, request: &DiagnoseRequest) -> FederationResult<ProbeResult> {
        self.call(remote, PATH_DIAGNOSE, request)
            .await?
            .ok_or_else(|| FederationError::Malformed("empty diagnosis payload".into()))
    }
}

fn classify_status(status: StatusCode, body: String) -> FederationError {
    let body = body.trim().to_string();
    match status {
        StatusCode::UNAUTHORIZED => FederationError::Unauthorized(body),
        StatusCode::FORBIDDEN => FederationError::Forbidden(body),
        StatusCode::CONFLICT => FederationError::CapacityExhausted(body),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            FederationError::RemoteUnreachable(format!("remote error {}: {}", s.as_u16(), body))
        }
        s => {
            warn!("Federation call rejected with status {}", s);
            FederationError::Rejected {
                code: i64::from(s.as_u16()),
                msg: body,
            }
        }
    }
}

fn classify_code(code: i64, msg: String) -> FederationError {
    match code {
        codes::UNAUTHORIZED => FederationError::Unauthorized(msg),
        codes::FORBIDDEN => FederationError::Forbidden(msg),
        codes::CAPACITY_EXHAUSTED => FederationError::CapacityExhausted(msg),
        _ if msg.contains(NO_AVAILABLE_PORT) => FederationError::CapacityExhausted(msg),
        code => FederationError::Rejected { code, msg },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpanel_core::LeaseRole;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_client() -> FederationClient {
        FederationClient::new(Duration::from_secs(2), Some("consumer.example.net".into())).unwrap()
    }

    fn make_apply() -> ApplyLeaseRequest {
        ApplyLeaseRequest {
            reservation_id: "res-1".into(),
            binding_id: "bind-1".into(),
            resource_key: "node:3:type:3:hop:0".into(),
            role: LeaseRole::Exit,
            protocol: "tls".into(),
            strategy: "round".into(),
            requested_port: None,
            targets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_lease_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/federation/runtime/apply"))
            .and(header("Authorization", "Bearer share-token"))
            .and(header("X-Panel-Domain", "consumer.example.net"))
            .and(body_partial_json(json!({"reservationId": "res-1", "role": "exit"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "msg": "success",
                "data": {"reservationId": "res-1", "bindingId": "bind-1", "allocatedPort": 41000}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(format!("{}/", server.uri()), "share-token");
        let response = make_client().apply_lease(&remote, &make_apply()).await.unwrap();
        assert_eq!(response.allocated_port, 41000);
    }

    #[tokio::test]
    async fn test_capacity_exhausted_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/federation/runtime/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 409, "msg": "No available port"
            })))
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(server.uri(), "t");
        let err = make_client().apply_lease(&remote, &make_apply()).await.unwrap_err();
        assert!(matches!(err, FederationError::CapacityExhausted(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(server.uri(), "bad");
        let err = make_client().connect(&remote).await.unwrap_err();
        assert!(matches!(err, FederationError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_and_unreachable_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(server.uri(), "t");
        let err = make_client().apply_lease(&remote, &make_apply()).await.unwrap_err();
        assert!(err.is_retryable());

        let nowhere = RemoteEndpoint::new("http://127.0.0.1:9", "t");
        let err = make_client().apply_lease(&nowhere, &make_apply()).await.unwrap_err();
        assert!(matches!(err, FederationError::RemoteUnreachable(_)));
    }

    #[tokio::test]
    async fn test_release_accepts_empty_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/federation/runtime/release"))
            .and(body_partial_json(json!({"bindingId": "bind-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "msg": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(server.uri(), "t");
        let request = ReleaseLeaseRequest {
            binding_id: Some("bind-1".into()),
            ..Default::default()
        };
        make_client().release_lease(&remote, &request).await.unwrap();

        let empty = make_client()
            .release_lease(&remote, &ReleaseLeaseRequest::default())
            .await;
        assert!(matches!(empty, Err(FederationError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_diagnose_and_connect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/federation/runtime/diagnose"))
            .and(body_partial_json(json!({"ip": "10.0.0.1", "port": 443, "count": 4, "timeout": 5000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"success": true, "averageTime": 8.25, "packetLoss": 0, "message": "ok"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/federation/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"shareId": 5, "shareName": "s", "nodeId": 2, "nodeName": "n",
                         "serverIp": "203.0.113.7", "portRangeStart": 40000, "portRangeEnd": 40100}
            })))
            .mount(&server)
            .await;

        let client = make_client();
        let remote = RemoteEndpoint::new(server.uri(), "t");
        let probe = client
            .diagnose(&remote, &DiagnoseRequest::new("10.0.0.1", 443))
            .await
            .unwrap();
        assert!(probe.success);
        assert_eq!(probe.average_time, 8.25);

        let info = client.connect(&remote).await.unwrap();
        assert_eq!(info.share_id, 5);
        assert_eq!(info.port_range_end, 40100);
    }

    #[tokio::test]
    async fn test_rejected_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": -1, "msg": "bad role"})))
            .mount(&server)
            .await;

        let remote = RemoteEndpoint::new(server.uri(), "t");
        let err = make_client().apply_lease(&remote, &make_apply()).await.unwrap_err();
        assert!(matches!(err, FederationError::Rejected { code: -1, .. }));
    }
}

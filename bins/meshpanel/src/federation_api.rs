//! Federation runtime API (provider side)
//!
//! Every endpoint answers HTTP 200 with a `{code, msg, data}` envelope; the
//! envelope code carries the failure class.

use std::net::{IpAddr, SocketAddr};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::Value;
use tracing::{debug, warn};

use meshpanel_control::{ControlError, ControlResult};
use meshpanel_core::{PeerShare, ProbeResult};
use meshpanel_federation::types::codes;
use meshpanel_federation::{
    ApiEnvelope, ApplyLeaseRequest, ApplyLeaseResponse, DiagnoseRequest, ReleaseLeaseRequest,
    RemoteShareInfo,
};

use crate::state::AppState;

/// Message consumers match on to recognize share port exhaustion
const NO_AVAILABLE_PORT: &str = "No available port";

pub async fn connect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<ApiEnvelope<RemoteShareInfo>> {
    let result = authorize(&state, &headers, peer).and_then(|share| state.leases.share_info(&share));
    respond("connect", result)
}

pub async fn apply(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<ApplyLeaseRequest>, JsonRejection>,
) -> Json<ApiEnvelope<ApplyLeaseResponse>> {
    let result: ControlResult<ApplyLeaseResponse> = async {
        let share = authorize(&state, &headers, peer)?;
        let Json(request) = body.map_err(malformed)?;
        state.leases.apply(&share, request).await
    }
    .await;
    respond("apply", result)
}

pub async fn release(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<ReleaseLeaseRequest>, JsonRejection>,
) -> Json<ApiEnvelope<Value>> {
    let result: ControlResult<Value> = async {
        // a disabled or expired share may still give back what it holds
        let token = bearer_token(&headers)?;
        let share = state.leases.authenticate(token, Some(caller_ip(&headers, peer)))?;
        let Json(request) = body.map_err(malformed)?;
        state.leases.release(&share, &request).await?;
        Ok(Value::Null)
    }
    .await;
    respond("release", result)
}

pub async fn diagnose(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<DiagnoseRequest>, JsonRejection>,
) -> Json<ApiEnvelope<ProbeResult>> {
    let result: ControlResult<ProbeResult> = async {
        let share = authorize(&state, &headers, peer)?;
        let Json(request) = body.map_err(malformed)?;
        state.leases.diagnose(&share, &request).await
    }
    .await;
    respond("diagnose", result)
}

fn authorize(state: &AppState, headers: &HeaderMap, peer: SocketAddr) -> ControlResult<PeerShare> {
    let token = bearer_token(headers)?;
    state.leases.authorize(token, Some(caller_ip(headers, peer)))
}

fn bearer_token(headers: &HeaderMap) -> ControlResult<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ControlError::Unauthorized("Unauthorized".into()))
}

/// Caller address; forwarding headers count only when set by a local proxy
fn caller_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    if !peer.ip().is_loopback() {
        return peer.ip();
    }

    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .unwrap_or_else(|| peer.ip())
}

fn malformed(rejection: JsonRejection) -> ControlError {
    ControlError::MalformedMessage(rejection.body_text())
}

/// Envelope code and message for a failure
fn error_envelope(error: &ControlError) -> (i64, String) {
    match error {
        ControlError::Unauthorized(_) => (codes::UNAUTHORIZED, "Unauthorized".to_string()),
        ControlError::Forbidden(reason) => (codes::FORBIDDEN, reason.clone()),
        ControlError::CapacityExhausted(_) | ControlError::PortExhausted { .. } => {
            (codes::CAPACITY_EXHAUSTED, NO_AVAILABLE_PORT.to_string())
        }
        other => (codes::ERROR, other.to_string()),
    }
}

fn respond<T>(operation: &str, result: ControlResult<T>) -> Json<ApiEnvelope<T>> {
    match result {
        Ok(data) => Json(ApiEnvelope::ok(data)),
        Err(e) => {
            let (code, msg) = error_envelope(&e);
            match code {
                codes::ERROR => warn!("Federation {} failed: {}", operation, e),
                _ => debug!("Federation {} refused ({}): {}", operation, code, e),
            }
            Json(ApiEnvelope::error(code, msg))
        }
    }
}

//! Traffic reports posted by local nodes
//!
//! A node posts `[{n, u, d}]` per service, plain or in the encrypted wrapper
//! keyed by its secret. The reply is always `ok` so a node never retries a
//! report the panel could not use.

use axum::extract::{Query, State};
use serde::Deserialize;
use tracing::{debug, warn};

use meshpanel_core::FlowSample;
use meshpanel_network::open_report;

use crate::node_channel::identify;
use crate::state::AppState;

pub const FLOW_UPLOAD_PATH: &str = "/flow/upload";

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    #[serde(default)]
    pub secret: String,
}

pub async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: String,
) -> &'static str {
    let Ok(node) = identify(&state, &params.secret) else {
        return "ok";
    };

    let samples = match parse_samples(&body, &node.secret) {
        Ok(samples) => samples,
        Err(e) => {
            debug!("Unreadable flow report from node {}: {}", node.id, e);
            return "ok";
        }
    };
    if let Err(e) = state.leases.record_flow(node.id, &samples) {
        warn!("Flow report from node {} not recorded: {}", node.id, e);
    }
    "ok"
}

fn parse_samples(body: &str, secret: &str) -> anyhow::Result<Vec<FlowSample>> {
    let plain = open_report(body, secret)?;
    if plain.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&plain)?)
}

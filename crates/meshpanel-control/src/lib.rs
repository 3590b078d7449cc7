//! Mesh Panel Control
//!
//! Orchestration on top of the store, the node channel and the federation API:
//! - Tunnel provisioning with remote leases and compensation on failure
//! - Provider side lease handling with service push to the share's node
//! - Segment by segment diagnosis of tunnels and forwards

pub mod diagnosis;
pub mod error;
pub mod leases;
pub mod provisioner;

#[cfg(test)]
mod testutil;

pub use diagnosis::{
    DiagnosisItem, DiagnosisOrchestrator, DiagnosisReport, FirstInGroup, RepresentativePolicy,
};
pub use error::{ControlError, ControlResult};
pub use leases::LeaseManager;
pub use provisioner::{TunnelProvisioner, TunnelRequest};

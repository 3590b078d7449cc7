//! Mesh Panel Federation
//!
//! Leasing tunnel capacity across independently operated panels:
//! - Wire types of the provider's federation API
//! - An HTTP client for consumers, with failure classification

pub mod client;
pub mod error;
pub mod types;

pub use client::{FederationClient, LeaseClient, RemoteProber, ShareConnector};
pub use error::{FederationError, FederationResult};
pub use types::{
    ApiEnvelope, ApplyLeaseRequest, ApplyLeaseResponse, DiagnoseRequest, ReleaseLeaseRequest,
    RemoteEndpoint, RemoteShareInfo,
};

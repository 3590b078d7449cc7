//! Mesh Panel Core
//!
//! Control-plane data model and storage for a multi-hop forwarding panel:
//! - Tunnels made of entry, relay and exit hop groups across a node fleet
//! - Port allocation on shared nodes without collision
//! - Forwards bound to a tunnel's entry group
//! - Federation bindings (consumer side) and peer share reservations (provider side)
//! - Group based access grants with reference counted user tunnels

pub mod address;
pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use address::{AddressSelector, PreferenceOrder};
pub use config::PanelConfig;
pub use error::{CoreError, CoreResult};
pub use model::*;
pub use store::Store;

/// Current wall clock time in milliseconds, the unit every timestamp column uses
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

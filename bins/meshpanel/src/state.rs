//! Shared handler state

use std::sync::Arc;

use meshpanel_control::LeaseManager;
use meshpanel_core::config::ControlConfig;
use meshpanel_core::Store;
use meshpanel_network::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    /// Live node sessions
    pub sessions: Arc<SessionRegistry>,
    /// Provider side of federation
    pub leases: Arc<LeaseManager>,
    pub control: ControlConfig,
}

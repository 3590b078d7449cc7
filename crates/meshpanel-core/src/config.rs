//! Panel configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Top-level panel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// SQLite database file
    pub database_path: String,
    /// HTTP listen address (federation API and node control channel)
    pub listen_addr: String,
    /// Domain this panel announces to peers (sent as `X-Panel-Domain`)
    pub panel_domain: Option<String>,
    /// Node control channel settings
    pub control: ControlConfig,
    /// Federation client settings
    pub federation: FederationConfig,
    /// Diagnosis settings
    pub diagnosis: DiagnosisConfig,
}

/// Node control channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// How long a command waits for its response
    pub command_timeout_secs: u64,
    /// Keepalive ping interval
    pub ping_interval_secs: u64,
    /// Drop a node that stays silent this long
    pub pong_wait_secs: u64,
    /// Outbound frame queue per node session
    pub send_queue: usize,
}

/// Federation client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// HTTP request timeout against peer panels
    pub request_timeout_secs: u64,
}

/// Diagnosis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    /// TCP connect attempts per probe
    pub probe_count: u32,
    /// Per-attempt timeout (milliseconds)
    pub probe_timeout_ms: u64,
    /// Probes in flight at once during one diagnosis run
    pub max_concurrent_probes: usize,
    /// Target used when a port-forward tunnel has no downstream hop
    pub external_target: String,
    /// Address selection policy (`preference-order`)
    pub address_policy: String,
    /// Representative node policy (`first-in-group`)
    pub representative_policy: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/meshpanel/panel.db".to_string(),
            listen_addr: "0.0.0.0:6365".to_string(),
            panel_domain: None,
            control: ControlConfig::default(),
            federation: FederationConfig::default(),
            diagnosis: DiagnosisConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10,
            ping_interval_secs: 15,
            pong_wait_secs: 45,
            send_queue: 256,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            probe_count: 4,
            probe_timeout_ms: 5000,
            max_concurrent_probes: 8,
            external_target: "www.google.com:443".to_string(),
            address_policy: "preference-order".to_string(),
            representative_policy: "first-in-group".to_string(),
        }
    }
}

impl ControlConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PanelConfig {
    /// Check the configuration for values the panel cannot run with
    pub fn validate(&self) -> CoreResult<()> {
        if self.database_path.trim().is_empty() {
            return Err(CoreError::InvalidInput("database_path is empty".into()));
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(CoreError::InvalidInput(format!(
                "listen_addr is not a socket address: {}",
                self.listen_addr
            )));
        }
        if self.control.command_timeout_secs == 0 {
            return Err(CoreError::InvalidInput("control.command_timeout_secs must be > 0".into()));
        }
        if self.control.pong_wait_secs <= self.control.ping_interval_secs {
            return Err(CoreError::InvalidInput(
                "control.pong_wait_secs must exceed control.ping_interval_secs".into(),
            ));
        }
        if self.control.send_queue == 0 {
            return Err(CoreError::InvalidInput("control.send_queue must be > 0".into()));
        }
        if self.federation.request_timeout_secs == 0 {
            return Err(CoreError::InvalidInput("federation.request_timeout_secs must be > 0".into()));
        }
        if self.diagnosis.probe_count == 0 || self.diagnosis.max_concurrent_probes == 0 {
            return Err(CoreError::InvalidInput(
                "diagnosis.probe_count and diagnosis.max_concurrent_probes must be > 0".into(),
            ));
        }
        if crate::address::parse_target_address(&self.diagnosis.external_target).is_none() {
            return Err(CoreError::InvalidInput(format!(
                "diagnosis.external_target is not host:port: {}",
                self.diagnosis.external_target
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PanelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: PanelConfig = toml::from_str(
            r#"
            database_path = "/tmp/panel.db"

            [diagnosis]
            probe_count = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, "/tmp/panel.db");
        assert_eq!(config.diagnosis.probe_count, 2);
        assert_eq!(config.diagnosis.probe_timeout_ms, 5000);
        assert_eq!(config.control.command_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_bad_keepalive() {
        let mut config = PanelConfig::default();
        config.control.pong_wait_secs = 5;
        assert!(config.validate().is_err());
    }
}

//! Config file loading

use std::path::Path;

use anyhow::{Context, Result};
use meshpanel_core::PanelConfig;

/// Read, parse and validate the panel config
pub async fn load(path: &Path) -> Result<PanelConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {:?}", path))?;

    parse(&contents)
}

fn parse(contents: &str) -> Result<PanelConfig> {
    let config: PanelConfig = toml::from_str(contents).context("Failed to parse config file")?;
    config.validate().context("Invalid config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = parse(
            r#"
            database_path = "/tmp/panel.db"

            [diagnosis]
            max_concurrent_probes = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, "/tmp/panel.db");
        assert_eq!(config.diagnosis.max_concurrent_probes, 2);
        assert_eq!(config.diagnosis.probe_count, 4);
        assert_eq!(config.control.ping_interval_secs, 15);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = parse(
            r#"
            [control]
            ping_interval_secs = 60
            pong_wait_secs = 30
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let text = toml::to_string_pretty(&PanelConfig::default()).unwrap();
        assert!(parse(&text).is_ok());
    }
}

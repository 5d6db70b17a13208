//! Process configuration: listen address, settings snapshot and seed data.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::gateway::settings::GatewaySettings;
use crate::gateway::{Channel, TenantSeed, TokenSeed};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub settings: GatewaySettings,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub tenants: Vec<TenantSeed>,
    #[serde(default)]
    pub tokens: Vec<TokenSeed>,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Seconds between settings reloads from the config file; 0 disables reloading.
    #[serde(default)]
    pub reload_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            settings: GatewaySettings::default(),
            channels: Vec::new(),
            tenants: Vec::new(),
            tokens: Vec::new(),
            redis_url: None,
            reload_interval_secs: 0,
        }
    }
}

impl RelayConfig {
    /// Loads TOML, or JSON when the file extension is `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RelayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = Self::parse(&raw, json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str, json: bool) -> Result<Self> {
        Ok(if json {
            serde_json::from_str(raw)?
        } else {
            toml::from_str(raw)?
        })
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }

    pub fn validate(&self) -> Result<()> {
        let mut channel_ids = BTreeSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id) {
                return Err(RelayError::InvalidConfig(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            if channel.credential.trim().is_empty() {
                return Err(RelayError::InvalidConfig(format!(
                    "channel {} has an empty key",
                    channel.id
                )));
            }
        }

        let tenant_ids: BTreeSet<_> = self.tenants.iter().map(|tenant| tenant.id).collect();
        let mut keys = BTreeSet::new();
        for token in &self.tokens {
            if !tenant_ids.contains(&token.tenant_id) {
                return Err(RelayError::InvalidConfig(format!(
                    "token {} references unknown tenant {}",
                    token.id, token.tenant_id
                )));
            }
            if !keys.insert(token.key.as_str()) {
                return Err(RelayError::InvalidConfig(format!(
                    "token {} reuses an existing key",
                    token.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen = "0.0.0.0:3000"
reload_interval_secs = 30

[settings]
retry_times = 3

[[channels]]
id = 1
name = "primary"
kind = "open_ai"
key = "sk-upstream"
models = ["gpt-4o"]
groups = { default = 10 }

[[tenants]]
id = 1
balance = 100000

[[tokens]]
id = 11
tenant_id = 1
key = "sk-tenant"
name = "ci"
remaining_quota = 100000
"#;

    #[test]
    fn parses_toml_sample() {
        let config = RelayConfig::parse(SAMPLE, false).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "0.0.0.0:3000");
        assert_eq!(config.settings.retry_times, 3);
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].group_weight("default"), 10);
        assert_eq!(config.tenants[0].group, "default");
        assert_eq!(config.reload_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = RelayConfig::parse("", false).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.reload_interval(), None);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn tokens_must_reference_known_tenants() {
        let raw = SAMPLE.replace("tenant_id = 1", "tenant_id = 9");
        let config = RelayConfig::parse(&raw, false).unwrap();
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfig(message)) if message.contains("unknown tenant")
        ));
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"listen":"127.0.0.1:9000","settings":{"retry_times":1}}"#)
            .unwrap();
        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.settings.retry_times, 1);
    }
}

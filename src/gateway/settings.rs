use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::tasks::AbortOnDrop;

/// Model ratio applied when a model has no entry in any table.
pub const UNKNOWN_MODEL_RATIO: f64 = 30.0;
/// Pricing bucket shared by every custom-GPT model name.
pub const GIZMO_MODEL_BUCKET: &str = "gpt-4-gizmo-*";

const DEFAULT_MODEL_RATIOS: &[(&str, f64)] = &[
    ("gpt-4", 15.0),
    ("gpt-4-0314", 15.0),
    ("gpt-4-0613", 15.0),
    ("gpt-4-32k", 30.0),
    ("gpt-4-32k-0613", 30.0),
    ("gpt-4-1106-preview", 5.0),
    ("gpt-4-0125-preview", 5.0),
    ("gpt-4-turbo-preview", 5.0),
    ("gpt-4-vision-preview", 5.0),
    ("gpt-4-turbo", 5.0),
    ("gpt-4-turbo-2024-04-09", 5.0),
    ("gpt-4o", 2.5),
    ("gpt-4o-2024-05-13", 2.5),
    ("gpt-4o-mini", 0.075),
    (GIZMO_MODEL_BUCKET, 15.0),
    ("gpt-3.5-turbo", 0.25),
    ("gpt-3.5-turbo-0301", 0.75),
    ("gpt-3.5-turbo-0613", 0.75),
    ("gpt-3.5-turbo-16k", 1.5),
    ("gpt-3.5-turbo-16k-0613", 1.5),
    ("gpt-3.5-turbo-instruct", 0.75),
    ("gpt-3.5-turbo-1106", 0.5),
    ("gpt-3.5-turbo-0125", 0.25),
    ("text-embedding-ada-002", 0.05),
    ("text-embedding-3-small", 0.01),
    ("text-embedding-3-large", 0.065),
    ("text-moderation-latest", 0.1),
    ("text-moderation-stable", 0.1),
    ("claude-instant-1.2", 0.4),
    ("claude-2.1", 4.0),
    ("claude-3-haiku-20240307", 0.125),
    ("claude-3-sonnet-20240229", 1.5),
    ("claude-3-5-sonnet-20240620", 1.5),
    ("claude-3-opus-20240229", 7.5),
    ("gemini-pro", 0.25),
    ("gemini-1.5-pro-latest", 1.75),
    ("gemini-1.5-flash-latest", 0.175),
];

const DEFAULT_GROUP_RATIOS: &[(&str, f64)] = &[("default", 1.0), ("vip", 1.0), ("svip", 1.0)];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse settings toml: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Runtime-tunable knobs. Every request works against one immutable snapshot of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Bumped by [`SettingsPublisher::publish`]; never read from the file.
    #[serde(skip)]
    pub version: u64,
    #[serde(default)]
    pub approximate_tokens: bool,
    #[serde(default = "default_true")]
    pub automatic_disable_channel: bool,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(default = "default_pre_consumed_tokens")]
    pub pre_consumed_tokens: u32,
    #[serde(default = "default_trust_multiplier")]
    pub trust_multiplier: i64,
    #[serde(default = "default_true")]
    pub log_consume_enabled: bool,
    #[serde(default = "default_true")]
    pub display_in_currency: bool,
    #[serde(default)]
    pub display_token_stat: bool,
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
    #[serde(default)]
    pub relay_timeout_secs: u64,
    #[serde(default = "default_image_fetch_timeout_secs")]
    pub image_fetch_timeout_secs: u64,
    #[serde(default = "default_channel_cache_ttl_ms")]
    pub channel_cache_ttl_ms: u64,
    /// Overrides layered over the built-in model ratio table.
    #[serde(default)]
    pub model_ratio: BTreeMap<String, f64>,
    #[serde(default)]
    pub completion_ratio: BTreeMap<String, f64>,
    #[serde(default)]
    pub group_ratio: BTreeMap<String, f64>,
}

fn default_true() -> bool {
    true
}

fn default_retry_times() -> u32 {
    2
}

fn default_pre_consumed_tokens() -> u32 {
    500
}

fn default_trust_multiplier() -> i64 {
    100
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

fn default_image_fetch_timeout_secs() -> u64 {
    5
}

fn default_channel_cache_ttl_ms() -> u64 {
    1_000
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            version: 0,
            approximate_tokens: false,
            automatic_disable_channel: default_true(),
            retry_times: default_retry_times(),
            pre_consumed_tokens: default_pre_consumed_tokens(),
            trust_multiplier: default_trust_multiplier(),
            log_consume_enabled: default_true(),
            display_in_currency: default_true(),
            display_token_stat: false,
            quota_per_unit: default_quota_per_unit(),
            relay_timeout_secs: 0,
            image_fetch_timeout_secs: default_image_fetch_timeout_secs(),
            channel_cache_ttl_ms: default_channel_cache_ttl_ms(),
            model_ratio: BTreeMap::new(),
            completion_ratio: BTreeMap::new(),
            group_ratio: BTreeMap::new(),
        }
    }
}

impl GatewaySettings {
    pub fn relay_timeout(&self) -> Option<Duration> {
        (self.relay_timeout_secs > 0).then(|| Duration::from_secs(self.relay_timeout_secs))
    }

    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.image_fetch_timeout_secs.max(1))
    }

    pub fn channel_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.channel_cache_ttl_ms)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        if let Some(ratio) = lookup_ratio(&self.model_ratio, model) {
            return ratio;
        }
        if let Some(ratio) = lookup_builtin(DEFAULT_MODEL_RATIOS, model) {
            return ratio;
        }
        warn!(model, ratio = UNKNOWN_MODEL_RATIO, "model ratio not found, using fallback");
        UNKNOWN_MODEL_RATIO
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        if let Some(ratio) = lookup_ratio(&self.completion_ratio, model) {
            return ratio;
        }
        default_completion_ratio(model)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        if let Some(ratio) = self.group_ratio.get(group) {
            return *ratio;
        }
        if let Some((_, ratio)) = DEFAULT_GROUP_RATIOS.iter().find(|(name, _)| *name == group) {
            return *ratio;
        }
        warn!(group, "group ratio not found, using 1");
        1.0
    }
}

fn lookup_ratio(table: &BTreeMap<String, f64>, model: &str) -> Option<f64> {
    if let Some(ratio) = table.get(model) {
        return Some(*ratio);
    }
    table
        .iter()
        .filter_map(|(pattern, ratio)| {
            let prefix = pattern.strip_suffix('*')?;
            model.starts_with(prefix).then_some((prefix.len(), *ratio))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, ratio)| ratio)
}

fn lookup_builtin(table: &[(&str, f64)], model: &str) -> Option<f64> {
    if let Some((_, ratio)) = table.iter().find(|(name, _)| *name == model) {
        return Some(*ratio);
    }
    table
        .iter()
        .filter_map(|(pattern, ratio)| {
            let prefix = pattern.strip_suffix('*')?;
            model.starts_with(prefix).then_some((prefix.len(), *ratio))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, ratio)| ratio)
}

fn default_completion_ratio(model: &str) -> f64 {
    if model.starts_with("gpt-3.5") {
        if model == "gpt-3.5-turbo" || model.ends_with("0125") {
            return 3.0;
        }
        if model.ends_with("1106") {
            return 2.0;
        }
        return 4.0 / 3.0;
    }
    if model.starts_with("gpt-4") {
        if model.starts_with("gpt-4o") || model.starts_with("gpt-4-turbo") || model.ends_with("preview")
        {
            return 3.0;
        }
        return 2.0;
    }
    if model.starts_with("claude-3") {
        return 5.0;
    }
    if model.starts_with("claude-") {
        return 3.0;
    }
    if model.starts_with("gemini-") {
        return 3.0;
    }
    1.0
}

/// Read side of the settings channel. Cloning is cheap; `current()` never blocks writers.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    rx: watch::Receiver<Arc<GatewaySettings>>,
}

impl SettingsHandle {
    /// A handle pinned to one snapshot, for tests and embedded use without reloads.
    pub fn fixed(settings: GatewaySettings) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(settings));
        Self { rx }
    }

    pub fn current(&self) -> Arc<GatewaySettings> {
        self.rx.borrow().clone()
    }
}

#[derive(Debug)]
pub struct SettingsPublisher {
    tx: watch::Sender<Arc<GatewaySettings>>,
}

pub fn settings_channel(initial: GatewaySettings) -> (SettingsPublisher, SettingsHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (SettingsPublisher { tx }, SettingsHandle { rx })
}

impl SettingsPublisher {
    pub fn handle(&self) -> SettingsHandle {
        SettingsHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Swaps in a new snapshot and returns its version.
    pub fn publish(&self, mut next: GatewaySettings) -> u64 {
        let version = self.tx.borrow().version.saturating_add(1);
        next.version = version;
        self.tx.send_replace(Arc::new(next));
        version
    }
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<GatewaySettings, SettingsError>;
}

/// Reads the `settings` table of a TOML or JSON config file (chosen by extension).
#[derive(Clone, Debug)]
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Deserialize)]
struct SettingsSection {
    #[serde(default)]
    settings: GatewaySettings,
}

pub fn parse_settings_section(raw: &str, json: bool) -> Result<GatewaySettings, SettingsError> {
    let section: SettingsSection = if json {
        serde_json::from_str(raw)?
    } else {
        toml::from_str(raw)?
    };
    Ok(section.settings)
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn load(&self) -> Result<GatewaySettings, SettingsError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SettingsError::Io {
                path: self.path.clone(),
                source,
            })?;
        let json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        parse_settings_section(&raw, json)
    }
}

/// Periodically reloads settings from `source`. A failed load keeps the previous snapshot.
pub fn spawn_settings_reload(
    source: Arc<dyn SettingsSource>,
    publisher: Arc<SettingsPublisher>,
    interval: Duration,
) -> AbortOnDrop {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match source.load().await {
                Ok(next) => {
                    let version = publisher.publish(next);
                    debug!(version, "settings reloaded");
                }
                Err(err) => warn!(error = %err, "settings reload failed; keeping previous snapshot"),
            }
        }
    });
    info!(interval_ms = interval.as_millis() as u64, "settings reload task started");
    AbortOnDrop::new(handle.abort_handle())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.retry_times, 2);
        assert_eq!(settings.pre_consumed_tokens, 500);
        assert_eq!(settings.trust_multiplier, 100);
        assert!(settings.automatic_disable_channel);
        assert!(!settings.approximate_tokens);
        assert_eq!(settings.relay_timeout(), None);
        assert_eq!(settings.image_fetch_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn empty_toml_section_yields_defaults() {
        let settings = parse_settings_section("listen = \"0.0.0.0:3000\"\n", false).unwrap();
        assert_eq!(settings.retry_times, 2);
        assert_eq!(settings.quota_per_unit, 500_000.0);
    }

    #[test]
    fn model_ratio_prefers_overrides_then_builtin_then_fallback() {
        let mut settings = GatewaySettings::default();
        assert_eq!(settings.model_ratio("gpt-4"), 15.0);
        assert_eq!(settings.model_ratio("totally-unknown"), UNKNOWN_MODEL_RATIO);

        settings.model_ratio.insert("gpt-4".to_string(), 1.5);
        settings.model_ratio.insert("local-*".to_string(), 0.5);
        assert_eq!(settings.model_ratio("gpt-4"), 1.5);
        assert_eq!(settings.model_ratio("local-llama"), 0.5);
    }

    #[test]
    fn gizmo_names_price_through_bucket() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.model_ratio("gpt-4-gizmo-g-abc123xyz1"), 15.0);
    }

    #[test]
    fn completion_ratio_rules() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.completion_ratio("gpt-3.5-turbo"), 3.0);
        assert_eq!(settings.completion_ratio("gpt-3.5-turbo-0125"), 3.0);
        assert_eq!(settings.completion_ratio("gpt-3.5-turbo-1106"), 2.0);
        assert_eq!(settings.completion_ratio("gpt-3.5-turbo-0613"), 4.0 / 3.0);
        assert_eq!(settings.completion_ratio("gpt-4-1106-preview"), 3.0);
        assert_eq!(settings.completion_ratio("gpt-4-turbo"), 3.0);
        assert_eq!(settings.completion_ratio("gpt-4"), 2.0);
        assert_eq!(settings.completion_ratio("claude-2.1"), 3.0);
        assert_eq!(settings.completion_ratio("mistral-large"), 1.0);
    }

    #[test]
    fn unknown_group_ratio_is_one() {
        let mut settings = GatewaySettings::default();
        assert_eq!(settings.group_ratio("nobody"), 1.0);
        settings.group_ratio.insert("vip".to_string(), 0.8);
        assert_eq!(settings.group_ratio("vip"), 0.8);
    }

    #[test]
    fn publish_bumps_version_and_reaches_handles() {
        let (publisher, handle) = settings_channel(GatewaySettings::default());
        assert_eq!(handle.current().version, 0);

        let next = GatewaySettings {
            retry_times: 5,
            ..GatewaySettings::default()
        };
        assert_eq!(publisher.publish(next), 1);
        assert_eq!(handle.current().version, 1);
        assert_eq!(handle.current().retry_times, 5);
        assert_eq!(publisher.handle().current().retry_times, 5);
    }

    #[tokio::test]
    async fn file_source_reads_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("relay.toml");
        std::fs::write(&toml_path, "[settings]\nretry_times = 4\napproximate_tokens = true\n").unwrap();
        let loaded = FileSettingsSource::new(&toml_path).load().await.unwrap();
        assert_eq!(loaded.retry_times, 4);
        assert!(loaded.approximate_tokens);

        let json_path = dir.path().join("relay.json");
        std::fs::write(&json_path, r#"{"settings":{"group_ratio":{"vip":0.5}}}"#).unwrap();
        let loaded = FileSettingsSource::new(&json_path).load().await.unwrap();
        assert_eq!(loaded.group_ratio("vip"), 0.5);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = FileSettingsSource::new("/definitely/not/here.toml")
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }
}

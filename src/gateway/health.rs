use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::channel::{Channel, ChannelId, ChannelStatus};
use super::observability::Observability;
use super::registry::ChannelRegistry;
use super::settings::SettingsHandle;
use super::store::{ChannelStore, StoreError};
use super::{ErrorBody, UpstreamError, now_millis};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHealthSnapshot {
    pub channel_id: ChannelId,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ts_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_ts_ms: Option<u64>,
}

#[derive(Clone, Debug, Default)]
struct ChannelHealth {
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    last_error: Option<String>,
    last_failure_ts_ms: Option<u64>,
    last_success_ts_ms: Option<u64>,
}

impl ChannelHealth {
    fn snapshot(&self, channel_id: ChannelId) -> ChannelHealthSnapshot {
        ChannelHealthSnapshot {
            channel_id,
            consecutive_failures: self.consecutive_failures,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_error: self.last_error.clone(),
            last_failure_ts_ms: self.last_failure_ts_ms,
            last_success_ts_ms: self.last_success_ts_ms,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_successes = self.total_successes.saturating_add(1);
        self.last_success_ts_ms = Some(now_millis());
    }

    fn record_failure(&mut self, message: Option<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        if message.is_some() {
            self.last_error = message;
        }
        self.last_failure_ts_ms = Some(now_millis());
    }
}

/// Whether an upstream failure means the channel itself is unusable (bad key, no credit).
pub fn disable_worthy(status: u16, error: &ErrorBody) -> bool {
    if status == 401 {
        return true;
    }
    if error.kind == "insufficient_quota" {
        return true;
    }
    matches!(error.code.as_str(), "invalid_api_key" | "account_deactivated")
}

pub struct HealthTracker {
    store: Arc<dyn ChannelStore>,
    registry: Arc<ChannelRegistry>,
    settings: SettingsHandle,
    observability: Arc<Observability>,
    channels: Mutex<HashMap<ChannelId, ChannelHealth>>,
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker").finish_non_exhaustive()
    }
}

impl HealthTracker {
    pub fn new(
        store: Arc<dyn ChannelStore>,
        registry: Arc<ChannelRegistry>,
        settings: SettingsHandle,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            observability,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_outcome(&self, channel_id: ChannelId, success: bool) {
        self.record(channel_id, success, None);
    }

    fn record(&self, channel_id: ChannelId, success: bool, message: Option<String>) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        let health = channels.entry(channel_id).or_default();
        if success {
            health.record_success();
        } else {
            health.record_failure(message);
        }
    }

    pub fn should_disable(&self, error: &ErrorBody, status: u16) -> bool {
        self.settings.current().automatic_disable_channel && disable_worthy(status, error)
    }

    /// Moves an enabled channel to `AutoDisabled`. Returns `false` when nothing changed.
    pub async fn disable(
        &self,
        channel_id: ChannelId,
        channel_name: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let changed = self
            .store
            .set_channel_status(channel_id, ChannelStatus::AutoDisabled, reason)
            .await?;
        self.registry.invalidate(channel_id);
        if changed {
            self.observability.record_channel_disabled();
            warn!(
                channel_id = %channel_id,
                channel_name,
                reason,
                "channel automatically disabled"
            );
        }
        Ok(changed)
    }

    /// Books a failed attempt; channels whose error proves them unusable are disabled.
    pub async fn report_failure(
        self: Arc<Self>,
        channel: Arc<Channel>,
        error: UpstreamError,
    ) -> Result<(), StoreError> {
        self.record(channel.id, false, Some(error.body.message.clone()));
        if !self.should_disable(&error.body, error.status) {
            debug!(channel_id = %channel.id, status = error.status, "channel failure recorded");
            return Ok(());
        }
        let reason = format!("status {}: {}", error.status, error.body.message);
        self.disable(channel.id, &channel.name, &reason).await?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<ChannelHealthSnapshot> {
        let Ok(channels) = self.channels.lock() else {
            return Vec::new();
        };
        let mut out: Vec<_> = channels
            .iter()
            .map(|(id, health)| health.snapshot(*id))
            .collect();
        out.sort_by_key(|snapshot| snapshot.channel_id);
        out
    }

    pub fn channel_snapshot(&self, channel_id: ChannelId) -> Option<ChannelHealthSnapshot> {
        let channels = self.channels.lock().ok()?;
        channels.get(&channel_id).map(|health| health.snapshot(channel_id))
    }
}

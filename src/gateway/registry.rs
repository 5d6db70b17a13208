use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error};

use super::channel::{Channel, ChannelId};
use super::settings::SettingsHandle;
use super::store::{ChannelStore, StoreError};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no available channel for model {model} under group {group}")]
    NotFound { group: String, model: String },
    #[error("channel {channel_id} is indexed but its record is missing")]
    Inconsistent { channel_id: ChannelId },
    #[error("channel {channel_id} does not exist")]
    UnknownChannel { channel_id: ChannelId },
    #[error("channel {channel_id} is disabled")]
    ChannelDisabled { channel_id: ChannelId },
    #[error("model name does not identify a specific custom GPT")]
    NonSpecificModel,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SelectError {
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::Inconsistent { .. } | Self::NonSpecificModel => 503,
            Self::UnknownChannel { .. } => 400,
            Self::ChannelDisabled { .. } => 403,
            Self::Store(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "no_available_channel",
            Self::Inconsistent { .. } => "channel_index_inconsistent",
            Self::UnknownChannel { .. } => "invalid_channel_id",
            Self::ChannelDisabled { .. } => "channel_disabled",
            Self::NonSpecificModel => "model_not_specific",
            Self::Store(_) => "store_error",
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound { model, .. } => format!("No available service nodes for model {model}"),
            Self::Inconsistent { .. } => {
                "Service node data is inconsistent, please contact the administrator".to_string()
            }
            Self::UnknownChannel { .. } => "Invalid server node ID".to_string(),
            Self::ChannelDisabled { .. } => "This service node has been disabled".to_string(),
            Self::NonSpecificModel => "Please specify a specific model, GPTs share links typified by \
                strings such as 'g-xxxxxxxxx', featuring an 11-character string that include 'g-'. \
                The complete model name appears as follows: 'gpt-4-gizmo-g-xxxxxxxxx'."
                .to_string(),
            Self::Store(_) => "internal error, please retry later".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelectionQuery<'a> {
    pub group: &'a str,
    pub model: &'a str,
    pub exclude: &'a [ChannelId],
    /// Only the first attempt is restricted to the highest priority tier.
    pub first_attempt: bool,
}

#[derive(Debug)]
struct IndexEntry {
    ids: Vec<ChannelId>,
    expires_at: Instant,
}

#[derive(Debug)]
struct RecordEntry {
    channel: Arc<Channel>,
    expires_at: Instant,
}

/// Read-through cache over the channel store plus weighted selection.
pub struct ChannelRegistry {
    store: Arc<dyn ChannelStore>,
    settings: SettingsHandle,
    index: RwLock<HashMap<(String, String), IndexEntry>>,
    records: RwLock<HashMap<ChannelId, RecordEntry>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn ChannelStore>, settings: SettingsHandle) -> Self {
        Self {
            store,
            settings,
            index: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn indexed_ids(&self, group: &str, model: &str) -> Result<Vec<ChannelId>, SelectError> {
        let key = (group.to_string(), model.to_string());
        let now = Instant::now();
        if let Ok(index) = self.index.read() {
            if let Some(entry) = index.get(&key).filter(|entry| entry.expires_at > now) {
                return Ok(entry.ids.clone());
            }
        }

        let ids = self.store.channels_by_group_and_model(group, model).await?;
        let ttl = self.settings.current().channel_cache_ttl();
        if let Ok(mut index) = self.index.write() {
            index.insert(
                key,
                IndexEntry {
                    ids: ids.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(ids)
    }

    async fn record(&self, id: ChannelId) -> Result<Option<Arc<Channel>>, SelectError> {
        let now = Instant::now();
        let cached = self.records.read().ok().and_then(|records| {
            records
                .get(&id)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.channel.clone())
        });
        if let Some(channel) = cached {
            return Ok(Some(channel));
        }

        let Some(channel) = self.store.channel_by_id(id).await? else {
            if let Ok(mut records) = self.records.write() {
                records.remove(&id);
            }
            return Ok(None);
        };
        let channel = Arc::new(channel);
        let ttl = self.settings.current().channel_cache_ttl();
        if let Ok(mut records) = self.records.write() {
            records.insert(
                id,
                RecordEntry {
                    channel: channel.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(Some(channel))
    }

    /// Channels eligible for `query`, already narrowed to the top priority tier on first attempts.
    pub async fn candidates(
        &self,
        query: &SelectionQuery<'_>,
    ) -> Result<Vec<Arc<Channel>>, SelectError> {
        let ids = self.indexed_ids(query.group, query.model).await?;

        let mut missing = None;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if query.exclude.contains(&id) {
                continue;
            }
            let Some(channel) = self.record(id).await? else {
                error!(
                    channel_id = %id,
                    group = query.group,
                    model = query.model,
                    "channel index references a missing channel record; data consistency is broken"
                );
                missing = Some(id);
                continue;
            };
            if !channel.is_enabled()
                || channel.group_weight(query.group) == 0
                || !channel.supports_model(query.model)
            {
                continue;
            }
            out.push(channel);
        }

        if query.first_attempt {
            if let Some(top) = out.iter().map(|channel| channel.priority).max() {
                out.retain(|channel| channel.priority == top);
            }
        }

        if out.is_empty() {
            if let Some(channel_id) = missing {
                return Err(SelectError::Inconsistent { channel_id });
            }
            return Err(SelectError::NotFound {
                group: query.group.to_string(),
                model: query.model.to_string(),
            });
        }
        Ok(out)
    }

    pub async fn select_channel(
        &self,
        query: &SelectionQuery<'_>,
    ) -> Result<Arc<Channel>, SelectError> {
        let candidates = self.candidates(query).await?;
        let picked = choose_weighted(&candidates, query.group, &mut rand::thread_rng());
        picked.ok_or_else(|| SelectError::NotFound {
            group: query.group.to_string(),
            model: query.model.to_string(),
        })
    }

    /// Resolves an explicitly pinned channel. It must exist and be enabled.
    pub async fn select_specific(&self, id: ChannelId) -> Result<Arc<Channel>, SelectError> {
        let channel = self
            .record(id)
            .await?
            .ok_or(SelectError::UnknownChannel { channel_id: id })?;
        if !channel.is_enabled() {
            return Err(SelectError::ChannelDisabled { channel_id: id });
        }
        Ok(channel)
    }

    /// Drops the channel record and every index entry that lists it.
    pub fn invalidate(&self, id: ChannelId) {
        if let Ok(mut records) = self.records.write() {
            records.remove(&id);
        }
        if let Ok(mut index) = self.index.write() {
            index.retain(|_, entry| !entry.ids.contains(&id));
        }
        debug!(channel_id = %id, "channel cache invalidated");
    }
}

/// Weighted random draw by group weight. Channels with weight 0 are never picked.
pub fn choose_weighted<R: Rng + ?Sized>(
    candidates: &[Arc<Channel>],
    group: &str,
    rng: &mut R,
) -> Option<Arc<Channel>> {
    let weighted: Vec<(&Arc<Channel>, u64)> = candidates
        .iter()
        .map(|channel| (channel, u64::from(channel.group_weight(group))))
        .filter(|(_, weight)| *weight > 0)
        .collect();
    if weighted.len() == 1 {
        return Some(weighted[0].0.clone());
    }

    let total_weight: u64 = weighted.iter().map(|(_, weight)| weight).sum();
    if total_weight == 0 {
        return None;
    }

    let mut pick = rng.gen_range(0..total_weight);
    for (channel, weight) in &weighted {
        if pick < *weight {
            return Some((*channel).clone());
        }
        pick -= weight;
    }
    weighted.last().map(|(channel, _)| (*channel).clone())
}

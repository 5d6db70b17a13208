//! In-process store backing the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::channel::{Channel, ChannelId, ChannelStatus};
use super::context::TenantContext;
use super::store::{
    AuditRecord, BalanceCache, ChannelStore, DEFAULT_BALANCE_TTL_SECS, QuotaStore, StoreError, TenantId, TenantResolver,
    TokenAccount, TokenId,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantSeed {
    pub id: TenantId,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub can_pin_channel: bool,
}

fn default_group() -> String {
    "default".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSeed {
    pub id: TokenId,
    pub tenant_id: TenantId,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub remaining_quota: i64,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for TokenSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSeed")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("remaining_quota", &self.remaining_quota)
            .field("unlimited", &self.unlimited)
            .finish()
    }
}

#[derive(Debug)]
struct TenantRow {
    group: String,
    balance: i64,
    used_quota: i64,
    request_count: u64,
    can_pin_channel: bool,
}

#[derive(Debug)]
struct TokenRow {
    key: String,
    account: TokenAccount,
}

#[derive(Debug, Default)]
struct Inner {
    channels: BTreeMap<ChannelId, Channel>,
    tenants: HashMap<TenantId, TenantRow>,
    tokens: HashMap<TokenId, TokenRow>,
    audit: Vec<AuditRecord>,
    channel_used_quota: HashMap<ChannelId, i64>,
}

/// All state behind one mutex so reservations are atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(channels: Vec<Channel>, tenants: Vec<TenantSeed>, tokens: Vec<TokenSeed>) -> Self {
        let store = Self::new();
        for channel in channels {
            store.upsert_channel(channel);
        }
        for tenant in tenants {
            store.upsert_tenant(tenant);
        }
        for token in tokens {
            store.upsert_token(token);
        }
        store
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    pub fn upsert_channel(&self, channel: Channel) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.channels.insert(channel.id, channel);
        }
    }

    pub fn upsert_tenant(&self, seed: TenantSeed) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tenants.insert(
                seed.id,
                TenantRow {
                    group: seed.group,
                    balance: seed.balance,
                    used_quota: seed.used_quota,
                    request_count: 0,
                    can_pin_channel: seed.can_pin_channel,
                },
            );
        }
    }

    pub fn upsert_token(&self, seed: TokenSeed) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tokens.insert(
                seed.id,
                TokenRow {
                    key: seed.key,
                    account: TokenAccount {
                        id: seed.id,
                        tenant_id: seed.tenant_id,
                        name: seed.name,
                        remaining_quota: seed.remaining_quota,
                        used_quota: 0,
                        unlimited: seed.unlimited,
                        expires_at: seed.expires_at,
                    },
                },
            );
        }
    }

    pub fn channel_status(&self, id: ChannelId) -> Option<ChannelStatus> {
        let inner = self.inner.lock().ok()?;
        inner.channels.get(&id).map(|channel| channel.status)
    }

    pub fn tenant_request_count(&self, tenant: TenantId) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.tenants.get(&tenant).map(|row| row.request_count))
            .unwrap_or(0)
    }

    pub fn channel_used_quota(&self, id: ChannelId) -> i64 {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.channel_used_quota.get(&id).copied())
            .unwrap_or(0)
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .map(|inner| inner.audit.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn channels_by_group_and_model(
        &self,
        group: &str,
        model: &str,
    ) -> Result<Vec<ChannelId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .channels
            .values()
            .filter(|channel| {
                channel.is_enabled()
                    && channel.groups.contains_key(group)
                    && channel.supports_model(model)
            })
            .map(|channel| channel.id)
            .collect())
    }

    async fn channel_by_id(&self, id: ChannelId) -> Result<Option<Channel>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.channels.get(&id).cloned())
    }

    async fn set_channel_status(
        &self,
        id: ChannelId,
        status: ChannelStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let channel = inner
            .channels
            .get_mut(&id)
            .ok_or(StoreError::ChannelNotFound(id))?;
        if channel.status == status {
            return Ok(false);
        }
        if status == ChannelStatus::AutoDisabled && channel.status != ChannelStatus::Enabled {
            return Ok(false);
        }
        channel.status = status;
        channel.config.insert("status_reason".to_string(), reason.to_string());
        Ok(true)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn tenant_balance(&self, tenant: TenantId) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        inner
            .tenants
            .get(&tenant)
            .map(|row| row.balance)
            .ok_or(StoreError::TenantNotFound(tenant))
    }

    async fn reserve_token_quota(&self, token: TokenId, amount: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let Inner {
            tenants, tokens, ..
        } = &mut *inner;
        let row = tokens.get_mut(&token).ok_or(StoreError::TokenNotFound(token))?;
        let tenant_id = row.account.tenant_id;
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or(StoreError::TenantNotFound(tenant_id))?;

        if !row.account.unlimited {
            if row.account.remaining_quota < amount {
                return Err(StoreError::InsufficientQuota {
                    remaining: row.account.remaining_quota,
                    requested: amount,
                });
            }
            if tenant.balance < amount {
                return Err(StoreError::InsufficientQuota {
                    remaining: tenant.balance,
                    requested: amount,
                });
            }
        }

        row.account.remaining_quota -= amount;
        row.account.used_quota += amount;
        tenant.balance -= amount;
        Ok(())
    }

    async fn apply_balance_delta(
        &self,
        token: TokenId,
        consumed_delta: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let Inner {
            tenants, tokens, ..
        } = &mut *inner;
        let row = tokens.get_mut(&token).ok_or(StoreError::TokenNotFound(token))?;
        let tenant_id = row.account.tenant_id;
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or(StoreError::TenantNotFound(tenant_id))?;

        row.account.remaining_quota -= consumed_delta;
        row.account.used_quota += consumed_delta;
        tenant.balance -= consumed_delta;
        if tenant.balance < 0 {
            warn!(tenant_id = %tenant_id, balance = tenant.balance, "tenant balance overdrawn by settlement");
        }
        Ok(())
    }

    async fn append_audit_record(&self, record: AuditRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.audit.push(record);
        Ok(())
    }

    async fn increment_aggregate_usage(
        &self,
        tenant: TenantId,
        channel: ChannelId,
        quota: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .tenants
            .get_mut(&tenant)
            .ok_or(StoreError::TenantNotFound(tenant))?;
        row.used_quota += quota;
        row.request_count += 1;
        *inner.channel_used_quota.entry(channel).or_insert(0) += quota;
        Ok(())
    }

    async fn token_account(&self, token: TokenId) -> Result<Option<TokenAccount>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.tokens.get(&token).map(|row| row.account.clone()))
    }

    async fn tenant_used_quota(&self, tenant: TenantId) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        inner
            .tenants
            .get(&tenant)
            .map(|row| row.used_quota)
            .ok_or(StoreError::TenantNotFound(tenant))
    }

    async fn period_quota_sum(
        &self,
        tenant: TenantId,
        from_epoch: i64,
        to_epoch: i64,
    ) -> Result<i64, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .audit
            .iter()
            .filter(|record| record.tenant_id == tenant)
            .filter(|record| {
                let ts = (record.ts_ms / 1000) as i64;
                ts >= from_epoch && ts <= to_epoch
            })
            .map(|record| record.quota)
            .sum())
    }
}

#[async_trait]
impl TenantResolver for MemoryStore {
    async fn resolve(&self, api_key: &str) -> Result<Option<TenantContext>, StoreError> {
        let inner = self.lock()?;
        let Some(row) = inner.tokens.values().find(|row| row.key == api_key) else {
            return Ok(None);
        };
        let now_secs = (super::now_millis() / 1000) as i64;
        if row.account.expires_at.is_some_and(|expires| expires > 0 && expires <= now_secs) {
            return Ok(None);
        }
        let Some(tenant) = inner.tenants.get(&row.account.tenant_id) else {
            return Ok(None);
        };
        Ok(Some(TenantContext {
            tenant_id: row.account.tenant_id,
            token_id: row.account.id,
            token_name: row.account.name.clone(),
            group: tenant.group.clone(),
            unlimited: row.account.unlimited,
            can_pin_channel: tenant.can_pin_channel,
        }))
    }
}

#[derive(Debug)]
struct CachedBalance {
    balance: i64,
    expires_at: Instant,
}

/// Entries live for the TTL from `set`; `increment` never revives or extends them.
#[derive(Debug)]
pub struct MemoryBalanceCache {
    entries: Mutex<HashMap<TenantId, CachedBalance>>,
    ttl: Duration,
}

impl Default for MemoryBalanceCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(DEFAULT_BALANCE_TTL_SECS),
        }
    }
}

impl MemoryBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<TenantId, CachedBalance>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("balance cache lock poisoned".to_string()))
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<TenantId, CachedBalance>,
        tenant: TenantId,
    ) -> Option<&'a mut CachedBalance> {
        if entries
            .get(&tenant)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(&tenant);
        }
        entries.get_mut(&tenant)
    }
}

#[async_trait]
impl BalanceCache for MemoryBalanceCache {
    async fn get(&self, tenant: TenantId) -> Result<Option<i64>, StoreError> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, tenant).map(|entry| entry.balance))
    }

    async fn set(&self, tenant: TenantId, balance: i64) -> Result<(), StoreError> {
        let expires_at = Instant::now() + self.ttl;
        self.lock()?.insert(tenant, CachedBalance { balance, expires_at });
        Ok(())
    }

    async fn increment(&self, tenant: TenantId, delta: i64) -> Result<Option<i64>, StoreError> {
        let mut entries = self.lock()?;
        Ok(Self::live_entry(&mut entries, tenant).map(|entry| {
            entry.balance += delta;
            entry.balance
        }))
    }

    async fn invalidate(&self, tenant: TenantId) -> Result<(), StoreError> {
        self.lock()?.remove(&tenant);
        Ok(())
    }
}

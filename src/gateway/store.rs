//! Persistence and cache seams. The relay core only speaks these traits.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel::{Channel, ChannelId, ChannelStatus};
use super::context::TenantContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient quota: remaining={remaining} requested={requested}")]
    InsufficientQuota { remaining: i64, requested: i64 },
    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),
    #[error("token {0} not found")]
    TokenNotFound(TokenId),
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub id: TokenId,
    pub tenant_id: TenantId,
    pub name: String,
    pub remaining_quota: i64,
    pub used_quota: i64,
    pub unlimited: bool,
    /// Epoch seconds; `None` never expires.
    pub expires_at: Option<i64>,
}

/// One consumption line, written only when a request cost something.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts_ms: u64,
    pub tenant_id: TenantId,
    pub token_name: String,
    pub channel_id: ChannelId,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: i64,
    pub content: String,
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Enabled channels indexed under `(group, model)`, wildcard entries included.
    async fn channels_by_group_and_model(
        &self,
        group: &str,
        model: &str,
    ) -> Result<Vec<ChannelId>, StoreError>;

    async fn channel_by_id(&self, id: ChannelId) -> Result<Option<Channel>, StoreError>;

    /// Returns `true` when the status actually changed.
    async fn set_channel_status(
        &self,
        id: ChannelId,
        status: ChannelStatus,
        reason: &str,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn tenant_balance(&self, tenant: TenantId) -> Result<i64, StoreError>;

    /// Debits `amount` from the token (and its tenant) only if the balance covers it.
    async fn reserve_token_quota(&self, token: TokenId, amount: i64) -> Result<(), StoreError>;

    /// Positive `consumed_delta` consumes more quota; negative gives quota back.
    async fn apply_balance_delta(&self, token: TokenId, consumed_delta: i64)
    -> Result<(), StoreError>;

    async fn append_audit_record(&self, record: AuditRecord) -> Result<(), StoreError>;

    async fn increment_aggregate_usage(
        &self,
        tenant: TenantId,
        channel: ChannelId,
        quota: i64,
    ) -> Result<(), StoreError>;

    async fn token_account(&self, token: TokenId) -> Result<Option<TokenAccount>, StoreError>;

    async fn tenant_used_quota(&self, tenant: TenantId) -> Result<i64, StoreError>;

    /// Quota consumed by `tenant` between two epoch-second bounds (inclusive).
    async fn period_quota_sum(
        &self,
        tenant: TenantId,
        from_epoch: i64,
        to_epoch: i64,
    ) -> Result<i64, StoreError>;
}

pub const DEFAULT_BALANCE_TTL_SECS: u64 = 60;

/// Tenant balance cache. Mutation goes through `increment`, never read-modify-write.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn get(&self, tenant: TenantId) -> Result<Option<i64>, StoreError>;

    async fn set(&self, tenant: TenantId, balance: i64) -> Result<(), StoreError>;

    /// Adds `delta` to a cached balance; `None` when the tenant is not cached.
    async fn increment(&self, tenant: TenantId, delta: i64) -> Result<Option<i64>, StoreError>;

    async fn invalidate(&self, tenant: TenantId) -> Result<(), StoreError>;
}

/// Maps an API key to the tenant context it authenticates.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, api_key: &str) -> Result<Option<TenantContext>, StoreError>;
}

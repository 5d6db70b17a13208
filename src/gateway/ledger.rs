//! Quota pre-consumption and reconciliation.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::GatewayError;
use super::channel::ChannelId;
use super::context::TenantContext;
use super::metering::Usage;
use super::now_millis;
use super::settings::{GatewaySettings, SettingsHandle};
use super::store::{AuditRecord, BalanceCache, QuotaStore, StoreError, TenantId, TokenId};

pub const USER_QUOTA_CODE: &str = "insufficient_user_quota";
pub const TOKEN_QUOTA_CODE: &str = "pre_consume_token_quota_failed";

/// Price multipliers for one request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pricing {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
}

impl Pricing {
    pub fn resolve(settings: &GatewaySettings, model: &str, group: &str) -> Self {
        Self {
            model_ratio: settings.model_ratio(model),
            completion_ratio: settings.completion_ratio(model),
            group_ratio: settings.group_ratio(group),
        }
    }

    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio
    }

    /// Quota held back for an estimated number of units.
    pub fn reserve_quota(&self, estimated_units: u32) -> i64 {
        (f64::from(estimated_units) * self.ratio()) as i64
    }

    /// Final cost of a request. Non-zero pricing always costs at least one unit.
    pub fn cost(&self, usage: &Usage) -> i64 {
        if usage.total() == 0 {
            return 0;
        }
        let weighted = f64::from(usage.prompt_tokens)
            + f64::from(usage.completion_tokens) * self.completion_ratio;
        let ratio = self.ratio();
        let cost = (weighted * ratio).ceil() as i64;
        if ratio != 0.0 && cost <= 0 { 1 } else { cost }
    }
}

/// Quota held for one in-flight request.
///
/// Consumed by exactly one of [`QuotaLedger::finalize`] or [`QuotaLedger::refund`].
#[must_use = "a reservation must be finalized or refunded"]
#[derive(Debug)]
pub struct Reservation {
    tenant_id: TenantId,
    token_id: TokenId,
    amount: i64,
    settled: bool,
}

impl Reservation {
    fn new(tenant: &TenantContext, amount: i64) -> Self {
        Self {
            tenant_id: tenant.tenant_id,
            token_id: tenant.token_id,
            amount,
            settled: false,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    fn disarm(mut self) -> (TenantId, TokenId, i64) {
        self.settled = true;
        (self.tenant_id, self.token_id, self.amount)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled && self.amount != 0 {
            warn!(
                tenant_id = %self.tenant_id,
                token_id = %self.token_id,
                amount = self.amount,
                "quota reservation dropped without settlement"
            );
        }
    }
}

/// What a successful request actually used.
#[derive(Clone, Debug)]
pub struct Settlement {
    pub channel_id: ChannelId,
    pub model: String,
    pub token_name: String,
    pub usage: Usage,
    pub pricing: Pricing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub cost: i64,
    pub delta: i64,
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    cache: Arc<dyn BalanceCache>,
    settings: SettingsHandle,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger").finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        cache: Arc<dyn BalanceCache>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    /// Cached tenant balance, loaded from the store on a miss.
    pub async fn balance(&self, tenant: TenantId) -> Result<i64, StoreError> {
        match self.cache.get(tenant).await {
            Ok(Some(balance)) => return Ok(balance),
            Ok(None) => {}
            Err(err) => warn!(tenant_id = %tenant, error = %err, "balance cache read failed"),
        }
        let balance = self.store.tenant_balance(tenant).await?;
        if let Err(err) = self.cache.set(tenant, balance).await {
            warn!(tenant_id = %tenant, error = %err, "balance cache fill failed");
        }
        Ok(balance)
    }

    async fn adjust_cache(&self, tenant: TenantId, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Err(err) = self.cache.increment(tenant, delta).await {
            warn!(tenant_id = %tenant, error = %err, "balance cache update failed; invalidating");
            if let Err(err) = self.cache.invalidate(tenant).await {
                error!(tenant_id = %tenant, error = %err, "balance cache invalidation failed");
            }
        }
    }

    pub async fn pre_consume(
        &self,
        tenant: &TenantContext,
        amount: i64,
    ) -> Result<Reservation, GatewayError> {
        let amount = amount.max(0);
        let balance = self.balance(tenant.tenant_id).await?;
        if !tenant.unlimited && balance < amount {
            return Err(GatewayError::QuotaExceeded {
                code: USER_QUOTA_CODE,
                balance,
                required: amount,
            });
        }

        let trust_floor = amount.saturating_mul(self.settings.current().trust_multiplier);
        if balance > trust_floor {
            info!(
                tenant_id = %tenant.tenant_id,
                balance,
                amount,
                "tenant has enough quota; skipping pre-consumption"
            );
            return Ok(Reservation::new(tenant, 0));
        }
        if amount == 0 {
            return Ok(Reservation::new(tenant, 0));
        }

        match self.store.reserve_token_quota(tenant.token_id, amount).await {
            Ok(()) => {}
            Err(StoreError::InsufficientQuota {
                remaining,
                requested,
            }) => {
                return Err(GatewayError::QuotaExceeded {
                    code: TOKEN_QUOTA_CODE,
                    balance: remaining,
                    required: requested,
                });
            }
            Err(err) => return Err(err.into()),
        }
        self.adjust_cache(tenant.tenant_id, -amount).await;
        Ok(Reservation::new(tenant, amount))
    }

    /// Applies `final - reserved` and books the request.
    pub async fn finalize(
        &self,
        reservation: Reservation,
        settlement: Settlement,
    ) -> Result<SettlementReceipt, StoreError> {
        let (tenant_id, token_id, reserved) = reservation.disarm();
        let cost = settlement.pricing.cost(&settlement.usage);
        let delta = cost - reserved;

        if delta != 0 {
            self.store.apply_balance_delta(token_id, delta).await?;
        }
        self.adjust_cache(tenant_id, -delta).await;

        if cost <= 0 {
            if settlement.usage.total() > 0 {
                error!(
                    tenant_id = %tenant_id,
                    channel_id = %settlement.channel_id,
                    model = %settlement.model,
                    cost,
                    "request used tokens but cost nothing; check the ratio tables"
                );
            }
            return Ok(SettlementReceipt { cost, delta });
        }

        let settings = self.settings.current();
        if settings.log_consume_enabled {
            let content = format!(
                "model ratio {:.2}, group ratio {:.2}, completion ratio {:.2}",
                settlement.pricing.model_ratio,
                settlement.pricing.group_ratio,
                settlement.pricing.completion_ratio
            );
            self.store
                .append_audit_record(AuditRecord {
                    ts_ms: now_millis(),
                    tenant_id,
                    token_name: settlement.token_name,
                    channel_id: settlement.channel_id,
                    model: settlement.model,
                    prompt_tokens: settlement.usage.prompt_tokens,
                    completion_tokens: settlement.usage.completion_tokens,
                    quota: cost,
                    content,
                })
                .await?;
        }
        self.store
            .increment_aggregate_usage(tenant_id, settlement.channel_id, cost)
            .await?;
        Ok(SettlementReceipt { cost, delta })
    }

    /// Returns everything a failed request reserved.
    pub async fn refund(&self, reservation: Reservation) -> Result<i64, StoreError> {
        let (tenant_id, token_id, reserved) = reservation.disarm();
        if reserved == 0 {
            return Ok(0);
        }
        self.store.apply_balance_delta(token_id, -reserved).await?;
        self.adjust_cache(tenant_id, reserved).await;
        Ok(reserved)
    }
}

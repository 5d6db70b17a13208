use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub upstream_failures: u64,
    pub quota_rejected: u64,
    pub settlements: u64,
    pub refunds: u64,
    pub channels_disabled: u64,
}

/// Process-wide relay counters, shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    upstream_failures: AtomicU64,
    quota_rejected: AtomicU64,
    settlements: AtomicU64,
    refunds: AtomicU64,
    channels_disabled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_success(&self) {
        bump(&self.succeeded);
    }

    pub fn record_failure(&self) {
        bump(&self.failed);
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn record_upstream_failure(&self) {
        bump(&self.upstream_failures);
    }

    pub fn record_quota_rejected(&self) {
        bump(&self.quota_rejected);
    }

    pub fn record_settlement(&self) {
        bump(&self.settlements);
    }

    pub fn record_refund(&self) {
        bump(&self.refunds);
    }

    pub fn record_channel_disabled(&self) {
        bump(&self.channels_disabled);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
            refunds: self.refunds.load(Ordering::Relaxed),
            channels_disabled: self.channels_disabled.load(Ordering::Relaxed),
        }
    }
}

//! Multi-tenant relay core: channel selection, failover, quota accounting and channel health.

pub mod adapter;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod health;
pub mod http;
pub mod ledger;
pub mod memory_store;
pub mod metering;
pub mod observability;
pub mod openai_adapter;
#[cfg(feature = "redis-cache")]
pub mod redis_cache;
pub mod registry;
pub mod request;
pub mod retry;
pub mod scrub;
pub mod settings;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod vision;

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use adapter::{AdapterCapabilities, AdapterResponse, AdapterSet, ChannelAdapter, RelayRequest};
pub use channel::{Channel, ChannelId, ChannelStatus, ProviderKind, ProviderProfile};
pub use context::{AttemptRecord, RequestContext, TenantContext};
pub use dispatch::{DispatchRequest, DispatchSuccess, Dispatcher, PublicError, RelayBody};
pub use health::{ChannelHealthSnapshot, HealthTracker};
pub use ledger::{Pricing, QuotaLedger, Reservation, Settlement};
pub use memory_store::{MemoryBalanceCache, MemoryStore, TenantSeed, TokenSeed};
pub use metering::{MeteringError, Usage, UsageMeter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use openai_adapter::OpenAiCompatibleAdapter;
#[cfg(feature = "redis-cache")]
pub use redis_cache::RedisBalanceCache;
pub use registry::{ChannelRegistry, SelectError, SelectionQuery};
pub use request::{ChatMessage, ChatRequest};
pub use settings::{GatewaySettings, SettingsHandle, SettingsPublisher, SettingsSource};
pub use store::{BalanceCache, ChannelStore, QuotaStore, StoreError, TenantId, TenantResolver, TokenId};
pub use tasks::TaskRunner;
pub use http::{GatewayHttpState, router};

/// `type` reported for errors raised by the gateway itself rather than relayed from upstream.
pub const GATEWAY_ERROR_TYPE: &str = "relaygate_error";

/// OpenAI-shaped error object: `{"message", "type", "param", "code"}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub param: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub code: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, kind: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            param: String::new(),
            code: code.into(),
        }
    }
}

// Upstreams send `code`/`param` as strings, numbers or null.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// The request never produced an upstream status (connect failure, timeout, broken body).
    Transport,
    /// Upstream answered with a non-success status.
    Status,
    /// The channel's adapter cannot serve this request shape.
    Unsupported,
}

#[derive(Clone, Debug, Error)]
#[error("upstream error ({status}): {}", .body.message)]
pub struct UpstreamError {
    pub status: u16,
    pub kind: UpstreamErrorKind,
    pub body: ErrorBody,
}

impl UpstreamError {
    pub fn transport(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: UpstreamErrorKind::Transport,
            body: ErrorBody::new(message, GATEWAY_ERROR_TYPE, code),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            status: 501,
            kind: UpstreamErrorKind::Unsupported,
            body: ErrorBody::new(message, GATEWAY_ERROR_TYPE, "channel_capability_mismatch"),
        }
    }

    pub fn status(status: u16, body: ErrorBody) -> Self {
        Self {
            status,
            kind: UpstreamErrorKind::Status,
            body,
        }
    }

    /// Builds an error from a non-success upstream response, reading `{"error": {...}}` when present.
    pub fn from_response(status: u16, bytes: &[u8]) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Option<ErrorBody>,
        }

        let parsed = serde_json::from_slice::<Envelope>(bytes)
            .ok()
            .and_then(|envelope| envelope.error)
            .filter(|body| !body.message.is_empty() || !body.kind.is_empty());
        let body = parsed.unwrap_or_else(|| ErrorBody {
            message: format!("bad response status code {status}"),
            kind: "upstream_error".to_string(),
            param: status.to_string(),
            code: "bad_response_status_code".to_string(),
        });
        Self::status(status, body)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("quota exceeded: balance={balance} required={required}")]
    QuotaExceeded {
        code: &'static str,
        balance: i64,
        required: i64,
    },
    #[error(transparent)]
    ChannelUnavailable(#[from] SelectError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("internal error ({code}): {message}")]
    Internal { code: &'static str, message: String },
}

impl GatewayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            code,
            message: err.to_string(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::QuotaExceeded { .. } => 403,
            Self::ChannelUnavailable(reason) => reason.status(),
            Self::Upstream(err) => err.status,
            Self::Internal { .. } => 500,
        }
    }

    /// The error object shown to the caller. Internal detail never leaves the process.
    pub fn public_body(&self) -> ErrorBody {
        match self {
            Self::Validation { code, message } => {
                ErrorBody::new(message.clone(), GATEWAY_ERROR_TYPE, *code)
            }
            Self::QuotaExceeded { code, .. } => {
                let message = if *code == ledger::TOKEN_QUOTA_CODE {
                    "token quota is not enough"
                } else {
                    "user quota is not enough"
                };
                ErrorBody::new(message, GATEWAY_ERROR_TYPE, *code)
            }
            Self::ChannelUnavailable(reason) => {
                ErrorBody::new(reason.public_message(), GATEWAY_ERROR_TYPE, reason.code())
            }
            Self::Upstream(err) => err.body.clone(),
            Self::Internal { code, .. } => ErrorBody::new(
                "internal error, please retry later",
                GATEWAY_ERROR_TYPE,
                *code,
            ),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::internal("store_error", err)
    }
}

impl From<MeteringError> for GatewayError {
    fn from(err: MeteringError) -> Self {
        Self::Validation {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Storage and cache seams the relay core is wired against.
#[derive(Clone)]
pub struct GatewayParts {
    pub channels: Arc<dyn ChannelStore>,
    pub quota: Arc<dyn QuotaStore>,
    pub balances: Arc<dyn BalanceCache>,
    pub adapters: AdapterSet,
    pub settings: SettingsHandle,
}

/// The wired relay core: every component shares the same settings handle and task runner.
#[derive(Clone)]
pub struct Gateway {
    pub registry: Arc<ChannelRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub health: Arc<HealthTracker>,
    pub meter: Arc<UsageMeter>,
    pub dispatcher: Arc<Dispatcher>,
    pub tasks: TaskRunner,
    pub observability: Arc<Observability>,
    pub settings: SettingsHandle,
    pub quota: Arc<dyn QuotaStore>,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Result<Self, GatewayError> {
        let GatewayParts {
            channels,
            quota,
            balances,
            adapters,
            settings,
        } = parts;

        let tasks = TaskRunner::new();
        let observability = Arc::new(Observability::default());
        let registry = Arc::new(ChannelRegistry::new(channels.clone(), settings.clone()));
        let ledger = Arc::new(QuotaLedger::new(
            quota.clone(),
            balances,
            settings.clone(),
        ));
        let health = Arc::new(HealthTracker::new(
            channels,
            registry.clone(),
            settings.clone(),
            observability.clone(),
        ));
        let meter = Arc::new(UsageMeter::new(settings.clone())?);
        let dispatcher = Arc::new(Dispatcher::new(dispatch::DispatcherParts {
            registry: registry.clone(),
            ledger: ledger.clone(),
            health: health.clone(),
            meter: meter.clone(),
            adapters: Arc::new(adapters),
            settings: settings.clone(),
            tasks: tasks.clone(),
            observability: observability.clone(),
        }));

        Ok(Self {
            registry,
            ledger,
            health,
            meter,
            dispatcher,
            tasks,
            observability,
            settings,
            quota,
        })
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }
}

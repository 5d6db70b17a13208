//! Multi-tenant LLM relay: routes OpenAI-shaped chat requests across upstream channels with
//! failover, quota accounting and automatic channel demotion.

pub mod config;
mod error;
pub mod gateway;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use gateway::{Gateway, GatewayError, GatewayParts};

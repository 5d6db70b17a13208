use std::path::PathBuf;

use thiserror::Error;

use crate::gateway::{GatewayError, StoreError, settings::SettingsError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

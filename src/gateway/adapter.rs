use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::UpstreamError;
use super::channel::{Channel, ProviderKind, ProviderProfile};
use super::metering::Usage;
use super::request::ChatRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub vision: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            vision: true,
        }
    }
}

/// One upstream call. `body.model` is already remapped for the channel.
#[derive(Clone, Debug)]
pub struct RelayRequest {
    pub request_id: String,
    pub body: ChatRequest,
    pub profile: ProviderProfile,
}

pub type UpstreamStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

pub enum ResponseBody {
    Json(Value),
    /// Raw SSE bytes as received.
    Stream(UpstreamStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct AdapterResponse {
    pub status: u16,
    pub body: ResponseBody,
    /// Usage reported by the provider outside the body, if any.
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn invoke(
        &self,
        channel: &Channel,
        request: &RelayRequest,
    ) -> Result<AdapterResponse, UpstreamError>;
}

/// Adapters by provider kind, with an optional catch-all.
#[derive(Clone, Default)]
pub struct AdapterSet {
    by_kind: HashMap<ProviderKind, Arc<dyn ChannelAdapter>>,
    fallback: Option<Arc<dyn ChannelAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    pub fn register(&mut self, kind: ProviderKind, adapter: Arc<dyn ChannelAdapter>) {
        self.by_kind.insert(kind, adapter);
    }

    pub fn for_channel(&self, channel: &Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.by_kind
            .get(&channel.kind)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort_by_key(|kind| format!("{kind:?}"));
        f.debug_struct("AdapterSet")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

use std::sync::Arc;

use super::channel::{Channel, ChannelId};
use super::store::{TenantId, TokenId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub token_id: TokenId,
    pub token_name: String,
    pub group: String,
    pub unlimited: bool,
    /// Allows the `x-channel-id` diagnostic override.
    pub can_pin_channel: bool,
}

#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub channel_id: ChannelId,
    pub status: u16,
    pub message: String,
}

/// Per-request state threaded through selection, invocation and settlement.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant: TenantContext,
    pub pinned_channel: Option<ChannelId>,
    /// Model name used to (re)select channels.
    pub selection_model: String,
    /// Model name as the caller sent it.
    pub requested_model: String,
    /// Model name sent to the current channel after remapping.
    pub upstream_model: String,
    pub channel: Option<Arc<Channel>>,
    pub excluded: Vec<ChannelId>,
    pub attempts: Vec<AttemptRecord>,
}

impl RequestContext {
    pub fn new(request_id: String, tenant: TenantContext, pinned_channel: Option<ChannelId>) -> Self {
        Self {
            request_id,
            tenant,
            pinned_channel,
            selection_model: String::new(),
            requested_model: String::new(),
            upstream_model: String::new(),
            channel: None,
            excluded: Vec::new(),
            attempts: Vec::new(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_channel.is_some()
    }

    pub fn group(&self) -> &str {
        &self.tenant.group
    }

    pub fn bind_channel(&mut self, channel: Arc<Channel>) {
        self.upstream_model = channel.upstream_model(&self.requested_model);
        self.channel = Some(channel);
    }

    pub fn record_failure(&mut self, channel_id: ChannelId, status: u16, message: &str) {
        if !self.excluded.contains(&channel_id) {
            self.excluded.push(channel_id);
        }
        self.attempts.push(AttemptRecord {
            channel_id,
            status,
            message: message.to_string(),
        });
    }
}

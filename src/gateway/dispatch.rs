//! Request orchestration: select, reserve, invoke, fail over, settle.

use std::sync::Arc;

use serde_json::Value;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

use super::adapter::{AdapterResponse, AdapterSet, RelayRequest, ResponseBody};
use super::channel::{Channel, ChannelId};
use super::context::{RequestContext, TenantContext};
use super::health::HealthTracker;
use super::ledger::{Pricing, QuotaLedger, Reservation, Settlement};
use super::metering::{Usage, UsageMeter};
use super::observability::Observability;
use super::registry::{ChannelRegistry, SelectionQuery};
use super::request::{ChatRequest, route_model};
use super::retry::{RetryBudget, should_retry};
use super::scrub::{OVERLOADED_MESSAGE, UpstreamScrubber, message_with_request_id};
use super::settings::{GatewaySettings, SettingsHandle};
use super::stream::{RelayStream, StreamFinisher, StreamSummary, metered_stream};
use super::tasks::TaskRunner;
use super::vision::is_vision_model;
use super::{ErrorBody, GatewayError, UpstreamError};

#[derive(Debug)]
pub struct DispatchRequest {
    pub request_id: String,
    pub tenant: TenantContext,
    /// Diagnostic override; the caller checks the tenant may pin.
    pub pinned_channel: Option<ChannelId>,
    pub body: ChatRequest,
}

pub enum RelayBody {
    Json(Value),
    Stream(RelayStream),
}

impl std::fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct DispatchSuccess {
    pub channel_id: ChannelId,
    pub body: RelayBody,
}

/// The error a tenant sees: scrubbed, with the request id appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicError {
    pub status: u16,
    pub error: ErrorBody,
}

pub struct DispatcherParts {
    pub registry: Arc<ChannelRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub health: Arc<HealthTracker>,
    pub meter: Arc<UsageMeter>,
    pub adapters: Arc<AdapterSet>,
    pub settings: SettingsHandle,
    pub tasks: TaskRunner,
    pub observability: Arc<Observability>,
}

/// Detached settlement; outlives the request that scheduled it.
#[derive(Clone)]
struct Settler {
    ledger: Arc<QuotaLedger>,
    tasks: TaskRunner,
    observability: Arc<Observability>,
}

impl Settler {
    fn finalize(&self, reservation: Reservation, settlement: Settlement) {
        let ledger = self.ledger.clone();
        let observability = self.observability.clone();
        self.tasks.spawn("finalize_quota", async move {
            let channel_id = settlement.channel_id;
            let receipt = ledger.finalize(reservation, settlement).await?;
            observability.record_settlement();
            debug!(channel_id = %channel_id, cost = receipt.cost, delta = receipt.delta, "request settled");
            Ok::<(), super::StoreError>(())
        });
    }

    fn refund(&self, reservation: Reservation) {
        let ledger = self.ledger.clone();
        let observability = self.observability.clone();
        self.tasks.spawn("refund_quota", async move {
            let refunded = ledger.refund(reservation).await?;
            if refunded != 0 {
                observability.record_refund();
                debug!(refunded, "reservation refunded");
            }
            Ok::<(), super::StoreError>(())
        });
    }
}

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    health: Arc<HealthTracker>,
    meter: Arc<UsageMeter>,
    adapters: Arc<AdapterSet>,
    settings: SettingsHandle,
    tasks: TaskRunner,
    observability: Arc<Observability>,
    settler: Settler,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

fn response_text(value: &Value) -> String {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return String::new();
    };
    choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
        })
        .collect::<Vec<_>>()
        .join("")
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        let DispatcherParts {
            registry,
            ledger,
            health,
            meter,
            adapters,
            settings,
            tasks,
            observability,
        } = parts;
        let settler = Settler {
            ledger,
            tasks: tasks.clone(),
            observability: observability.clone(),
        };
        Self {
            registry,
            health,
            meter,
            adapters,
            settings,
            tasks,
            observability,
            settler,
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchSuccess, PublicError> {
        let DispatchRequest {
            request_id,
            tenant,
            pinned_channel,
            body,
        } = request;
        let span = info_span!(
            "relay",
            request_id = %request_id,
            tenant_id = %tenant.tenant_id,
            model = %body.model,
            channel_id = field::Empty,
        );
        self.observability.record_request();

        let mut ctx = RequestContext::new(request_id, tenant, pinned_channel);
        let outcome = self.run(&mut ctx, body).instrument(span.clone()).await;
        let _entered = span.enter();
        match outcome {
            Ok(success) => {
                self.observability.record_success();
                Ok(success)
            }
            Err(err) => {
                self.observability.record_failure();
                Err(self.public_error(&ctx, err))
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        body: ChatRequest,
    ) -> Result<DispatchSuccess, GatewayError> {
        body.validate()?;
        let route = route_model(&body.model)?;
        ctx.requested_model = route.requested;
        ctx.selection_model = route.selection;
        let settings = self.settings.current();

        let first = match ctx.pinned_channel {
            Some(id) => self.registry.select_specific(id).await?,
            None => {
                let query = SelectionQuery {
                    group: &ctx.tenant.group,
                    model: &ctx.selection_model,
                    exclude: &[],
                    first_attempt: true,
                };
                self.registry.select_channel(&query).await?
            }
        };

        let vision = body.has_images() && is_vision_model(&ctx.requested_model);
        let prompt = self
            .meter
            .count_usage(&body.messages, &ctx.requested_model, vision)
            .await?;
        let pricing = Pricing::resolve(&settings, &ctx.requested_model, ctx.group());
        let estimate = self.meter.estimate_max_usage(prompt, body.max_tokens);
        let reservation = match self
            .settler
            .ledger
            .pre_consume(&ctx.tenant, pricing.reserve_quota(estimate))
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => {
                if matches!(err, GatewayError::QuotaExceeded { .. }) {
                    self.observability.record_quota_rejected();
                }
                return Err(err);
            }
        };

        match self.attempt(ctx, &body, first, &settings).await {
            Ok((channel, response)) => {
                Ok(self.settle(ctx, channel, response, reservation, pricing, prompt))
            }
            Err(err) => {
                self.settler.refund(reservation);
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &mut RequestContext,
        body: &ChatRequest,
        first: Arc<Channel>,
        settings: &GatewaySettings,
    ) -> Result<(Arc<Channel>, AdapterResponse), GatewayError> {
        let mut budget = RetryBudget::new(settings.retry_times);
        let mut channel = first;
        loop {
            ctx.bind_channel(channel.clone());
            tracing::Span::current().record("channel_id", field::display(channel.id));

            let err = match self.invoke(&channel, ctx, body, settings).await {
                Ok(response) => {
                    self.health.record_outcome(channel.id, true);
                    return Ok((channel, response));
                }
                Err(err) => err,
            };

            self.observability.record_upstream_failure();
            warn!(
                channel_id = %channel.id,
                status = err.status,
                kind = ?err.kind,
                error = %err.body.message,
                "upstream attempt failed"
            );
            ctx.record_failure(channel.id, err.status, &err.body.message);
            self.tasks.spawn(
                "report_channel_failure",
                self.health.clone().report_failure(channel.clone(), err.clone()),
            );

            if !should_retry(err.status, ctx.is_pinned()) {
                debug!(status = err.status, pinned = ctx.is_pinned(), "failure is not retryable");
                return Err(err.into());
            }
            if !budget.take() {
                return Err(err.into());
            }

            let query = SelectionQuery {
                group: &ctx.tenant.group,
                model: &ctx.selection_model,
                exclude: &ctx.excluded,
                first_attempt: false,
            };
            match self.registry.select_channel(&query).await {
                Ok(next) => {
                    self.observability.record_retry();
                    info!(
                        from = %channel.id,
                        to = %next.id,
                        remaining = budget.remaining(),
                        "retrying on another channel"
                    );
                    channel = next;
                }
                Err(select_err) => {
                    warn!(error = %select_err, "no channel left to retry on");
                    return Err(err.into());
                }
            }
        }
    }

    async fn invoke(
        &self,
        channel: &Arc<Channel>,
        ctx: &RequestContext,
        body: &ChatRequest,
        settings: &GatewaySettings,
    ) -> Result<AdapterResponse, UpstreamError> {
        let Some(adapter) = self.adapters.for_channel(channel) else {
            return Err(UpstreamError::unsupported(format!(
                "no adapter registered for provider {:?}",
                channel.kind
            )));
        };
        let capabilities = adapter.capabilities();
        if body.stream && !capabilities.streaming {
            return Err(UpstreamError::unsupported("channel does not support streaming"));
        }
        if body.has_images() && !capabilities.vision {
            return Err(UpstreamError::unsupported("channel does not support image input"));
        }

        let request = RelayRequest {
            request_id: ctx.request_id.clone(),
            body: body.for_model(&ctx.upstream_model),
            profile: channel.profile(),
        };
        let call = adapter.invoke(channel, &request);
        match settings.relay_timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                UpstreamError::transport(504, "upstream_timeout", "upstream request timed out")
            })?,
            None => call.await,
        }
    }

    fn settle(
        &self,
        ctx: &RequestContext,
        channel: Arc<Channel>,
        response: AdapterResponse,
        reservation: Reservation,
        pricing: Pricing,
        prompt: u32,
    ) -> DispatchSuccess {
        let model = ctx.requested_model.clone();
        let token_name = ctx.tenant.token_name.clone();
        let channel_id = channel.id;

        let body = match response.body {
            ResponseBody::Json(value) => {
                let usage = response
                    .usage
                    .or_else(|| Usage::from_value(&value))
                    .unwrap_or_else(|| Usage {
                        prompt_tokens: prompt,
                        completion_tokens: self.meter.count_text(&response_text(&value), &model),
                    });
                self.settler.finalize(
                    reservation,
                    Settlement {
                        channel_id,
                        model,
                        token_name,
                        usage,
                        pricing,
                    },
                );
                RelayBody::Json(value)
            }
            ResponseBody::Stream(upstream) => {
                let settler = self.settler.clone();
                let meter = self.meter.clone();
                let finisher: StreamFinisher = Box::new(move |summary: StreamSummary| {
                    debug!(end = ?summary.end, bytes = summary.bytes_sent, "stream finished");
                    let usage = summary.observed_usage.unwrap_or_else(|| Usage {
                        prompt_tokens: prompt,
                        completion_tokens: meter.count_text(&summary.completion_text, &model),
                    });
                    settler.finalize(
                        reservation,
                        Settlement {
                            channel_id,
                            model,
                            token_name,
                            usage,
                            pricing,
                        },
                    );
                });
                RelayBody::Stream(metered_stream(upstream, finisher))
            }
        };
        DispatchSuccess { channel_id, body }
    }

    fn public_error(&self, ctx: &RequestContext, err: GatewayError) -> PublicError {
        match &err {
            GatewayError::Internal { code, message } => {
                error!(code, error = %message, "request failed internally");
            }
            GatewayError::Upstream(_) => {
                warn!(attempts = ctx.attempts.len(), error = %err, "relay failed");
            }
            _ => info!(error = %err, "request rejected"),
        }

        let status = err.status();
        let mut body = err.public_body();
        if let GatewayError::Upstream(upstream) = &err {
            if upstream.status == 429 {
                body.message = OVERLOADED_MESSAGE.to_string();
            }
        }
        if let Some(channel) = ctx.channel.as_ref() {
            body = UpstreamScrubber::new(channel.id, channel.base_url()).scrub_body(&body);
        }
        body.message = message_with_request_id(&body.message, &ctx.request_id);
        PublicError {
            status,
            error: body,
        }
    }
}

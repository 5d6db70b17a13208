use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use relaygate::gateway::adapter::ResponseBody;
use relaygate::gateway::scrub::OVERLOADED_MESSAGE;
use relaygate::gateway::{
    AdapterResponse, AdapterSet, Channel, ChannelAdapter, ChannelId, ChannelStatus, DispatchRequest,
    Gateway, GatewayParts, GatewaySettings, MemoryBalanceCache, MemoryStore, ProviderKind,
    QuotaStore, RelayBody, RelayRequest, SettingsHandle, TenantContext, TenantId, TenantSeed,
    TokenId, TokenSeed, UpstreamError, Usage,
};
use serde_json::{Value, json};

const MODEL: &str = "test-model";
const BALANCE: i64 = 10_000;

#[derive(Clone)]
enum Reply {
    Json(Value),
    Fail(u16, Value),
    Stream(Vec<&'static str>),
}

#[derive(Default)]
struct ScriptedAdapter {
    replies: Mutex<HashMap<ChannelId, Reply>>,
    calls: Mutex<Vec<(ChannelId, String)>>,
}

impl ScriptedAdapter {
    fn reply(&self, id: i64, reply: Reply) {
        self.replies.lock().unwrap().insert(ChannelId(id), reply);
    }

    fn calls(&self) -> Vec<(ChannelId, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        channel: &Channel,
        request: &RelayRequest,
    ) -> Result<AdapterResponse, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((channel.id, request.body.model.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&channel.id)
            .cloned()
            .unwrap_or(Reply::Fail(500, json!({})));
        match reply {
            Reply::Json(value) => Ok(AdapterResponse {
                status: 200,
                usage: Usage::from_value(&value),
                body: ResponseBody::Json(value),
            }),
            Reply::Fail(status, body) => Err(UpstreamError::from_response(
                status,
                body.to_string().as_bytes(),
            )),
            Reply::Stream(parts) => {
                let chunks: Vec<Result<Bytes, UpstreamError>> = parts
                    .into_iter()
                    .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                    .collect();
                Ok(AdapterResponse {
                    status: 200,
                    usage: None,
                    body: ResponseBody::Stream(futures_util::stream::iter(chunks).boxed()),
                })
            }
        }
    }
}

struct Harness {
    gateway: Gateway,
    store: Arc<MemoryStore>,
    adapter: Arc<ScriptedAdapter>,
}

fn channel(id: i64) -> Channel {
    Channel {
        id: ChannelId(id),
        name: format!("upstream-{id}"),
        kind: ProviderKind::Custom,
        base_url: Some(format!("https://upstream-{id}.example.com")),
        credential: format!("sk-upstream-{id}"),
        status: ChannelStatus::Enabled,
        models: vec![MODEL.to_string()],
        model_mapping: BTreeMap::new(),
        groups: BTreeMap::from([("default".to_string(), 1)]),
        priority: 0,
        other: None,
        config: BTreeMap::new(),
    }
}

fn settings() -> GatewaySettings {
    let mut settings = GatewaySettings::default();
    settings.model_ratio.insert(MODEL.to_string(), 1.0);
    settings
}

fn harness_with(channels: Vec<Channel>, balance: i64, settings: GatewaySettings) -> Harness {
    let store = Arc::new(MemoryStore::from_seed(
        channels,
        vec![TenantSeed {
            id: TenantId(1),
            group: "default".to_string(),
            balance,
            used_quota: 0,
            can_pin_channel: true,
        }],
        vec![TokenSeed {
            id: TokenId(11),
            tenant_id: TenantId(1),
            key: "sk-tenant".to_string(),
            name: "ci".to_string(),
            remaining_quota: balance,
            unlimited: false,
            expires_at: None,
        }],
    ));
    let adapter = Arc::new(ScriptedAdapter::default());
    let gateway = Gateway::new(GatewayParts {
        channels: store.clone(),
        quota: store.clone(),
        balances: Arc::new(MemoryBalanceCache::new()),
        adapters: AdapterSet::new().with_fallback(adapter.clone()),
        settings: SettingsHandle::fixed(settings),
    })
    .unwrap();
    Harness {
        gateway,
        store,
        adapter,
    }
}

fn harness(channel_count: i64) -> Harness {
    harness_with((1..=channel_count).map(channel).collect(), BALANCE, settings())
}

fn tenant() -> TenantContext {
    TenantContext {
        tenant_id: TenantId(1),
        token_id: TokenId(11),
        token_name: "ci".to_string(),
        group: "default".to_string(),
        unlimited: false,
        can_pin_channel: true,
    }
}

fn request(stream: bool) -> DispatchRequest {
    DispatchRequest {
        request_id: "req-1".to_string(),
        tenant: tenant(),
        pinned_channel: None,
        body: serde_json::from_value(json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hello there"}],
            "max_tokens": 100,
            "stream": stream
        }))
        .unwrap(),
    }
}

fn completion(prompt: u32, completion: u32) -> Reply {
    Reply::Json(json!({
        "choices": [{"message": {"role": "assistant", "content": "hi"}}],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion}
    }))
}

async fn balance(harness: &Harness) -> i64 {
    harness.store.tenant_balance(TenantId(1)).await.unwrap()
}

fn distinct(calls: &[(ChannelId, String)]) -> usize {
    calls.iter().map(|(id, _)| *id).collect::<BTreeSet<_>>().len()
}

#[tokio::test]
async fn success_settles_actual_cost() {
    let harness = harness(1);
    harness.adapter.reply(1, completion(10, 20));

    let success = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap();
    assert_eq!(success.channel_id, ChannelId(1));
    assert!(matches!(success.body, RelayBody::Json(_)));
    harness.gateway.tasks.wait_idle().await;

    assert_eq!(balance(&harness).await, BALANCE - 30);
    assert_eq!(harness.store.channel_used_quota(ChannelId(1)), 30);
    let audit = harness.store.audit_records();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].quota, 30);
    assert_eq!(audit[0].model, MODEL);

    let counters = harness.gateway.observability();
    assert_eq!(counters.succeeded, 1);
    assert_eq!(counters.settlements, 1);
}

#[tokio::test]
async fn upstream_model_mapping_is_applied() {
    let mut mapped = channel(1);
    mapped
        .model_mapping
        .insert(MODEL.to_string(), "vendor-model-v2".to_string());
    let harness = harness_with(vec![mapped], BALANCE, settings());
    harness.adapter.reply(1, completion(1, 1));

    harness.gateway.dispatcher.dispatch(request(false)).await.unwrap();
    harness.gateway.tasks.wait_idle().await;
    assert_eq!(harness.adapter.calls()[0].1, "vendor-model-v2");
    assert_eq!(harness.store.audit_records()[0].model, MODEL);
}

#[tokio::test]
async fn failover_never_reuses_a_channel_and_refunds() {
    let harness = harness(3);

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 500);
    harness.gateway.tasks.wait_idle().await;

    let calls = harness.adapter.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(distinct(&calls), 3);
    assert_eq!(balance(&harness).await, BALANCE);

    let counters = harness.gateway.observability();
    assert_eq!(counters.retries, 2);
    assert_eq!(counters.upstream_failures, 3);
    assert_eq!(counters.refunds, 1);
}

#[tokio::test]
async fn failover_reaches_a_healthy_channel() {
    let harness = harness(2);
    harness.adapter.reply(1, Reply::Fail(503, json!({})));
    harness.adapter.reply(2, Reply::Fail(503, json!({})));

    // Whichever channel is tried first, the second one answers.
    let first = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(first.status, 503);
    let tried_first = harness.adapter.calls()[0].0;
    let other = if tried_first == ChannelId(1) { 2 } else { 1 };
    harness.adapter.reply(other, completion(2, 3));

    let success = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap();
    harness.gateway.tasks.wait_idle().await;
    assert_eq!(success.channel_id, ChannelId(other));
    assert_eq!(balance(&harness).await, BALANCE - 5);
}

#[tokio::test]
async fn retry_budget_bounds_attempts() {
    let mut settings = settings();
    settings.retry_times = 1;
    let harness = harness_with((1..=4).map(channel).collect(), BALANCE, settings);

    harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    harness.gateway.tasks.wait_idle().await;
    let calls = harness.adapter.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(distinct(&calls), 2);
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let harness = harness(3);
    for id in 1..=3 {
        harness.adapter.reply(
            id,
            Reply::Fail(
                400,
                json!({"error": {"message": "bad field", "type": "invalid_request_error", "code": "bad"}}),
            ),
        );
    }

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.error.code, "bad");
    assert_eq!(err.error.message, "bad field (request id: req-1)");
    assert_eq!(harness.adapter.calls().len(), 1);
    harness.gateway.tasks.wait_idle().await;
}

#[tokio::test]
async fn pinned_channel_is_never_retried() {
    let harness = harness(3);
    let mut pinned = request(false);
    pinned.pinned_channel = Some(ChannelId(2));

    let err = harness.gateway.dispatcher.dispatch(pinned).await.unwrap_err();
    assert_eq!(err.status, 500);
    assert_eq!(harness.adapter.calls(), vec![(ChannelId(2), MODEL.to_string())]);
    harness.gateway.tasks.wait_idle().await;
}

#[tokio::test]
async fn pinning_an_unknown_channel_is_rejected() {
    let harness = harness(1);
    let mut pinned = request(false);
    pinned.pinned_channel = Some(ChannelId(99));

    let err = harness.gateway.dispatcher.dispatch(pinned).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert!(err.error.message.starts_with("Invalid server node ID"));
    assert!(harness.adapter.calls().is_empty());
}

#[tokio::test]
async fn rate_limited_upstream_reports_overload() {
    let harness = harness(1);
    harness.adapter.reply(
        1,
        Reply::Fail(429, json!({"error": {"message": "slow down", "type": "rate_limit"}})),
    );

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 429);
    assert_eq!(
        err.error.message,
        format!("{OVERLOADED_MESSAGE} (request id: req-1)")
    );
    harness.gateway.tasks.wait_idle().await;
}

#[tokio::test]
async fn unauthorized_upstream_auto_disables_the_channel() {
    let harness = harness(1);
    harness.adapter.reply(
        1,
        Reply::Fail(401, json!({"error": {"message": "bad key", "type": "auth"}})),
    );

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 401);
    harness.gateway.tasks.wait_idle().await;
    assert_eq!(
        harness.store.channel_status(ChannelId(1)),
        Some(ChannelStatus::AutoDisabled)
    );
    assert_eq!(harness.gateway.observability().channels_disabled, 1);

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 503);
    assert!(err.error.message.contains("No available service nodes"));
    assert_eq!(harness.adapter.calls().len(), 1);
}

#[tokio::test]
async fn plain_server_errors_keep_the_channel_enabled() {
    let harness = harness(1);
    harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    harness.gateway.tasks.wait_idle().await;
    assert_eq!(
        harness.store.channel_status(ChannelId(1)),
        Some(ChannelStatus::Enabled)
    );
}

#[tokio::test]
async fn upstream_identity_is_scrubbed() {
    let harness = harness(1);
    harness.adapter.reply(
        1,
        Reply::Fail(
            400,
            json!({"error": {
                "message": "upstream-1.example.com rejected the call (request id: abc123)",
                "type": "one_api_error",
                "code": "rejected"
            }}),
        ),
    );

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert!(!err.error.message.contains("upstream-1.example.com"));
    assert!(!err.error.message.contains("abc123"));
    assert!(err.error.message.ends_with("(request id: req-1)"));
    assert!(!err.error.kind.contains("one_api"));
    harness.gateway.tasks.wait_idle().await;
}

#[tokio::test]
async fn insufficient_balance_is_rejected_before_any_upstream_call() {
    let harness = harness_with(vec![channel(1)], 10, settings());
    harness.adapter.reply(1, completion(1, 1));

    let err = harness.gateway.dispatcher.dispatch(request(false)).await.unwrap_err();
    assert_eq!(err.status, 403);
    assert_eq!(err.error.code, "insufficient_user_quota");
    assert!(harness.adapter.calls().is_empty());
    assert_eq!(harness.gateway.observability().quota_rejected, 1);
    assert_eq!(balance(&harness).await, 10);
}

#[tokio::test]
async fn unknown_model_has_no_channel() {
    let harness = harness(1);
    let mut unknown = request(false);
    unknown.body.model = "other-model".to_string();

    let err = harness.gateway.dispatcher.dispatch(unknown).await.unwrap_err();
    assert_eq!(err.status, 503);
    assert!(err.error.message.contains("other-model"));
}

#[tokio::test]
async fn stream_dropped_early_still_settles_once() {
    let harness = harness(1);
    harness.adapter.reply(
        1,
        Reply::Stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":5}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]),
    );

    let success = harness.gateway.dispatcher.dispatch(request(true)).await.unwrap();
    let RelayBody::Stream(mut stream) = success.body else {
        panic!("expected a stream");
    };
    stream.next().await.unwrap().unwrap();
    drop(stream);

    harness.gateway.tasks.wait_idle().await;
    assert_eq!(balance(&harness).await, BALANCE - 10);
    assert_eq!(harness.store.audit_records().len(), 1);
    assert_eq!(harness.gateway.observability().settlements, 1);
}

#[tokio::test]
async fn completed_stream_without_usage_counts_reply_text() {
    let harness = harness(1);
    harness.adapter.reply(
        1,
        Reply::Stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hello world\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]),
    );

    let success = harness.gateway.dispatcher.dispatch(request(true)).await.unwrap();
    let RelayBody::Stream(mut stream) = success.body else {
        panic!("expected a stream");
    };
    while let Some(chunk) = stream.next().await {
        chunk.unwrap();
    }
    drop(stream);

    harness.gateway.tasks.wait_idle().await;
    let audit = harness.store.audit_records();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].completion_tokens > 0);
    assert!(audit[0].prompt_tokens > 0);
    assert!(balance(&harness).await < BALANCE);
}

#[tokio::test]
async fn validation_errors_are_reported_without_selection() {
    let harness = harness(1);
    let mut empty = request(false);
    empty.body.messages.clear();

    let err = harness.gateway.dispatcher.dispatch(empty).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(err.error.code, "missing_messages");
    assert!(harness.adapter.calls().is_empty());
}

#[tokio::test]
async fn custom_gpt_models_route_through_the_gizmo_bucket() {
    let mut gizmo = channel(1);
    gizmo.models = vec!["gpt-4-gizmo-*".to_string()];
    let harness = harness_with(vec![gizmo], BALANCE, GatewaySettings::default());
    harness.adapter.reply(1, completion(10, 20));

    for vague in ["gpt-4-gizmo-g", "gpt-4-gizmo-*"] {
        let mut rejected = request(false);
        rejected.body.model = vague.to_string();
        let err = harness.gateway.dispatcher.dispatch(rejected).await.unwrap_err();
        assert_eq!(err.status, 503, "{vague}");
        assert_eq!(err.error.code, "model_not_specific");
        assert!(err.error.message.contains("gpt-4-gizmo-g-xxxxxxxxx"));
    }
    harness.gateway.tasks.wait_idle().await;
    assert!(harness.adapter.calls().is_empty());
    assert_eq!(balance(&harness).await, BALANCE);

    let mut specific = request(false);
    specific.body.model = "gpt-4-gizmo-g-abc123xyz1".to_string();
    let success = harness.gateway.dispatcher.dispatch(specific).await.unwrap();
    assert_eq!(success.channel_id, ChannelId(1));
    harness.gateway.tasks.wait_idle().await;

    let calls = harness.adapter.calls();
    assert_eq!(calls, vec![(ChannelId(1), "gpt-4-gizmo-g-abc123xyz1".to_string())]);
    // Bucket ratio 15, gpt-4 completion ratio 2: (10 + 20 * 2) * 15.
    assert_eq!(balance(&harness).await, BALANCE - 750);
    assert_eq!(harness.store.audit_records()[0].quota, 750);
}

//! Adapter for OpenAI-compatible chat endpoints (OpenAI, Azure OpenAI, OpenRouter, proxies).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use tracing::debug;

use super::adapter::{AdapterCapabilities, AdapterResponse, ChannelAdapter, RelayRequest, ResponseBody};
use super::channel::{Channel, ProviderProfile};
use super::metering::Usage;
use super::{GatewayError, UpstreamError};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";
const OPENROUTER_REFERER: &str = "https://github.com/relaygate/relaygate";
const OPENROUTER_TITLE: &str = "relaygate";

#[derive(Clone, Debug)]
pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new() -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GatewayError::internal("http_client", err))?;
        Ok(Self { client })
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);

    // A base URL that already carries /v1 still accepts /v1 paths.
    if base.ends_with("/v1") {
        if let Some(rest) = path.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path}")
}

/// Azure deployment names drop dots and dated snapshot suffixes.
fn azure_deployment(model: &str) -> String {
    let name = model.replace('.', "");
    ["-0301", "-0314", "-0613"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix).map(str::to_string))
        .unwrap_or(name)
}

pub fn request_url(base_url: &str, profile: &ProviderProfile, model: &str) -> String {
    let cloudflare = base_url.starts_with(CLOUDFLARE_GATEWAY_PREFIX);
    match profile {
        ProviderProfile::Azure { api_version } => {
            let version = api_version.as_deref().unwrap_or(DEFAULT_AZURE_API_VERSION);
            let deployment = azure_deployment(model);
            let path = if cloudflare {
                format!("/{deployment}/chat/completions")
            } else {
                format!("/openai/deployments/{deployment}/chat/completions")
            };
            format!("{}?api-version={version}", join_base_url(base_url, &path))
        }
        _ if cloudflare => join_base_url(base_url, "/chat/completions"),
        _ => join_base_url(base_url, CHAT_COMPLETIONS_PATH),
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::transport(504, "upstream_timeout", format!("upstream request timed out: {err}"));
    }
    UpstreamError::transport(500, "do_request_failed", format!("upstream request failed: {err}"))
}

#[async_trait]
impl ChannelAdapter for OpenAiCompatibleAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            vision: true,
        }
    }

    async fn invoke(
        &self,
        channel: &Channel,
        request: &RelayRequest,
    ) -> Result<AdapterResponse, UpstreamError> {
        let url = request_url(channel.base_url(), &request.profile, &request.body.model);
        debug!(channel_id = %channel.id, url = %url, "invoking upstream");

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body);
        builder = match &request.profile {
            ProviderProfile::Azure { .. } => builder.header("api-key", channel.credential.as_str()),
            _ => builder.header(AUTHORIZATION, format!("Bearer {}", channel.credential)),
        };
        match &request.profile {
            ProviderProfile::OpenRouter => {
                builder = builder
                    .header("HTTP-Referer", OPENROUTER_REFERER)
                    .header("X-Title", OPENROUTER_TITLE);
            }
            ProviderProfile::Ali {
                plugin: Some(plugin),
            } => {
                builder = builder.header("X-DashScope-Plugin", plugin.as_str());
            }
            _ => {}
        }
        if request.body.stream {
            builder = builder.header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        if status != 200 {
            let bytes = response.bytes().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, &bytes));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if request.body.stream || is_event_stream {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(transport_error))
                .boxed();
            return Ok(AdapterResponse {
                status,
                body: ResponseBody::Stream(stream),
                usage: None,
            });
        }

        let value: Value = response.json().await.map_err(|err| {
            UpstreamError::transport(500, "unmarshal_response_body_failed", err.to_string())
        })?;
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            let body = serde_json::from_value(error.clone()).unwrap_or_default();
            return Err(UpstreamError::status(status, body));
        }
        let usage = Usage::from_value(&value);
        Ok(AdapterResponse {
            status,
            body: ResponseBody::Json(value),
            usage,
        })
    }
}

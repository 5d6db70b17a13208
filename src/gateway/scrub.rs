//! Hides upstream identity in errors shown to tenants.

use std::sync::OnceLock;

use base64::Engine as _;
use regex::{NoExpand, Regex};

use super::ErrorBody;
use super::channel::ChannelId;

pub const OVERLOADED_MESSAGE: &str = "The current service node is overloaded. Please try again later.";

const RELAY_PRODUCT_NAMES: &[&str] = &[
    "one-api", "one_api", "ONE_API", "ONE-API", "shell-api", "shell_api", "SHELL_API", "SHELL-API",
    "new_api", "new-api", "NEW_API", "NEW-API",
];

/// Applied in this order; later rules see the output of earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    /// Relay product names and the channel host become an opaque channel token.
    MaskUpstreamNames,
    /// Upstream "model unavailable under group" text becomes a neutral message.
    RewriteGroupModelUnavailable,
    /// Upstream request-id annotations are stripped.
    StripRequestId,
}

const RULES: [Rule; 3] = [
    Rule::MaskUpstreamNames,
    Rule::RewriteGroupModelUnavailable,
    Rule::StripRequestId,
];

fn host_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"//([\w.-]+)").expect("host regex is valid"))
}

fn group_model_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"当前分组 (.*?) 下对于模型 (.*?) ").expect("group/model regex is valid")
    })
}

fn request_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"( )?\(request id: [^)]+\)").expect("request id regex is valid")
    })
}

#[derive(Clone, Debug)]
pub struct UpstreamScrubber {
    token: String,
    host: Option<String>,
}

impl UpstreamScrubber {
    pub fn new(channel_id: ChannelId, base_url: &str) -> Self {
        let encoded =
            base64::engine::general_purpose::URL_SAFE.encode(channel_id.0.to_string().as_bytes());
        let host = host_regex()
            .captures(base_url)
            .and_then(|caps| caps.get(1))
            .map(|host| host.as_str().to_string())
            .filter(|host| !host.is_empty());
        Self {
            token: format!("[{encoded}] upstream"),
            host,
        }
    }

    /// The opaque stand-in for this channel.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scrub(&self, text: &str) -> String {
        RULES
            .iter()
            .fold(text.to_string(), |text, rule| self.apply(*rule, text))
    }

    fn apply(&self, rule: Rule, text: String) -> String {
        match rule {
            Rule::MaskUpstreamNames => {
                let mut out = text;
                for name in RELAY_PRODUCT_NAMES {
                    if out.contains(name) {
                        out = out.replace(name, &self.token);
                    }
                }
                if let Some(host) = self.host.as_deref() {
                    out = out.replace(host, &self.token);
                }
                out
            }
            Rule::RewriteGroupModelUnavailable => {
                let Some(caps) = group_model_regex().captures(&text) else {
                    return text;
                };
                let model = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                format!(
                    "The model '{model}' under the current service node is unavailable; please switch to a different model"
                )
            }
            Rule::StripRequestId => request_id_regex()
                .replace_all(&text, NoExpand(""))
                .into_owned(),
        }
    }

    /// Scrubs `message` and `param`; `type` is replaced outright when it names the upstream.
    pub fn scrub_body(&self, body: &ErrorBody) -> ErrorBody {
        let kind = if self.scrub(&body.kind) != body.kind {
            self.token.clone()
        } else {
            body.kind.clone()
        };
        ErrorBody {
            message: self.scrub(&body.message),
            kind,
            param: self.scrub(&body.param),
            code: body.code.clone(),
        }
    }
}

pub fn message_with_request_id(message: &str, request_id: &str) -> String {
    format!("{message} (request id: {request_id})")
}

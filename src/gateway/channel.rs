use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    /// Turned off by an operator.
    Disabled,
    /// Turned off by the health tracker; only an operator brings it back.
    AutoDisabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Azure,
    OpenRouter,
    Anthropic,
    Gemini,
    Xunfei,
    Ali,
    AiProxyLibrary,
    Zhipu,
    Baidu,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Ali => "https://dashscope.aliyuncs.com",
            Self::AiProxyLibrary => "https://api.aiproxy.io",
            Self::Zhipu => "https://open.bigmodel.cn",
            Self::Baidu => "https://aip.baidubce.com",
            Self::Azure | Self::Xunfei | Self::Custom => "",
        }
    }
}

/// Provider quirks resolved from a channel's legacy fields. Only adapters look at this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderProfile {
    Standard,
    Azure { api_version: Option<String> },
    Gemini { api_version: Option<String> },
    Xunfei { api_version: Option<String> },
    AiProxyLibrary { library_id: Option<String> },
    Ali { plugin: Option<String> },
    OpenRouter,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(rename = "key", default)]
    pub credential: String,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    /// Group name to selection weight. Membership is entitlement.
    #[serde(default)]
    pub groups: BTreeMap<String, u32>,
    #[serde(default)]
    pub priority: i64,
    /// Legacy per-provider field (api version, library id, plugin).
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("credential", &"<redacted>")
            .field("status", &self.status)
            .field("models", &self.models)
            .field("groups", &self.groups)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// `pattern` matches `model` exactly, or as a prefix when it ends in `*`.
pub fn model_pattern_matches(pattern: &str, model: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => model.starts_with(prefix),
        None => pattern == model,
    }
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models
            .iter()
            .any(|pattern| model_pattern_matches(pattern, model))
    }

    pub fn group_weight(&self, group: &str) -> u32 {
        self.groups.get(group).copied().unwrap_or(0)
    }

    /// Effective base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        let raw = self
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_base_url());
        raw.trim_end_matches('/')
    }

    pub fn upstream_model(&self, logical: &str) -> String {
        self.model_mapping
            .get(logical)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    fn legacy_field(&self, config_key: &str) -> Option<String> {
        self.config
            .get(config_key)
            .or(self.other.as_ref())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn profile(&self) -> ProviderProfile {
        match self.kind {
            ProviderKind::Azure => ProviderProfile::Azure {
                api_version: self.legacy_field("api_version"),
            },
            ProviderKind::Gemini => ProviderProfile::Gemini {
                api_version: self.legacy_field("api_version"),
            },
            ProviderKind::Xunfei => ProviderProfile::Xunfei {
                api_version: self.legacy_field("api_version"),
            },
            ProviderKind::AiProxyLibrary => ProviderProfile::AiProxyLibrary {
                library_id: self.legacy_field("library_id"),
            },
            ProviderKind::Ali => ProviderProfile::Ali {
                plugin: self.legacy_field("plugin"),
            },
            ProviderKind::OpenRouter => ProviderProfile::OpenRouter,
            _ => ProviderProfile::Standard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(kind: ProviderKind) -> Channel {
        Channel {
            id: ChannelId(7),
            name: "primary".to_string(),
            kind,
            base_url: None,
            credential: "sk-live-secret".to_string(),
            status: ChannelStatus::Enabled,
            models: vec!["gpt-4".to_string(), "gpt-4-gizmo-*".to_string()],
            model_mapping: BTreeMap::from([("gpt-4".to_string(), "gpt-4-0613".to_string())]),
            groups: BTreeMap::from([("default".to_string(), 10), ("vip".to_string(), 0)]),
            priority: 0,
            other: None,
            config: BTreeMap::new(),
        }
    }

    #[test]
    fn wildcard_and_exact_models() {
        let channel = channel(ProviderKind::OpenAi);
        assert!(channel.supports_model("gpt-4"));
        assert!(!channel.supports_model("gpt-4-32k"));
        assert!(channel.supports_model("gpt-4-gizmo-*"));
        assert!(channel.supports_model("gpt-4-gizmo-g-abc123xyz1"));
    }

    #[test]
    fn remapping_falls_back_to_logical_name() {
        let channel = channel(ProviderKind::OpenAi);
        assert_eq!(channel.upstream_model("gpt-4"), "gpt-4-0613");
        assert_eq!(channel.upstream_model("gpt-4-gizmo-g-abc123xyz1"), "gpt-4-gizmo-g-abc123xyz1");
    }

    #[test]
    fn base_url_defaults_by_provider() {
        let mut channel = channel(ProviderKind::OpenAi);
        assert_eq!(channel.base_url(), "https://api.openai.com");
        channel.base_url = Some("https://proxy.internal/".to_string());
        assert_eq!(channel.base_url(), "https://proxy.internal");
    }

    #[test]
    fn profile_reads_config_before_legacy_field() {
        let mut channel = channel(ProviderKind::Azure);
        channel.other = Some("2023-05-15".to_string());
        assert_eq!(
            channel.profile(),
            ProviderProfile::Azure {
                api_version: Some("2023-05-15".to_string())
            }
        );
        channel
            .config
            .insert("api_version".to_string(), "2024-02-01".to_string());
        assert_eq!(
            channel.profile(),
            ProviderProfile::Azure {
                api_version: Some("2024-02-01".to_string())
            }
        );
        assert_eq!(channel.group_weight("vip"), 0);
        assert_eq!(channel.group_weight("missing"), 0);
    }

    #[test]
    fn debug_redacts_credential() {
        let rendered = format!("{:?}", channel(ProviderKind::OpenAi));
        assert!(!rendered.contains("sk-live-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

//! Prompt and completion metering in tokenizer units.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, tokenizer};

use super::request::ChatMessage;
use super::settings::SettingsHandle;
use super::vision::{ImageDetail, ImageInspector, image_token_cost};

const APPROXIMATE_TOKENS_PER_BYTE: f64 = 0.38;

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("malformed message content: {0}")]
    MalformedContent(String),
    #[error("invalid image url: {0}")]
    InvalidImageUrl(String),
    #[error("failed to fetch image: {0}")]
    ImageFetch(String),
    #[error("failed to decode image: {0}")]
    ImageDecode(String),
    #[error("invalid base64 image data: {0}")]
    InvalidBase64(String),
}

impl MeteringError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedContent(_) => "malformed_content",
            Self::InvalidImageUrl(_) => "invalid_image_url",
            Self::ImageFetch(_) => "image_fetch_failed",
            Self::ImageDecode(_) => "image_decode_failed",
            Self::InvalidBase64(_) => "invalid_image_base64",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Reads an OpenAI `usage` object; `None` when absent or all zero.
    pub fn from_value(value: &Value) -> Option<Self> {
        let usage = value.get("usage")?;
        let read = |field: &str| {
            usage
                .get(field)
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(0)
        };
        let usage = Self {
            prompt_tokens: read("prompt_tokens"),
            completion_tokens: read("completion_tokens"),
        };
        (usage.total() > 0).then_some(usage)
    }
}

enum Part<'a> {
    Text(&'a str),
    Image { url: &'a str, detail: ImageDetail },
    Ignored,
}

fn message_parts(content: &Value) -> Result<Vec<Part<'_>>, MeteringError> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(vec![Part::Text(text)]),
        Value::Array(parts) => parts.iter().map(content_part).collect(),
        other => Err(MeteringError::MalformedContent(format!(
            "content must be a string or an array, got {}",
            json_kind(other)
        ))),
    }
}

fn content_part(part: &Value) -> Result<Part<'_>, MeteringError> {
    if let Value::String(text) = part {
        return Ok(Part::Text(text));
    }
    let Some(obj) = part.as_object() else {
        return Err(MeteringError::MalformedContent(format!(
            "content part must be an object, got {}",
            json_kind(part)
        )));
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("text") => obj
            .get("text")
            .and_then(Value::as_str)
            .map(Part::Text)
            .ok_or_else(|| MeteringError::MalformedContent("text part without text".to_string())),
        Some("image_url") => {
            let image = obj.get("image_url").ok_or_else(|| {
                MeteringError::MalformedContent("image_url part without image_url".to_string())
            })?;
            let (url, detail) = match image {
                Value::String(url) => (url.as_str(), None),
                Value::Object(image) => (
                    image.get("url").and_then(Value::as_str).unwrap_or_default(),
                    image.get("detail").and_then(Value::as_str),
                ),
                other => {
                    return Err(MeteringError::MalformedContent(format!(
                        "image_url must be a string or an object, got {}",
                        json_kind(other)
                    )));
                }
            };
            if url.is_empty() {
                return Err(MeteringError::InvalidImageUrl("empty image url".to_string()));
            }
            Ok(Part::Image {
                url,
                detail: ImageDetail::parse(detail),
            })
        }
        Some(_) => Ok(Part::Ignored),
        None => Err(MeteringError::MalformedContent(
            "content part without type".to_string(),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
    }
}

/// Per-message and per-name framing overhead.
fn message_framing(model: &str) -> (i64, i64) {
    if model == "gpt-3.5-turbo-0301" {
        (4, -1)
    } else {
        (3, 1)
    }
}

fn clamp_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

pub struct UsageMeter {
    settings: SettingsHandle,
    images: ImageInspector,
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMeter").finish_non_exhaustive()
    }
}

impl UsageMeter {
    pub fn new(settings: SettingsHandle) -> Result<Self, MeteringError> {
        Ok(Self {
            settings,
            images: ImageInspector::new()?,
        })
    }

    pub fn count_text(&self, text: &str, model: &str) -> u32 {
        clamp_to_u32(self.text_units(text, model))
    }

    fn text_units(&self, text: &str, model: &str) -> i64 {
        if self.settings.current().approximate_tokens {
            return (text.len() as f64 * APPROXIMATE_TOKENS_PER_BYTE) as i64;
        }
        clamp_to_i64(bpe_for_model(model).encode_with_special_tokens(text).len())
    }

    /// Counts embedding/moderation style input: a string or an array of strings.
    pub fn count_input(&self, input: &Value, model: &str) -> Result<u32, MeteringError> {
        match input {
            Value::String(text) => Ok(self.count_text(text, model)),
            Value::Array(items) => {
                let mut total: i64 = 0;
                for item in items {
                    let text = item.as_str().ok_or_else(|| {
                        MeteringError::MalformedContent(format!(
                            "input items must be strings, got {}",
                            json_kind(item)
                        ))
                    })?;
                    total = total.saturating_add(self.text_units(text, model));
                }
                Ok(clamp_to_u32(total))
            }
            other => Err(MeteringError::MalformedContent(format!(
                "input must be a string or an array, got {}",
                json_kind(other)
            ))),
        }
    }

    /// Prompt units for a conversation. Image parts are billed only when `vision` is set.
    pub async fn count_usage(
        &self,
        messages: &[ChatMessage],
        model: &str,
        vision: bool,
    ) -> Result<u32, MeteringError> {
        let (per_message, per_name) = message_framing(model);
        let timeout = self.settings.current().image_fetch_timeout();

        let mut total: i64 = 0;
        for message in messages {
            total = total.saturating_add(per_message);
            total = total.saturating_add(self.text_units(&message.role, model));
            for part in message_parts(&message.content)? {
                let units = match part {
                    Part::Text(text) => self.text_units(text, model),
                    Part::Image { url, detail } if vision => {
                        let cost = if detail == ImageDetail::Low {
                            image_token_cost(0, 0, detail)
                        } else {
                            let (width, height) = self.images.dimensions(url, timeout).await?;
                            image_token_cost(width, height, detail)
                        };
                        i64::from(cost)
                    }
                    Part::Image { .. } | Part::Ignored => 0,
                };
                total = total.saturating_add(units);
            }
            if let Some(name) = message.name.as_deref() {
                total = total.saturating_add(per_name);
                total = total.saturating_add(self.text_units(name, model));
            }
        }
        total = total.saturating_add(3);
        Ok(clamp_to_u32(total))
    }

    /// Worst-case usage to pre-charge: prompt plus the reply cap, or the configured default.
    pub fn estimate_max_usage(&self, prompt_units: u32, max_reply_hint: Option<u32>) -> u32 {
        match max_reply_hint {
            Some(hint) if hint > 0 => prompt_units.saturating_add(hint),
            _ => self.settings.current().pre_consumed_tokens,
        }
    }
}

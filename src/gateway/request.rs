//! Inbound chat request shape and model-name routing.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::GatewayError;
use super::registry::SelectError;
use super::settings::GIZMO_MODEL_BUCKET;

const GIZMO_PREFIX: &str = "gpt-4-gizmo-g";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// OpenAI-shaped chat request. Fields the relay does not read pass through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("missing_model", "model is required"));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::validation(
                "missing_messages",
                "messages must not be empty",
            ));
        }
        Ok(())
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|message| {
            message.content.as_array().is_some_and(|parts| {
                parts
                    .iter()
                    .any(|part| part.get("type").and_then(Value::as_str) == Some("image_url"))
            })
        })
    }

    /// The same request addressed to `model`.
    pub fn for_model(&self, model: &str) -> Self {
        let mut request = self.clone();
        request.model = model.to_string();
        request
    }
}

/// How a requested model name is selected and billed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelRoute {
    /// Name sent upstream (before per-channel remapping).
    pub requested: String,
    /// Name used to pick channels.
    pub selection: String,
}

fn gizmo_id() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"gpt-4-gizmo-g-[a-zA-Z0-9]{9}").expect("gizmo regex is valid"))
}

/// Custom-GPT names select through the shared gizmo bucket but reach upstream verbatim.
pub fn route_model(model: &str) -> Result<ModelRoute, SelectError> {
    let model = model.trim();
    if model == GIZMO_MODEL_BUCKET || model == GIZMO_PREFIX {
        return Err(SelectError::NonSpecificModel);
    }
    if model.starts_with(GIZMO_PREFIX) {
        if !gizmo_id().is_match(model) {
            return Err(SelectError::NonSpecificModel);
        }
        return Ok(ModelRoute {
            requested: model.to_string(),
            selection: GIZMO_MODEL_BUCKET.to_string(),
        });
    }
    Ok(ModelRoute {
        requested: model.to_string(),
        selection: model.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_fields_round_trip() {
        let raw = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi", "tool_call_id": "x"}],
            "temperature": 0.2,
            "stream": true
        });
        let request: ChatRequest = serde_json::from_value(raw.clone()).unwrap();
        assert!(request.stream);
        assert_eq!(request.extra.get("temperature"), Some(&json!(0.2)));
        assert_eq!(serde_json::to_value(&request).unwrap(), raw);
    }

    #[test]
    fn validation_requires_model_and_messages() {
        let err = ChatRequest::default().validate().unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "missing_model", .. }));

        let request = ChatRequest {
            model: "gpt-4".to_string(),
            ..ChatRequest::default()
        };
        let err = request.validate().unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "missing_messages", .. }));
    }

    #[test]
    fn detects_image_parts() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]}]
        }))
        .unwrap();
        assert!(request.has_images());
        assert_eq!(request.for_model("gpt-4o-2024-05-13").model, "gpt-4o-2024-05-13");
    }

    #[test]
    fn specific_gizmo_goes_through_bucket() {
        let route = route_model("gpt-4-gizmo-g-abc123xyz1").unwrap();
        assert_eq!(route.requested, "gpt-4-gizmo-g-abc123xyz1");
        assert_eq!(route.selection, "gpt-4-gizmo-*");
    }

    #[test]
    fn longer_gizmo_variant_with_id_is_coerced() {
        let route = route_model("gpt-4-gizmo-g-abc123xyz1-extra").unwrap();
        assert_eq!(route.selection, "gpt-4-gizmo-*");
    }

    #[test]
    fn non_specific_gizmo_is_rejected() {
        for model in ["gpt-4-gizmo-g", "gpt-4-gizmo-*", "gpt-4-gizmo-g-abc"] {
            let err = route_model(model).unwrap_err();
            assert!(matches!(err, SelectError::NonSpecificModel), "{model}");
        }
    }

    #[test]
    fn plain_models_route_to_themselves() {
        let route = route_model("gpt-3.5-turbo").unwrap();
        assert_eq!(route.selection, "gpt-3.5-turbo");
    }
}

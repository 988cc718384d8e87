//! Language model adapter.
//!
//! The pipeline sees models only through [`LanguageModel`]: a structured
//! extraction call (prompt plus JSON schema in, JSON object out) and a plain
//! completion call. Concrete providers build both on top of a chat endpoint.

pub mod anthropic;
pub mod openai;
pub mod tensorzero;

use crate::config::{HttpSettings, LlmSettings};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiCompatClient;
pub use tensorzero::TensorZeroClient;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("response for `{schema}` did not match schema: {reason}")]
    Schema { schema: String, reason: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A request for a JSON object shaped by `schema`.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub schema_name: &'static str,
    pub schema: Value,
    pub prompt: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, LlmError>;

    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Runs an extraction and decodes the object into `T`.
pub async fn extract_as<T: DeserializeOwned>(
    llm: &dyn LanguageModel,
    request: &ExtractionRequest,
) -> Result<T, LlmError> {
    let value = llm.extract(request).await?;
    serde_json::from_value(value).map_err(|err| LlmError::Schema {
        schema: request.schema_name.to_string(),
        reason: err.to_string(),
    })
}

pub fn from_settings(llm: &LlmSettings, http: &HttpSettings) -> Arc<dyn LanguageModel> {
    match llm {
        LlmSettings::TensorZero {
            gateway_url,
            api_key,
            function_name,
            model,
        } => Arc::new(TensorZeroClient::new(
            tensorzero::TensorZeroConfig {
                gateway_url: gateway_url.clone(),
                api_key: api_key.clone(),
                function_name: function_name.clone(),
                model: model.clone(),
            },
            http,
        )),
        LlmSettings::OpenAi {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            http,
        )),
        LlmSettings::Anthropic {
            base_url,
            api_key,
            model,
        } => Arc::new(AnthropicClient::new(
            base_url.clone(),
            api_key.clone(),
            model.clone(),
            http,
        )),
    }
}

pub(crate) fn extraction_messages(request: &ExtractionRequest) -> Vec<LlmMessage> {
    let system = format!(
        "Respond with a single JSON object named `{name}` that validates against this JSON schema. Output JSON only, no prose.\n{schema}",
        name = request.schema_name,
        schema = request.schema,
    );
    vec![
        LlmMessage::system(system),
        LlmMessage::user(request.prompt.clone()),
    ]
}

pub(crate) fn parse_json_object(schema_name: &str, text: &str) -> Result<Value, LlmError> {
    let cleaned = strip_markdown_fence(text);
    let value: Value = serde_json::from_str(&cleaned).map_err(|err| LlmError::Schema {
        schema: schema_name.to_string(),
        reason: err.to_string(),
    })?;
    if !value.is_object() {
        return Err(LlmError::Schema {
            schema: schema_name.to_string(),
            reason: "expected a JSON object".into(),
        });
    }
    Ok(value)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

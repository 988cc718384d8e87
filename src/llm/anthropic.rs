use super::{
    ExtractionRequest, LanguageModel, LlmError, LlmMessage, extraction_messages, parse_json_object,
};
use crate::config::HttpSettings;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2048;

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(base_url: String, api_key: String, model: String, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http, None),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    async fn send(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        if self.base_url.is_empty() {
            return Err(LlmError::MissingGateway);
        }
        let body = MessagesRequest::new(&self.model, messages);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: MessagesResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .text()
            .ok_or_else(|| LlmError::InvalidResponse("missing text content".into()))
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, LlmError> {
        let text = self.send(&extraction_messages(request)).await?;
        parse_json_object(request.schema_name, &text)
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.send(&[LlmMessage::user(prompt)]).await
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a LlmMessage>,
    temperature: f32,
}

impl<'a> MessagesRequest<'a> {
    /// System turns move to the top-level `system` field; the API rejects them in `messages`.
    fn new(model: &'a str, messages: &'a [LlmMessage]) -> Self {
        let (system, turns): (Vec<&LlmMessage>, Vec<&LlmMessage>) =
            messages.iter().partition(|m| m.role == "system");
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });
        Self {
            model,
            max_tokens: MAX_TOKENS,
            system,
            messages: turns,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn text(self) -> Option<String> {
        let text: String = self
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

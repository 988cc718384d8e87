use super::{
    ExtractionRequest, LanguageModel, LlmError, LlmMessage, extraction_messages, parse_json_object,
};
use crate::config::HttpSettings;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chat-completions client for OpenAI and OpenAI-compatible servers (Ollama's `/v1`).
pub struct OpenAiCompatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        http: &HttpSettings,
    ) -> Self {
        Self {
            http: build_client(http, None),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    async fn chat(&self, messages: &[LlmMessage], json_mode: bool) -> Result<String, LlmError> {
        if self.base_url.is_empty() {
            return Err(LlmError::MissingGateway);
        }
        let body = CompletionRequest {
            model: &self.model,
            messages,
            response_format: json_mode.then_some(ResponseFormat {
                r#type: "json_object",
            }),
            temperature: 0.0,
        };
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("missing choice content".into()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, LlmError> {
        let text = self.chat(&extraction_messages(request), true).await?;
        parse_json_object(request.schema_name, &text)
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.chat(&[LlmMessage::user(prompt)], false).await
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

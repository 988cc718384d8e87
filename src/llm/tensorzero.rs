use super::{
    ExtractionRequest, LanguageModel, LlmError, LlmMessage, extraction_messages, parse_json_object,
};
use crate::config::HttpSettings;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TensorZeroConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

pub struct TensorZeroClient {
    http: Client,
    config: TensorZeroConfig,
}

impl TensorZeroClient {
    pub fn new(config: TensorZeroConfig, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http, None),
            config,
        }
    }

    pub async fn chat(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let function_name = self
            .config
            .function_name
            .as_deref()
            .unwrap_or("deal_finder");

        let body = ChatRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);

        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        if let Some(usage) = &payload.usage {
            debug!(
                target = "deal_finder.llm",
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "tensorzero_usage"
            );
        }

        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))
    }
}

#[async_trait]
impl LanguageModel for TensorZeroClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, LlmError> {
        let text = self.chat(&extraction_messages(request)).await?;
        parse_json_object(request.schema_name, &text)
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.chat(&[LlmMessage::user(prompt)]).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_gateway_is_rejected_before_network() {
        let client = TensorZeroClient::new(
            TensorZeroConfig {
                gateway_url: "  ".into(),
                api_key: None,
                function_name: None,
                model: None,
            },
            &HttpSettings::default(),
        );
        let err = client.complete("hello").await.unwrap_err();
        assert!(matches!(err, LlmError::MissingGateway));
    }

    #[test]
    fn request_omits_absent_model() {
        let body = ChatRequest {
            function_name: "deal_finder".into(),
            model_name: None,
            input: ChatInput {
                messages: vec![LlmMessage::user("hi")],
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("model_name").is_none());
        assert_eq!(value["input"]["messages"][0]["role"], "user");
    }
}

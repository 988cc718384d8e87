use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Lenient parse used at the transport edge; unknown roles are treated as user turns.
    pub fn from_loose(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "assistant" | "ai" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    #[allow(dead_code)]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Price {
    pub value: f64,
    pub currency: Option<String>,
}

/// One marketplace advertisement, normalized by a listing source.
///
/// `url` is the identity key: two listings with the same url are the same ad.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub price: Option<Price>,
    pub location: Option<String>,
    pub condition: Option<String>,
    pub category_id: Option<i64>,
    pub category_type: Option<String>,
    pub source_id: Option<i64>,
}

impl Listing {
    pub fn price_value(&self) -> Option<f64> {
        self.price.as_ref().map(|p| p.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredListing {
    pub listing: Listing,
    pub relevancy_score: u8,
    pub price_score: f64,
    pub combined_score: f64,
}

// -------- transport payloads --------

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl From<InboundMessage> for Message {
    fn from(value: InboundMessage) -> Self {
        let role = value
            .kind
            .as_deref()
            .or(value.role.as_deref())
            .map(Role::from_loose)
            .unwrap_or(Role::User);
        Message {
            role,
            content: value.content,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub messages: Vec<InboundMessage>,
}

impl RunRequest {
    pub fn into_conversation(self) -> Vec<Message> {
        self.messages.into_iter().map(Message::from).collect()
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

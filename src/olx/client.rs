use super::parse::{LISTING_SEARCH_QUERY, parse_search_response};
use crate::config::{HttpSettings, OlxSettings};
use crate::http::{BROWSER_USER_AGENT, build_client};
use crate::source::{ListingSource, SearchPage, SourceError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

/// OLX GraphQL search client. Owns its own pacing state; build one per process
/// and share it behind an `Arc`.
pub struct OlxClient {
    http: Client,
    settings: OlxSettings,
    last_request: Mutex<Option<Instant>>,
}

impl OlxClient {
    pub fn new(settings: OlxSettings, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http, Some(BROWSER_USER_AGENT)),
            settings,
            last_request: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let wait = wait_for(previous.elapsed(), self.settings.min_request_interval);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn post_graphql(&self, variables: Value) -> Result<Value, SourceError> {
        self.pace().await;
        let response = self
            .http
            .post(&self.settings.graphql_url)
            .json(&json!({
                "query": LISTING_SEARCH_QUERY,
                "variables": variables,
            }))
            .send()
            .await
            .map_err(|err| SourceError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SourceError::Request(format!("HTTP {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("application/json") {
            return Err(SourceError::Decode(format!(
                "expected JSON, got `{content_type}`"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ListingSource for OlxClient {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage, SourceError> {
        let limit = self.settings.page_limit;
        let variables = search_variables(query, page, limit);
        debug!(target = "deal_finder.olx", query, page, "olx_search");
        match self.post_graphql(variables).await {
            Ok(body) => Ok(parse_search_response(body, limit)),
            Err(err) => {
                warn!(target = "deal_finder.olx", query, page, error = %err, "olx_search_failed");
                Err(err)
            }
        }
    }
}

fn search_variables(query: &str, page: u32, limit: u32) -> Value {
    let offset = page.saturating_sub(1) * limit;
    json!({
        "searchParameters": [
            {"key": "offset", "value": offset.to_string()},
            {"key": "limit", "value": limit.to_string()},
            {"key": "query", "value": query},
        ]
    })
}

fn wait_for(elapsed: Duration, min_interval: Duration) -> Duration {
    min_interval.saturating_sub(elapsed)
}

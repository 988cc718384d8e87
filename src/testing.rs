//! Deterministic stand-ins for the model and listing source.

use crate::llm::{ExtractionRequest, LanguageModel, LlmError};
use crate::models::{Listing, Price};
use crate::source::{ListingSource, SearchPage, SourceError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub fn listing(n: u32, price: Option<f64>) -> Listing {
    Listing {
        title: format!("Listing {n}"),
        url: format!("https://olx.example/ad/{n}"),
        description: Some(format!("Description for listing {n}")),
        price: price.map(|value| Price {
            value,
            currency: Some("BGN".into()),
        }),
        location: Some("Sofia".into()),
        condition: None,
        category_id: None,
        category_type: None,
        source_id: Some(n as i64),
    }
}

pub fn listings(range: std::ops::Range<u32>, price: impl Fn(u32) -> Option<f64>) -> Vec<Listing> {
    range.map(|n| listing(n, price(n))).collect()
}

type Responder = Box<dyn Fn(&str) -> Value + Send + Sync>;

/// Model stub keyed by schema name. Unknown schemas answer `{}`.
pub struct ScriptedModel {
    responders: HashMap<&'static str, Responder>,
    failures: HashMap<&'static str, usize>,
    completion: String,
    counts: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            responders: HashMap::new(),
            failures: HashMap::new(),
            completion: "Here is what I found.".into(),
            counts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedModel {
    /// Parses one product, fans each into two queries, keeps everything, scores 7.
    pub fn happy(products: &[&str]) -> Self {
        let products: Vec<String> = products.iter().map(|p| p.to_string()).collect();
        Self::default()
            .answer("UserRequest", json!({"products": products, "max_products_count": 5}))
            .on("SearchQueries", |prompt| {
                let product = prompt
                    .lines()
                    .find_map(|l| l.strip_prefix("Product: "))
                    .unwrap_or("item")
                    .to_string();
                json!({"search_queries": [product.clone(), format!("{product} used")]})
            })
            .keep_all()
            .answer("ListingScore", json!({"score": 7}))
    }

    pub fn on(
        mut self,
        schema: &'static str,
        responder: impl Fn(&str) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.responders.insert(schema, Box::new(responder));
        self
    }

    pub fn answer(self, schema: &'static str, value: Value) -> Self {
        self.on(schema, move |_| value.clone())
    }

    /// Filter responder that keeps every index of every batch.
    pub fn keep_all(self) -> Self {
        self.answer(
            "FilterListings",
            json!({"ids_to_keep": (0..1000).collect::<Vec<u32>>()}),
        )
    }

    /// Fails the `nth` (1-based) extraction for `schema`.
    pub fn failing_on(mut self, schema: &'static str, nth: usize) -> Self {
        self.failures.insert(schema, nth);
        self
    }

    pub fn completion(mut self, text: &str) -> Self {
        self.completion = text.to_string();
        self
    }

    pub fn calls_for(&self, schema: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == schema)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value, LlmError> {
        let schema = request.schema_name;
        self.calls
            .lock()
            .unwrap()
            .push((schema.to_string(), request.prompt.clone()));
        let nth = {
            let mut counts = self.counts.lock().unwrap();
            let count = counts.entry(schema.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if self.failures.get(schema) == Some(&nth) {
            return Err(LlmError::Http(format!("scripted failure on {schema} #{nth}")));
        }
        Ok(self
            .responders
            .get(schema)
            .map(|responder| responder(&request.prompt))
            .unwrap_or_else(|| json!({})))
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push(("completion".into(), prompt.to_string()));
        Ok(self.completion.clone())
    }
}

/// Listing source serving fixed pages per query. Unknown queries and pages past
/// the end answer an empty final page.
#[derive(Default)]
pub struct StaticSource {
    pages: HashMap<String, Vec<SearchPage>>,
    failing: HashSet<(String, u32)>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl StaticSource {
    pub fn with_pages(mut self, query: &str, pages: Vec<SearchPage>) -> Self {
        self.pages.insert(query.to_string(), pages);
        self
    }

    /// Every query gets the same single page.
    pub fn serving(listings: Vec<Listing>, queries: &[&str]) -> Self {
        queries.iter().fold(Self::default(), |source, q| {
            source.with_pages(
                q,
                vec![SearchPage {
                    listings: listings.clone(),
                    has_more_pages: false,
                }],
            )
        })
    }

    pub fn failing_page(mut self, query: &str, page: u32) -> Self {
        self.failing.insert((query.to_string(), page));
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ListingSource for StaticSource {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage, SourceError> {
        self.calls.lock().unwrap().push((query.to_string(), page));
        if self.failing.contains(&(query.to_string(), page)) {
            return Err(SourceError::Request("HTTP 503 Service Unavailable".into()));
        }
        Ok(self
            .pages
            .get(query)
            .and_then(|pages| pages.get(page.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or_else(SearchPage::empty))
    }
}

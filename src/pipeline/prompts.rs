use crate::models::{Listing, Message, Role};
use serde_json::{Value, json};

/// User turns only, in order, one per line.
pub fn history_summary(conversation: &[Message]) -> String {
    conversation
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| format!("User: {}", m.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn user_request(conversation: &[Message]) -> String {
    format!(
        "You help shoppers find deals on a classifieds marketplace.\n\
         Read the conversation and list the distinct products the user is looking for, \
         how many results they want to see, and whether bundles or configurations that \
         contain the product are acceptable.\n\
         Storage size, colour and condition describe a product; they are not products \
         of their own.\n\n\
         Conversation:\n{}",
        history_summary(conversation)
    )
}

pub fn user_request_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "products": {"type": "array", "items": {"type": "string"}},
            "max_products_count": {"type": "integer", "default": 20},
            "include_configurations": {"type": "boolean", "default": false}
        },
        "required": ["products"]
    })
}

pub fn search_queries(product: &str, include_configurations: bool) -> String {
    let bundles = if include_configurations {
        "Bundles and configurations containing the product are welcome."
    } else {
        "Target the product on its own, not bundles or configurations."
    };
    format!(
        "Write 3 to 5 distinct short search queries for a classifieds marketplace.\n\
         Vary model names, common abbreviations and spellings.\n\
         {bundles}\n\
         Product: {product}"
    )
}

pub fn search_queries_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "search_queries": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["search_queries"]
    })
}

pub fn filter_listings(
    conversation: &[Message],
    batch: &[Listing],
    desired_products: &[String],
    include_configurations: bool,
) -> String {
    let numbered = batch
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{i}. {}", l.title))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Conversation:\n{history}\n\n\
         The user wants: {products}.\n\
         Configurations or bundles acceptable: {include_configurations}.\n\
         Return the zero-based numbers of the listings below that are actually one of the \
         wanted products and meet every requirement from the conversation (storage, \
         colour, condition and the like). Drop accessories, parts and unrelated items.\n\n\
         {numbered}",
        history = history_summary(conversation),
        products = desired_products.join(", "),
    )
}

pub fn filter_listings_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ids_to_keep": {"type": "array", "items": {"type": "integer"}}
        },
        "required": ["ids_to_keep"]
    })
}

pub fn listing_score(conversation: &[Message], listing: &Listing) -> String {
    format!(
        "Rate from 0 to 10 how well this listing matches what the user asked for. \
         0 is unrelated, 10 is exactly the requested item. Ignore the price.\n\n\
         Conversation:\n{history}\n\n\
         Title: {title}\n\
         Description: {description}",
        history = history_summary(conversation),
        title = listing.title,
        description = listing.description.as_deref().unwrap_or("-"),
    )
}

pub fn listing_score_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "score": {"type": "integer", "minimum": 0, "maximum": 10}
        },
        "required": ["score"]
    })
}

pub struct ResponseFacts<'a> {
    pub conversation: &'a [Message],
    pub desired_products: &'a [String],
    pub candidates: usize,
    pub filtered: usize,
    pub shown: usize,
    pub median_price: Option<f64>,
    pub top_results: &'a str,
}

pub fn response_summary(facts: &ResponseFacts<'_>) -> String {
    let median = facts
        .median_price
        .map(|m| format!("{m}"))
        .unwrap_or_else(|| "unknown".into());
    format!(
        "Write a short, friendly summary (two or three sentences) of a marketplace search.\n\
         Do not list the individual results; they are appended after your text.\n\
         The user may write in Bulgarian; always reply in English.\n\n\
         Conversation:\n{history}\n\n\
         Searched for: {products}\n\
         Listings found: {candidates}\n\
         Relevant after filtering: {filtered}\n\
         Shown: {shown}\n\
         Median price: {median}\n\n\
         Top results:\n{top}",
        history = history_summary(facts.conversation),
        products = facts.desired_products.join(", "),
        candidates = facts.candidates,
        filtered = facts.filtered,
        shown = facts.shown,
        top = facts.top_results,
    )
}

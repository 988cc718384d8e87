//! Shared run state and the reducers that fold stage patches into it.
//!
//! Merge policy per field:
//!
//! | field                    | policy                  |
//! |--------------------------|-------------------------|
//! | `conversation`           | append                  |
//! | `candidate_listings`     | append, dedup by url    |
//! | `scored_listings`        | append                  |
//! | everything else          | overwrite               |

use crate::models::{Listing, Message, ScoredListing};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PipelineState {
    pub conversation: Vec<Message>,
    pub desired_products: Vec<String>,
    pub include_configurations: bool,
    pub max_results_count: usize,
    pub pending_queries: Vec<String>,
    pub candidate_listings: Vec<Listing>,
    pub filtered_listings: Vec<Listing>,
    pub average_price: f64,
    pub median_price: Option<f64>,
    pub scored_listings: Vec<ScoredListing>,
}

/// Partial update returned by a stage. `None` leaves the field untouched.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PipelinePatch {
    pub conversation: Option<Vec<Message>>,
    pub desired_products: Option<Vec<String>>,
    pub include_configurations: Option<bool>,
    pub max_results_count: Option<usize>,
    pub pending_queries: Option<Vec<String>>,
    pub candidate_listings: Option<Vec<Listing>>,
    pub filtered_listings: Option<Vec<Listing>>,
    pub average_price: Option<f64>,
    pub median_price: Option<Option<f64>>,
    pub scored_listings: Option<Vec<ScoredListing>>,
}

impl PipelineState {
    /// Fresh run state; only the conversation carries caller input.
    pub fn seeded(conversation: Vec<Message>) -> Self {
        Self {
            conversation,
            ..Self::default()
        }
    }

    pub fn merge(mut self, patch: PipelinePatch) -> Self {
        if let Some(messages) = patch.conversation {
            self.conversation.extend(messages);
        }
        if let Some(products) = patch.desired_products {
            self.desired_products = products;
        }
        if let Some(include) = patch.include_configurations {
            self.include_configurations = include;
        }
        if let Some(max) = patch.max_results_count {
            self.max_results_count = max;
        }
        if let Some(queries) = patch.pending_queries {
            self.pending_queries = queries;
        }
        if let Some(listings) = patch.candidate_listings {
            let current = std::mem::take(&mut self.candidate_listings);
            self.candidate_listings = dedup_merge(current, listings, |l| l.url.as_str());
        }
        if let Some(listings) = patch.filtered_listings {
            self.filtered_listings = listings;
        }
        if let Some(average) = patch.average_price {
            self.average_price = average;
        }
        if let Some(median) = patch.median_price {
            self.median_price = median;
        }
        if let Some(scored) = patch.scored_listings {
            self.scored_listings.extend(scored);
        }
        self
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == crate::models::Role::Assistant)
    }
}

/// Search loop predicate: route back to search while queries remain.
pub fn has_pending_queries(state: &PipelineState) -> bool {
    !state.pending_queries.is_empty()
}

/// Appends `incoming` to `current`, keeping only the first occurrence of each key.
pub fn dedup_merge<T, F>(current: Vec<T>, incoming: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen: HashSet<String> = HashSet::with_capacity(current.len() + incoming.len());
    let mut merged = Vec::with_capacity(current.len() + incoming.len());
    for item in current.into_iter().chain(incoming) {
        if seen.insert(key(&item).to_string()) {
            merged.push(item);
        }
    }
    merged
}

//! Listing source adapter seam.

use crate::models::Listing;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listing request failed: {0}")]
    Request(String),
    #[error("listing response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub listings: Vec<Listing>,
    pub has_more_pages: bool,
}

impl SearchPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Paginated marketplace search. Pages are 1-based.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage, SourceError>;
}

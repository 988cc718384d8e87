//! The six stage functions. Each reads the current state and returns a patch;
//! none of them mutate the state they are given.

use super::events::{EventMultiplexer, ProgressEvent};
use super::prompts;
use super::scoring::{ScoreWeights, average_price, median_price, normalized_scores};
use super::state::{PipelinePatch, PipelineState};
use super::{PipelineError, Stage};
use crate::config::PipelineConfig;
use crate::llm::{ExtractionRequest, LanguageModel, LlmError, extract_as};
use crate::models::{Listing, Message, ScoredListing};
use crate::source::ListingSource;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_RESULTS: usize = 20;

pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub llm: &'a dyn LanguageModel,
    pub source: &'a dyn ListingSource,
    pub events: &'a EventMultiplexer,
}

fn model_failure(stage: Stage) -> impl Fn(LlmError) -> PipelineError {
    move |err| PipelineError::adapter(stage.name(), err.to_string())
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    #[serde(default)]
    products: Vec<String>,
    #[serde(default)]
    max_products_count: Option<i64>,
    #[serde(default)]
    include_configurations: Option<bool>,
}

pub async fn parse_user_request(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    ctx.events.progress(ProgressEvent::ParseUserRequest).await;

    let request = ExtractionRequest {
        schema_name: "UserRequest",
        schema: prompts::user_request_schema(),
        prompt: prompts::user_request(&state.conversation),
    };
    let parsed: UserRequest = extract_as(ctx.llm, &request)
        .await
        .map_err(model_failure(Stage::ParseUserRequest))?;

    let products: Vec<String> = parsed
        .products
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if products.is_empty() {
        warn!(target = "deal_finder.pipeline", "no_products_extracted");
    }
    let max_results_count = match parsed.max_products_count {
        Some(n) if n > 0 => n as usize,
        _ => DEFAULT_MAX_RESULTS,
    };

    info!(
        target = "deal_finder.pipeline",
        products = ?products,
        max_results_count,
        "user_request_parsed"
    );
    Ok(PipelinePatch {
        desired_products: Some(products),
        include_configurations: Some(parsed.include_configurations.unwrap_or(false)),
        max_results_count: Some(max_results_count),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct SearchQueries {
    #[serde(default)]
    search_queries: Vec<String>,
}

pub async fn generate_search_queries(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    ctx.events.progress(ProgressEvent::GenerateSearchQueries).await;

    let mut seen = HashSet::new();
    let mut queue = Vec::new();
    for product in &state.desired_products {
        let request = ExtractionRequest {
            schema_name: "SearchQueries",
            schema: prompts::search_queries_schema(),
            prompt: prompts::search_queries(product, state.include_configurations),
        };
        let generated: SearchQueries = extract_as(ctx.llm, &request)
            .await
            .map_err(model_failure(Stage::GenerateSearchQueries))?;
        for query in generated.search_queries {
            let query = query.trim().to_string();
            if !query.is_empty() && seen.insert(query.clone()) {
                queue.push(query);
            }
        }
    }

    debug!(target = "deal_finder.pipeline", queries = ?queue, "search_queries_generated");
    Ok(PipelinePatch {
        pending_queries: Some(queue),
        ..Default::default()
    })
}

pub async fn search_for_listings(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    let Some((query, rest)) = state.pending_queries.split_first() else {
        return Err(PipelineError::validation(
            Stage::SearchForListings.name(),
            "search entered with an empty query queue",
        ));
    };

    ctx.events
        .progress(ProgressEvent::SearchForListings {
            search_query: query.clone(),
            remaining_queries: rest.len(),
        })
        .await;

    let mut collected: Vec<Listing> = Vec::new();
    let mut pages = 0;
    if !query.trim().is_empty() {
        for page in 1..=ctx.config.max_pages_to_search.max(1) {
            match ctx.source.search(query, page).await {
                Ok(result) => {
                    pages = page;
                    collected.extend(result.listings);
                    if !result.has_more_pages {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        target = "deal_finder.pipeline",
                        query = %query,
                        page,
                        error = %err,
                        "search_page_failed"
                    );
                    break;
                }
            }
        }
    }
    crate::metrics::listings_found(query, pages, collected.len());

    Ok(PipelinePatch {
        pending_queries: Some(rest.to_vec()),
        candidate_listings: Some(collected),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct FilterListings {
    #[serde(default)]
    ids_to_keep: Vec<i64>,
}

pub async fn filter_listings(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    let candidates = &state.candidate_listings;
    ctx.events
        .progress(ProgressEvent::FilterListings {
            listings_count: candidates.len(),
        })
        .await;

    let mut kept: Vec<Listing> = Vec::new();
    for batch in candidates.chunks(ctx.config.listings_batch_size.max(1)) {
        let request = ExtractionRequest {
            schema_name: "FilterListings",
            schema: prompts::filter_listings_schema(),
            prompt: prompts::filter_listings(
                &state.conversation,
                batch,
                &state.desired_products,
                state.include_configurations,
            ),
        };
        let answer: FilterListings = extract_as(ctx.llm, &request)
            .await
            .map_err(model_failure(Stage::FilterListings))?;
        let keep: HashSet<i64> = answer.ids_to_keep.into_iter().collect();
        kept.extend(
            batch
                .iter()
                .enumerate()
                .filter(|(i, _)| keep.contains(&(*i as i64)))
                .map(|(_, listing)| listing.clone()),
        );
    }

    let average = average_price(&kept);
    let median = median_price(&kept);
    info!(
        target = "deal_finder.pipeline",
        candidates = candidates.len(),
        kept = kept.len(),
        average_price = average,
        median_price = ?median,
        "listings_filtered"
    );
    Ok(PipelinePatch {
        filtered_listings: Some(kept),
        average_price: Some(average),
        median_price: Some(median),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct ListingScore {
    score: i64,
}

pub async fn score_listings(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    let total = state.filtered_listings.len();
    ctx.events
        .progress(ProgressEvent::ScoreListings {
            listings_count: total,
        })
        .await;

    let weights = ScoreWeights::from(ctx.config);
    let mut scored = Vec::with_capacity(total);
    for (i, listing) in state.filtered_listings.iter().enumerate() {
        let request = ExtractionRequest {
            schema_name: "ListingScore",
            schema: prompts::listing_score_schema(),
            prompt: prompts::listing_score(&state.conversation, listing),
        };
        let answer: ListingScore = extract_as(ctx.llm, &request)
            .await
            .map_err(model_failure(Stage::ScoreListings))?;
        let scores = normalized_scores(
            answer.score,
            listing.price_value(),
            state.median_price,
            &weights,
        );
        scored.push(ScoredListing {
            listing: listing.clone(),
            relevancy_score: answer.score.clamp(0, 10) as u8,
            price_score: scores.price_score,
            combined_score: scores.combined_score,
        });
        ctx.events
            .progress(ProgressEvent::ScoreListingsProgress {
                scored_listings_count: i + 1,
                total_listings_count: total,
            })
            .await;
    }

    Ok(PipelinePatch {
        scored_listings: Some(scored),
        ..Default::default()
    })
}

pub async fn generate_response(
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    ctx.events.progress(ProgressEvent::GenerateResponse).await;

    let top = rank(&state.scored_listings, state.max_results_count);
    let list = top
        .iter()
        .map(|s| format_listing_line(s, ctx.config))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = prompts::response_summary(&prompts::ResponseFacts {
        conversation: &state.conversation,
        desired_products: &state.desired_products,
        candidates: state.candidate_listings.len(),
        filtered: state.filtered_listings.len(),
        shown: top.len(),
        median_price: state.median_price,
        top_results: &list,
    });
    let summary = ctx
        .llm
        .complete(&prompt)
        .await
        .map_err(model_failure(Stage::GenerateResponse))?;

    let summary = summary.trim();
    let text = if list.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}\n\n{list}")
    };
    Ok(PipelinePatch {
        conversation: Some(vec![Message::assistant(text)]),
        ..Default::default()
    })
}

/// Best first; equal scores keep their incoming order.
pub fn rank(scored: &[ScoredListing], limit: usize) -> Vec<ScoredListing> {
    let mut ranked = scored.to_vec();
    ranked.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    ranked.truncate(limit);
    ranked
}

pub fn format_listing_line(scored: &ScoredListing, config: &PipelineConfig) -> String {
    let listing = &scored.listing;
    let price = match &listing.price {
        Some(p) => match &p.currency {
            Some(currency) => format!("{} {currency}", p.value),
            None => format!("{}", p.value),
        },
        None => "no price".to_string(),
    };
    let mut line = if config.enable_markdown {
        format!("- [{} ({price})]({})", listing.title, listing.url)
    } else {
        format!("- {} ({price}) - ({})", listing.title, listing.url)
    };
    if config.debug_scoring {
        line.push_str(&format!(
            " [relevancy {}, price {}, combined {}]",
            scored.relevancy_score, scored.price_score, scored.combined_score
        ));
    }
    line
}

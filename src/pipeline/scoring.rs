use crate::config::PipelineConfig;
use crate::models::Listing;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub relevancy_weight: f64,
    pub price_weight: f64,
    pub relevancy_gamma: f64,
    pub max_price_ratio: f64,
}

impl From<&PipelineConfig> for ScoreWeights {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            relevancy_weight: config.relevancy_weight,
            price_weight: config.price_weight,
            relevancy_gamma: config.relevancy_gamma,
            max_price_ratio: config.max_price_ratio,
        }
    }
}

/// Derived scores on the 0–10 scale, rounded to 4 decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub price_score: f64,
    pub combined_score: f64,
}

/// Fuses relevance and price competitiveness with a weighted geometric mean,
/// so a zero in either factor pulls the combined score to zero.
pub fn normalized_scores(
    relevancy: i64,
    price: Option<f64>,
    median: Option<f64>,
    weights: &ScoreWeights,
) -> Scores {
    let mut relevance_norm = (relevancy as f64 / 10.0).clamp(0.0, 1.0);
    if weights.relevancy_gamma != 1.0 {
        relevance_norm = relevance_norm.powf(weights.relevancy_gamma);
    }

    let price_norm = match (price, median) {
        (Some(price), Some(median)) if price > 0.0 && median > 0.0 => {
            ((median / price) / weights.max_price_ratio).clamp(0.0, 1.0)
        }
        _ => 1.0,
    };

    let weight_sum = weights.relevancy_weight + weights.price_weight;
    let a = weights.relevancy_weight / weight_sum;
    let b = weights.price_weight / weight_sum;
    let combined = relevance_norm.powf(a) * price_norm.powf(b);

    Scores {
        price_score: round4(price_norm * 10.0),
        combined_score: round4(combined * 10.0),
    }
}

/// Mean over listings that carry a price; 0 when none do.
pub fn average_price(listings: &[Listing]) -> f64 {
    let prices: Vec<f64> = listings.iter().filter_map(Listing::price_value).collect();
    if prices.is_empty() {
        0.0
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    }
}

/// Price of the element at index `n / 2` after sorting by price.
///
/// Priced listings sort ascending; price-less listings sort after all priced
/// ones and keep their relative order. For even `n` this picks the upper of
/// the two middle elements rather than averaging them.
pub fn median_price(listings: &[Listing]) -> Option<f64> {
    if listings.is_empty() {
        return None;
    }
    let mut prices: Vec<Option<f64>> = listings.iter().map(Listing::price_value).collect();
    prices.sort_by(|a, b| match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    prices[prices.len() / 2]
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

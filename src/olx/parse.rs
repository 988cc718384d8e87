use crate::models::{Listing, Price};
use crate::source::SearchPage;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

pub const LISTING_SEARCH_QUERY: &str = r#"
query ListingSearchQuery($searchParameters: [SearchParameter!]!) {
    clientCompatibleListings(searchParameters: $searchParameters) {
        __typename
        ... on ListingSuccess {
            data {
                id
                title
                description
                url
                category { id type }
                params {
                    key
                    value {
                        ... on PriceParam { value currency }
                        ... on GenericParam { key label }
                    }
                }
            }
        }
    }
}
"#;

#[derive(Debug, Default, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<GraphQlData>,
}

#[derive(Debug, Default, Deserialize)]
struct GraphQlData {
    #[serde(rename = "clientCompatibleListings", default)]
    listings: Option<ListingsResult>,
}

#[derive(Debug, Default, Deserialize)]
struct ListingsResult {
    #[serde(rename = "__typename", default)]
    typename: String,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    category: Option<RawCategory>,
    #[serde(default)]
    params: Vec<RawParam>,
}

#[derive(Debug, Deserialize)]
struct RawCategory {
    #[serde(default)]
    id: Option<i64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParam {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<RawParamValue>,
}

#[derive(Debug, Deserialize)]
struct RawParamValue {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

/// Turns a search response into a page. `has_more_pages` is true when the raw
/// page was full, regardless of how many entries survived parsing.
pub fn parse_search_response(body: Value, limit: u32) -> SearchPage {
    let envelope: GraphQlEnvelope = match serde_json::from_value(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(target = "deal_finder.olx", error = %err, "graphql_envelope_unreadable");
            return SearchPage::empty();
        }
    };
    let Some(result) = envelope.data.and_then(|d| d.listings) else {
        return SearchPage::empty();
    };
    if result.typename != "ListingSuccess" {
        return SearchPage::empty();
    }

    let raw_count = result.data.len();
    let listings = result.data.into_iter().filter_map(parse_listing).collect();

    SearchPage {
        listings,
        has_more_pages: raw_count as u32 == limit,
    }
}

fn parse_listing(raw: Value) -> Option<Listing> {
    let raw: RawListing = match serde_json::from_value(raw) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(target = "deal_finder.olx", error = %err, "listing_unreadable");
            return None;
        }
    };
    let title = raw.title.filter(|t| !t.trim().is_empty())?;
    let url = raw.url.filter(|u| !u.trim().is_empty())?;

    let mut listing = Listing {
        title,
        url,
        description: raw.description,
        price: None,
        location: None,
        condition: None,
        category_id: raw.category.as_ref().and_then(|c| c.id),
        category_type: raw.category.and_then(|c| c.kind),
        source_id: raw.id,
    };

    for param in raw.params {
        let Some(value) = param.value else { continue };
        match param.key.as_str() {
            "price" => {
                if let Some(amount) = value.value.as_ref().and_then(number_from) {
                    listing.price = Some(Price {
                        value: amount,
                        currency: value.currency,
                    });
                }
            }
            "state" => listing.condition = value.label.filter(|l| !l.is_empty()),
            "location" => listing.location = value.label.filter(|l| !l.is_empty()),
            _ => {}
        }
    }
    Some(listing)
}

fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

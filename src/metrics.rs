use tracing::trace;

// Trace-based counters on the `deal_finder.metrics` target.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "deal_finder.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "deal_finder.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn listings_found(query: &str, pages: u32, count: usize) {
    trace!(
        target = "deal_finder.metrics",
        query = query,
        pages = pages,
        count = count as u64,
        "listings_found"
    );
}

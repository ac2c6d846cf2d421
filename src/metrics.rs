use crate::models::RunSummary;
use tracing::trace;

// Trace-based counters; the Prometheus recorder is installed in main and
// rendered on /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catalog.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn page_outcome(page: u32, ok: bool, records: usize) {
    trace!(
        target = "catalog.metrics",
        page = page,
        ok = ok,
        records = records as u64,
        "page_outcome"
    );
}

pub fn run_completed(summary: &RunSummary) {
    trace!(
        target = "catalog.metrics",
        scraped = summary.total_scraped as u64,
        updated = summary.total_updated as u64,
        failed_pages = summary.failed_pages.len() as u64,
        cache_degraded = summary.cache_degraded as u64,
        "run_completed"
    );
}

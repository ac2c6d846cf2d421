use crate::cache::{CacheBackend, PriceCache};
use crate::config::{CatalogConfig, FetchConfig};
use crate::extractor::{PageExtraction, ProductExtractor};
use crate::fetcher::{FetchError, PageFetcher};
use crate::images::{FsImageStore, ImageStore};
use crate::models::{ProductKey, ProductRecord, RunSummary, ScrapeRequest};
use crate::store::CatalogStore;
use chrono::Utc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, warn};

/// The pipeline as wired in the server.
pub type CatalogPipeline = Orchestrator<CacheBackend, FsImageStore>;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Conflict,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn cancelled(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Cancelled)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Result of driving one page through `Pending -> Fetching -> {Extracted | FailedAfterRetries}`.
enum PageOutcome {
    Extracted(PageExtraction),
    FailedAfterRetries(FetchError),
}

/// Prices in `pending` are written to the cache only once `updates` are
/// persisted.
#[derive(Default)]
struct Reconciliation {
    updates: Vec<ProductRecord>,
    pending: Vec<(ProductKey, f64)>,
    degraded: usize,
}

struct RunPlan {
    pages: u32,
    proxy: Option<String>,
}

/// Drives scrape runs: sequential page fetches, extraction, change detection
/// against the price cache and a single merge into the catalogue at the end.
///
/// Only one run executes at a time; a concurrent trigger is rejected rather
/// than queued.
pub struct Orchestrator<C, I> {
    catalog: CatalogConfig,
    fetch: FetchConfig,
    extractor: ProductExtractor,
    images: I,
    cache: C,
    store: CatalogStore,
    pub(crate) run_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl<C: PriceCache, I: ImageStore> Orchestrator<C, I> {
    pub fn new(
        catalog: CatalogConfig,
        fetch: FetchConfig,
        cache: C,
        images: I,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PipelineError> {
        let extractor =
            ProductExtractor::new().map_err(|err| PipelineError::internal("extract", err.to_string()))?;
        let store = CatalogStore::new(catalog.data_file.clone());
        Ok(Self {
            catalog,
            fetch,
            extractor,
            images,
            cache,
            store,
            run_lock: Mutex::new(()),
            shutdown,
        })
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Runs immediately, or fails with a conflict when another run holds the lock.
    pub async fn run(&self, request: ScrapeRequest) -> Result<RunSummary, PipelineError> {
        let plan = self.plan(request)?;
        let running = self
            .run_lock
            .try_lock()
            .map_err(|_| PipelineError::conflict("run", "a scrape run is already in progress"))?;
        self.execute(plan, running).await
    }

    /// Waits for any active run to finish, then runs.
    pub async fn run_queued(&self, request: ScrapeRequest) -> Result<RunSummary, PipelineError> {
        let plan = self.plan(request)?;
        let running = self.run_lock.lock().await;
        self.execute(plan, running).await
    }

    fn plan(&self, request: ScrapeRequest) -> Result<RunPlan, PipelineError> {
        let pages = request.pages.unwrap_or(self.catalog.default_pages);
        if pages == 0 {
            return Err(PipelineError::invalid_input("request", "pages must be at least 1"));
        }
        if pages > self.catalog.max_pages {
            return Err(PipelineError::invalid_input(
                "request",
                format!("pages must not exceed {}", self.catalog.max_pages),
            ));
        }
        let proxy = request
            .proxy
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Ok(RunPlan { pages, proxy })
    }

    async fn execute(
        &self,
        plan: RunPlan,
        _running: MutexGuard<'_, ()>,
    ) -> Result<RunSummary, PipelineError> {
        let RunPlan { pages, proxy } = plan;
        let proxy = proxy.as_deref();
        let fetcher = PageFetcher::new(&self.fetch, proxy)
            .map_err(|err| PipelineError::invalid_input("fetch", err.to_string()))?;

        let started_at = Utc::now();
        info!(target = "catalog.pipeline", pages, proxied = proxy.is_some(), "scrape run started");

        let fetch_started = Instant::now();
        let mut scraped = Vec::new();
        let mut skipped = 0usize;
        let mut failed_pages = Vec::new();
        for page in 1..=pages {
            if *self.shutdown.borrow() {
                warn!(target = "catalog.pipeline", page, "shutdown requested; abandoning run");
                return Err(PipelineError::cancelled(
                    "fetch_pages",
                    format!("shutdown requested before page {page}"),
                ));
            }
            match self.scrape_page(&fetcher, page).await {
                PageOutcome::Extracted(extraction) => {
                    crate::metrics::page_outcome(page, true, extraction.records.len());
                    for skip in &extraction.skipped {
                        warn!(
                            target = "catalog.pipeline",
                            page,
                            index = skip.index,
                            reason = %skip.reason,
                            "product element skipped"
                        );
                    }
                    skipped += extraction.skipped.len();
                    scraped.extend(extraction.records);
                }
                PageOutcome::FailedAfterRetries(err) => {
                    crate::metrics::page_outcome(page, false, 0);
                    warn!(target = "catalog.pipeline", page, error = %err, "page abandoned");
                    failed_pages.push(page);
                }
            }
        }
        crate::metrics::stage_elapsed("fetch_pages", fetch_started.elapsed().as_millis());

        let reconcile_started = Instant::now();
        let total_scraped = scraped.len();
        let reconciliation = self.reconcile(scraped).await;
        let total_updated = reconciliation.updates.len();
        crate::metrics::stage_elapsed("reconcile", reconcile_started.elapsed().as_millis());

        let save_started = Instant::now();
        let records_written = self
            .store
            .merge_and_save(reconciliation.updates)
            .await
            .map_err(|err| PipelineError::internal("save", err.to_string()))?;
        crate::metrics::stage_elapsed("save", save_started.elapsed().as_millis());
        let degraded = reconciliation.degraded + self.advance_cache(reconciliation.pending).await;

        let summary = RunSummary {
            total_scraped,
            total_updated,
            records_written,
            records_skipped: skipped,
            cache_degraded: degraded,
            failed_pages,
            started_at,
            finished_at: Utc::now(),
            message: format!("Scraped {total_scraped} products, {total_updated} updated."),
        };
        crate::metrics::run_completed(&summary);
        info!(
            target = "catalog.pipeline",
            scraped = summary.total_scraped,
            updated = summary.total_updated,
            skipped = summary.records_skipped,
            failed_pages = ?summary.failed_pages,
            "{}",
            summary.message
        );
        Ok(summary)
    }

    async fn scrape_page(&self, fetcher: &PageFetcher, page: u32) -> PageOutcome {
        let url = self.catalog.page_url(page);
        debug!(target = "catalog.pipeline", page, url = %url, "fetching page");
        match fetcher.fetch_with_retry(&url).await {
            Ok(document) => {
                let extraction = self.extractor.extract(&document, &self.images).await;
                debug!(
                    target = "catalog.pipeline",
                    page,
                    records = extraction.records.len(),
                    skipped = extraction.skipped.len(),
                    "page extracted"
                );
                PageOutcome::Extracted(extraction)
            }
            Err(err) => PageOutcome::FailedAfterRetries(err),
        }
    }

    /// A record is an update when its price is new or differs from the cached
    /// one. When the cache cannot answer, the record is treated as an update
    /// and nothing is queued for the cache.
    async fn reconcile(&self, scraped: Vec<ProductRecord>) -> Reconciliation {
        let mut out = Reconciliation::default();
        for record in scraped {
            let key = record.key();
            match self.cache.get(&key).await {
                Ok(Some(cached)) if cached == record.price => {
                    debug!(target = "catalog.pipeline", key = %key, price = record.price, "price unchanged");
                }
                Ok(previous) => {
                    debug!(
                        target = "catalog.pipeline",
                        key = %key,
                        previous = ?previous,
                        price = record.price,
                        "price changed"
                    );
                    out.pending.push((key, record.price));
                    out.updates.push(record);
                }
                Err(err) => {
                    warn!(
                        target = "catalog.cache",
                        key = %key,
                        error = %err,
                        "change status unknown; persisting without caching"
                    );
                    out.degraded += 1;
                    out.updates.push(record);
                }
            }
        }
        out
    }

    /// Returns the number of cache writes that failed.
    async fn advance_cache(&self, pending: Vec<(ProductKey, f64)>) -> usize {
        let mut failed = 0;
        for (key, price) in pending {
            if let Err(err) = self.cache.set(&key, price).await {
                warn!(target = "catalog.cache", key = %key, error = %err, "cache write skipped");
                failed += 1;
            }
        }
        failed
    }
}

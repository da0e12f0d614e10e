//! Pipeline orchestrator: ties fetch session → table extraction → files together.
//!
//! ## Run modes
//!
//! `Pipeline::scrape()` — batch mode:
//!   1. Build one `Target` per symbol from the configured range/interval
//!   2. Fetch targets strictly one after another, each with bounded retries
//!   3. Write the combined dataset, the failed-symbol list and a JSON report
//!   A target that exhausts its retries is recorded and the batch moves on.
//!
//! `Pipeline::quick()` — one attempt per target, all launched at once under a
//!   semaphore bound, joined back in input order. No retries.

use crate::config::AppConfig;
use crate::models::{FetchOutcome, PriceRow, Schema, TaggedRow, Target};
use crate::scraper::browser::ChromeSession;
use crate::scraper::parsers::extract_rows;
use crate::scraper::{FetchError, PageSource};
use crate::storage::{write_dataset, write_failed, write_report};
use crate::utils::Timer;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{error, info, warn};

// ── Retrying fetcher ──────────────────────────────────────────────────────────

/// Pending → Attempting(1..=max_attempts) → Succeeded | ExhaustedFailed.
pub struct RetryingFetcher<S> {
    source: Arc<S>,
    schema: Schema,
    max_attempts: u32,
    backoff: Duration,
}

impl<S: PageSource> RetryingFetcher<S> {
    pub fn new(source: Arc<S>, schema: Schema, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            source,
            schema,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn fetch(&self, target: &Target) -> FetchOutcome {
        self.fetch_counted(target, &AtomicU32::new(0)).await
    }

    /// Like `fetch`, publishing the attempt number so a caller that abandons
    /// the future still knows how far it got.
    pub async fn fetch_counted(&self, target: &Target, attempts: &AtomicU32) -> FetchOutcome {
        let strategy = FixedInterval::new(self.backoff).take(self.max_attempts as usize - 1);

        let result = RetryIf::spawn(
            strategy,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.attempt(target, n)
            },
            |e: &FetchError| e.is_retryable(),
        )
        .await;

        match result {
            Ok(rows) => FetchOutcome::Success(rows),
            Err(reason) => {
                let attempts = attempts.load(Ordering::SeqCst);
                if reason.is_retryable() {
                    warn!("[{}] Failed after {} attempts", target.symbol(), attempts);
                }
                FetchOutcome::Failure { reason, attempts }
            }
        }
    }

    async fn attempt(&self, target: &Target, n: u32) -> Result<Vec<PriceRow>, FetchError> {
        let result = match self.source.fetch_markup(target).await {
            Ok(markup) => extract_rows(&markup, self.schema).and_then(|rows| {
                if rows.is_empty() {
                    Err(FetchError::EmptyResult)
                } else {
                    Ok(rows)
                }
            }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(rows) => info!("[{}] {} rows (try {})", target.symbol(), rows.len(), n),
            Err(e) => warn!("[{}] Attempt {}/{} failed: {}", target.symbol(), n, self.max_attempts, e),
        }
        result
    }
}

// ── Batch driver ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FailedTarget {
    pub symbol: String,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    /// Succeeded targets in input order.
    pub succeeded: Vec<(String, Vec<PriceRow>)>,
    /// Failed targets in input order.
    pub failed: Vec<FailedTarget>,
    /// Set when a fatal session error stopped the run early.
    pub aborted: Option<FetchError>,
}

impl BatchResult {
    /// All succeeded rows tagged with their symbol, stably sorted by (symbol, date).
    pub fn combined_rows(&self) -> Vec<TaggedRow> {
        let mut rows: Vec<TaggedRow> = self
            .succeeded
            .iter()
            .flat_map(|(symbol, rows)| {
                rows.iter().map(move |row| TaggedRow {
                    symbol: symbol.clone(),
                    row: row.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    pub fn failed_symbols(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.symbol.clone()).collect()
    }
}

pub struct BatchDriver<S> {
    fetcher: RetryingFetcher<S>,
    polite_delay: Duration,
    jitter_ms: u64,
    run_timeout: Option<Duration>,
}

impl<S: PageSource> BatchDriver<S> {
    pub fn new(fetcher: RetryingFetcher<S>, polite_delay: Duration) -> Self {
        Self {
            fetcher,
            polite_delay,
            jitter_ms: 0,
            run_timeout: None,
        }
    }

    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Process targets sequentially. Resolving `shutdown`, passing the run
    /// timeout, or a fatal session error fails the target in flight and every
    /// target not yet started; results gathered so far are kept. A fatal error
    /// is also left in `aborted`.
    pub async fn run<F>(&self, targets: &[Target], shutdown: F) -> BatchResult
    where
        F: Future<Output = ()>,
    {
        let deadline = self.run_timeout.map(|t| Instant::now() + t);
        tokio::pin!(shutdown);

        let total = targets.len();
        let mut result = BatchResult::default();
        let mut cancelled: Option<String> = None;

        for (i, target) in targets.iter().enumerate() {
            let symbol = target.symbol().to_string();

            if cancelled.is_none() && i > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay()) => {}
                    _ = until(deadline) => cancelled = Some("run deadline exceeded".into()),
                    _ = &mut shutdown => cancelled = Some("shutdown requested".into()),
                }
            }

            if let Some(reason) = &cancelled {
                result.failed.push(FailedTarget {
                    symbol,
                    reason: FetchError::Cancelled(reason.clone()).to_string(),
                    attempts: 0,
                });
                continue;
            }

            let attempts = AtomicU32::new(0);
            let outcome = tokio::select! {
                outcome = self.fetcher.fetch_counted(target, &attempts) => outcome,
                _ = until(deadline) => {
                    cancelled = Some("run deadline exceeded".into());
                    cancelled_outcome("run deadline exceeded", &attempts)
                }
                _ = &mut shutdown => {
                    cancelled = Some("shutdown requested".into());
                    cancelled_outcome("shutdown requested", &attempts)
                }
            };

            match outcome {
                FetchOutcome::Success(rows) => {
                    info!("[{}/{}] Done: {} ({} rows)", i + 1, total, symbol, rows.len());
                    result.succeeded.push((symbol, rows));
                }
                FetchOutcome::Failure { reason, attempts } if reason.is_fatal() => {
                    error!("[{}/{}] {}: {}; stopping the run", i + 1, total, symbol, reason);
                    result.failed.push(FailedTarget {
                        symbol,
                        reason: reason.to_string(),
                        attempts,
                    });
                    cancelled = Some("browser unavailable".into());
                    result.aborted = Some(reason);
                }
                FetchOutcome::Failure { reason, attempts } => {
                    warn!("[{}/{}] Failed: {} ({})", i + 1, total, symbol, reason);
                    result.failed.push(FailedTarget {
                        symbol,
                        reason: reason.to_string(),
                        attempts,
                    });
                }
            }
        }

        result
    }

    /// Polite delay plus random jitter.
    fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.polite_delay + Duration::from_millis(jitter)
    }
}

fn cancelled_outcome(reason: &str, attempts: &AtomicU32) -> FetchOutcome {
    FetchOutcome::Failure {
        reason: FetchError::Cancelled(reason.to_string()),
        attempts: attempts.load(Ordering::SeqCst),
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

// ── Concurrent quick path ─────────────────────────────────────────────────────

/// One attempt per target, at most `concurrency` in flight, results in input
/// order. Failed targets are logged and left out.
pub async fn fetch_concurrent<S>(
    source: Arc<S>,
    targets: Vec<Target>,
    schema: Schema,
    concurrency: usize,
) -> Result<Vec<(String, Vec<PriceRow>)>>
where
    S: PageSource + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::new();

    for target in targets {
        let source = Arc::clone(&source);
        let sem = Arc::clone(&sem);
        let symbol = target.symbol().to_string();

        let handle = tokio::spawn(async move {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| FetchError::Cancelled(e.to_string()))?;
            let markup = source.fetch_markup(&target).await?;
            extract_rows(&markup, schema)
        });

        handles.push((symbol, handle));
    }

    let mut results = Vec::new();
    for (symbol, handle) in handles {
        match handle.await {
            Ok(Ok(rows)) => {
                info!("[{}] {} rows", symbol, rows.len());
                results.push((symbol, rows));
            }
            Ok(Err(e)) if e.is_fatal() => return Err(anyhow::Error::new(e)),
            Ok(Err(e)) => warn!("[{}] {}", symbol, e),
            Err(e) => error!("Task panic for {}: {}", symbol, e),
        }
    }
    Ok(results)
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub targets: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedTarget>,
    pub rows_written: usize,
    pub dataset_path: PathBuf,
    pub failed_path: Option<PathBuf>,
    pub aborted: Option<String>,
}

/// Output locations for one run, resolved from config and CLI overrides.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dataset: PathBuf,
    pub failed: PathBuf,
    pub report: PathBuf,
}

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn targets(&self, symbols: &[String]) -> Result<Vec<Target>> {
        let (start, end) = self.config.pipeline.date_range()?;
        Ok(symbols
            .iter()
            .map(|s| Target::new(s.as_str(), start, end, self.config.pipeline.interval))
            .collect())
    }

    pub async fn scrape(&self, symbols: &[String], paths: &RunPaths) -> Result<BatchReport> {
        let scraper = &self.config.scraper;
        let fetcher = RetryingFetcher::new(
            Arc::new(ChromeSession::new(scraper)),
            self.config.pipeline.schema,
            scraper.max_retries,
            Duration::from_millis(scraper.backoff_ms),
        );
        let driver = BatchDriver::new(fetcher, Duration::from_millis(scraper.request_delay_ms))
            .with_jitter_ms(scraper.jitter_ms)
            .with_run_timeout(self.config.pipeline.run_timeout_secs.map(Duration::from_secs));

        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            warn!("Ctrl-C received, stopping after the current target");
        };

        self.scrape_with(&driver, symbols, paths, shutdown).await
    }

    /// Run a batch with any page source and persist its results. The outputs
    /// are written even when a fatal session error ends the run, which then
    /// surfaces as `Err`.
    pub async fn scrape_with<S, F>(
        &self,
        driver: &BatchDriver<S>,
        symbols: &[String],
        paths: &RunPaths,
        shutdown: F,
    ) -> Result<BatchReport>
    where
        S: PageSource,
        F: Future<Output = ()>,
    {
        let timer = Timer::start("Batch scrape");
        let started_at = Utc::now();
        let targets = self.targets(symbols)?;
        info!("=== Scraping {} targets ===", targets.len());

        let mut batch = driver.run(&targets, shutdown).await;
        let aborted = batch.aborted.take();

        let rows = batch.combined_rows();
        let rows_written = write_dataset(&paths.dataset, self.config.pipeline.schema, &rows)
            .context("Failed to write dataset")?;

        let failed_path = if batch.failed.is_empty() {
            None
        } else {
            write_failed(&paths.failed, &batch.failed_symbols())
                .context("Failed to write failed-target list")?;
            Some(paths.failed.clone())
        };

        let report = BatchReport {
            started_at,
            elapsed_secs: timer.elapsed().as_secs_f64(),
            targets: targets.len(),
            succeeded: batch.succeeded.len(),
            failed: batch.failed,
            rows_written,
            dataset_path: paths.dataset.clone(),
            failed_path,
            aborted: aborted.as_ref().map(ToString::to_string),
        };
        write_report(&paths.report, &report)?;

        if let Some(reason) = aborted {
            return Err(anyhow::Error::new(reason).context(format!(
                "Run stopped early; partial results saved to {:?}",
                paths.dataset
            )));
        }

        info!(
            "=== Done: {} targets | {} succeeded | {} failed | {} rows ===",
            report.targets,
            report.succeeded,
            report.failed.len(),
            report.rows_written
        );
        Ok(report)
    }

    pub async fn quick(&self, symbols: &[String], dataset: &Path) -> Result<usize> {
        let _t = Timer::start("Quick scrape");
        let targets = self.targets(symbols)?;
        let source = Arc::new(ChromeSession::new(&self.config.scraper));
        let schema = self.config.pipeline.schema;

        let fetched = fetch_concurrent(source, targets, schema, self.config.pipeline.concurrency).await?;
        let batch = BatchResult {
            succeeded: fetched,
            ..BatchResult::default()
        };
        info!("Scraped {} of {} targets", batch.succeeded.len(), symbols.len());
        write_dataset(dataset, schema, &batch.combined_rows())
    }
}

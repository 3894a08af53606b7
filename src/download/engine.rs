//! Batch download manager: sequential items, bounded retries, cancellation.
//!
//! The [`DownloadManager`] runs items strictly in submission order. Each item
//! gets up to three passes of the [`TransferOrchestrator`]; failures are
//! classified by `(stage, reason)` and only transient ones are retried.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arrakis_core::config::EngineConfig;
//! use arrakis_core::credentials::Credentials;
//! use arrakis_core::download::{DownloadItem, DownloadManager, NoopSink};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(&EngineConfig::from_env(), Credentials::from_env(), Arc::new(NoopSink))?;
//! let items = vec![DownloadItem::new(
//!     "https://huggingface.co/org/repo/resolve/main/vae/ae.safetensors",
//!     "vae",
//!     "ae.safetensors",
//! )];
//! let all_ok = manager.download_all(&items).await;
//! println!("all ok: {all_ok}, failures: {:?}", manager.failure_report());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::driver::DriverTable;
use super::error::EngineError;
use super::item::DownloadItem;
use super::orchestrator::TransferOrchestrator;
use super::outcome::{AttemptOutcome, AttemptRecord, FailureRecord};
use super::progress::{LogLevel, ProgressSink, StatusUpdate};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_failure};
use super::source::Provider;
use crate::config::{EngineConfig, FailurePolicy};
use crate::credentials::Credentials;

/// Counters for one batch run.
///
/// Atomic so another task can read them while a batch is running.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    total: usize,
}

impl DownloadStats {
    /// Creates a tracker for a batch of `total` items.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Items transferred during this batch.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Items already present on disk.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Items recorded in the failure report.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made across all items.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Items in the batch, including ones never attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Items that ended up present on disk (completed + skipped).
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.completed() + self.skipped()
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a caller needs after a batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Per-batch counters.
    pub stats: DownloadStats,
    /// Items that failed for good.
    pub failures: Vec<FailureRecord>,
    /// True iff every item ultimately succeeded.
    pub success: bool,
    /// True if the batch stopped because of [`DownloadManager::cancel`].
    pub cancelled: bool,
}

impl BatchReport {
    /// Whether the batch should fail the surrounding install under `policy`.
    ///
    /// A cancelled batch is always fatal.
    #[must_use]
    pub fn is_fatal(&self, policy: FailurePolicy) -> bool {
        if self.cancelled {
            return true;
        }
        match policy {
            FailurePolicy::Strict => !self.success,
            FailurePolicy::Lenient => self.failures.iter().any(|failure| {
                classify_failure(&failure.stage, &failure.reason) == FailureType::Configuration
            }),
        }
    }
}

enum ItemResult {
    Succeeded,
    Failed,
    Cancelled,
}

/// Runs batches of [`DownloadItem`]s.
///
/// Share it behind an [`Arc`]: [`cancel`](Self::cancel) may be called from
/// any task while [`download_all`](Self::download_all) runs.
pub struct DownloadManager {
    orchestrator: TransferOrchestrator,
    retry_policy: RetryPolicy,
    cancelled: AtomicBool,
    batch_token: Mutex<CancellationToken>,
    failures: Mutex<Vec<FailureRecord>>,
    attempts: Mutex<Vec<AttemptRecord>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("orchestrator", &self.orchestrator)
            .field("retry_policy", &self.retry_policy)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager with the transports found on this machine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if an HTTP client cannot be built.
    #[instrument(level = "debug", skip_all)]
    pub fn new(
        config: &EngineConfig,
        credentials: Credentials,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, EngineError> {
        let drivers = DriverTable::discover(config)?;
        Self::with_drivers(config, credentials, drivers, sink)
    }

    /// Creates a manager with an explicit driver table.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if the redirect resolver cannot be built.
    pub fn with_drivers(
        config: &EngineConfig,
        credentials: Credentials,
        drivers: DriverTable,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, EngineError> {
        info!(
            models_dir = %config.models_dir.display(),
            speed_limit = config.speed_limit.as_deref().unwrap_or("unlimited"),
            aria2_connections = config.aria2_connections,
            aria2_splits = config.aria2_splits,
            aria2_min_split_size = %config.aria2_min_split_size,
            stall_timeout_secs = config.stall_timeout.map(|t| t.as_secs()),
            "download engine configured"
        );
        for (name, provider) in [("HF_TOKEN", Provider::HuggingFace), ("CIVITAI_TOKEN", Provider::Civitai)] {
            let token = credentials.token(provider);
            if token.is_present() {
                info!(source = token.source(), "{name} loaded ({})", token.masked());
            } else {
                info!("{name} not set");
            }
        }
        debug!(?drivers, "transport drivers");

        let orchestrator = TransferOrchestrator::new(config, Arc::new(credentials), drivers, sink)?;
        Ok(Self {
            orchestrator,
            retry_policy: RetryPolicy::default(),
            cancelled: AtomicBool::new(false),
            batch_token: Mutex::new(CancellationToken::new()),
            failures: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Downloads every item; true iff all of them ended up on disk.
    pub async fn download_all(&self, items: &[DownloadItem]) -> bool {
        self.download_batch(items).await.success
    }

    /// Downloads every item in order and returns the full report.
    ///
    /// Resets the failure report and attempt log. Individual failures never
    /// abort the batch; only [`cancel`](Self::cancel) does.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn download_batch(&self, items: &[DownloadItem]) -> BatchReport {
        let total = items.len();
        let token = self.start_batch();
        let stats = DownloadStats::new(total);
        self.report(format!("Starting download of {total} files"), 0, total);

        for (index, item) in items.iter().enumerate() {
            let position = index + 1;
            if self.is_cancelled() {
                return self.cancelled_report(stats, position, total);
            }
            if item.url.trim().is_empty() {
                warn!("[{position}/{total}] Skipping item with no URL");
                continue;
            }
            self.report(format!("[{position}/{total}] {}", item.display_name()), position, total);

            match self.run_item(item, &token, &stats).await {
                ItemResult::Succeeded | ItemResult::Failed => {}
                ItemResult::Cancelled => return self.cancelled_report(stats, position, total),
            }
        }

        let succeeded = stats.succeeded();
        self.report(format!("Downloaded {succeeded}/{total} files successfully"), total, total);
        let failures = self.failure_report();
        self.log_failure_summary(&failures);
        info!(
            completed = stats.completed(),
            skipped = stats.skipped(),
            failed = stats.failed(),
            retried = stats.retried(),
            total,
            "batch complete"
        );

        BatchReport {
            success: succeeded == total,
            stats,
            failures,
            cancelled: false,
        }
    }

    /// Runs the retry loop for one item.
    async fn run_item(&self, item: &DownloadItem, token: &CancellationToken, stats: &DownloadStats) -> ItemResult {
        let label = item.explicit_filename().unwrap_or(&item.url);
        let mut attempt = 0u32;

        loop {
            if self.is_cancelled() {
                return ItemResult::Cancelled;
            }
            attempt += 1;
            debug!(attempt, url = %item.url, "starting attempt");

            let outcome = self.orchestrator.transfer(item, token).await;
            self.record_attempt(item, &outcome);

            if outcome.success {
                if outcome.is_skip() {
                    stats.increment_skipped();
                } else {
                    stats.increment_completed();
                }
                return ItemResult::Succeeded;
            }
            if self.is_cancelled() {
                return ItemResult::Cancelled;
            }

            let failure_type = classify_failure(&outcome.stage, &outcome.reason);
            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    warn!(
                        delay_ms = delay.as_millis(),
                        "Download failed ({label}) [{}: {}], retrying ({attempt}/{})...",
                        outcome.stage,
                        outcome.reason,
                        self.retry_policy.max_attempts()
                    );
                    stats.increment_retried();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => return ItemResult::Cancelled,
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    if failure_type.is_retryable() {
                        error!("Failed to download after {attempt} attempts: {label}");
                    } else {
                        error!(%reason, "Non-retryable failure ({label}) [{}: {}]", outcome.stage, outcome.reason);
                    }
                    self.record_failure(item, outcome);
                    stats.increment_failed();
                    return ItemResult::Failed;
                }
            }
        }
    }

    /// Stops the running batch.
    ///
    /// Sets the cancellation flag, cancels the batch token, and kills the
    /// running transfer process if there is one. Safe to call from any task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.batch_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if self.orchestrator.slot().kill_current() {
            warn!("Killing active download process...");
        }
        info!("Download cancelled by user");
    }

    /// Whether [`cancel`](Self::cancel) was called since the batch started.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Failures recorded during the last batch.
    #[must_use]
    pub fn failure_report(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every orchestrator pass made during the last batch.
    #[must_use]
    pub fn attempt_log(&self) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn start_batch(&self) -> CancellationToken {
        self.cancelled.store(false, Ordering::SeqCst);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let token = CancellationToken::new();
        *self.batch_token.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn cancelled_report(&self, stats: DownloadStats, current: usize, total: usize) -> BatchReport {
        self.report("Download cancelled".to_string(), current, total);
        BatchReport {
            stats,
            failures: self.failure_report(),
            success: false,
            cancelled: true,
        }
    }

    fn report(&self, message: String, current: usize, total: usize) {
        info!("{message}");
        self.orchestrator.sink().status(&StatusUpdate {
            message,
            current,
            total,
        });
    }

    fn record_attempt(&self, item: &DownloadItem, outcome: &AttemptOutcome) {
        let record = AttemptRecord {
            url: item.url.clone(),
            method: outcome.stage.clone(),
            ok: outcome.success,
            reason: if outcome.success {
                String::new()
            } else {
                outcome.reason.clone()
            },
        };
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn record_failure(&self, item: &DownloadItem, outcome: AttemptOutcome) {
        let record = FailureRecord {
            filename: item.display_name().to_string(),
            dir: item.dir.clone(),
            url: item.url.clone(),
            stage: outcome.stage,
            reason: outcome.reason,
        };
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn log_failure_summary(&self, failures: &[FailureRecord]) {
        if failures.is_empty() {
            return;
        }
        let sink = self.orchestrator.sink();
        error!("Download failure summary:");
        sink.log(LogLevel::Error, "Download failure summary:");
        for (index, failure) in failures.iter().enumerate() {
            let line = format!(
                "[{}] file={} dir={} stage={} reason={} url={}",
                index + 1,
                failure.filename,
                failure.dir,
                failure.stage,
                failure.reason,
                failure.url
            );
            error!("{line}");
            sink.log(LogLevel::Error, &line);
        }
    }
}

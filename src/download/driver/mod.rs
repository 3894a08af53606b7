//! Transport drivers: one capability interface, four implementations.
//!
//! - [`HfCliDriver`] - the managed `hf download` CLI (HuggingFace only)
//! - [`HfHubDriver`] - in-process HuggingFace fallback over HTTP
//! - [`Aria2Driver`] - segmented, resumable, multi-connection `aria2c`
//! - [`WgetDriver`] - single-stream resumable `wget`
//!
//! Drivers are selected through a [`DriverTable`] keyed on [`Provider`]
//! rather than by branching at call sites. A driver never returns an error:
//! every failure becomes a failed [`AttemptOutcome`] with a greppable reason.

mod aria2;
mod hf_cli;
mod hf_hub;
mod wget;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use aria2::{Aria2Driver, parse_aria2_progress};
pub use hf_cli::{HfCliDriver, find_hf_cli, parse_tqdm_progress};
pub use hf_hub::HfHubDriver;
pub use wget::{WgetDriver, parse_wget_progress};

use super::error::EngineError;
use super::outcome::AttemptOutcome;
use super::process::ProcessSlot;
use super::progress::{ProgressEvent, ProgressLogThrottle, ProgressSink};
use super::source::Provider;
use crate::config::EngineConfig;
use crate::credentials::Credentials;

/// What to fetch and where to put it.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Effective download URL (normalized, resolved, token-augmented).
    pub url: &'a str,
    /// Destination directory (already created).
    pub dest_dir: &'a Path,
    /// Destination filename relative to `dest_dir`; `None` trusts the
    /// server's Content-Disposition.
    pub filename: Option<&'a str>,
    /// Name shown in progress events and logs.
    pub label: &'a str,
}

impl FetchRequest<'_> {
    /// Full destination path when the filename is known.
    #[must_use]
    pub fn dest_path(&self) -> Option<PathBuf> {
        self.filename.map(|name| self.dest_dir.join(name))
    }
}

/// Shared collaborators every driver may use during a fetch.
#[derive(Clone, Copy)]
pub struct FetchContext<'a> {
    /// Provider tokens (read-only).
    pub credentials: &'a Credentials,
    /// Where subprocess drivers register their child.
    pub slot: &'a ProcessSlot,
    /// Progress receiver.
    pub sink: &'a dyn ProgressSink,
    /// Batch cancellation.
    pub cancel: &'a CancellationToken,
}

/// A way of getting bytes from a URL onto disk.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Stage name recorded on outcomes (`aria2c`).
    fn name(&self) -> &'static str;

    /// Runs one transfer. Never panics and never returns an error value.
    async fn fetch(&self, request: &FetchRequest<'_>, ctx: &FetchContext<'_>) -> AttemptOutcome;
}

/// Provider-priority driver selection.
///
/// Native chains run first for their provider; the generic chain runs for
/// every item that is not already done, each link falling back to the next.
#[derive(Clone, Default)]
pub struct DriverTable {
    native: HashMap<Provider, Vec<Arc<dyn TransportDriver>>>,
    generic: Vec<Arc<dyn TransportDriver>>,
}

impl std::fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let native: HashMap<&Provider, Vec<&'static str>> = self
            .native
            .iter()
            .map(|(provider, chain)| (provider, chain.iter().map(|d| d.name()).collect()))
            .collect();
        f.debug_struct("DriverTable")
            .field("native", &native)
            .field("generic", &self.generic.iter().map(|d| d.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl DriverTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers installed tools and builds the standard table.
    ///
    /// HuggingFace: `hf-cli` (when found) then `hf-hub`. Generic: `aria2c`
    /// (when on `PATH`) then `wget`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if the in-process client cannot be built.
    pub fn discover(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut table = Self::new().with_huggingface_cli(find_hf_cli(&config.hf_cli_search_dirs), config)?;

        match which::which("aria2c") {
            Ok(program) => table = table.with_generic(Aria2Driver::new(program, config)),
            Err(_) => warn!("aria2c not found on PATH, using wget only"),
        }
        Ok(table.with_generic(WgetDriver::new("wget")))
    }

    /// Registers the HuggingFace native chain: the CLI, then the in-process
    /// fallback. Without a CLI the chain stays empty and HuggingFace items go
    /// straight to the generic chain.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the fallback's HTTP client cannot be built.
    pub fn with_huggingface_cli(self, cli: Option<PathBuf>, config: &EngineConfig) -> Result<Self, EngineError> {
        let Some(program) = cli else {
            warn!("HuggingFace CLI not found, HuggingFace downloads use the generic chain");
            return Ok(self);
        };
        info!(path = %program.display(), "HuggingFace CLI found");
        Ok(self
            .with_native(Provider::HuggingFace, HfCliDriver::new(program, config))
            .with_native(Provider::HuggingFace, HfHubDriver::new(config)?))
    }

    /// Appends a driver to `provider`'s native chain.
    #[must_use]
    pub fn with_native(mut self, provider: Provider, driver: impl TransportDriver + 'static) -> Self {
        self.native.entry(provider).or_default().push(Arc::new(driver));
        self
    }

    /// Appends a driver to the generic chain.
    #[must_use]
    pub fn with_generic(mut self, driver: impl TransportDriver + 'static) -> Self {
        self.generic.push(Arc::new(driver));
        self
    }

    /// Native chain for `provider` (possibly empty).
    #[must_use]
    pub fn native(&self, provider: Provider) -> &[Arc<dyn TransportDriver>] {
        self.native.get(&provider).map_or(&[], Vec::as_slice)
    }

    /// Generic chain.
    #[must_use]
    pub fn generic(&self) -> &[Arc<dyn TransportDriver>] {
        &self.generic
    }
}

/// A progress line parsed from tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProgress {
    /// Percent complete.
    pub percent: f64,
    /// Speed as printed (`110MiB/s`), possibly empty.
    pub speed: String,
    /// ETA as printed, possibly empty.
    pub eta: String,
    /// Extra detail for log lines (size info), possibly empty.
    pub detail: String,
}

/// Forwards parsed progress to the sink and the throttled log.
pub(crate) struct ProgressReporter<'a> {
    label: &'a str,
    sink: &'a dyn ProgressSink,
    throttle: ProgressLogThrottle,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(label: &'a str, sink: &'a dyn ProgressSink) -> Self {
        Self {
            label,
            sink,
            throttle: ProgressLogThrottle::new(),
        }
    }

    pub(crate) fn report(&mut self, parsed: &ParsedProgress) {
        let event = ProgressEvent {
            filename: self.label.to_string(),
            percent: parsed.percent,
            speed: parsed.speed.clone(),
            eta: parsed.eta.clone(),
        };
        self.sink.transfer(&event);
        self.throttle.log(&event, &parsed.detail);
    }
}

/// Formats a bytes-per-second rate the way transfer tools print it.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}/s", UNITS[unit])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl TransportDriver for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn fetch(&self, _request: &FetchRequest<'_>, _ctx: &FetchContext<'_>) -> AttemptOutcome {
            AttemptOutcome::succeeded(self.0)
        }
    }

    #[test]
    fn test_driver_table_chains_in_registration_order() {
        let table = DriverTable::new()
            .with_native(Provider::HuggingFace, Named("hf-cli"))
            .with_native(Provider::HuggingFace, Named("hf-hub"))
            .with_generic(Named("aria2c"))
            .with_generic(Named("wget"));

        let native: Vec<_> = table.native(Provider::HuggingFace).iter().map(|d| d.name()).collect();
        assert_eq!(native, vec!["hf-cli", "hf-hub"]);
        assert!(table.native(Provider::Civitai).is_empty());
        let generic: Vec<_> = table.generic().iter().map(|d| d.name()).collect();
        assert_eq!(generic, vec!["aria2c", "wget"]);
    }

    #[test]
    fn test_huggingface_chain_requires_cli() {
        let config = EngineConfig::default();
        let table = DriverTable::new().with_huggingface_cli(None, &config).unwrap();
        assert!(table.native(Provider::HuggingFace).is_empty());

        let table = DriverTable::new()
            .with_huggingface_cli(Some(PathBuf::from("/opt/venv/bin/hf")), &config)
            .unwrap();
        let native: Vec<_> = table.native(Provider::HuggingFace).iter().map(|d| d.name()).collect();
        assert_eq!(native, vec!["hf-cli", "hf-hub"]);
    }

    #[test]
    fn test_driver_table_debug_lists_names() {
        let table = DriverTable::new().with_generic(Named("wget"));
        assert!(format!("{table:?}").contains("wget"));
    }

    #[test]
    fn test_fetch_request_dest_path() {
        let request = FetchRequest {
            url: "https://example.com/a.bin",
            dest_dir: Path::new("/models/vae"),
            filename: Some("a.bin"),
            label: "a.bin",
        };
        assert_eq!(request.dest_path(), Some(PathBuf::from("/models/vae/a.bin")));
        let trusting = FetchRequest { filename: None, ..request };
        assert_eq!(trusting.dest_path(), None);
    }

    #[test]
    fn test_format_rate_units() {
        assert_eq!(format_rate(512.0), "512.0B/s");
        assert_eq!(format_rate(2048.0), "2.0KB/s");
        assert_eq!(format_rate(3.5 * 1024.0 * 1024.0), "3.5MB/s");
    }
}

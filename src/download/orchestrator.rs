//! One pass of the per-item transfer state machine.
//!
//! normalize → destination → filename → skip check → precheck → native
//! provider chain → redirect resolution or token augmentation → generic chain.
//! Retries are owned by the batch manager around this pass.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::driver::{DriverTable, FetchContext, FetchRequest, TransportDriver};
use super::error::EngineError;
use super::filename::{
    PLACEHOLDER_FILENAME, filename_from_redirect_url, filename_from_url, is_safe_relative_path,
};
use super::item::DownloadItem;
use super::outcome::{AttemptOutcome, chain_stage, reason, stage};
use super::process::ProcessSlot;
use super::progress::ProgressSink;
use super::resolve::RedirectResolver;
use super::source::{Provider, normalize_source_url, with_civitai_token};
use crate::config::EngineConfig;
use crate::credentials::Credentials;

/// Drivers tried so far for one item, with their failure reasons.
#[derive(Debug, Default)]
struct ChainTrace {
    names: Vec<&'static str>,
    reasons: Vec<String>,
}

impl ChainTrace {
    fn stage(&self) -> String {
        chain_stage(&self.names)
    }

    fn exhausted(self) -> AttemptOutcome {
        if self.names.is_empty() {
            return AttemptOutcome::failed(stage::PRECHECK, reason::NO_TRANSPORT);
        }
        let stage = self.stage();
        AttemptOutcome::failed(stage, self.reasons.join(reason::CHAIN_JOIN))
    }
}

/// Where an item lands once its filename is known.
struct Target {
    dest_dir: PathBuf,
    filename: Option<String>,
}

impl Target {
    fn path(&self) -> Option<PathBuf> {
        self.filename.as_ref().map(|name| self.dest_dir.join(name))
    }

    fn label(&self) -> &str {
        self.filename.as_deref().unwrap_or(PLACEHOLDER_FILENAME)
    }
}

/// Runs one transfer pass for an item.
///
/// Owns the [`ProcessSlot`] so a control-plane caller can kill the running
/// tool through the batch manager.
pub struct TransferOrchestrator {
    models_dir: PathBuf,
    credentials: Arc<Credentials>,
    drivers: DriverTable,
    resolver: RedirectResolver,
    slot: ProcessSlot,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("models_dir", &self.models_dir)
            .field("credentials", &self.credentials)
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if the redirect resolver cannot be built.
    pub fn new(
        config: &EngineConfig,
        credentials: Arc<Credentials>,
        drivers: DriverTable,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            models_dir: config.models_dir.clone(),
            credentials,
            drivers,
            resolver: RedirectResolver::new(Provider::Civitai, config.resolve_timeout)?,
            slot: ProcessSlot::new(),
            sink,
        })
    }

    /// The running-process slot.
    #[must_use]
    pub fn slot(&self) -> &ProcessSlot {
        &self.slot
    }

    /// The progress sink.
    #[must_use]
    pub fn sink(&self) -> &dyn ProgressSink {
        self.sink.as_ref()
    }

    /// Runs one pass for `item`.
    ///
    /// Never returns an error: every failure is a failed [`AttemptOutcome`].
    #[instrument(skip_all, fields(url = %item.url, dir = %item.dir))]
    pub async fn transfer(&self, item: &DownloadItem, cancel: &CancellationToken) -> AttemptOutcome {
        let url = normalize_source_url(&item.url);
        let provider = Provider::detect(&url);

        let mut target = match self.prepare_target(item, provider, &url).await {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        if let Some(path) = target.path()
            && path.exists()
        {
            info!("✓ Already exists: {}", target.label());
            return AttemptOutcome::already_exists();
        }

        let token = self.credentials.token(provider);
        if provider.requires_token() && !token.is_present() {
            error!("{}", reason::CIVITAI_TOKEN_MISSING);
            return AttemptOutcome::failed(stage::PRECHECK, reason::CIVITAI_TOKEN_MISSING);
        }

        let ctx = FetchContext {
            credentials: &self.credentials,
            slot: &self.slot,
            sink: self.sink.as_ref(),
            cancel,
        };
        let mut trace = ChainTrace::default();

        let native = self.drivers.native(provider);
        if !native.is_empty() {
            if let Some(outcome) = run_chain(native, &url, &target, &ctx, &mut trace).await {
                return outcome;
            }
            debug!(chain = %trace.stage(), "native chain failed, falling through to generic transports");
        }

        let effective_url: Cow<'_, str> = if provider.resolves_redirects() {
            let resolved = match self.resolver.resolve(&url, token).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    let failure = e.to_string();
                    error!(reason = %failure, "{} URL resolution failed", provider.name());
                    return AttemptOutcome::failed(stage::CIVITAI_RESOLVE, failure);
                }
            };
            if target.filename.is_none() {
                target.filename = redirect_filename(&resolved, &url);
                if let Some(name) = &target.filename
                    && !is_safe_relative_path(name)
                {
                    return AttemptOutcome::failed(stage::PRECHECK, reason::UNSAFE_PATH);
                }
            }
            if let Some(path) = target.path()
                && path.exists()
            {
                info!("✓ Already exists: {}", target.label());
                return AttemptOutcome::already_exists();
            }
            if resolved != url.as_ref() {
                info!("Resolved {} download URL via authenticated redirect", provider.name());
            }
            Cow::Owned(resolved)
        } else {
            with_civitai_token(&url, self.credentials.civitai())
        };

        if let Some(path) = target.path()
            && let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(path = %parent.display(), error = %e, "cannot create destination directory");
            return AttemptOutcome::failed(stage::PRECHECK, format!("{}: {e}", reason::DEST_DIR_UNAVAILABLE));
        }

        match run_chain(self.drivers.generic(), &effective_url, &target, &ctx, &mut trace).await {
            Some(outcome) => outcome,
            None => trace.exhausted(),
        }
    }

    /// Steps 1-3: validate paths, create the destination directory, pick the filename.
    async fn prepare_target(
        &self,
        item: &DownloadItem,
        provider: Provider,
        url: &str,
    ) -> Result<Target, AttemptOutcome> {
        let dir = item.dir.trim();
        if !dir.is_empty() && !is_safe_relative_path(dir) {
            error!(dir, "refusing item directory outside the models root");
            return Err(AttemptOutcome::failed(stage::PRECHECK, reason::UNSAFE_PATH));
        }
        let explicit = item.explicit_filename();
        if let Some(name) = explicit
            && !is_safe_relative_path(name)
        {
            error!(filename = name, "refusing filename outside the destination directory");
            return Err(AttemptOutcome::failed(stage::PRECHECK, reason::UNSAFE_PATH));
        }

        let dest_dir = self.models_dir.join(dir);
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            error!(path = %dest_dir.display(), error = %e, "cannot create destination directory");
            return Err(AttemptOutcome::failed(
                stage::PRECHECK,
                format!("{}: {e}", reason::DEST_DIR_UNAVAILABLE),
            ));
        }

        let filename = match explicit {
            Some(name) => Some(name.to_string()),
            // The real name is only known after redirect resolution.
            None if provider.resolves_redirects() => None,
            None => Some(filename_from_url(url)),
        };
        Ok(Target { dest_dir, filename })
    }
}

/// Picks the filename after redirect resolution.
///
/// Disposition hint in the resolved URL, else the heuristic over the source
/// URL; `None` (trust the server) if only the placeholder is left.
fn redirect_filename(resolved: &str, source: &str) -> Option<String> {
    filename_from_redirect_url(resolved).or_else(|| {
        let heuristic = filename_from_url(source);
        (heuristic != PLACEHOLDER_FILENAME).then_some(heuristic)
    })
}

/// Runs `chain` in order until one driver succeeds.
async fn run_chain(
    chain: &[Arc<dyn TransportDriver>],
    url: &str,
    target: &Target,
    ctx: &FetchContext<'_>,
    trace: &mut ChainTrace,
) -> Option<AttemptOutcome> {
    let request = FetchRequest {
        url,
        dest_dir: &target.dest_dir,
        filename: target.filename.as_deref(),
        label: target.label(),
    };
    for driver in chain {
        if ctx.cancel.is_cancelled() {
            trace.names.push(driver.name());
            trace.reasons.push(reason::CANCELLED.to_string());
            return Some(AttemptOutcome::failed(trace.stage(), reason::CANCELLED));
        }
        trace.names.push(driver.name());
        let outcome = driver.fetch(&request, ctx).await;
        debug!(driver = driver.name(), ok = outcome.success, reason = %outcome.reason, "transport attempt finished");
        if outcome.success {
            return Some(AttemptOutcome::succeeded(trace.stage()));
        }
        trace.reasons.push(outcome.reason);
    }
    None
}

//! HuggingFace downloads through the managed `hf download` CLI.
//!
//! The CLI picks the hf_xet backend when installed; the environment asks it
//! for high-performance mode and keeps tqdm progress bars on.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use super::{FetchContext, FetchRequest, ParsedProgress, ProgressReporter, TransportDriver};
use crate::config::EngineConfig;
use crate::download::outcome::{AttemptOutcome, reason};
use crate::download::process::{RunLimits, ToolCommand, run_streaming};
use crate::download::source::HfFileRef;

const TOOL: &str = "hf-cli";

/// Executable names tried in each search directory, in order.
const CLI_NAMES: [&str; 2] = ["hf", "huggingface-cli"];

/// `model.safetensors: 45%|████▌     | 1.23G/2.75G [00:12<00:15, 102MB/s]`
#[allow(clippy::expect_used)]
static TQDM_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)%\|[^|]*\|\s*([^\[]*)\[([^\]]*)\]")
        .expect("tqdm progress regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TQDM_SPEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\d\.]+\s*\w+/s)").expect("tqdm speed regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TQDM_ETA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([\d:]+)").expect("tqdm eta regex is valid") // Static pattern, safe to panic
});

/// Parses one tqdm progress line.
#[must_use]
pub fn parse_tqdm_progress(line: &str) -> Option<ParsedProgress> {
    let captures = TQDM_PROGRESS.captures(line)?;
    let timing = &captures[3];
    Some(ParsedProgress {
        percent: captures[1].parse().ok()?,
        speed: TQDM_SPEED
            .captures(timing)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
        eta: TQDM_ETA
            .captures(timing)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
        detail: captures[2].trim().to_string(),
    })
}

/// Finds the HuggingFace CLI.
///
/// Searches each of `search_dirs` for `hf` then `huggingface-cli`, then `PATH`.
#[must_use]
pub fn find_hf_cli(search_dirs: &[PathBuf]) -> Option<PathBuf> {
    search_dirs
        .iter()
        .flat_map(|dir| CLI_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
        .or_else(|| CLI_NAMES.iter().find_map(|name| which::which(name).ok()))
}

/// Drives `hf download <repo> <path> --revision <rev> --local-dir <dir>`.
#[derive(Debug, Clone)]
pub struct HfCliDriver {
    program: PathBuf,
    xet_range_gets: u32,
    hub_timeout: Duration,
}

impl HfCliDriver {
    /// Creates a driver running `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            program: program.into(),
            xet_range_gets: config.hf_xet_range_gets,
            hub_timeout: config.hf_hub_timeout,
        }
    }

    fn command(&self, file: &HfFileRef, dest_dir: &Path, token: &str) -> ToolCommand {
        let mut command = ToolCommand::new(TOOL, &self.program)
            .arg("download")
            .arg(file.repo_id.as_str())
            .arg(file.path.as_str())
            .arg("--revision")
            .arg(file.revision.as_str())
            .arg("--local-dir")
            .arg(dest_dir.to_string_lossy())
            .secret(token);
        if !token.is_empty() {
            command = command.arg("--token").arg(token);
        }
        command
            .env("HF_XET_HIGH_PERFORMANCE", "1")
            .env("HF_XET_NUM_CONCURRENT_RANGE_GETS", self.xet_range_gets.to_string())
            .env("HF_HUB_ENABLE_HF_TRANSFER", "1")
            .env("HF_HUB_DOWNLOAD_TIMEOUT", self.hub_timeout.as_secs().to_string())
            .env_remove("HF_HUB_DISABLE_PROGRESS_BARS")
    }
}

/// Moves the CLI's `<local-dir>/<repo path>` output to the requested name.
async fn place_output(dest_dir: &Path, repo_path: &str, filename: Option<&str>) -> std::io::Result<()> {
    let Some(filename) = filename else {
        return Ok(());
    };
    let downloaded = dest_dir.join(repo_path);
    let target = dest_dir.join(filename);
    if downloaded == target || !tokio::fs::try_exists(&downloaded).await.unwrap_or(false) {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&downloaded, &target).await?;
    debug!(from = %downloaded.display(), to = %target.display(), "moved CLI output to requested name");
    prune_empty_parents(dest_dir, repo_path).await;
    Ok(())
}

/// Removes the now-empty `<repo path>` directories left after a move. Best effort.
async fn prune_empty_parents(dest_dir: &Path, repo_path: &str) {
    for dir in Path::new(repo_path).ancestors().skip(1) {
        if dir.as_os_str().is_empty() {
            break;
        }
        let full = dest_dir.join(dir);
        if let Err(e) = tokio::fs::remove_dir(&full).await {
            debug!(path = %full.display(), error = %e, "keeping CLI output directory");
            break;
        }
    }
}

/// Removes the CLI's `.cache/huggingface` metadata under `dest_dir`. Best effort.
async fn prune_cli_cache(dest_dir: &Path) {
    let cache_root = dest_dir.join(".cache");
    let cache = cache_root.join("huggingface");
    if !tokio::fs::try_exists(&cache).await.unwrap_or(false) {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(&cache).await {
        warn!(path = %cache.display(), error = %e, "cannot remove HF CLI cache");
        return;
    }
    if let Err(e) = tokio::fs::remove_dir(&cache_root).await {
        debug!(path = %cache_root.display(), error = %e, "keeping .cache directory");
    }
}

#[async_trait]
impl TransportDriver for HfCliDriver {
    fn name(&self) -> &'static str {
        TOOL
    }

    #[instrument(skip_all, fields(file = request.label))]
    async fn fetch(&self, request: &FetchRequest<'_>, ctx: &FetchContext<'_>) -> AttemptOutcome {
        let Some(file) = HfFileRef::parse(request.url) else {
            warn!(url = request.url, "could not parse HuggingFace URL");
            return AttemptOutcome::failed(TOOL, reason::INVALID_HF_URL);
        };
        info!("Downloading from HuggingFace: {}/{}", file.repo_id, file.path);

        let command = self.command(&file, request.dest_dir, ctx.credentials.huggingface());
        let mut reporter = ProgressReporter::new(request.label, ctx.sink);

        let limits = RunLimits {
            stall_timeout: None,
            slot: ctx.slot,
            cancel: ctx.cancel,
        };
        let run = run_streaming(&command, limits, |line| match parse_tqdm_progress(line) {
            Some(parsed) => {
                reporter.report(&parsed);
                true
            }
            None => {
                if !line.starts_with('|') && !line.contains("%|") {
                    debug!("  [hf] {line}");
                }
                false
            }
        })
        .await;

        let outcome = run.into_outcome(TOOL);
        if !outcome.success {
            error!(reason = %outcome.reason, "HF download failed");
            return outcome;
        }

        if let Err(e) = place_output(request.dest_dir, &file.path, request.filename).await {
            error!(error = %e, "failed to move HF CLI output");
            return AttemptOutcome::failed(TOOL, format!("hf_cli_move_failed: {e}"));
        }
        prune_cli_cache(request.dest_dir).await;
        info!("✓ Downloaded from HF: {}", request.label);
        outcome
    }
}

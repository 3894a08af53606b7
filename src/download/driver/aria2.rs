//! Segmented downloads through `aria2c`.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error, info, instrument};

use super::{FetchContext, FetchRequest, ParsedProgress, ProgressReporter, TransportDriver};
use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::download::outcome::AttemptOutcome;
use crate::download::process::{RunLimits, ToolCommand, run_streaming};
use crate::download::resolve::{CIVITAI_ACCEPT, CIVITAI_REFERER};
use crate::download::source::Provider;
use crate::user_agent::HTTP_USER_AGENT;

const TOOL: &str = "aria2c";

/// `[#2089b0 27MiB/91MiB(29%) CN:8 DL:110MiB ETA:1s]`
#[allow(clippy::expect_used)]
static ARIA2_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(([\d\.]+)%\).*DL:([\d\.]+\w+)(?:.*?ETA:([\d\w]+))?")
        .expect("aria2 progress regex is valid") // Static pattern, safe to panic
});

/// Parses one aria2c summary line.
#[must_use]
pub fn parse_aria2_progress(line: &str) -> Option<ParsedProgress> {
    let captures = ARIA2_PROGRESS.captures(line)?;
    let percent = captures[1].parse().ok()?;
    Some(ParsedProgress {
        percent,
        speed: format!("{}/s", &captures[2]),
        eta: captures.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
        detail: String::new(),
    })
}

/// Tracks forward progress for stall detection.
///
/// A line counts as progress if the percent moved up, or the reported
/// throughput is nonzero.
#[derive(Debug, Default)]
struct ForwardProgress {
    last_percent: f64,
}

impl ForwardProgress {
    fn observe(&mut self, parsed: &ParsedProgress) -> bool {
        if parsed.percent > self.last_percent + 0.01 {
            self.last_percent = parsed.percent;
            return true;
        }
        !parsed.speed.starts_with("0B")
    }
}

/// Drives `aria2c -c -x N -s N ...`.
#[derive(Debug, Clone)]
pub struct Aria2Driver {
    program: PathBuf,
    connections: u32,
    splits: u32,
    min_split_size: String,
    speed_limit: Option<String>,
    stall_timeout: Option<Duration>,
}

impl Aria2Driver {
    /// Creates a driver running `program` with tuning from `config`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            program: program.into(),
            connections: config.aria2_connections,
            splits: config.aria2_splits,
            min_split_size: config.aria2_min_split_size.clone(),
            speed_limit: config.speed_limit.clone(),
            stall_timeout: config.stall_timeout,
        }
    }

    fn command(&self, request: &FetchRequest<'_>, credentials: &Credentials) -> ToolCommand {
        let mut command = ToolCommand::new(TOOL, &self.program)
            .arg("-c")
            .arg("-x")
            .arg(self.connections.to_string())
            .arg("-s")
            .arg(self.splits.to_string())
            .arg(format!("--max-connection-per-server={}", self.connections))
            .arg(format!("--min-split-size={}", self.min_split_size))
            .arg("--file-allocation=none")
            .arg("--console-log-level=notice")
            .arg("--summary-interval=1")
            .arg("--dir")
            .arg(request.dest_dir.to_string_lossy())
            .secret(credentials.huggingface())
            .secret(credentials.civitai());

        for header in provider_headers(request.url, credentials) {
            command = command.arg("--header").arg(header);
        }

        if let Some(limit) = &self.speed_limit {
            command = command.arg("--max-download-limit").arg(limit.as_str());
        }

        command = match request.filename {
            Some(filename) => command.arg("--out").arg(filename),
            None => command
                .arg("--content-disposition=true")
                .arg("--auto-file-renaming=false"),
        };

        command.arg(request.url)
    }
}

fn provider_headers(url: &str, credentials: &Credentials) -> Vec<String> {
    let mut headers = Vec::new();
    match Provider::detect(url) {
        Provider::HuggingFace => {
            if !credentials.huggingface().is_empty() {
                headers.push(format!("Authorization: Bearer {}", credentials.huggingface()));
            }
            headers.push(format!("User-Agent: {HTTP_USER_AGENT}"));
        }
        Provider::Civitai => {
            if !credentials.civitai().is_empty() {
                headers.push(format!("Authorization: Bearer {}", credentials.civitai()));
            }
            headers.push(format!("User-Agent: {HTTP_USER_AGENT}"));
            headers.push(format!("Accept: {CIVITAI_ACCEPT}"));
            headers.push(format!("Referer: {CIVITAI_REFERER}"));
        }
        Provider::Direct => {}
    }
    headers
}

#[async_trait]
impl TransportDriver for Aria2Driver {
    fn name(&self) -> &'static str {
        TOOL
    }

    #[instrument(skip_all, fields(file = request.label))]
    async fn fetch(&self, request: &FetchRequest<'_>, ctx: &FetchContext<'_>) -> AttemptOutcome {
        let command = self.command(request, ctx.credentials);
        let mut reporter = ProgressReporter::new(request.label, ctx.sink);
        let mut forward = ForwardProgress::default();

        let limits = RunLimits {
            stall_timeout: self.stall_timeout,
            slot: ctx.slot,
            cancel: ctx.cancel,
        };
        let run = run_streaming(&command, limits, |line| match parse_aria2_progress(line) {
            Some(parsed) => {
                reporter.report(&parsed);
                forward.observe(&parsed)
            }
            None => {
                if !line.starts_with("[#") && !line.starts_with("***") {
                    debug!("  [aria2c] {line}");
                }
                false
            }
        })
        .await;

        let outcome = run.into_outcome(TOOL);
        if outcome.success {
            info!("✓ Downloaded: {}", request.label);
        } else {
            error!(reason = %outcome.reason, "aria2c failed");
        }
        outcome
    }
}

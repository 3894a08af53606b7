//! Single-stream fallback through `wget`.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{error, info, instrument};

use super::{FetchContext, FetchRequest, ParsedProgress, ProgressReporter, TransportDriver};
use crate::credentials::Credentials;
use crate::download::outcome::AttemptOutcome;
use crate::download::process::{RunLimits, ToolCommand, run_streaming};
use crate::download::resolve::CIVITAI_REFERER;
use crate::download::source::Provider;
use crate::user_agent::HTTP_USER_AGENT;

const TOOL: &str = "wget";

/// ` 52% [============>           ] 14,833,969  21.3MB/s  eta 1s`
#[allow(clippy::expect_used)]
static WGET_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)%.*?([\d\.]+[KMG]B/s).*?eta\s+([\w\d]+)")
        .expect("wget progress regex is valid") // Static pattern, safe to panic
});

/// Parses one `--progress=bar:force` line.
#[must_use]
pub fn parse_wget_progress(line: &str) -> Option<ParsedProgress> {
    let captures = WGET_PROGRESS.captures(line)?;
    Some(ParsedProgress {
        percent: captures[1].parse().ok()?,
        speed: captures[2].to_string(),
        eta: captures[3].to_string(),
        detail: String::new(),
    })
}

/// Drives `wget --progress=bar:force -c --content-disposition ...`.
#[derive(Debug, Clone)]
pub struct WgetDriver {
    program: PathBuf,
}

impl WgetDriver {
    /// Creates a driver running `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &FetchRequest<'_>, credentials: &Credentials) -> ToolCommand {
        let mut command = ToolCommand::new(TOOL, &self.program)
            .arg("--progress=bar:force")
            .arg("-c")
            .arg("--content-disposition")
            .secret(credentials.huggingface())
            .secret(credentials.civitai());

        match Provider::detect(request.url) {
            Provider::HuggingFace => {
                if !credentials.huggingface().is_empty() {
                    command = command
                        .arg("--header")
                        .arg(format!("Authorization: Bearer {}", credentials.huggingface()));
                }
                command = command.arg("--user-agent").arg(HTTP_USER_AGENT);
            }
            Provider::Civitai => {
                if !credentials.civitai().is_empty() {
                    command = command
                        .arg("--header")
                        .arg(format!("Authorization: Bearer {}", credentials.civitai()));
                }
                command = command
                    .arg("--user-agent")
                    .arg(HTTP_USER_AGENT)
                    .arg("--header")
                    .arg(format!("Referer: {CIVITAI_REFERER}"));
            }
            Provider::Direct => {}
        }

        command = match request.dest_path() {
            Some(path) => command.arg("-O").arg(path.to_string_lossy()),
            None => command.arg("-P").arg(request.dest_dir.to_string_lossy()),
        };

        command.arg(request.url)
    }
}

#[async_trait]
impl TransportDriver for WgetDriver {
    fn name(&self) -> &'static str {
        TOOL
    }

    #[instrument(skip_all, fields(file = request.label))]
    async fn fetch(&self, request: &FetchRequest<'_>, ctx: &FetchContext<'_>) -> AttemptOutcome {
        let command = self.command(request, ctx.credentials);
        let mut reporter = ProgressReporter::new(request.label, ctx.sink);

        let limits = RunLimits {
            stall_timeout: None,
            slot: ctx.slot,
            cancel: ctx.cancel,
        };
        let run = run_streaming(&command, limits, |line| {
            parse_wget_progress(line).is_some_and(|parsed| {
                reporter.report(&parsed);
                true
            })
        })
        .await;

        let outcome = run.into_outcome(TOOL);
        if outcome.success {
            info!("✓ Downloaded: {}", request.label);
        } else {
            error!(reason = %outcome.reason, "wget failed");
        }
        outcome
    }
}

//! In-process HuggingFace fallback.
//!
//! Streams the canonical `resolve` URL to `<target>.part`, resuming with a
//! `Range` request when a partial file exists, then renames it into place.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, instrument, warn};

use super::{FetchContext, FetchRequest, ParsedProgress, ProgressReporter, TransportDriver, format_rate};
use crate::config::EngineConfig;
use crate::download::constants::CONNECT_TIMEOUT_SECS;
use crate::download::error::{DownloadError, EngineError};
use crate::download::outcome::{AttemptOutcome, reason};
use crate::download::source::HfFileRef;
use crate::user_agent::default_http_user_agent;

const TOOL: &str = "hf-hub";

/// Fetches HuggingFace files over HTTP without the CLI.
#[derive(Debug, Clone)]
pub struct HfHubDriver {
    client: Client,
    endpoint: String,
}

impl HfHubDriver {
    /// Creates the driver using `config.hf_endpoint` and `config.hf_hub_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(default_http_user_agent())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(config.hf_hub_timeout)
            .build()
            .map_err(EngineError::HttpClient)?;
        Ok(Self {
            client,
            endpoint: config.hf_endpoint.clone(),
        })
    }

    async fn download(
        &self,
        file: &HfFileRef,
        target: &Path,
        ctx: &FetchContext<'_>,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<u64, DownloadError> {
        let url = file.resolve_url(&self.endpoint);
        let part = part_path(target);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let existing = tokio::fs::metadata(&part).await.map_or(0, |m| m.len());
        let mut request = self.client.get(&url);
        let token = ctx.credentials.huggingface();
        if !token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let response = request.send().await.map_err(|e| map_request_error(&url, e))?;
        let status = response.status().as_u16();
        let resumed = status == 206 && existing > 0;
        if status == 416 && existing > 0 {
            if unsatisfied_range_total(response.headers()) == Some(existing) {
                info!(bytes = existing, "partial file already complete");
                tokio::fs::rename(&part, target)
                    .await
                    .map_err(|e| DownloadError::io(target, e))?;
                return Ok(existing);
            }
            // Stale partial; start over next attempt.
            if let Err(e) = tokio::fs::remove_file(&part).await {
                warn!(path = %part.display(), error = %e, "cannot remove stale partial file");
            }
        }
        if !(status == 200 || status == 206) {
            return Err(DownloadError::http_status(&url, status));
        }

        let body_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let offset = if resumed { existing } else { 0 };
        let expected = body_length.map(|len| len + offset);
        debug!(status, resumed, offset, ?expected, "streaming HuggingFace file");

        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        let mut writer = BufWriter::new(handle);

        let mut stream = response.bytes_stream();
        let mut written = offset;
        let started = Instant::now();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                () = ctx.cancel.cancelled() => return Err(DownloadError::cancelled(&url)),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| map_request_error(&url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(&part, e))?;
            written += chunk.len() as u64;
            if let Some(total) = expected {
                reporter.report(&progress_line(written, offset, total, started.elapsed()));
            }
        }
        writer.flush().await.map_err(|e| DownloadError::io(&part, e))?;

        if let Some(total) = expected
            && total != written
        {
            return Err(DownloadError::integrity(&part, total, written));
        }

        tokio::fs::rename(&part, target)
            .await
            .map_err(|e| DownloadError::io(target, e))?;
        Ok(written)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Total size from a 416 `Content-Range: bytes */<total>`.
fn unsatisfied_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .trim()
        .strip_prefix("bytes */")?
        .parse()
        .ok()
}

fn map_request_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

#[allow(clippy::cast_precision_loss)]
fn progress_line(written: u64, offset: u64, total: u64, elapsed: Duration) -> ParsedProgress {
    let percent = if total == 0 {
        100.0
    } else {
        written as f64 * 100.0 / total as f64
    };
    let secs = elapsed.as_secs_f64().max(0.001);
    let rate = (written - offset) as f64 / secs;
    let eta = if rate > 0.0 {
        format!("{:.0}s", (total.saturating_sub(written)) as f64 / rate)
    } else {
        String::new()
    };
    ParsedProgress {
        percent,
        speed: format_rate(rate),
        eta,
        detail: format!("{written}/{total}"),
    }
}

#[async_trait]
impl TransportDriver for HfHubDriver {
    fn name(&self) -> &'static str {
        TOOL
    }

    #[instrument(skip_all, fields(file = request.label))]
    async fn fetch(&self, request: &FetchRequest<'_>, ctx: &FetchContext<'_>) -> AttemptOutcome {
        let Some(file) = HfFileRef::parse(request.url) else {
            return AttemptOutcome::failed(TOOL, reason::INVALID_HF_URL);
        };
        info!("Fallback: downloading over HTTP: {}/{}", file.repo_id, file.path);

        let filename = request.filename.map_or_else(
            || {
                file.path
                    .rsplit('/')
                    .next()
                    .unwrap_or(file.path.as_str())
                    .to_string()
            },
            str::to_string,
        );
        let target = request.dest_dir.join(&filename);
        let mut reporter = ProgressReporter::new(request.label, ctx.sink);

        match self.download(&file, &target, ctx, &mut reporter).await {
            Ok(bytes) => {
                info!(bytes, "✓ Downloaded over HTTP: {}", request.label);
                AttemptOutcome::succeeded(TOOL)
            }
            Err(e) => {
                error!(error = %e, "HuggingFace HTTP fallback failed");
                AttemptOutcome::failed(TOOL, format!("{}: {e}", reason::HF_HUB_EXCEPTION))
            }
        }
    }
}

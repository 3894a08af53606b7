//! Progress events and sinks.
//!
//! Drivers report every parsed progress line to a [`ProgressSink`]; the batch
//! manager reports per-item status lines. Delivery is best-effort: a sink must
//! never block a transfer or fail it.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use super::constants::{PROGRESS_LOG_INTERVAL, PROGRESS_LOG_PERCENT_STEP};

/// One parsed progress line from a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Destination filename (the item identifier shown to users).
    pub filename: String,
    /// Percent complete, 0 to 100.
    pub percent: f64,
    /// Instantaneous speed as printed by the tool (`102MB/s`), possibly empty.
    pub speed: String,
    /// Remaining time as printed by the tool, possibly empty.
    pub eta: String,
}

/// Batch-level status line (`[2/5] model.safetensors`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    /// Human-readable message.
    pub message: String,
    /// 1-based index of the current item (total once finished).
    pub current: usize,
    /// Items in the batch.
    pub total: usize,
}

/// Receives progress and status notifications.
pub trait ProgressSink: Send + Sync {
    /// Called for every parsed progress line.
    fn transfer(&self, event: &ProgressEvent);

    /// Called for batch status changes.
    fn status(&self, update: &StatusUpdate);

    /// Human-readable log line (failure summaries, warnings).
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Severity of a [`ProgressSink::log`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Something failed but the batch continues.
    Warning,
    /// An item failed for good.
    Error,
}

/// A log line as forwarded to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn transfer(&self, _event: &ProgressEvent) {}

    fn status(&self, _update: &StatusUpdate) {}
}

/// Events as forwarded to control-plane subscribers (browser WebSocket clients).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// Live transfer progress.
    DownloadProgress(ProgressEvent),
    /// Batch status.
    Status(StatusUpdate),
    /// Human-readable log line.
    Log(LogLine),
}

/// Publishes events on a tokio broadcast channel.
///
/// Sending with no subscribers, or to lagging subscribers, is silently
/// dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<DownloadEvent>,
}

impl BroadcastSink {
    /// Creates a sink and its first receiver.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<DownloadEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Adds another subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn transfer(&self, event: &ProgressEvent) {
        let _ = self
            .sender
            .send(DownloadEvent::DownloadProgress(event.clone()));
    }

    fn status(&self, update: &StatusUpdate) {
        let _ = self.sender.send(DownloadEvent::Status(update.clone()));
    }

    fn log(&self, level: LogLevel, message: &str) {
        let _ = self.sender.send(DownloadEvent::Log(LogLine {
            level,
            message: message.to_string(),
        }));
    }
}

/// Throttles progress log lines to every ~10% or every 15 seconds.
#[derive(Debug)]
pub struct ProgressLogThrottle {
    last_percent: f64,
    last_logged: Instant,
}

impl Default for ProgressLogThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLogThrottle {
    /// Starts a throttle that logs the first observed line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_percent: -PROGRESS_LOG_PERCENT_STEP,
            last_logged: Instant::now(),
        }
    }

    /// Returns true (and records the line) when a log line is due.
    pub fn should_log(&mut self, percent: f64) -> bool {
        self.should_log_at(percent, Instant::now())
    }

    fn should_log_at(&mut self, percent: f64, now: Instant) -> bool {
        let due = percent - self.last_percent >= PROGRESS_LOG_PERCENT_STEP
            || now.duration_since(self.last_logged) > PROGRESS_LOG_INTERVAL;
        if due {
            self.last_percent = percent;
            self.last_logged = now;
        }
        due
    }

    /// Emits an `info!` line for `event` if one is due.
    pub fn log(&mut self, event: &ProgressEvent, detail: &str) {
        if !self.should_log(event.percent) {
            return;
        }
        let speed = if event.speed.is_empty() {
            String::new()
        } else {
            format!(" @ {}", event.speed)
        };
        let eta = if event.eta.is_empty() {
            String::new()
        } else {
            format!(" ETA {}", event.eta)
        };
        info!(
            "  ↓ {}: {:.0}%{}{}{}",
            event.filename,
            event.percent,
            if detail.is_empty() { String::new() } else { format!(" {detail}") },
            speed,
            eta
        );
    }
}

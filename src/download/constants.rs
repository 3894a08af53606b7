//! Constants for the download module (timeouts, tuning defaults, log cadence).

use std::time::Duration;

/// Maximum attempts per download item, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Default HTTP connect timeout for in-process requests (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the authenticated redirect-resolution request (30 seconds).
pub const RESOLVE_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for the in-process HuggingFace fallback (2 minutes).
pub const HF_HUB_TIMEOUT_SECS: u64 = 120;

/// Default time without forward progress before a transfer tool is killed.
pub const STALL_TIMEOUT_SECS: u64 = 120;

/// Default aria2c connections per server (also the default split count).
pub const ARIA2_CONNECTIONS: u32 = 16;

/// Default aria2c minimum split size.
pub const ARIA2_MIN_SPLIT_SIZE: &str = "1M";

/// Default concurrent range GETs for the hf_xet backend.
pub const HF_XET_RANGE_GETS: u32 = 32;

/// Number of trailing tool output lines kept for failure reasons.
pub const OUTPUT_TAIL_LINES: usize = 12;

/// Minimum percent advance between two progress log lines.
pub const PROGRESS_LOG_PERCENT_STEP: f64 = 10.0;

/// Maximum quiet period between two progress log lines.
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(15);

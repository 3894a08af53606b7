//! Model download engine.
//!
//! Moves large model artifacts from HuggingFace, Civitai, and plain HTTP
//! hosts into a models tree, choosing among external transfer tools and an
//! in-process fallback per item.
//!
//! # Layers
//!
//! - [`DownloadManager`] runs a batch sequentially with bounded retries and
//!   cross-task cancellation.
//! - [`TransferOrchestrator`] runs one pass for one item: filename
//!   resolution, skip check, precheck, provider chain, generic chain.
//! - [`driver`] holds the transports behind one [`TransportDriver`] interface.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arrakis_core::config::EngineConfig;
//! use arrakis_core::credentials::Credentials;
//! use arrakis_core::download::{BroadcastSink, DownloadItem, DownloadManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, mut events) = BroadcastSink::new(256);
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event).unwrap_or_default());
//!     }
//! });
//! let manager = DownloadManager::new(&EngineConfig::from_env(), Credentials::from_env(), Arc::new(sink))?;
//! let report = manager
//!     .download_batch(&[DownloadItem::new("https://example.com/model.safetensors", "checkpoints", "")])
//!     .await;
//! println!("{} of {} present", report.stats.succeeded(), report.stats.total());
//! # Ok(())
//! # }
//! ```

pub(crate) mod constants;
pub mod driver;
mod engine;
mod error;
mod filename;
mod item;
mod orchestrator;
pub mod outcome;
mod process;
mod progress;
mod resolve;
mod retry;
mod source;

pub use constants::{MAX_ATTEMPTS, OUTPUT_TAIL_LINES, STALL_TIMEOUT_SECS};
pub use driver::{DriverTable, FetchContext, FetchRequest, TransportDriver};
pub use engine::{BatchReport, DownloadManager, DownloadStats};
pub use error::{DownloadError, EngineError, ResolveError};
pub use filename::{
    PLACEHOLDER_FILENAME, filename_from_redirect_url, filename_from_url, is_safe_relative_path,
    parse_content_disposition, sanitize_filename,
};
pub use item::DownloadItem;
pub use orchestrator::TransferOrchestrator;
pub use outcome::{AttemptOutcome, AttemptRecord, FailureRecord};
pub use process::{
    LineSplitter, OutputTail, ProcessGuard, ProcessSlot, RunLimits, ToolCommand, ToolExit, ToolRun,
    run_streaming,
};
pub use progress::{
    BroadcastSink, DownloadEvent, LogLevel, LogLine, NoopSink, ProgressEvent, ProgressLogThrottle,
    ProgressSink, StatusUpdate,
};
pub use resolve::{CIVITAI_ACCEPT, CIVITAI_REFERER, RedirectResolver};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_failure, is_retryable_failure};
pub use source::{
    HfFileRef, Provider, normalize_source_url, query_param, with_civitai_token, with_query_param,
};

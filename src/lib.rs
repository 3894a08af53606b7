//! Arrakis Fetch Core Library
//!
//! Resumable, multi-source downloads of model artifacts (checkpoints, LoRAs,
//! VAEs) into a ComfyUI models tree on freshly provisioned GPU instances.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Engine tunables resolved from the environment
//! - [`credentials`] - Provider token discovery and masking
//! - [`download`] - Batch manager, per-item orchestrator, transport drivers
//! - [`manifest`] - Loading item lists from JSON presets
//! - [`user_agent`] - User-Agent strings shared by every transport

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod credentials;
pub mod download;
pub mod manifest;
pub mod user_agent;

// Re-export commonly used types
pub use config::{EngineConfig, FailurePolicy};
pub use credentials::{Credentials, ProviderToken, mask_token};
pub use download::{
    AttemptOutcome, BatchReport, BroadcastSink, DownloadEvent, DownloadItem, DownloadManager,
    DownloadStats, EngineError, FailureRecord, FailureType, NoopSink, ProgressSink, Provider,
    RetryDecision, RetryPolicy, classify_failure,
};
pub use manifest::{ManifestError, load_manifest};

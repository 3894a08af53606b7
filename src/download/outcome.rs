//! Attempt outcomes, failure records, and the stage/reason vocabulary.
//!
//! Reason strings are a contract: drivers produce them, the retry classifier
//! and operators grep them. Every recognized marker lives in [`reason`] so
//! producers and the classifier cannot drift apart.

use serde::Serialize;

/// Stage names recorded on every [`AttemptOutcome`].
pub mod stage {
    /// Destination already present on disk.
    pub const SKIP: &str = "skip";
    /// Deterministic validation before any network activity.
    pub const PRECHECK: &str = "precheck";
    /// Civitai API URL to CDN URL resolution.
    pub const CIVITAI_RESOLVE: &str = "civitai-resolve";
    /// Separator between links of a fallback chain (`aria2c->wget`).
    pub const CHAIN_SEPARATOR: &str = "->";
}

/// Reason codes and markers shared between drivers and the classifier.
pub mod reason {
    /// Success outcome reason for a skipped item.
    pub const ALREADY_EXISTS: &str = "already_exists";
    /// Success outcome reason for a completed transfer.
    pub const OK: &str = "ok";
    /// Marker for an HTTP 401 from a provider.
    pub const AUTH_HTTP_401: &str = "auth_http_401";
    /// Marker for an HTTP 403 from a provider.
    pub const AUTH_HTTP_403: &str = "auth_http_403";
    /// Precheck reason when Civitai is requested without a token.
    pub const CIVITAI_TOKEN_MISSING: &str =
        "CIVITAI_TOKEN is missing (required for Civitai downloads)";
    /// Lower-case marker the classifier looks for in required-token failures.
    pub const TOKEN_REQUIRED_MARKER: &str = "missing (required for civitai downloads)";
    /// Reason when the destination directory cannot be created.
    pub const DEST_DIR_UNAVAILABLE: &str = "dest_dir_unavailable";
    /// Item `dir` or explicit `filename` would escape the models root.
    pub const UNSAFE_PATH: &str = "unsafe_path";
    /// No driver is registered for the item.
    pub const NO_TRANSPORT: &str = "no_transport_available";
    /// The batch was cancelled between transports.
    pub const CANCELLED: &str = "cancelled";
    /// HF URL did not match `<owner>/<repo>/resolve/<rev>/<path>`.
    pub const INVALID_HF_URL: &str = "invalid_hf_url_format";
    /// Prefix for in-process HuggingFace fallback failures.
    pub const HF_HUB_EXCEPTION: &str = "hf_hub_exception";
    /// Separator placed before the captured tool output tail.
    pub const TAIL_PREFIX: &str = " | tail: ";
    /// Separator between captured tail lines.
    pub const TAIL_JOIN: &str = " || ";
    /// Separator between reasons of an exhausted fallback chain.
    pub const CHAIN_JOIN: &str = " ; ";
}

/// Result of one transport attempt (or one full pass of the orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    /// Whether the artifact is now present at its destination.
    pub success: bool,
    /// Short machine-parsable reason code.
    pub reason: String,
    /// Stage that produced the outcome.
    pub stage: String,
}

impl AttemptOutcome {
    /// A completed transfer by the given stage.
    #[must_use]
    pub fn succeeded(stage: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason::OK.to_string(),
            stage: stage.into(),
        }
    }

    /// The destination already exists; no transport was used.
    #[must_use]
    pub fn already_exists() -> Self {
        Self {
            success: true,
            reason: reason::ALREADY_EXISTS.to_string(),
            stage: stage::SKIP.to_string(),
        }
    }

    /// A failed attempt.
    #[must_use]
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            stage: stage.into(),
        }
    }

    /// Returns true if this outcome short-circuits because the file was present.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        self.success && self.stage == stage::SKIP
    }
}

/// Appends the captured tool output tail to a reason code.
#[must_use]
pub fn with_tail<S: AsRef<str>>(code: &str, tail: &[S]) -> String {
    if tail.is_empty() {
        return code.to_string();
    }
    let joined = tail
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(reason::TAIL_JOIN);
    format!("{code}{}{joined}", reason::TAIL_PREFIX)
}

/// Joins driver names into a chain stage (`aria2c->wget`).
#[must_use]
pub fn chain_stage(names: &[&str]) -> String {
    names.join(stage::CHAIN_SEPARATOR)
}

/// An item that exhausted its attempts or hit a non-retryable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Requested or derived filename.
    pub filename: String,
    /// Target subdirectory under the models root.
    pub dir: String,
    /// Source URL as requested.
    pub url: String,
    /// Stage of the last failed attempt.
    pub stage: String,
    /// Reason of the last failed attempt.
    pub reason: String,
}

/// One transport attempt, kept for per-batch diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Source URL of the item.
    pub url: String,
    /// Driver or stage that ran.
    pub method: String,
    /// Whether it succeeded.
    pub ok: bool,
    /// Reason code (empty on success).
    pub reason: String,
}

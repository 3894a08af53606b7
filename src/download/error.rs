//! Error types for the download module.
//!
//! Transport drivers never surface these to the orchestrator: every error is
//! flattened into a failed [`AttemptOutcome`](super::AttemptOutcome) reason at
//! the driver boundary. They exist so in-process transfer code can use `?`
//! with full context, and so construction-time misuse is reported as a value.

use std::path::PathBuf;

use thiserror::Error;

/// Failure inside the in-process HuggingFace transfer.
///
/// `Display` becomes the tail of an `hf_hub_exception: ...` reason.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection, TLS or body-stream failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// No response or no body bytes within the read timeout.
    #[error("timed out fetching {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },

    /// Any status other than 200, or 206 for a resumed `.part`.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Response status.
        status: u16,
    },

    /// Creating, writing or renaming the partial file failed.
    #[error("cannot write {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bytes on disk disagree with the advertised length.
    #[error("size mismatch for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Integrity {
        /// The `.part` file.
        path: PathBuf,
        /// Offset plus `Content-Length`.
        expected_bytes: u64,
        /// Bytes actually on disk.
        actual_bytes: u64,
    },

    /// The batch token fired mid-stream.
    #[error("cancelled while fetching {url}")]
    Cancelled {
        /// Requested URL.
        url: String,
    },
}

impl DownloadError {
    pub(crate) fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub(crate) fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub(crate) fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    pub(crate) fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }
}

/// Errors raised while constructing the engine (programming or environment misuse).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The in-process HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Failure to resolve a provider API URL to its final content URL.
///
/// `Display` output is the failure reason recorded for the item, so the
/// `auth_http_<code>` marker and the masked token tail must stay verbatim.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The provider rejected the credentials (401/403).
    #[error("{provider}_auth_http_{status} (token tail: {token_tail})")]
    Auth {
        /// Provider name prefix (`civitai`).
        provider: &'static str,
        /// 401 or 403.
        status: u16,
        /// Output of [`mask_token`](crate::credentials::mask_token).
        token_tail: String,
    },

    /// A redirect status arrived without a `Location` header.
    #[error("{provider}_redirect_without_location_{status}")]
    MissingLocation {
        /// Provider name prefix.
        provider: &'static str,
        /// The 3xx status.
        status: u16,
    },

    /// Any other unexpected status.
    #[error("{provider}_resolve_http_{status}")]
    HttpStatus {
        /// Provider name prefix.
        provider: &'static str,
        /// The HTTP status code.
        status: u16,
    },

    /// The request itself failed (DNS, connect, timeout, TLS).
    #[error("{provider}_resolve_exception: {source}")]
    Transport {
        /// Provider name prefix.
        provider: &'static str,
        /// The underlying error, with its URL stripped.
        #[source]
        source: reqwest::Error,
    },
}

impl ResolveError {
    /// Creates a transport error, dropping the request URL (it carries the token).
    pub fn transport(provider: &'static str, source: reqwest::Error) -> Self {
        Self::Transport {
            provider,
            source: source.without_url(),
        }
    }
}

// No From<reqwest::Error> / From<std::io::Error> for DownloadError: every variant
// needs the url or path the source errors don't carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/model.safetensors");
        assert_eq!(
            error.to_string(),
            "timed out fetching https://example.com/model.safetensors"
        );
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.bin", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/file.bin"),
            "Expected URL in: {msg}"
        );
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/model.safetensors"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/model.safetensors"), "Expected path in: {msg}");
    }

    #[test]
    fn test_download_error_integrity_display() {
        let error = DownloadError::integrity("/tmp/x.bin", 100, 40);
        assert_eq!(
            error.to_string(),
            "size mismatch for /tmp/x.bin: expected 100 bytes, got 40"
        );
    }

    #[test]
    fn test_resolve_error_reason_strings() {
        let auth = ResolveError::Auth {
            provider: "civitai",
            status: 401,
            token_tail: "...abcdef".to_string(),
        };
        assert_eq!(auth.to_string(), "civitai_auth_http_401 (token tail: ...abcdef)");

        let missing = ResolveError::MissingLocation {
            provider: "civitai",
            status: 302,
        };
        assert_eq!(missing.to_string(), "civitai_redirect_without_location_302");

        let status = ResolveError::HttpStatus {
            provider: "civitai",
            status: 500,
        };
        assert_eq!(status.to_string(), "civitai_resolve_http_500");
    }
}

//! The unit of work handed to the engine.

use serde::{Deserialize, Serialize};

/// One artifact to fetch: `{url, dir, filename}`.
///
/// `dir` is relative to the models root; an empty `filename` means the name
/// is derived from the server or the URL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Source URL.
    #[serde(default)]
    pub url: String,
    /// Target subdirectory under the models root.
    #[serde(default)]
    pub dir: String,
    /// Explicit destination filename, possibly with subdirectories.
    #[serde(default)]
    pub filename: String,
}

impl DownloadItem {
    /// Creates an item.
    #[must_use]
    pub fn new(url: impl Into<String>, dir: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            filename: filename.into(),
        }
    }

    /// The explicit filename, trimmed, if one was given.
    #[must_use]
    pub fn explicit_filename(&self) -> Option<&str> {
        Some(self.filename.trim()).filter(|name| !name.is_empty())
    }

    /// Name used in status lines before the real filename is known.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.explicit_filename().unwrap_or("file")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_missing_fields() {
        let item: DownloadItem = serde_json::from_str(r#"{"url": "https://example.com/a.bin"}"#).unwrap();
        assert_eq!(item.url, "https://example.com/a.bin");
        assert_eq!(item.dir, "");
        assert_eq!(item.explicit_filename(), None);
        assert_eq!(item.display_name(), "file");
    }

    #[test]
    fn test_explicit_filename_is_trimmed() {
        let item = DownloadItem::new("https://example.com/a.bin", "vae", "  ae.safetensors ");
        assert_eq!(item.explicit_filename(), Some("ae.safetensors"));
    }
}

//! Loading download items from a JSON manifest.
//!
//! Accepts either a bare list of items or a preset object carrying them under
//! `models`; every other preset field is ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::download::DownloadItem;

/// Errors loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("cannot read manifest {path}: {source}")]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or has the wrong shape.
    #[error("invalid manifest {path}: {source}")]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestShape {
    List(Vec<DownloadItem>),
    Preset { models: Vec<DownloadItem> },
}

/// Parses manifest JSON text.
///
/// # Errors
///
/// Returns the `serde_json` error if the text is neither a list of items nor
/// an object with a `models` list.
pub fn parse_manifest(text: &str) -> Result<Vec<DownloadItem>, serde_json::Error> {
    let items = match serde_json::from_str(text)? {
        ManifestShape::List(items) | ManifestShape::Preset { models: items } => items,
    };
    Ok(items)
}

/// Reads and parses the manifest at `path`.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] if the file cannot be read and
/// [`ManifestError::Parse`] if its content is not a manifest.
pub fn load_manifest(path: &Path) -> Result<Vec<DownloadItem>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let items = parse_manifest(&text).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), items = items.len(), "manifest loaded");
    Ok(items)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_bare_list() {
        let items = parse_manifest(
            r#"[{"url": "https://example.com/a.bin", "dir": "vae"}, {"url": "https://example.com/b.bin", "dir": "loras", "filename": "b.safetensors"}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].explicit_filename(), Some("b.safetensors"));
    }

    #[test]
    fn test_parse_preset_object_ignores_other_fields() {
        let items = parse_manifest(
            r#"{"name": "Flux Dev", "category": "image", "models": [{"url": "https://example.com/a.bin", "dir": "unet"}]}"#,
        )
        .unwrap();
        assert_eq!(items, vec![DownloadItem::new("https://example.com/a.bin", "unet", "")]);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(parse_manifest(r#"{"items": []}"#).is_err());
        assert!(parse_manifest("not json").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = load_manifest(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preset.json");
        std::fs::write(&path, r#"{"models": []}"#).unwrap();
        assert!(load_manifest(&path).unwrap().is_empty());
    }
}

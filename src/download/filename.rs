//! Filename extraction and sanitization for download destinations.
//!
//! Names come from three places, in decreasing order of trust: the caller's
//! explicit filename, a Content-Disposition value (header or smuggled into a
//! redirect query string), and finally a heuristic over the URL itself.

use std::path::{Component, Path};

use url::Url;

use super::source::{Provider, query_param};

/// Extension used when a provider URL only carries a numeric model id.
const DEFAULT_MODEL_EXTENSION: &str = "safetensors";

/// Name used when nothing better can be derived.
pub const PLACEHOLDER_FILENAME: &str = "downloaded_file";

/// Query parameters CDNs use to carry a Content-Disposition value.
const DISPOSITION_PARAMS: [&str; 2] = ["response-content-disposition", "content-disposition"];

/// Parses a Content-Disposition value to extract the filename.
///
/// Handles, in priority order:
/// - `attachment; filename*=UTF-8''my%20file.safetensors` (RFC 5987)
/// - `attachment; filename="example.bin"`
/// - `attachment; filename=example.bin`
///
/// Parameter names match case-insensitively. Returns `None` when no form matches.
#[must_use]
pub fn parse_content_disposition(value: &str) -> Option<String> {
    // ASCII lowering keeps byte offsets aligned with `value`.
    let lowered = value.to_ascii_lowercase();

    if let Some(pos) = lowered.find("filename*=") {
        let raw = value_until_semicolon(&value[pos + 10..]);
        // charset'language'encoded_value; the charset prefix is optional
        let encoded = raw.find("''").map_or(raw, |quote_pos| &raw[quote_pos + 2..]);
        let encoded = encoded.trim().trim_matches('"');
        if let Ok(decoded) = urlencoding::decode(encoded) {
            let decoded = decoded.trim();
            if !decoded.is_empty() {
                return Some(decoded.to_string());
            }
        }
    }

    let mut search_from = 0;
    while let Some(offset) = lowered[search_from..].find("filename=") {
        let start = search_from + offset + 9;
        search_from = start;
        let rest = value[start..].trim_start();

        if let Some(stripped) = rest.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = stripped[..end].trim();
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
            continue;
        }

        let name = value_until_semicolon(rest).trim().trim_matches('"');
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    None
}

fn value_until_semicolon(value: &str) -> &str {
    let end = value.find(';').unwrap_or(value.len());
    value[..end].trim()
}

/// Extracts the server-chosen filename from a resolved CDN URL.
///
/// Civitai redirects to storage URLs carrying
/// `response-content-disposition=attachment; filename="..."`.
#[must_use]
pub fn filename_from_redirect_url(url: &str) -> Option<String> {
    DISPOSITION_PARAMS
        .iter()
        .find_map(|param| query_param(url, param))
        .and_then(|disposition| parse_content_disposition(&disposition))
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.is_empty())
}

/// Heuristic filename when no disposition hint exists.
///
/// Takes the last path segment if it looks like a filename (contains a `.`);
/// for Civitai model URLs synthesizes `civitai_<id>.safetensors`; otherwise
/// returns [`PLACEHOLDER_FILENAME`].
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let parsed = Url::parse(url).ok();

    if let Some(last) = parsed
        .as_ref()
        .and_then(|u| u.path_segments())
        .and_then(|mut segments| segments.next_back())
        .map(|segment| {
            urlencoding::decode(segment)
                .map_or_else(|_| segment.to_string(), |decoded| decoded.into_owned())
        })
        && last.contains('.')
    {
        return sanitize_filename(&last);
    }

    if Provider::detect(url) == Provider::Civitai
        && let Some(model_id) = civitai_model_id(url)
    {
        return format!(
            "{}_{model_id}.{DEFAULT_MODEL_EXTENSION}",
            Provider::Civitai.name()
        );
    }

    PLACEHOLDER_FILENAME.to_string()
}

fn civitai_model_id(url: &str) -> Option<String> {
    let (_, after) = url.split_once("/models/")?;
    let id = after
        .split(['?', '#', '/'])
        .next()
        .filter(|id| !id.is_empty())?;
    Some(sanitize_filename(id))
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and control characters with `_`, and rewrites
/// dot-only names so the result can never escape its directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_relative_path(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Returns true if `name` is a relative path that stays inside its parent.
///
/// Explicit filenames from presets may contain subdirectories
/// (`vae/ae.safetensors`) but never `..`, a root, or a drive prefix.
#[must_use]
pub fn is_safe_relative_path(name: &str) -> bool {
    !name.is_empty()
        && !Path::new(name).components().any(|component| {
            matches!(
                component,
                Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        })
}

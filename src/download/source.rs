//! Source URL handling: provider detection, normalization, and token injection.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Query flag that providers append to share links and that transfer tools
/// must not see.
const NOISY_FLAG: (&str, &str) = ("download", "true");

#[allow(clippy::expect_used)]
static HF_RESOLVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"huggingface\.co/([^/]+/[^/]+)/resolve/([^/]+)/(.+)")
        .expect("HF resolve regex is valid") // Static pattern, safe to panic
});

/// A remote content source with its own auth scheme and URL shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// huggingface.co: optional bearer token, managed CLI available.
    HuggingFace,
    /// civitai.com: mandatory token, API URLs redirect to a CDN.
    Civitai,
    /// Anything else: fetched anonymously.
    Direct,
}

impl Provider {
    /// Detects the provider from the URL host.
    #[must_use]
    pub fn detect(url: &str) -> Self {
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return Self::Direct;
        };
        if host_matches(&host, "huggingface.co") {
            Self::HuggingFace
        } else if host_matches(&host, "civitai.com") {
            Self::Civitai
        } else {
            Self::Direct
        }
    }

    /// Short lower-case name used in synthesized filenames and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::HuggingFace => "huggingface",
            Self::Civitai => "civitai",
            Self::Direct => "direct",
        }
    }

    /// Whether downloads from this provider are impossible without a token.
    #[must_use]
    pub fn requires_token(self) -> bool {
        matches!(self, Self::Civitai)
    }

    /// Whether the true filename is only known after redirect resolution.
    #[must_use]
    pub fn resolves_redirects(self) -> bool {
        matches!(self, Self::Civitai)
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Removes the `download=true` flag from the query string.
///
/// Every other parameter keeps its original encoding and order. URLs without
/// the flag are returned byte-identical.
#[must_use]
pub fn normalize_source_url(url: &str) -> Cow<'_, str> {
    let Some((head, rest)) = url.split_once('?') else {
        return Cow::Borrowed(url);
    };
    let (query, fragment) = match rest.split_once('#') {
        Some((query, fragment)) => (query, Some(fragment)),
        None => (rest, None),
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !is_noisy_flag(pair))
        .collect();
    if kept.len() == query.split('&').count() {
        return Cow::Borrowed(url);
    }

    let mut normalized = head.to_string();
    let kept: Vec<&str> = kept.into_iter().filter(|pair| !pair.is_empty()).collect();
    if !kept.is_empty() {
        normalized.push('?');
        normalized.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        normalized.push('#');
        normalized.push_str(fragment);
    }
    Cow::Owned(normalized)
}

fn is_noisy_flag(pair: &str) -> bool {
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    key == NOISY_FLAG.0 && value.eq_ignore_ascii_case(NOISY_FLAG.1)
}

/// Sets (or replaces) a query parameter, leaving the rest of the URL intact.
#[must_use]
pub fn with_query_param(url: &str, key: &str, value: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        let separator = if url.contains('?') { '&' } else { '?' };
        return format!("{url}{separator}{key}={}", urlencoding::encode(value));
    };
    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &retained {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(key, value);
    }
    parsed.to_string()
}

/// Returns a query parameter value, percent-decoded.
#[must_use]
pub fn query_param(url: &str, key: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    })
}

/// Adds the Civitai token as a `token=` query parameter on Civitai URLs.
///
/// Other URLs, and calls with an empty token, pass through unchanged.
#[must_use]
pub fn with_civitai_token<'a>(url: &'a str, token: &str) -> Cow<'a, str> {
    if token.is_empty() || Provider::detect(url) != Provider::Civitai {
        return Cow::Borrowed(url);
    }
    Cow::Owned(with_query_param(url, "token", token))
}

/// Coordinates of a file inside a HuggingFace repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfFileRef {
    /// `owner/repo`.
    pub repo_id: String,
    /// Branch, tag, or commit.
    pub revision: String,
    /// Percent-decoded path inside the repository.
    pub path: String,
}

impl HfFileRef {
    /// Parses `https://huggingface.co/<owner>/<repo>/resolve/<rev>/<path>`.
    ///
    /// The query string is ignored.
    #[must_use]
    pub fn parse(url: &str) -> Option<Self> {
        let clean = url.split_once('?').map_or(url, |(head, _)| head);
        let captures = HF_RESOLVE_PATTERN.captures(clean)?;
        let path = urlencoding::decode(&captures[3])
            .map_or_else(|_| captures[3].to_string(), |decoded| decoded.into_owned());
        Some(Self {
            repo_id: captures[1].to_string(),
            revision: captures[2].to_string(),
            path,
        })
    }

    /// Canonical resolve URL on the given endpoint (normally `https://huggingface.co`).
    #[must_use]
    pub fn resolve_url(&self, endpoint: &str) -> String {
        let encoded_path = self
            .path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{}/resolve/{}/{}",
            endpoint.trim_end_matches('/'),
            self.repo_id,
            self.revision,
            encoded_path
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_detect_by_host() {
        assert_eq!(
            Provider::detect("https://huggingface.co/a/b/resolve/main/x.safetensors"),
            Provider::HuggingFace
        );
        assert_eq!(
            Provider::detect("https://civitai.com/api/download/models/12345"),
            Provider::Civitai
        );
        assert_eq!(
            Provider::detect("https://cdn.civitai.com/file.safetensors"),
            Provider::Civitai
        );
        assert_eq!(
            Provider::detect("https://example.com/civitai.com/x"),
            Provider::Direct
        );
        assert_eq!(Provider::detect("not a url"), Provider::Direct);
        assert_eq!(
            Provider::detect("https://notcivitai.com/x"),
            Provider::Direct
        );
    }

    #[test]
    fn test_normalize_drops_download_flag_keeps_others() {
        let url = "https://civitai.com/api/download/models/1?download=true&foo=bar";
        assert_eq!(
            normalize_source_url(url),
            "https://civitai.com/api/download/models/1?foo=bar"
        );
    }

    #[test]
    fn test_normalize_without_flag_is_byte_identical() {
        let url = "https://example.com/a%20b.bin?type=Model&format=SafeTensor";
        let normalized = normalize_source_url(url);
        assert!(matches!(normalized, Cow::Borrowed(_)));
        assert_eq!(normalized, url);
    }

    #[test]
    fn test_normalize_preserves_encoding_of_other_params() {
        let url = "https://example.com/f?name=a%2Fb&download=TRUE&x=%20y";
        assert_eq!(
            normalize_source_url(url),
            "https://example.com/f?name=a%2Fb&x=%20y"
        );
    }

    #[test]
    fn test_normalize_only_flag_removes_query() {
        assert_eq!(
            normalize_source_url("https://example.com/f.bin?download=true"),
            "https://example.com/f.bin"
        );
    }

    #[test]
    fn test_normalize_keeps_download_false() {
        let url = "https://example.com/f.bin?download=false";
        assert_eq!(normalize_source_url(url), url);
    }

    #[test]
    fn test_with_query_param_replaces_existing() {
        let url = with_query_param("https://civitai.com/api/x?token=old&type=Model", "token", "new");
        assert_eq!(query_param(&url, "token").as_deref(), Some("new"));
        assert_eq!(query_param(&url, "type").as_deref(), Some("Model"));
        assert_eq!(url.matches("token=").count(), 1);
    }

    #[test]
    fn test_with_civitai_token_only_for_civitai() {
        let hf = "https://huggingface.co/a/b/resolve/main/x.bin";
        assert_eq!(with_civitai_token(hf, "secret"), hf);
        let civitai = "https://civitai.com/api/download/models/7";
        assert_eq!(with_civitai_token(civitai, ""), civitai);
        let authed = with_civitai_token(civitai, "secret");
        assert_eq!(query_param(&authed, "token").as_deref(), Some("secret"));
    }

    #[test]
    fn test_hf_file_ref_parse() {
        let parsed = HfFileRef::parse(
            "https://huggingface.co/Comfy-Org/flux/resolve/main/split_files/vae/ae%20v2.safetensors?download=true",
        )
        .unwrap();
        assert_eq!(parsed.repo_id, "Comfy-Org/flux");
        assert_eq!(parsed.revision, "main");
        assert_eq!(parsed.path, "split_files/vae/ae v2.safetensors");
    }

    #[test]
    fn test_hf_file_ref_rejects_blob_urls() {
        assert!(HfFileRef::parse("https://huggingface.co/org/repo/blob/main/x.bin").is_none());
        assert!(HfFileRef::parse("https://huggingface.co/org").is_none());
    }

    #[test]
    fn test_hf_file_ref_resolve_url_reencodes_path() {
        let parsed = HfFileRef {
            repo_id: "org/repo".to_string(),
            revision: "v1".to_string(),
            path: "dir/a b.bin".to_string(),
        };
        assert_eq!(
            parsed.resolve_url("http://127.0.0.1:9000/"),
            "http://127.0.0.1:9000/org/repo/resolve/v1/dir/a%20b.bin"
        );
    }
}

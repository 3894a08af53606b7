//! Provider API token resolution.
//!
//! Tokens are looked up once, when the engine is built, from (in order) a
//! primary environment variable, an alternate environment variable, and a
//! permissively parsed token file. Failure to read or parse the file degrades
//! to "missing"; it never aborts construction.
//!
//! Full tokens must never reach a log line or a failure reason. Everything
//! that displays a token goes through [`mask_token`].

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::download::Provider;

/// Number of trailing token characters revealed in diagnostics.
const MASK_TAIL_CHARS: usize = 6;

/// Provenance tag for a token that was not found anywhere.
pub const SOURCE_MISSING: &str = "missing";

/// Where to look for one provider's token.
#[derive(Debug, Clone, Copy)]
struct TokenSpec {
    primary_env: &'static str,
    alternate_env: &'static str,
    file_env: &'static str,
    default_file: &'static str,
    json_keys: &'static [&'static str],
    kv_keys: &'static [&'static str],
}

const HF_SPEC: TokenSpec = TokenSpec {
    primary_env: "HF_TOKEN",
    alternate_env: "HUGGING_FACE_HUB_TOKEN",
    file_env: "HF_TOKEN_PATH",
    default_file: ".cache/huggingface/token",
    json_keys: &["token", "hf_token", "api_key"],
    kv_keys: &["token", "hf_token", "huggingface_token", "api_key"],
};

const CIVITAI_SPEC: TokenSpec = TokenSpec {
    primary_env: "CIVITAI_TOKEN",
    alternate_env: "CIVITAI_API_KEY",
    file_env: "CIVITAI_TOKEN_FILE",
    default_file: ".civitai/config",
    json_keys: &["token", "civitai_token", "api_key"],
    kv_keys: &["token", "civitai_token", "civitai_api_key", "api_key"],
};

fn spec_for(provider: Provider) -> Option<TokenSpec> {
    match provider {
        Provider::HuggingFace => Some(HF_SPEC),
        Provider::Civitai => Some(CIVITAI_SPEC),
        Provider::Direct => None,
    }
}

/// A resolved token plus where it came from.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProviderToken {
    token: String,
    source: String,
}

impl ProviderToken {
    /// Creates a token with an explicit provenance tag.
    #[must_use]
    pub fn new(token: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            token: token.into().trim().to_string(),
            source: source.into(),
        }
    }

    /// A token that was not found.
    #[must_use]
    pub fn missing() -> Self {
        Self::new("", SOURCE_MISSING)
    }

    /// The raw token. Empty when missing.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// Provenance tag (`env:HF_TOKEN`, `file:<path> (kv:token)`, `missing`, ...).
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a non-empty token is available.
    #[must_use]
    pub fn is_present(&self) -> bool {
        !self.token.is_empty()
    }

    /// Masked form suitable for logs.
    #[must_use]
    pub fn masked(&self) -> String {
        mask_token(&self.token)
    }
}

impl fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderToken")
            .field("token", &self.masked())
            .field("source", &self.source)
            .finish()
    }
}

/// Tokens for every provider. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    huggingface: ProviderToken,
    civitai: ProviderToken,
}

impl Credentials {
    /// Builds credentials from explicit tokens.
    #[must_use]
    pub fn new(huggingface: ProviderToken, civitai: ProviderToken) -> Self {
        Self {
            huggingface,
            civitai,
        }
    }

    /// Resolves every provider's token from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), home_dir().as_deref())
    }

    /// Resolves every provider's token through `lookup` (environment access)
    /// with `home` as the base for default token file paths.
    #[must_use]
    pub fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            huggingface: resolve_provider_token(Provider::HuggingFace, &lookup, home),
            civitai: resolve_provider_token(Provider::Civitai, &lookup, home),
        }
    }

    /// Token for a provider; `Direct` always yields a missing token.
    #[must_use]
    pub fn token(&self, provider: Provider) -> &ProviderToken {
        static NONE: std::sync::LazyLock<ProviderToken> =
            std::sync::LazyLock::new(ProviderToken::missing);
        match provider {
            Provider::HuggingFace => &self.huggingface,
            Provider::Civitai => &self.civitai,
            Provider::Direct => &NONE,
        }
    }

    /// Raw HuggingFace token (empty when missing).
    #[must_use]
    pub fn huggingface(&self) -> &str {
        self.huggingface.secret()
    }

    /// Raw Civitai token (empty when missing).
    #[must_use]
    pub fn civitai(&self) -> &str {
        self.civitai.secret()
    }
}

/// Masks a token to its last 6 characters (`...abc123`), or `missing`.
#[must_use]
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return SOURCE_MISSING.to_string();
    }
    let chars: Vec<char> = token.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(MASK_TAIL_CHARS)..]
        .iter()
        .collect();
    format!("...{tail}")
}

/// Resolves one provider's token. First non-empty source wins.
pub fn resolve_provider_token<F>(provider: Provider, lookup: &F, home: Option<&Path>) -> ProviderToken
where
    F: Fn(&str) -> Option<String>,
{
    let Some(spec) = spec_for(provider) else {
        return ProviderToken::missing();
    };

    for var in [spec.primary_env, spec.alternate_env] {
        if let Some(value) = lookup(var).map(|v| v.trim().to_string())
            && !value.is_empty()
        {
            return ProviderToken::new(value, format!("env:{var}"));
        }
    }

    let token_file = lookup(spec.file_env)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| home.map(|h| h.join(spec.default_file)));
    let Some(token_file) = token_file else {
        return ProviderToken::missing();
    };
    if !token_file.exists() {
        debug!(provider = provider.name(), path = %token_file.display(), "no token file");
        return ProviderToken::missing();
    }

    match std::fs::read_to_string(&token_file) {
        Ok(content) => parse_token_file(&content, &token_file, &spec),
        Err(e) => {
            warn!(
                provider = provider.name(),
                path = %token_file.display(),
                error = %e,
                "failed to read token file"
            );
            ProviderToken::new("", format!("file:{} (unusable)", token_file.display()))
        }
    }
}

fn parse_token_file(content: &str, path: &Path, spec: &TokenSpec) -> ProviderToken {
    let shown = path.display();
    let content = content.trim();
    if content.is_empty() {
        return ProviderToken::new("", format!("file:{shown} (empty)"));
    }

    if content.starts_with('{') && content.ends_with('}') {
        match serde_json::from_str::<serde_json::Value>(content) {
            Ok(serde_json::Value::Object(map)) => {
                for key in spec.json_keys {
                    let value = match map.get(*key) {
                        Some(serde_json::Value::String(s)) => s.trim().to_string(),
                        Some(serde_json::Value::Number(n)) => n.to_string(),
                        _ => continue,
                    };
                    if !value.is_empty() {
                        return ProviderToken::new(value, format!("file:{shown} (json:{key})"));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %shown, error = %e, "token file looks like JSON but does not parse");
            }
        }
    }

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = strip_quotes(value.trim());
        if spec.kv_keys.contains(&key.as_str()) && !value.is_empty() {
            return ProviderToken::new(value, format!("file:{shown} (kv:{key})"));
        }
    }

    let first = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(strip_quotes)
        .unwrap_or_default();
    if !first.is_empty() && !first.contains('=') && !first.chars().any(char::is_whitespace) {
        return ProviderToken::new(first, format!("file:{shown} (raw)"));
    }

    ProviderToken::new("", format!("file:{shown} (unusable)"))
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches('"').trim_matches('\'').trim()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_mask_token_reveals_last_six() {
        assert_eq!(mask_token("abcdefghijkl"), "...ghijkl");
        assert_eq!(mask_token("abc"), "...abc");
        assert_eq!(mask_token(""), "missing");
    }

    #[test]
    fn test_primary_env_wins() {
        let lookup = lookup_from(&[("CIVITAI_TOKEN", "primary"), ("CIVITAI_API_KEY", "alt")]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert_eq!(token.secret(), "primary");
        assert_eq!(token.source(), "env:CIVITAI_TOKEN");
    }

    #[test]
    fn test_alternate_env_used_when_primary_blank() {
        let lookup = lookup_from(&[("CIVITAI_TOKEN", "   "), ("CIVITAI_API_KEY", "alt")]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert_eq!(token.secret(), "alt");
        assert_eq!(token.source(), "env:CIVITAI_API_KEY");
    }

    #[test]
    fn test_missing_everywhere() {
        let temp = TempDir::new().unwrap();
        let token = resolve_provider_token(Provider::Civitai, &lookup_from(&[]), Some(temp.path()));
        assert!(!token.is_present());
        assert_eq!(token.source(), "missing");
    }

    #[test]
    fn test_default_file_under_home_json() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".civitai")).unwrap();
        std::fs::write(
            temp.path().join(".civitai/config"),
            r#"{"civitai_token": "from-json"}"#,
        )
        .unwrap();
        let token = resolve_provider_token(Provider::Civitai, &lookup_from(&[]), Some(temp.path()));
        assert_eq!(token.secret(), "from-json");
        assert!(token.source().ends_with("(json:civitai_token)"), "{}", token.source());
    }

    #[test]
    fn test_file_override_kv_case_insensitive_and_quoted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token.env");
        std::fs::write(&path, "# comment\nOTHER=1\nCIVITAI_API_KEY = \"kv-token\"\n").unwrap();
        let lookup = lookup_from(&[("CIVITAI_TOKEN_FILE", path.to_str().unwrap())]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert_eq!(token.secret(), "kv-token");
        assert!(token.source().ends_with("(kv:civitai_api_key)"));
    }

    #[test]
    fn test_raw_token_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token");
        std::fs::write(&path, "\n  hf_rawtoken123  \n").unwrap();
        let lookup = lookup_from(&[("HF_TOKEN_PATH", path.to_str().unwrap())]);
        let token = resolve_provider_token(Provider::HuggingFace, &lookup, None);
        assert_eq!(token.secret(), "hf_rawtoken123");
        assert!(token.source().ends_with("(raw)"));
    }

    #[test]
    fn test_unusable_file_degrades_to_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        std::fs::write(&path, "this has spaces in it").unwrap();
        let lookup = lookup_from(&[("CIVITAI_TOKEN_FILE", path.to_str().unwrap())]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert!(!token.is_present());
        assert!(token.source().ends_with("(unusable)"));
    }

    #[test]
    fn test_broken_json_falls_back_to_unusable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        std::fs::write(&path, "{not json}").unwrap();
        let lookup = lookup_from(&[("CIVITAI_TOKEN_FILE", path.to_str().unwrap())]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert!(!token.is_present());
    }

    #[test]
    fn test_empty_file_tagged_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        std::fs::write(&path, "   \n").unwrap();
        let lookup = lookup_from(&[("CIVITAI_TOKEN_FILE", path.to_str().unwrap())]);
        let token = resolve_provider_token(Provider::Civitai, &lookup, None);
        assert!(token.source().ends_with("(empty)"));
    }

    #[test]
    fn test_debug_output_never_contains_token() {
        let credentials = Credentials::new(
            ProviderToken::new("hf_supersecretvalue", "env:HF_TOKEN"),
            ProviderToken::new("civitai_supersecret", "env:CIVITAI_TOKEN"),
        );
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hf_supersecretvalue"));
        assert!(!rendered.contains("civitai_supersecret"));
        assert!(rendered.contains("...tvalue"));
    }

    #[test]
    fn test_direct_provider_has_no_token() {
        let credentials = Credentials::new(
            ProviderToken::new("a", "env:HF_TOKEN"),
            ProviderToken::new("b", "env:CIVITAI_TOKEN"),
        );
        assert!(!credentials.token(Provider::Direct).is_present());
        assert_eq!(credentials.token(Provider::Civitai).secret(), "b");
    }
}

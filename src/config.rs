//! Engine configuration resolved from environment variables.
//!
//! Every knob has a default; a missing or malformed variable is never fatal.
//! [`EngineConfig::from_lookup`] takes the environment as a function so tests
//! can exercise parsing without mutating process state.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::download::constants::{
    ARIA2_CONNECTIONS, ARIA2_MIN_SPLIT_SIZE, HF_HUB_TIMEOUT_SECS, HF_XET_RANGE_GETS,
    RESOLVE_TIMEOUT_SECS, STALL_TIMEOUT_SECS,
};

const DEFAULT_COMFY_BASE: &str = "/workspace/comfy";
const DEFAULT_VENV_BIN: &str = ".venv/bin";

/// Whether one failed item should fail the whole install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Only configuration (precheck) failures are fatal; transfer failures are reported.
    #[default]
    Lenient,
    /// Any failed item is fatal.
    Strict,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown failure policy '{other}' (expected lenient or strict)")),
        }
    }
}

/// Tunables for the transfer engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root under which every item's `dir` is created.
    pub models_dir: PathBuf,
    /// ComfyUI install base (`COMFY_BASE`), searched for a venv `hf` CLI.
    pub comfy_base: PathBuf,
    /// Extra directories searched for the `hf` CLI before `PATH`.
    pub hf_cli_search_dirs: Vec<PathBuf>,
    /// Global bandwidth cap passed to aria2c (`50M`); `None` is unlimited.
    pub speed_limit: Option<String>,
    /// aria2c `-x` / `--max-connection-per-server`.
    pub aria2_connections: u32,
    /// aria2c `-s`.
    pub aria2_splits: u32,
    /// aria2c `--min-split-size`.
    pub aria2_min_split_size: String,
    /// Kill a transfer tool after this long without forward progress; `None` disables.
    pub stall_timeout: Option<Duration>,
    /// `HF_XET_NUM_CONCURRENT_RANGE_GETS` forwarded to the hf CLI.
    pub hf_xet_range_gets: u32,
    /// Read timeout for the in-process HuggingFace fallback.
    pub hf_hub_timeout: Duration,
    /// Timeout for the authenticated Civitai redirect resolution.
    pub resolve_timeout: Duration,
    /// HuggingFace endpoint used by the in-process fallback.
    pub hf_endpoint: String,
    /// Install-level policy for failed items.
    pub failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    /// Reads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let comfy_base = PathBuf::from(get("COMFY_BASE").unwrap_or_else(|| DEFAULT_COMFY_BASE.to_string()));
        let venv_bin = get("ARRAKIS_VENV_BIN").map_or_else(|| PathBuf::from(DEFAULT_VENV_BIN), PathBuf::from);

        let aria2_connections = parse_or(&get, "ARIA2_CONNECTIONS", ARIA2_CONNECTIONS).max(1);
        let aria2_splits = parse_or(&get, "ARIA2_SPLITS", aria2_connections).max(1);
        let stall_secs = parse_or(&get, "ARIA2_STALL_TIMEOUT_SECONDS", STALL_TIMEOUT_SECS);

        let failure_policy = get("ARRAKIS_FAILURE_POLICY")
            .and_then(|raw| {
                raw.parse()
                    .map_err(|e: String| warn!(key = "ARRAKIS_FAILURE_POLICY", error = %e, "ignoring invalid value"))
                    .ok()
            })
            .unwrap_or_default();

        Self {
            models_dir: comfy_base.join("ComfyUI").join("models"),
            hf_cli_search_dirs: vec![venv_bin, comfy_base.join(".venv").join("bin")],
            comfy_base,
            speed_limit: get("DOWNLOAD_SPEED_LIMIT").filter(|v| v != "0"),
            aria2_connections,
            aria2_splits,
            aria2_min_split_size: get("ARIA2_MIN_SPLIT_SIZE")
                .unwrap_or_else(|| ARIA2_MIN_SPLIT_SIZE.to_string()),
            stall_timeout: (stall_secs > 0).then(|| Duration::from_secs(stall_secs)),
            hf_xet_range_gets: parse_or(&get, "HF_XET_NUM_CONCURRENT_RANGE_GETS", HF_XET_RANGE_GETS),
            hf_hub_timeout: Duration::from_secs(parse_or(&get, "HF_HUB_DOWNLOAD_TIMEOUT", HF_HUB_TIMEOUT_SECS)),
            resolve_timeout: Duration::from_secs(parse_or(
                &get,
                "CIVITAI_RESOLVE_TIMEOUT_SECONDS",
                RESOLVE_TIMEOUT_SECS,
            )),
            hf_endpoint: get("HF_ENDPOINT").unwrap_or_else(|| "https://huggingface.co".to_string()),
            failure_policy,
        }
    }

    /// Overrides the models root.
    #[must_use]
    pub fn with_models_dir(mut self, models_dir: impl Into<PathBuf>) -> Self {
        self.models_dir = models_dir.into();
        self
    }

    /// Overrides the stall timeout (`Duration::ZERO` disables it).
    #[must_use]
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + Copy,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e: T::Err| {
            warn!(key, value = %raw, error = %e, "ignoring unparseable value, using default");
            default
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        EngineConfig::from_lookup(|key| map.get(key).map(|v| (*v).to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.aria2_connections, 16);
        assert_eq!(config.aria2_splits, 16);
        assert_eq!(config.aria2_min_split_size, "1M");
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.speed_limit, None);
        assert_eq!(config.resolve_timeout, Duration::from_secs(30));
        assert_eq!(
            config.models_dir,
            PathBuf::from("/workspace/comfy/ComfyUI/models")
        );
        assert_eq!(config.failure_policy, FailurePolicy::Lenient);
    }

    #[test]
    fn test_splits_follow_connections() {
        let config = config_from(&[("ARIA2_CONNECTIONS", "8")]);
        assert_eq!(config.aria2_connections, 8);
        assert_eq!(config.aria2_splits, 8);

        let config = config_from(&[("ARIA2_CONNECTIONS", "8"), ("ARIA2_SPLITS", "4")]);
        assert_eq!(config.aria2_splits, 4);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = config_from(&[("ARIA2_CONNECTIONS", "lots"), ("ARIA2_STALL_TIMEOUT_SECONDS", "-1")]);
        assert_eq!(config.aria2_connections, 16);
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_zero_stall_timeout_disables() {
        let config = config_from(&[("ARIA2_STALL_TIMEOUT_SECONDS", "0")]);
        assert_eq!(config.stall_timeout, None);
    }

    #[test]
    fn test_speed_limit_zero_is_unlimited() {
        assert_eq!(config_from(&[("DOWNLOAD_SPEED_LIMIT", "0")]).speed_limit, None);
        assert_eq!(
            config_from(&[("DOWNLOAD_SPEED_LIMIT", "50M")]).speed_limit.as_deref(),
            Some("50M")
        );
    }

    #[test]
    fn test_comfy_base_drives_paths() {
        let config = config_from(&[("COMFY_BASE", "/opt/comfy"), ("ARRAKIS_VENV_BIN", "/opt/arrakis/bin")]);
        assert_eq!(config.models_dir, PathBuf::from("/opt/comfy/ComfyUI/models"));
        assert_eq!(
            config.hf_cli_search_dirs,
            vec![PathBuf::from("/opt/arrakis/bin"), PathBuf::from("/opt/comfy/.venv/bin")]
        );
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("STRICT".parse::<FailurePolicy>().unwrap(), FailurePolicy::Strict);
        assert!("sometimes".parse::<FailurePolicy>().is_err());
        let config = config_from(&[("ARRAKIS_FAILURE_POLICY", "bogus")]);
        assert_eq!(config.failure_policy, FailurePolicy::Lenient);
    }

    #[test]
    fn test_builder_overrides() {
        let config = EngineConfig::default()
            .with_models_dir("/tmp/models")
            .with_stall_timeout(Duration::ZERO);
        assert_eq!(config.models_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.stall_timeout, None);
    }
}

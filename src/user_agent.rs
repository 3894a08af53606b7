//! Shared User-Agent strings for provider HTTP traffic.
//!
//! Transfer tools and the in-process clients send the same browser-like UA so
//! provider CDNs treat every transport identically.

/// Browser-like User-Agent sent to HuggingFace and Civitai by every transport.
pub const HTTP_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) ArrakisStart/2.0";

/// User-Agent for in-process requests (redirect resolution, library fallback).
///
/// Appends the crate version so provider-side logs can tell fetcher builds apart.
#[must_use]
pub(crate) fn default_http_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{HTTP_USER_AGENT} arrakis-fetch/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_extends_browser_agent() {
        let ua = default_http_user_agent();
        assert!(ua.starts_with(HTTP_USER_AGENT), "unexpected UA: {ua}");
        assert!(
            ua.ends_with(env!("CARGO_PKG_VERSION")),
            "UA must carry crate version: {ua}"
        );
    }
}

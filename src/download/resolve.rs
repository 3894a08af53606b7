//! Authenticated redirect resolution for providers whose API URLs are not the
//! content URL (Civitai `api/download/models/<id>` answers with a 3xx to a
//! signed CDN URL).

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, LOCATION, REFERER, USER_AGENT};
use reqwest::{Client, redirect};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::CONNECT_TIMEOUT_SECS;
use super::error::{EngineError, ResolveError};
use super::source::{Provider, with_query_param};
use crate::credentials::ProviderToken;
use crate::user_agent::HTTP_USER_AGENT;

/// `Accept` header Civitai expects on download requests.
pub const CIVITAI_ACCEPT: &str = "application/octet-stream,*/*";

/// `Referer` header Civitai expects on download requests.
pub const CIVITAI_REFERER: &str = "https://civitai.com/";

/// Resolves provider API URLs to final content URLs without following redirects.
#[derive(Debug, Clone)]
pub struct RedirectResolver {
    client: Client,
    provider: Provider,
}

impl RedirectResolver {
    /// Creates a resolver for `provider` with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(provider: Provider, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(EngineError::HttpClient)?;
        Ok(Self { client, provider })
    }

    /// Resolves `url` with `token`.
    ///
    /// The token is sent both as a bearer header and as a `token=` query
    /// parameter. On 200 the authenticated URL itself is returned.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] whose `Display` is the failure reason.
    #[instrument(skip(self, token), fields(provider = self.provider.name()))]
    pub async fn resolve(&self, url: &str, token: &ProviderToken) -> Result<String, ResolveError> {
        let provider = self.provider.name();
        let authed = if token.is_present() {
            with_query_param(url, "token", token.secret())
        } else {
            url.to_string()
        };

        let mut request = self
            .client
            .get(&authed)
            .header(USER_AGENT, HTTP_USER_AGENT)
            .header(ACCEPT, CIVITAI_ACCEPT)
            .header(REFERER, CIVITAI_REFERER);
        if token.is_present() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token.secret()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::transport(provider, e))?;
        let status = response.status().as_u16();
        debug!(status, "redirect resolution response");

        match status {
            301 | 302 | 303 | 307 | 308 => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .filter(|value| !value.is_empty())
                    .ok_or(ResolveError::MissingLocation { provider, status })?;
                Ok(absolute_location(&authed, location))
            }
            200 => Ok(authed),
            401 | 403 => {
                warn!(status, token_source = %token.source(), token = %token.masked(), "provider rejected credentials");
                Err(ResolveError::Auth {
                    provider,
                    status,
                    token_tail: token.masked(),
                })
            }
            _ => Err(ResolveError::HttpStatus { provider, status }),
        }
    }
}

fn absolute_location(base: &str, location: &str) -> String {
    match Url::parse(location) {
        Ok(absolute) => absolute.to_string(),
        Err(_) => Url::parse(base)
            .and_then(|base| base.join(location))
            .map_or_else(|_| location.to_string(), |joined| joined.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_location_passthrough() {
        assert_eq!(
            absolute_location("https://civitai.com/api/x", "https://cdn.example.com/f?sig=1"),
            "https://cdn.example.com/f?sig=1"
        );
    }

    #[test]
    fn test_absolute_location_relative_is_joined() {
        assert_eq!(
            absolute_location("https://civitai.com/api/download/models/1?token=t", "/files/a.bin"),
            "https://civitai.com/files/a.bin"
        );
    }

    #[test]
    fn test_new_builds_client() {
        let resolver = RedirectResolver::new(Provider::Civitai, Duration::from_secs(5)).unwrap();
        assert_eq!(resolver.provider, Provider::Civitai);
    }
}

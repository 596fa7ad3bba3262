//! Network resource policy with base-URL resolution and domain allow-list.
//!
//! Security model:
//! - Only http and https URLs can be fetched
//! - URLs carrying userinfo are always rejected
//! - Scheme-less URIs need a configured base URL
//! - With a non-empty allow-list, only listed hostnames (case-insensitive)
//! - Redirects are re-vetted hop by hop against the same rules

use async_trait::async_trait;
use reqwest::{redirect, Client};
use url::Url;

use crate::error::{Error, SanitizeError};
use crate::policy::{LoaderPolicy, SanitizedUri};

const MAX_REDIRECTS: usize = 10;

/// Configuration for [`NetworkPolicy`].
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Relative URIs are resolved against this URL. `None` rejects them.
    pub base_url: Option<String>,
    /// Permitted hostnames. Empty permits every host.
    pub allowed_domains: Vec<String>,
}

/// Allows loading resources over http and https.
pub struct NetworkPolicy {
    base_url: Option<Url>,
    allowed_domains: Vec<String>,
    client: Client,
}

impl NetworkPolicy {
    pub fn new(config: NetworkConfig) -> Result<Self, Error> {
        let base_url = config
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::Construction(format!("invalid base URL: {}", e)))?;

        let allowed = config.allowed_domains.clone();
        let client = Client::builder()
            .redirect(redirect::Policy::custom(move |attempt| {
                // `previous` includes the original request.
                if attempt.previous().len() > MAX_REDIRECTS {
                    return attempt.error("too many redirects");
                }
                match check_redirect(attempt.url(), &allowed) {
                    Ok(()) => attempt.follow(),
                    Err(e) => attempt.error(e),
                }
            }))
            .build()
            .map_err(|e| Error::Construction(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            allowed_domains: config.allowed_domains,
            client,
        })
    }
}

/// Scheme and allow-list checks on an already-resolved URL.
fn check_target(url: &Url, allowed_domains: &[String]) -> Result<(), SanitizeError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SanitizeError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
            uri: url.to_string(),
        });
    }

    if !allowed_domains.is_empty() {
        let host = url.host_str().unwrap_or_default();
        if !allowed_domains.iter().any(|d| d.eq_ignore_ascii_case(host)) {
            return Err(SanitizeError::DomainNotAllowed {
                host: host.to_string(),
                uri: url.to_string(),
            });
        }
    }

    Ok(())
}

fn has_userinfo(url: &Url) -> bool {
    !url.username().is_empty() || url.password().is_some()
}

/// Every redirect hop gets the same vetting as the original URI.
fn check_redirect(url: &Url, allowed_domains: &[String]) -> Result<(), SanitizeError> {
    if has_userinfo(url) {
        return Err(SanitizeError::EmbeddedCredentials {
            uri: url.to_string(),
        });
    }
    check_target(url, allowed_domains)
}

#[async_trait]
impl LoaderPolicy for NetworkPolicy {
    fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
        let invalid = |e: url::ParseError| SanitizeError::InvalidUri {
            uri: uri.into(),
            reason: e.to_string(),
        };

        let resolved = match Url::parse(uri) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base.join(uri).map_err(invalid)?,
                None => return Err(SanitizeError::MissingBase { uri: uri.into() }),
            },
            Err(e) => return Err(invalid(e)),
        };

        // Checked after resolution so `//user@host/x` is caught as well.
        if has_userinfo(&resolved) {
            return Err(SanitizeError::EmbeddedCredentials { uri: uri.into() });
        }

        check_target(&resolved, &self.allowed_domains)?;

        Ok(SanitizedUri::new(resolved.to_string()))
    }

    async fn load(&self, uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
        let response = self
            .client
            .get(uri.as_str())
            .send()
            .await
            .map_err(|e| Error::transport(uri.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(uri.as_str(), format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(uri.as_str(), e))?;
        Ok(body.to_vec())
    }
}

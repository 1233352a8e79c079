//! Transport requirements for outbound URLs.

use url::Url;

/// Errors from URL validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("URL scheme must be https")]
    InvalidScheme,

    #[error("URL must include a hostname")]
    MissingHost,
}

/// Require an https URL with a host.
///
/// Federation metadata carries the keys tokens are verified against, so it
/// must not be fetched over plain HTTP unless explicitly allowed.
pub fn require_https(url: &Url) -> Result<(), UrlValidationError> {
    if url.scheme() != "https" {
        return Err(UrlValidationError::InvalidScheme);
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }
    Ok(())
}

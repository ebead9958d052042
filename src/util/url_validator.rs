use thiserror::Error;
use url::Url;

/// Errors that can occur when validating a topic, callback, or hub URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates that a string is an absolute http(s) URL with a host.
///
/// Topics and callbacks arrive from untrusted form input; everything the
/// hub later fetches or POSTs to must pass through here first. The hub is
/// an open relay, so private-network hosts are deliberately allowed —
/// local subscribers are a supported deployment.
///
/// # Errors
///
/// Returns [`UrlValidationError`] if the string does not parse, uses a
/// non-http(s) scheme, or lacks a host.
///
/// # Examples
///
/// ```
/// use superduperfeeder::util::validate_absolute_url;
///
/// let url = validate_absolute_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_absolute_url("file:///etc/passwd").is_err());
/// assert!(validate_absolute_url("/relative/path").is_err());
/// ```
pub fn validate_absolute_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}

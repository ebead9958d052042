//! Utility functions shared across the hub, polling, and external-client
//! services.
//!
//! - **URL validation**: topics, callbacks, and hub URLs must be absolute
//!   http(s) URLs before they are persisted or fetched.
//! - **Signatures**: `X-Hub-Signature` HMAC-SHA1 rendering.
//! - **Tokens**: random challenges and verification tokens.

mod signature;
mod token;
mod url_validator;

pub use signature::hub_signature;
pub use token::{random_challenge, random_token};
pub use url_validator::{validate_absolute_url, UrlValidationError};

/// The shared outbound HTTP client: service User-Agent on every
/// request, redirects capped at 5 hops.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(crate::config::Config::user_agent())
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
}

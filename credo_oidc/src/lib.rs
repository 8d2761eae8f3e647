//! OpenID Connect token validation for client applications
//!
//! Tokens are validated against the signing keys the issuer publishes through
//! its [discovery document][discovery_url]. Documents are cached by
//! [`DiscoveryCache`] and retrieved again when they age out or when a token
//! names a signing key the cache does not hold.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use credo_oidc::{discovery_url, DiscoveryCache, TokenValidator};
//!
//! # async fn validate(id_token: &str) -> Result<(), credo_oidc::ValidationError> {
//! let discovery = Arc::new(DiscoveryCache::new(reqwest::Client::new()));
//! let validator = TokenValidator::new(discovery);
//!
//! let url = discovery_url("https://auth.example.com/realms/game");
//! let validated = validator
//!     .validate(id_token, Some(aliri::jwt::AudienceRef::from_static("game-client")), &url)
//!     .await?;
//!
//! println!("email verified: {}", validated.claims().email_verified());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod claims;
mod discovery;
mod validator;

pub use claims::IdentityClaims;
pub use discovery::{
    discovery_url, DiscoveryCache, DiscoveryDocument, DiscoveryError, CONFIGURATION_SUFFIX,
    DEFAULT_MAX_AGE,
};
pub use validator::{
    TokenValidator, ValidatedToken, ValidationError, DEFAULT_APPROVED_ALGORITHMS, LEEWAY_SECS,
};

//! Credential records and their lifecycle for client applications
//!
//! This crate holds the pieces of a client-side credential manager that do
//! not depend on how the application coordinates requests:
//!
//! * [`TokenRecord`]: the access, ID, and refresh tokens issued for one
//!   audience, with their expirations. Token values are wrapped in newtypes
//!   that redact themselves when formatted.
//! * [`freshness`]: decides whether a cached record can be handed out as is,
//!   must be refreshed, or requires the user to authenticate again.
//! * [`store`]: persists records, one per audience, in a single encrypted
//!   entry of a pluggable [`SecureStorage`][store::SecureStorage] backend.
//! * [`grants`]: refresh, token exchange, requesting party token, logout,
//!   and email verification requests against the authority.
//!
//! ```
//! use aliri_clock::{DurationSecs, UnixTime};
//! use credo_tokens::{
//!     freshness::{Freshness, FreshnessPolicy},
//!     AccessToken, AudienceKey, RefreshToken, TokenRecord,
//! };
//!
//! let record = TokenRecord::new(
//!     AudienceKey::main(),
//!     AccessToken::from_static("access"),
//!     None,
//!     RefreshToken::from_static("opaque"),
//!     UnixTime(1_000),
//! )
//! .with_refresh_expiration(Some(UnixTime(5_000)));
//!
//! let policy = FreshnessPolicy::new(DurationSecs(60));
//! assert_eq!(policy.decide(Some(&record), false, UnixTime(900)), Freshness::Fresh);
//! assert_eq!(policy.decide(Some(&record), false, UnixTime(950)), Freshness::NeedsRefresh);
//! assert_eq!(policy.decide(Some(&record), false, UnixTime(4_950)), Freshness::NeedsReauth);
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides the [`grants`] client for the authority's endpoints.
//! * `file`: Provides a storage backend using the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
pub mod freshness;
#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod grants;
mod record;
pub mod store;

pub use braids::*;
pub use record::{TokenLifetime, TokenRecord};

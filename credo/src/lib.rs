//! Client-side credential lifecycle management for OAuth2 and OpenID Connect
//!
//! An [`Authenticator`] acquires, caches, validates, refreshes, and revokes
//! the credentials of a single user. Credentials are kept per audience: the
//! primary session lives under [`AudienceKey::main()`], and tokens for other
//! services are obtained from it as requesting party tokens.
//!
//! Concurrent requests for the same audience are coalesced into a single
//! exchange with the authority. Outcomes are handed to a [`DispatchPump`],
//! which the application drives wherever it wants callbacks to run.
//!
//! ```no_run
//! use credo::{Authenticator, AudienceKey, InMemoryStorage, KeyMaterial, RawConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = RawConfig::from_env()?;
//! let (auth, mut pump) = Authenticator::builder(
//!     raw,
//!     InMemoryStorage::new(),
//!     KeyMaterial::new(b"device-local secret".to_vec()),
//! )
//! .build()?;
//!
//! auth.initialize().await?;
//! auth.request_token(AudienceKey::from_static("billing"), false, |result| {
//!     match result {
//!         Ok(record) => println!("expires in {}s", record.until_expired().0),
//!         Err(error) => eprintln!("{}", error),
//!     }
//! });
//!
//! // Later, on the thread that should run callbacks
//! pump.drain();
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
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod authenticator;
mod config;
mod coordinator;
pub mod dispatch;
mod error;
pub mod events;
pub mod login;
mod state;

pub use authenticator::{Authenticator, AuthenticatorBuilder, BuildError};
pub use config::{Config, ConfigError, RawConfig, ENV_PREFIX, MAX_SAFE_WINDOW};
pub use coordinator::TokenCallback;
#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use credo_tokens::store::FileStorage;
pub use credo_tokens::{
    store::{InMemoryStorage, KeyMaterial, SecureStorage},
    AudienceKey, AudienceKeyRef, TokenRecord,
};
pub use dispatch::{DispatchPump, Dispatcher};
pub use error::{AuthError, NO_VALID_CREDENTIALS};
pub use events::{AuthEvent, SubscriptionId};
pub use state::{Activity, AuthState};

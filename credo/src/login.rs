//! The platform login flow
//!
//! Interactive login (a browser session, a native sign-in sheet, or anything
//! else that ends with the authority issuing tokens) happens outside this
//! crate. Applications plug it in by implementing [`LoginTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::Config;

/// The tokens produced by a completed login
pub type RawAuthResult = credo_tokens::grants::dto::TokenResponse;

/// The message reported when the platform cannot perform an action
pub const UNSUPPORTED_ACTION: &str = "This action is not supported in your current platform.";

/// An error reported by a login transport
#[derive(Debug, Error)]
pub enum LoginError {
    /// The platform has no login flow
    #[error("{}", UNSUPPORTED_ACTION)]
    Unsupported,
    /// The user dismissed the login flow
    #[error("login was cancelled by the user")]
    Cancelled,
    /// The login flow failed
    #[error("{0}")]
    Failed(String),
}

/// A platform-specific interactive login flow
#[async_trait]
pub trait LoginTransport: std::fmt::Debug + Send + Sync {
    /// Prepares the platform, once, while the authenticator initializes
    async fn initialize(&self, _config: &Config) -> Result<(), LoginError> {
        Ok(())
    }

    /// Runs the login flow to completion
    async fn start_login(&self, config: &Config) -> Result<RawAuthResult, LoginError>;
}

#[async_trait]
impl<T: LoginTransport + ?Sized> LoginTransport for Arc<T> {
    async fn initialize(&self, config: &Config) -> Result<(), LoginError> {
        (**self).initialize(config).await
    }

    async fn start_login(&self, config: &Config) -> Result<RawAuthResult, LoginError> {
        (**self).start_login(config).await
    }
}

/// A login transport for platforms without an interactive login flow
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsupportedPlatform;

#[async_trait]
impl LoginTransport for UnsupportedPlatform {
    async fn start_login(&self, _config: &Config) -> Result<RawAuthResult, LoginError> {
        tracing::warn!("interactive login requested on an unsupported platform");
        Err(LoginError::Unsupported)
    }
}

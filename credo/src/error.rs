use std::{error::Error as StdError, fmt::Write};

use credo_oidc::ValidationError;
use credo_tokens::{grants::GrantError, store::StoreError, AudienceKey};
use thiserror::Error;

use crate::{config::ConfigError, login::LoginError};

/// The message reported when the user must authenticate before continuing
pub const NO_VALID_CREDENTIALS: &str = "No valid credentials found, please authenticate your user.";

/// An error reported by the authenticator
///
/// Errors are cloneable so that a single outcome can be delivered to every
/// caller waiting on the same request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// A configuration field is missing or unusable
    #[error("invalid configuration field `{field}`")]
    ConfigInvalid {
        /// The offending field
        field: String,
    },
    /// The authenticator has not finished initializing
    #[error("authenticator is not initialized")]
    NotInitialized,
    /// No stored credentials exist for the user
    #[error("{}", NO_VALID_CREDENTIALS)]
    NoValidCredentials,
    /// An HTTP exchange with the authority failed
    #[error("{message}")]
    NetworkError {
        /// The status returned by the authority, if it responded
        status: Option<u16>,
        /// The body returned by the authority, if any
        body: Option<String>,
        /// A description of the failure
        message: String,
    },
    /// The authority responded without the expected tokens
    #[error("malformed response from authority: {0}")]
    MalformedResponse(String),
    /// The issued tokens could not be validated
    #[error("token validation failed: {0}")]
    ValidationFailed(String),
    /// The tokens resolved for a request were issued for a different audience
    #[error("server response does not match audience: expected {expected}, found {actual}")]
    AudienceMismatch {
        /// The audience that was requested
        expected: AudienceKey,
        /// The audience the tokens were issued for
        actual: AudienceKey,
    },
    /// The refresh token has expired or been revoked
    #[error("Authentication tokens have expired. Please authenticate again.")]
    ExpiredRefreshCredentials,
    /// The credential storage could not be written
    #[error("credential storage failed: {0}")]
    Storage(String),
    /// The login transport failed
    #[error("login failed: {0}")]
    Login(String),
    /// A verification email was requested for an already verified address
    #[error("User email is already verified.")]
    EmailAlreadyVerified,
    /// The request was abandoned before it produced an outcome
    #[error("request was abandoned before completing")]
    Cancelled,
}

fn describe(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {}", cause);
        source = cause.source();
    }
    message
}

impl From<GrantError> for AuthError {
    fn from(error: GrantError) -> Self {
        match &error {
            GrantError::MalformedResponse { body, .. } => Self::MalformedResponse(body.clone()),
            _ => Self::NetworkError {
                status: error.status().map(|s| s.as_u16()),
                body: error.body().map(ToOwned::to_owned),
                message: describe(&error),
            },
        }
    }
}

impl From<ValidationError> for AuthError {
    fn from(error: ValidationError) -> Self {
        Self::ValidationFailed(describe(&error))
    }
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> Self {
        Self::Storage(describe(&error))
    }
}

impl From<LoginError> for AuthError {
    fn from(error: LoginError) -> Self {
        Self::Login(describe(&error))
    }
}

impl From<ConfigError> for AuthError {
    fn from(error: ConfigError) -> Self {
        Self::ConfigInvalid {
            field: error.field().unwrap_or("config").to_owned(),
        }
    }
}

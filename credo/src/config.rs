//! Authenticator configuration
//!
//! Configuration arrives as a [`RawConfig`], in which every field is
//! optional, and is checked field by field when the authenticator
//! initializes. The resulting [`Config`] is immutable.

use std::{env, fs, io, path::Path, time::Duration};

use aliri::jwa;
use aliri_clock::DurationSecs;
use credo_tokens::{
    freshness::DEFAULT_SAFE_WINDOW,
    grants::{Endpoints, DEFAULT_SCOPE, DEFAULT_TIMEOUT},
    ClientId,
};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

/// The prefix of environment variables read by [`RawConfig::from_env`]
pub const ENV_PREFIX: &str = "CREDO_";

/// The largest accepted safe window, one day
pub const MAX_SAFE_WINDOW: DurationSecs = DurationSecs(86_400);

/// An error in the provided configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is missing or empty
    #[error("missing required configuration field `{field}`")]
    Missing {
        /// The name of the field
        field: &'static str,
    },
    /// A field holds a value that cannot be used
    #[error("invalid value for configuration field `{field}`: {reason}")]
    Invalid {
        /// The name of the field
        field: &'static str,
        /// Why the value was refused
        reason: String,
    },
    /// The configuration file could not be read
    #[error("unable to read configuration file")]
    Io(#[from] io::Error),
    /// The configuration file could not be parsed
    #[error("unable to parse configuration file")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// The name of the offending field, if the error concerns a single field
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Missing { field } | Self::Invalid { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Unvalidated configuration, as provided by the application
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// The issuer URL of the authority
    pub issuer: Option<String>,
    /// The client ID registered with the authority
    pub client_id: Option<String>,
    /// The redirect URL used by the login transport
    pub callback_url: Option<String>,
    /// The token endpoint
    pub token_endpoint: Option<String>,
    /// The endpoint that sends a verification email
    pub verify_email_endpoint: Option<String>,
    /// The endpoint that revokes a session
    pub logout_endpoint: Option<String>,
    /// Seconds before expiration at which a token is no longer fresh
    pub safe_window_secs: Option<u64>,
    /// Seconds to wait on any single HTTP exchange
    pub request_timeout_secs: Option<u64>,
    /// Seconds after which a cached discovery document is retrieved again
    pub discovery_max_age_secs: Option<u64>,
    /// The scope requested in refresh and exchange grants
    pub scope: Option<String>,
    /// External issuers whose exchanged subject tokens are ID tokens
    pub id_token_subject_issuers: Option<Vec<String>>,
    /// Signing algorithms accepted when validating tokens
    pub approved_algorithms: Option<Vec<jwa::Algorithm>>,
    /// Whether to start the login transport when the main session cannot be refreshed
    pub interactive_reauth: Option<bool>,
    /// Whether to refresh a cached main session right after initializing
    pub refresh_on_init: Option<bool>,
}

impl RawConfig {
    /// Reads configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Reads configuration from `CREDO_*` environment variables
    ///
    /// List values are separated by commas.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn number(field: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
            value
                .map(|v| {
                    v.trim().parse().map_err(|e: std::num::ParseIntError| {
                        ConfigError::Invalid {
                            field,
                            reason: e.to_string(),
                        }
                    })
                })
                .transpose()
        }

        fn flag(field: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
            value
                .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" => Ok(true),
                    "0" | "false" | "no" => Ok(false),
                    other => Err(ConfigError::Invalid {
                        field,
                        reason: format!("expected a boolean, found `{}`", other),
                    }),
                })
                .transpose()
        }

        fn list(value: Option<String>) -> Option<Vec<String>> {
            value.map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
        }

        let approved_algorithms = list(lookup("APPROVED_ALGORITHMS"))
            .map(|algs| {
                algs.iter()
                    .map(|a| {
                        jwa::Algorithm::try_from(a.as_str()).map_err(|e| ConfigError::Invalid {
                            field: "approved_algorithms",
                            reason: e.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            issuer: lookup("ISSUER"),
            client_id: lookup("CLIENT_ID"),
            callback_url: lookup("CALLBACK_URL"),
            token_endpoint: lookup("TOKEN_ENDPOINT"),
            verify_email_endpoint: lookup("VERIFY_EMAIL_ENDPOINT"),
            logout_endpoint: lookup("LOGOUT_ENDPOINT"),
            safe_window_secs: number("safe_window_secs", lookup("SAFE_WINDOW_SECS"))?,
            request_timeout_secs: number("request_timeout_secs", lookup("REQUEST_TIMEOUT_SECS"))?,
            discovery_max_age_secs: number(
                "discovery_max_age_secs",
                lookup("DISCOVERY_MAX_AGE_SECS"),
            )?,
            scope: lookup("SCOPE"),
            id_token_subject_issuers: list(lookup("ID_TOKEN_SUBJECT_ISSUERS")),
            approved_algorithms,
            interactive_reauth: flag("interactive_reauth", lookup("INTERACTIVE_REAUTH"))?,
            refresh_on_init: flag("refresh_on_init", lookup("REFRESH_ON_INIT"))?,
        })
    }

    /// Checks every field and produces the immutable configuration
    pub fn validate(&self) -> Result<Config, ConfigError> {
        fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(ConfigError::Missing { field }),
            }
        }

        fn url(field: &'static str, value: &Option<String>) -> Result<Url, ConfigError> {
            Url::parse(required(field, value)?).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })
        }

        let issuer = url("issuer", &self.issuer)?;
        let client_id = ClientId::new(required("client_id", &self.client_id)?.to_owned());
        let callback_url = url("callback_url", &self.callback_url)?;
        let endpoints = Endpoints {
            token: url("token_endpoint", &self.token_endpoint)?,
            verify_email: url("verify_email_endpoint", &self.verify_email_endpoint)?,
            logout: url("logout_endpoint", &self.logout_endpoint)?,
        };

        let request_timeout = match self.request_timeout_secs {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "request_timeout_secs",
                    reason: "timeout must be positive".to_owned(),
                })
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_TIMEOUT,
        };

        let safe_window = match self.safe_window_secs {
            Some(secs) if secs > MAX_SAFE_WINDOW.0 => {
                return Err(ConfigError::Invalid {
                    field: "safe_window_secs",
                    reason: format!("window may not exceed {} seconds", MAX_SAFE_WINDOW.0),
                })
            }
            Some(secs) => DurationSecs(secs),
            None => DEFAULT_SAFE_WINDOW,
        };

        let approved_algorithms = match &self.approved_algorithms {
            Some(algs) if algs.is_empty() => {
                return Err(ConfigError::Invalid {
                    field: "approved_algorithms",
                    reason: "at least one algorithm must be approved".to_owned(),
                })
            }
            Some(algs) => algs.clone(),
            None => credo_oidc::DEFAULT_APPROVED_ALGORITHMS.to_vec(),
        };

        Ok(Config {
            issuer: issuer.as_str().trim_end_matches('/').to_owned(),
            client_id,
            callback_url,
            endpoints,
            safe_window,
            request_timeout,
            discovery_max_age: self
                .discovery_max_age_secs
                .map_or(credo_oidc::DEFAULT_MAX_AGE, DurationSecs),
            scope: self
                .scope
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SCOPE.to_owned()),
            id_token_subject_issuers: self
                .id_token_subject_issuers
                .clone()
                .unwrap_or_else(|| vec!["apple".to_owned()]),
            approved_algorithms,
            interactive_reauth: self.interactive_reauth.unwrap_or(false),
            refresh_on_init: self.refresh_on_init.unwrap_or(true),
        })
    }
}

/// Validated, immutable authenticator configuration
#[derive(Clone, Debug)]
pub struct Config {
    issuer: String,
    client_id: ClientId,
    callback_url: Url,
    endpoints: Endpoints,
    safe_window: DurationSecs,
    request_timeout: Duration,
    discovery_max_age: DurationSecs,
    scope: String,
    id_token_subject_issuers: Vec<String>,
    approved_algorithms: Vec<jwa::Algorithm>,
    interactive_reauth: bool,
    refresh_on_init: bool,
}

impl Config {
    /// The issuer URL of the authority, without a trailing slash
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The URL of the issuer's discovery document
    pub fn discovery_url(&self) -> String {
        credo_oidc::discovery_url(&self.issuer)
    }

    /// The client ID registered with the authority
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The redirect URL used by the login transport
    pub fn callback_url(&self) -> &Url {
        &self.callback_url
    }

    /// The authority's endpoints
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The margin before expiration at which a token is no longer fresh
    pub fn safe_window(&self) -> DurationSecs {
        self.safe_window
    }

    /// The timeout applied to every HTTP exchange
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The age after which a cached discovery document is retrieved again
    pub fn discovery_max_age(&self) -> DurationSecs {
        self.discovery_max_age
    }

    /// The scope requested in refresh and exchange grants
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// External issuers whose exchanged subject tokens are ID tokens
    pub fn id_token_subject_issuers(&self) -> &[String] {
        &self.id_token_subject_issuers
    }

    /// Signing algorithms accepted when validating tokens
    pub fn approved_algorithms(&self) -> &[jwa::Algorithm] {
        &self.approved_algorithms
    }

    /// Whether the login transport is started when the main session cannot be refreshed
    pub fn interactive_reauth(&self) -> bool {
        self.interactive_reauth
    }

    /// Whether a cached main session is refreshed right after initializing
    pub fn refresh_on_init(&self) -> bool {
        self.refresh_on_init
    }
}

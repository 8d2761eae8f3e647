use std::sync::Arc;

use aliri::{
    error::{ClaimsRejected, JwtVerifyError},
    jwa,
    jwt::{self, CoreHeaders, HasAlgorithm},
    Jwk, JwtRef,
};
use thiserror::Error;

use crate::{DiscoveryCache, DiscoveryDocument, DiscoveryError, IdentityClaims};

/// The grace period applied to time-based claims
pub const LEEWAY_SECS: u64 = 60;

/// The algorithms accepted when none are configured
pub const DEFAULT_APPROVED_ALGORITHMS: [jwa::Algorithm; 6] = [
    jwa::Algorithm::RS256,
    jwa::Algorithm::RS384,
    jwa::Algorithm::RS512,
    jwa::Algorithm::PS256,
    jwa::Algorithm::PS384,
    jwa::Algorithm::PS512,
];

/// A token that passed validation
pub type ValidatedToken = jwt::Validated<IdentityClaims>;

/// Indicates that a token could not be trusted
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The token could not be parsed as a JWT
    #[error("malformed token")]
    Malformed(#[source] JwtVerifyError),
    /// The discovery document needed to validate the token was unavailable
    #[error("unable to retrieve signing keys")]
    Discovery(#[from] DiscoveryError),
    /// No signing key matches the token header, even after refreshing the keys
    #[error("no matching key found to validate token")]
    UnknownKeyId,
    /// The signature or claims were rejected
    #[error("token rejected")]
    Rejected(#[source] JwtVerifyError),
}

impl ValidationError {
    /// Whether the token was rejected because it names a different audience
    pub fn is_audience_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Rejected(JwtVerifyError::ClaimsRejected(ClaimsRejected::InvalidAudience))
        )
    }
}

/// Validates tokens against the signing keys published by their issuer
#[derive(Debug, Clone)]
pub struct TokenValidator {
    discovery: Arc<DiscoveryCache>,
    approved_algorithms: Vec<jwa::Algorithm>,
}

impl TokenValidator {
    /// Constructs a validator using the provided discovery cache
    pub fn new(discovery: Arc<DiscoveryCache>) -> Self {
        Self {
            discovery,
            approved_algorithms: DEFAULT_APPROVED_ALGORITHMS.to_vec(),
        }
    }

    /// Replaces the set of approved signing algorithms
    #[must_use]
    pub fn with_approved_algorithms(mut self, algorithms: Vec<jwa::Algorithm>) -> Self {
        self.approved_algorithms = algorithms;
        self
    }

    /// The discovery cache backing this validator
    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// Validates the token against the issuer described at `discovery_url`
    ///
    /// The signature, issuer, and expiration are always checked. The audience
    /// is checked only when one is provided. If the token names a key that is
    /// not known, the signing keys are retrieved once more before giving up.
    #[tracing::instrument(skip(self, raw_token), fields(discovery.url = %discovery_url))]
    pub async fn validate(
        &self,
        raw_token: &str,
        audience: Option<&jwt::AudienceRef>,
        discovery_url: &str,
    ) -> Result<ValidatedToken, ValidationError> {
        let decomposed = JwtRef::from_str(raw_token)
            .decompose::<jwt::BasicHeaders>()
            .map_err(ValidationError::Malformed)?;

        let kid = decomposed.kid();
        let alg = decomposed.alg();

        let mut document = self.discovery.get(discovery_url).await?;
        if find_key(&document, kid, alg).is_none() {
            tracing::debug!("no matching key cached; refreshing signing keys");
            document = self.discovery.refresh(discovery_url).await?;
        }

        let key = find_key(&document, kid, alg).ok_or_else(|| {
            if let Some(kid) = kid {
                tracing::debug!(%kid, %alg, "unable to find matching key");
            } else {
                tracing::debug!(%alg, "unable to find matching key");
            }
            ValidationError::UnknownKeyId
        })?;

        let mut validator = jwt::CoreValidator::default()
            .with_leeway_secs(LEEWAY_SECS)
            .require_issuer(document.issuer().to_owned());
        for &algorithm in &self.approved_algorithms {
            validator = validator.add_approved_algorithm(algorithm);
        }
        if let Some(audience) = audience {
            validator = validator.add_allowed_audience(audience.to_owned());
        }

        let validated = decomposed
            .verify(key, &validator)
            .map_err(ValidationError::Rejected)?;

        tracing::trace!("token validated");
        Ok(validated)
    }
}

fn find_key<'a>(
    document: &'a DiscoveryDocument,
    kid: Option<&aliri::jwk::KeyIdRef>,
    alg: jwa::Algorithm,
) -> Option<&'a Jwk> {
    document.jwks().get_key_by_opt(kid, alg)
}

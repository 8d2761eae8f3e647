use aliri::jwt::{self, CoreClaims};
use aliri_clock::UnixTime;
use serde::{Deserialize, Serialize};

/// Claims carried by the authority's ID and access tokens
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(flatten)]
    basic: jwt::BasicClaims,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jti: Option<String>,
}

impl IdentityClaims {
    /// Constructs claims from the registered claims
    pub fn new(basic: jwt::BasicClaims) -> Self {
        Self {
            basic,
            ..Self::default()
        }
    }

    /// Sets the user's email address
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    /// Sets the token identifier
    #[must_use]
    pub fn with_jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }

    /// The user's email address
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Whether the user's email address has been verified
    pub fn email_verified(&self) -> bool {
        self.email_verified
    }

    /// The token identifier
    pub fn jti(&self) -> Option<&str> {
        self.jti.as_deref()
    }
}

impl CoreClaims for IdentityClaims {
    fn nbf(&self) -> Option<UnixTime> {
        self.basic.nbf()
    }

    fn exp(&self) -> Option<UnixTime> {
        self.basic.exp()
    }

    fn aud(&self) -> &jwt::Audiences {
        self.basic.aud()
    }

    fn iss(&self) -> Option<&jwt::IssuerRef> {
        self.basic.iss()
    }

    fn sub(&self) -> Option<&jwt::SubjectRef> {
        self.basic.sub()
    }
}

use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AudienceKey, AudienceKeyRef, IdToken, RefreshToken};

/// A set of credentials issued for a single audience
///
/// A record carrying an `error` has no usable tokens and is refused by the
/// token store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<IdToken>,
    refresh_token: RefreshToken,
    audience: AudienceKey,
    absolute_expiration: UnixTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_expiration: Option<UnixTime>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TokenRecord {
    /// Constructs a record from its parts
    pub fn new(
        audience: AudienceKey,
        access_token: AccessToken,
        id_token: Option<IdToken>,
        refresh_token: RefreshToken,
        absolute_expiration: UnixTime,
    ) -> Self {
        Self {
            access_token,
            id_token,
            refresh_token,
            audience,
            absolute_expiration,
            refresh_expiration: None,
            email_verified: false,
            error: None,
        }
    }

    /// Constructs a failed record that carries no usable tokens
    pub fn failed(audience: AudienceKey, error: impl Into<String>) -> Self {
        Self {
            access_token: AccessToken::from_static(""),
            id_token: None,
            refresh_token: RefreshToken::from_static(""),
            audience,
            absolute_expiration: UnixTime(0),
            refresh_expiration: None,
            email_verified: false,
            error: Some(error.into()),
        }
    }

    /// Records when the refresh token expires, as reported by the authority
    #[must_use]
    pub fn with_refresh_expiration(mut self, refresh_expiration: Option<UnixTime>) -> Self {
        self.refresh_expiration = refresh_expiration;
        self
    }

    /// Records whether the user's email address has been verified
    #[must_use]
    pub fn with_email_verified(mut self, email_verified: bool) -> Self {
        self.email_verified = email_verified;
        self
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    /// Gets the ID token, if one was issued
    #[inline]
    pub fn id_token(&self) -> Option<&IdToken> {
        self.id_token.as_ref()
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshToken {
        &self.refresh_token
    }

    /// Gets the audience these credentials were issued for
    #[inline]
    pub fn audience(&self) -> &AudienceKeyRef {
        &self.audience
    }

    /// Gets the time at which the access token expires
    #[inline]
    pub fn absolute_expiration(&self) -> UnixTime {
        self.absolute_expiration
    }

    /// Gets the refresh token expiration reported by the authority, if any
    #[inline]
    pub fn refresh_expiration(&self) -> Option<UnixTime> {
        self.refresh_expiration
    }

    /// Whether the user's email address was verified when these tokens were issued
    #[inline]
    pub fn email_verified(&self) -> bool {
        self.email_verified
    }

    /// The reason this record carries no usable tokens, if any
    #[inline]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Whether the record carries usable tokens
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.error().is_none()
    }

    /// Gets a duration for how much longer the access token will be valid
    #[inline]
    pub fn until_expired(&self) -> DurationSecs {
        self.until_expired_at(System.now())
    }

    /// Gets a duration for how much longer the access token would be valid
    /// as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        if time < self.absolute_expiration {
            self.absolute_expiration - time
        } else {
            DurationSecs(0)
        }
    }
}

/// Computes absolute expirations for freshly issued tokens
#[derive(Clone, Debug, Default)]
pub struct TokenLifetime<C = System> {
    clock: C,
}

impl TokenLifetime {
    /// Uses the system clock
    pub const fn new() -> Self {
        Self { clock: System }
    }
}

impl<C: Clock> TokenLifetime<C> {
    /// Uses the provided clock
    pub const fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Given the tokens and lifetimes granted by the authority, constructs a record
    ///
    /// Lifetimes too large to represent saturate at the end of time.
    pub fn create_record(
        &self,
        audience: AudienceKey,
        access_token: AccessToken,
        id_token: Option<IdToken>,
        refresh_token: RefreshToken,
        expires_in: DurationSecs,
        refresh_expires_in: Option<DurationSecs>,
    ) -> TokenRecord {
        let issued = self.clock.now();
        TokenRecord::new(
            audience,
            access_token,
            id_token,
            refresh_token,
            expires_after(issued, expires_in),
        )
        .with_refresh_expiration(
            refresh_expires_in
                .filter(|d| d.0 > 0)
                .map(|d| expires_after(issued, d)),
        )
    }
}

fn expires_after(issued: UnixTime, lifetime: DurationSecs) -> UnixTime {
    UnixTime(issued.0.saturating_add(lifetime.0))
}

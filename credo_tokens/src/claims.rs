//! Inspection of token claims without verification
//!
//! These helpers never establish trust in a token. They exist to read
//! bookkeeping claims, such as a refresh token's own expiration, from tokens
//! the client already holds.

use aliri_base64::Base64Url;
use aliri_clock::UnixTime;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UntrustedClaims {
    exp: Option<UnixTime>,
    email_verified: Option<Flag>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

fn untrusted_claims(token: &str) -> Option<UntrustedClaims> {
    let mut parts = token.splitn(4, '.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let payload = Base64Url::from_encoded(payload).ok()?;
    serde_json::from_slice(payload.as_slice()).ok()
}

/// Reads the `exp` claim of a token without verifying it
///
/// Returns `None` if the token is not a JWT or carries no expiration.
pub fn untrusted_expiration(token: &str) -> Option<UnixTime> {
    let exp = untrusted_claims(token).and_then(|c| c.exp);
    if exp.is_none() {
        tracing::trace!("unable to read expiration from token");
    }
    exp
}

/// Reads the `email_verified` claim of a token without verifying it
///
/// Missing or unreadable claims are reported as unverified.
pub fn untrusted_email_verified(token: &str) -> bool {
    untrusted_claims(token)
        .and_then(|c| c.email_verified)
        .map_or(false, |f| f.is_set())
}

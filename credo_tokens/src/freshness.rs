//! Decides whether cached credentials can be used as they are

use aliri_clock::{DurationSecs, UnixTime};

use crate::{claims::untrusted_expiration, TokenRecord};

/// The default margin before expiration at which a token is no longer
/// considered fresh
pub const DEFAULT_SAFE_WINDOW: DurationSecs = DurationSecs(60);

/// The outcome of evaluating cached credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// The cached access token may be used as is
    Fresh,
    /// The access token must be replaced, but the refresh token is still valid
    NeedsRefresh,
    /// No usable credentials remain; the user must authenticate again
    NeedsReauth,
}

/// Evaluates cached credentials against the current time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreshnessPolicy {
    safe_window: DurationSecs,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SAFE_WINDOW)
    }
}

impl FreshnessPolicy {
    /// Constructs a policy with the given safe window
    pub const fn new(safe_window: DurationSecs) -> Self {
        Self { safe_window }
    }

    /// The margin before expiration at which a token stops being fresh
    pub const fn safe_window(&self) -> DurationSecs {
        self.safe_window
    }

    /// Decides what must happen before the record can be handed out
    ///
    /// A forced refresh never returns [`Freshness::Fresh`].
    pub fn decide(
        &self,
        record: Option<&TokenRecord>,
        force_refresh: bool,
        now: UnixTime,
    ) -> Freshness {
        let record = match record {
            Some(r) if r.is_usable() => r,
            _ => return Freshness::NeedsReauth,
        };

        let horizon = UnixTime(now.0.saturating_add(self.safe_window.0));

        if !force_refresh && record.absolute_expiration() > horizon {
            return Freshness::Fresh;
        }

        let refresh_expiration = untrusted_expiration(record.refresh_token().as_str())
            .or_else(|| record.refresh_expiration());

        match refresh_expiration {
            Some(exp) if exp > horizon => Freshness::NeedsRefresh,
            Some(_) => {
                tracing::debug!(audience = %record.audience(), "refresh token has expired");
                Freshness::NeedsReauth
            }
            None => {
                tracing::debug!(
                    audience = %record.audience(),
                    "refresh token expiration is unknown"
                );
                Freshness::NeedsReauth
            }
        }
    }
}

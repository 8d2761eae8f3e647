//! DTOs for interacting with the token endpoint

use aliri_clock::{Clock, DurationSecs};
use serde::{Deserialize, Serialize, Serializer};

use crate::{
    claims::untrusted_email_verified, AccessToken, AccessTokenRef, AudienceKey, AudienceKeyRef,
    ClientIdRef, IdToken, RefreshToken, RefreshTokenRef, TokenLifetime, TokenRecord,
};

/// The grant type used to refresh tokens
pub const REFRESH_GRANT_TYPE: &str = "refresh_token";

/// The grant type used to exchange an external identity for tokens
pub const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// The grant type used to obtain a requesting party token for an audience
pub const RPT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:uma-ticket";

/// The subject token type sent when the exchanged token is an ID token
pub const ID_TOKEN_SUBJECT_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";

pub(super) struct RefreshRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub refresh_token: &'a RefreshTokenRef,
    pub scope: &'a str,
}

impl Serialize for RefreshRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshRequest", 4)?;
        ser.serialize_field("grant_type", REFRESH_GRANT_TYPE)?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("refresh_token", self.refresh_token.as_str())?;
        ser.serialize_field("scope", self.scope)?;
        ser.end()
    }
}

pub(super) struct ExchangeRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub subject_token: &'a str,
    pub subject_issuer: &'a str,
    pub subject_is_id_token: bool,
    pub scope: &'a str,
}

impl Serialize for ExchangeRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ExchangeRequest", 6)?;
        ser.serialize_field("grant_type", TOKEN_EXCHANGE_GRANT_TYPE)?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("subject_token", self.subject_token)?;
        ser.serialize_field("subject_issuer", self.subject_issuer)?;
        if self.subject_is_id_token {
            ser.serialize_field("subject_token_type", ID_TOKEN_SUBJECT_TYPE)?;
        } else {
            ser.skip_field("subject_token_type")?;
        }
        ser.serialize_field("scope", self.scope)?;
        ser.end()
    }
}

pub(super) struct RptRequest<'a> {
    pub audience: &'a AudienceKeyRef,
}

impl Serialize for RptRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RptRequest", 2)?;
        ser.serialize_field("grant_type", RPT_GRANT_TYPE)?;
        ser.serialize_field("audience", self.audience)?;
        ser.end()
    }
}

#[derive(Serialize)]
pub(super) struct LogoutRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub refresh_token: &'a str,
}

/// A successful response from the token endpoint
///
/// The login transport reports the tokens it obtains in this same shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,
    /// The ID token, if issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
    /// The refresh token
    pub refresh_token: RefreshToken,
    /// The lifetime of the access token
    pub expires_in: DurationSecs,
    /// The lifetime of the refresh token, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<DurationSecs>,
}

impl TokenResponse {
    /// Converts the response into a record for the given audience
    pub fn into_record<C: Clock>(
        self,
        audience: AudienceKey,
        lifetime: &TokenLifetime<C>,
    ) -> TokenRecord {
        let email_verified = untrusted_email_verified(self.access_token.as_str());
        lifetime
            .create_record(
                audience,
                self.access_token,
                self.id_token,
                self.refresh_token,
                self.expires_in,
                self.refresh_expires_in,
            )
            .with_email_verified(email_verified)
    }

    /// The access token
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::UnixTime;

    use super::*;
    use crate::ClientId;

    #[test]
    fn exchange_form_includes_subject_type_only_for_id_tokens() -> color_eyre::Result<()> {
        let client_id = ClientId::from_static("game");
        let mut request = ExchangeRequest {
            client_id: &client_id,
            subject_token: "external",
            subject_issuer: "apple",
            subject_is_id_token: true,
            scope: "openid",
        };

        let value = serde_json::to_value(&request)?;
        assert_eq!(value["grant_type"], TOKEN_EXCHANGE_GRANT_TYPE);
        assert_eq!(value["subject_token_type"], ID_TOKEN_SUBJECT_TYPE);

        request.subject_is_id_token = false;
        let value = serde_json::to_value(&request)?;
        assert!(value.get("subject_token_type").is_none());
        assert_eq!(value["subject_issuer"], "apple");
        Ok(())
    }

    #[test]
    fn response_requires_core_fields() {
        let missing_refresh = r#"{"access_token":"a","expires_in":300}"#;
        assert!(serde_json::from_str::<TokenResponse>(missing_refresh).is_err());

        let complete = r#"{"access_token":"a","refresh_token":"r","expires_in":300,"refresh_expires_in":1800}"#;
        let response: TokenResponse = serde_json::from_str(complete).expect("valid response");
        assert_eq!(response.refresh_expires_in, Some(DurationSecs(1_800)));
        assert!(response.id_token.is_none());
    }

    #[test]
    fn unbounded_lifetimes_do_not_overflow() -> color_eyre::Result<()> {
        let body = format!(
            r#"{{"access_token":"a","refresh_token":"r","expires_in":{max},"refresh_expires_in":{max}}}"#,
            max = u64::MAX,
        );
        let response: TokenResponse = serde_json::from_str(&body)?;

        let lifetime = TokenLifetime::with_clock(aliri_clock::TestClock::new(UnixTime(1_000)));
        let record = response.into_record(AudienceKey::main(), &lifetime);
        assert_eq!(record.absolute_expiration(), UnixTime(u64::MAX));
        assert_eq!(record.refresh_expiration(), Some(UnixTime(u64::MAX)));
        Ok(())
    }
}

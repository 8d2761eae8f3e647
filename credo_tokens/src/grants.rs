//! Grants against the authority's token, logout, and email verification endpoints

use std::time::Duration;

use aliri_clock::{Clock, System};
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::{
    AccessTokenRef, AudienceKey, AudienceKeyRef, ClientId, RefreshTokenRef, TokenLifetime,
    TokenRecord,
};

pub mod dto;

/// The default timeout applied to every request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The default scope requested in refresh and exchange grants
pub const DEFAULT_SCOPE: &str = "openid";

/// The endpoints exposed by the authority
#[derive(Clone, Debug)]
pub struct Endpoints {
    /// The token endpoint
    pub token: Url,
    /// The endpoint that sends a verification email to the user
    pub verify_email: Url,
    /// The endpoint that revokes a session
    pub logout: Url,
}

/// An error while performing a grant against the authority
#[derive(Debug, Error)]
pub enum GrantError {
    /// The authority responded with an error status
    #[error("authority responded with {status}: {body}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The response body
        body: String,
    },
    /// The response body did not contain the expected tokens
    #[error("malformed token response from authority: {body}")]
    MalformedResponse {
        /// The underlying deserialization error
        source: serde_json::Error,
        /// The body of the response
        body: String,
    },
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to send the request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
}

impl GrantError {
    /// The status returned by the authority, if it responded
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::BodyRead(e) | Self::RequestSend(e) => e.status(),
            Self::MalformedResponse { .. } => None,
        }
    }

    /// The body returned by the authority, if any
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Rejected { body, .. } | Self::MalformedResponse { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether the request timed out
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::BodyRead(e) | Self::RequestSend(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Whether the authority refused the grant itself, as opposed to failing
    ///
    /// Such a refusal means the credentials used for the grant will never
    /// succeed again and should be discarded.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            Self::Rejected { status, body } => {
                (*status == StatusCode::BAD_REQUEST || *status == StatusCode::UNAUTHORIZED)
                    && body.contains("invalid_grant")
            }
            _ => false,
        }
    }
}

/// Performs grants against an OAuth2 authority on behalf of a public client
#[derive(Debug)]
pub struct GrantClient<C = System> {
    client: reqwest::Client,
    endpoints: Endpoints,
    client_id: ClientId,
    scope: String,
    timeout: Duration,
    id_token_issuers: Vec<String>,
    lifetime: TokenLifetime<C>,
}

impl GrantClient {
    /// Constructs a new grant client
    pub fn new(client: reqwest::Client, endpoints: Endpoints, client_id: ClientId) -> Self {
        Self {
            client,
            endpoints,
            client_id,
            scope: DEFAULT_SCOPE.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            id_token_issuers: vec!["apple".to_owned()],
            lifetime: TokenLifetime::new(),
        }
    }
}

impl<C: Clock> GrantClient<C> {
    /// Sets the scope requested by refresh and exchange grants
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the timeout applied to every request
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the external issuers whose exchanged subject tokens are ID tokens
    #[must_use]
    pub fn with_id_token_issuers(mut self, issuers: Vec<String>) -> Self {
        self.id_token_issuers = issuers;
        self
    }

    /// Uses the provided clock to compute token expirations
    pub fn with_clock<D: Clock>(self, clock: D) -> GrantClient<D> {
        GrantClient {
            client: self.client,
            endpoints: self.endpoints,
            client_id: self.client_id,
            scope: self.scope,
            timeout: self.timeout,
            id_token_issuers: self.id_token_issuers,
            lifetime: TokenLifetime::with_clock(clock),
        }
    }

    /// The client ID used in grants
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Converts tokens obtained elsewhere into a record for the main audience
    pub fn main_record(&self, response: dto::TokenResponse) -> TokenRecord {
        response.into_record(AudienceKey::main(), &self.lifetime)
    }

    /// Exchanges a refresh token for new main session tokens
    #[tracing::instrument(
        err,
        skip(self, refresh_token),
        fields(token_url = %self.endpoints.token, client_id = %self.client_id),
    )]
    pub async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenRecord, GrantError> {
        tracing::trace!("refreshing tokens");

        let form = dto::RefreshRequest {
            client_id: &self.client_id,
            refresh_token,
            scope: &self.scope,
        };
        let req = self.client.post(self.endpoints.token.clone()).form(&form);
        let response = self.token_response(req).await?;
        Ok(self.main_record(response))
    }

    /// Exchanges a token issued by an external identity provider for main session tokens
    #[tracing::instrument(
        err,
        skip(self, subject_token),
        fields(token_url = %self.endpoints.token, client_id = %self.client_id),
    )]
    pub async fn exchange(
        &self,
        subject_token: &str,
        subject_issuer: &str,
    ) -> Result<TokenRecord, GrantError> {
        tracing::trace!("exchanging external token");

        let form = dto::ExchangeRequest {
            client_id: &self.client_id,
            subject_token,
            subject_issuer,
            subject_is_id_token: self.id_token_issuers.iter().any(|i| i == subject_issuer),
            scope: &self.scope,
        };
        let req = self.client.post(self.endpoints.token.clone()).form(&form);
        let response = self.token_response(req).await?;
        Ok(self.main_record(response))
    }

    /// Obtains a requesting party token for the audience using the main session
    #[tracing::instrument(
        err,
        skip(self, main_access_token),
        fields(token_url = %self.endpoints.token),
    )]
    pub async fn rpt(
        &self,
        main_access_token: &AccessTokenRef,
        audience: &AudienceKeyRef,
    ) -> Result<TokenRecord, GrantError> {
        tracing::trace!("requesting audience token");

        let form = dto::RptRequest { audience };
        let req = self
            .client
            .post(self.endpoints.token.clone())
            .bearer_auth(main_access_token.as_str())
            .form(&form);
        let response = self.token_response(req).await?;
        Ok(response.into_record(audience.to_owned(), &self.lifetime))
    }

    /// Revokes the session associated with the refresh token
    #[tracing::instrument(
        err,
        skip(self, refresh_token),
        fields(logout_url = %self.endpoints.logout, client_id = %self.client_id),
    )]
    pub async fn logout(&self, refresh_token: &RefreshTokenRef) -> Result<(), GrantError> {
        let form = dto::LogoutRequest {
            client_id: &self.client_id,
            refresh_token: refresh_token.as_str(),
        };
        let req = self.client.post(self.endpoints.logout.clone()).form(&form);
        self.send(req).await?;
        tracing::info!("session revoked");
        Ok(())
    }

    /// Asks the authority to send a verification email to the user
    #[tracing::instrument(
        err,
        skip(self, access_token),
        fields(verify_email_url = %self.endpoints.verify_email),
    )]
    pub async fn send_verification_email(
        &self,
        access_token: &AccessTokenRef,
    ) -> Result<(), GrantError> {
        let req = self
            .client
            .post(self.endpoints.verify_email.clone())
            .bearer_auth(access_token.as_str())
            .header(reqwest::header::CONTENT_LENGTH, 0);
        self.send(req).await?;
        tracing::info!("verification email requested");
        Ok(())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, GrantError> {
        let resp = req
            .timeout(self.timeout)
            .send()
            .await
            .map_err(GrantError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from authority"
        );

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.map_err(GrantError::BodyRead)?;
            return Err(GrantError::Rejected { status, body });
        }

        Ok(resp)
    }

    async fn token_response(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<dto::TokenResponse, GrantError> {
        let resp = self.send(req).await?;
        let body = resp.bytes().await.map_err(GrantError::BodyRead)?;
        let response: dto::TokenResponse =
            serde_json::from_slice(&body).map_err(|source| GrantError::MalformedResponse {
                source,
                body: String::from_utf8_lossy(&body).into_owned(),
            })?;

        tracing::info!(
            has_id_token = response.id_token.is_some(),
            lifetime = response.expires_in.0,
            "received new tokens"
        );

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::{DurationSecs, TestClock, UnixTime};
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{AccessToken, RefreshToken};

    async fn client(server: &MockServer) -> GrantClient<TestClock> {
        let base = Url::parse(&server.uri()).expect("mock server uri");
        let endpoints = Endpoints {
            token: base.join("/token").expect("url"),
            verify_email: base.join("/verify").expect("url"),
            logout: base.join("/logout").expect("url"),
        };
        GrantClient::new(reqwest::Client::new(), endpoints, ClientId::from_static("game"))
            .with_timeout(Duration::from_millis(500))
            .with_clock(TestClock::new(UnixTime(1_000)))
    }

    #[tokio::test]
    async fn refresh_produces_a_main_record() -> color_eyre::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .and(body_string_contains("scope=openid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 300,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = client(&server)
            .await
            .refresh(&RefreshToken::from_static("old-refresh"))
            .await?;

        assert!(record.audience().is_main());
        assert_eq!(record.access_token().as_str(), "new-access");
        assert_eq!(record.absolute_expiration(), UnixTime(1_300));
        Ok(())
    }

    #[tokio::test]
    async fn rpt_uses_bearer_main_token() -> color_eyre::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("authorization", "Bearer main-access"))
            .and(body_string_contains("audience=billing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "billing-access",
                "refresh_token": "billing-refresh",
                "expires_in": 60,
                "refresh_expires_in": 600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = client(&server)
            .await
            .rpt(
                &AccessToken::from_static("main-access"),
                AudienceKeyRef::from_static("billing"),
            )
            .await?;

        assert_eq!(record.audience().as_str(), "billing");
        assert_eq!(record.refresh_expiration(), Some(UnixTime(1_600)));
        assert_eq!(record.until_expired_at(UnixTime(1_000)), DurationSecs(60));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_grant_is_detected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"Token is not active"}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .refresh(&RefreshToken::from_static("revoked"))
            .await
            .expect_err("grant should be refused");

        assert!(err.is_invalid_grant());
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn missing_fields_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "only-access",
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .refresh(&RefreshToken::from_static("r"))
            .await
            .expect_err("response is incomplete");

        assert!(matches!(err, GrantError::MalformedResponse { .. }));
        assert!(!err.is_invalid_grant());
    }

    #[tokio::test]
    async fn slow_authority_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logout"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .logout(&RefreshToken::from_static("r"))
            .await
            .expect_err("request should time out");

        assert!(err.is_timeout());
    }
}

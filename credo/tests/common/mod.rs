#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use aliri::{jwa, jwk, jwt, Jwk, Jwks};
use aliri_base64::Base64Url;
use aliri_clock::{Clock, System, UnixTime};
use credo::{
    AudienceKey, AuthEvent, Authenticator, DispatchPump, InMemoryStorage, KeyMaterial, RawConfig,
    TokenRecord,
};
use credo_oidc::IdentityClaims;
use credo_tokens::{store::TokenStore, AccessToken, IdToken, RefreshToken};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const CLIENT_ID: &str = "game-client";
pub const KEY_MATERIAL: &[u8] = b"integration test key material";
const KEY_ID: &str = "test-key";

pub fn now() -> i64 {
    System.now().0 as i64
}

pub fn key_material() -> KeyMaterial {
    KeyMaterial::new(KEY_MATERIAL.to_vec())
}

/// A mock authority that publishes an HS256 signing key
pub struct Authority {
    pub server: MockServer,
    jwk: Jwk,
}

impl Authority {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let jwk = Jwk::from(jwa::Hmac::new(Base64Url::from_raw(
            b"integration tests sign with this secret".to_vec(),
        )))
        .with_algorithm(jwa::Algorithm::HS256)
        .with_key_id(jwk::KeyId::from_static(KEY_ID));

        let mut jwks = Jwks::default();
        jwks.add_key(jwk.clone());

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "jwks_uri": format!("{}/certs", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&jwks))
            .mount(&server)
            .await;

        Self { server, jwk }
    }

    pub fn raw_config(&self) -> RawConfig {
        let uri = self.server.uri();
        RawConfig {
            issuer: Some(uri.clone()),
            client_id: Some(CLIENT_ID.to_owned()),
            callback_url: Some("com.example.game:/oauth2redirect".to_owned()),
            token_endpoint: Some(format!("{}/token", uri)),
            verify_email_endpoint: Some(format!("{}/verify-email", uri)),
            logout_endpoint: Some(format!("{}/logout", uri)),
            approved_algorithms: Some(vec![jwa::Algorithm::HS256]),
            refresh_on_init: Some(false),
            ..RawConfig::default()
        }
    }

    fn sign(&self, claims: &IdentityClaims) -> String {
        let headers =
            jwt::BasicHeaders::with_key_id(jwa::Algorithm::HS256, jwk::KeyId::from_static(KEY_ID));
        aliri::Jwt::try_from_parts_with_signature(&headers, claims, &self.jwk)
            .expect("signing succeeds")
            .as_str()
            .to_owned()
    }

    fn claims(&self, audience: &str, lifetime: i64, email_verified: bool) -> IdentityClaims {
        IdentityClaims::new(
            jwt::BasicClaims::new()
                .with_issuer(jwt::Issuer::new(self.server.uri()))
                .with_audience(jwt::Audience::new(audience.to_owned()))
                .with_subject(jwt::Subject::from_static("player-1"))
                .with_expiration(UnixTime((now() + lifetime).max(0) as u64)),
        )
        .with_email("player@example.com", email_verified)
    }

    pub fn id_token(&self, lifetime: i64) -> String {
        self.sign(&self.claims(CLIENT_ID, lifetime, false))
    }

    pub fn access_token(&self, audience: &str, lifetime: i64, email_verified: bool) -> String {
        self.sign(&self.claims(audience, lifetime, email_verified))
    }

    pub fn refresh_token(&self, lifetime: i64) -> String {
        self.sign(&self.claims(self.server.uri().as_str(), lifetime, false))
    }

    /// A token endpoint response for the main session
    pub fn session_response(&self, email_verified: bool) -> serde_json::Value {
        serde_json::json!({
            "access_token": self.access_token("account", 300, email_verified),
            "id_token": self.id_token(300),
            "refresh_token": self.refresh_token(3_600),
            "expires_in": 300,
            "refresh_expires_in": 3_600,
        })
    }

    /// A token endpoint response for a requesting party token
    pub fn audience_response(&self, audience: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": self.access_token(audience, 300, false),
            "refresh_token": self.refresh_token(3_600),
            "expires_in": 300,
        })
    }

    /// A main session record whose access token expires after `lifetime` seconds
    pub fn main_record(&self, lifetime: i64, refresh_lifetime: i64, email_verified: bool) -> TokenRecord {
        TokenRecord::new(
            AudienceKey::main(),
            AccessToken::new(self.access_token("account", lifetime, email_verified)),
            Some(IdToken::new(self.id_token(lifetime))),
            RefreshToken::new(self.refresh_token(refresh_lifetime)),
            UnixTime((now() + lifetime).max(0) as u64),
        )
        .with_email_verified(email_verified)
    }

    pub fn audience_record(&self, audience: &str, lifetime: i64) -> TokenRecord {
        TokenRecord::new(
            AudienceKey::new(audience.to_owned()),
            AccessToken::new(self.access_token(audience, lifetime, false)),
            None,
            RefreshToken::new(self.refresh_token(3_600)),
            UnixTime((now() + lifetime).max(0) as u64),
        )
    }
}

pub fn store(storage: &Arc<InMemoryStorage>) -> TokenStore {
    TokenStore::new(Arc::clone(storage), &key_material()).expect("key derivation succeeds")
}

pub async fn seed(storage: &Arc<InMemoryStorage>, record: &TokenRecord) {
    store(storage)
        .put(record.audience(), record)
        .await
        .expect("record is storable");
}

pub fn authenticator(raw: RawConfig, storage: &Arc<InMemoryStorage>) -> (Authenticator, DispatchPump) {
    Authenticator::builder(raw, Arc::clone(storage), key_material())
        .build()
        .expect("a runtime is available")
}

pub fn record_events(auth: &Authenticator) -> Arc<Mutex<Vec<AuthEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    auth.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// Drives the pump until `done` reports true
pub async fn pump_until(pump: &mut DispatchPump, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        pump.drain();
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached while pumping");
}

//! Retrieval and caching of OpenID Connect discovery documents and their key sets

use std::{collections::HashMap, sync::Arc, time::Duration};

use aliri::{jwt, Jwks};
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use arc_swap::ArcSwap;
use reqwest::{
    header::{self, HeaderValue},
    Client, StatusCode,
};
use serde::Deserialize;
use thiserror::Error;

/// The path, relative to the issuer, of the discovery document
pub const CONFIGURATION_SUFFIX: &str = ".well-known/openid-configuration";

/// The default age after which a cached document is fetched again
pub const DEFAULT_MAX_AGE: DurationSecs = DurationSecs(3_600);

/// The default timeout applied to every request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the discovery URL for an issuer
pub fn discovery_url(issuer: &str) -> String {
    format!("{}/{}", issuer.trim_end_matches('/'), CONFIGURATION_SUFFIX)
}

/// An error while retrieving a discovery document or its key set
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Unable to send the request
    #[error("error requesting {url}")]
    Request {
        /// The requested URL
        url: String,
        /// The underlying request error
        source: reqwest::Error,
    },
    /// The server responded with an unexpected status
    #[error("{url} responded with {status}")]
    Status {
        /// The requested URL
        url: String,
        /// The response status
        status: StatusCode,
    },
    /// The response could not be parsed
    #[error("invalid document received from {url}")]
    InvalidDocument {
        /// The requested URL
        url: String,
        /// The underlying decoding error
        source: reqwest::Error,
    },
}

#[derive(Debug, Deserialize)]
struct OidcConfiguration {
    issuer: jwt::Issuer,
    jwks_uri: String,
}

/// The parts of a discovery document needed to validate tokens
#[derive(Debug)]
pub struct DiscoveryDocument {
    issuer: jwt::Issuer,
    jwks_uri: String,
    jwks: Jwks,
    fetched_at: UnixTime,
    etag: Option<HeaderValue>,
}

impl DiscoveryDocument {
    /// The issuer that tokens must name
    pub fn issuer(&self) -> &jwt::IssuerRef {
        &self.issuer
    }

    /// Where the signing keys were retrieved from
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// The signing keys
    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }

    /// When the document was last retrieved
    pub fn fetched_at(&self) -> UnixTime {
        self.fetched_at
    }
}

/// A cache of discovery documents keyed by discovery URL
///
/// Documents are retrieved on first use, again once older than the maximum
/// age, and on demand through [`refresh`][DiscoveryCache::refresh]. A failed
/// retrieval leaves any cached document in place.
#[derive(Debug)]
pub struct DiscoveryCache<C = System> {
    client: Client,
    documents: ArcSwap<HashMap<String, Arc<DiscoveryDocument>>>,
    max_age: DurationSecs,
    timeout: Duration,
    clock: C,
}

impl DiscoveryCache {
    /// Constructs a new, empty cache
    pub fn new(client: Client) -> Self {
        Self::with_clock(client, System)
    }
}

impl<C: Clock> DiscoveryCache<C> {
    /// Constructs a new, empty cache using the provided clock
    pub fn with_clock(client: Client, clock: C) -> Self {
        Self {
            client,
            documents: ArcSwap::from_pointee(HashMap::new()),
            max_age: DEFAULT_MAX_AGE,
            timeout: DEFAULT_TIMEOUT,
            clock,
        }
    }

    /// Sets the age after which a cached document is fetched again
    #[must_use]
    pub fn with_max_age(self, max_age: DurationSecs) -> Self {
        Self { max_age, ..self }
    }

    /// Sets the timeout applied to every request
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Gets the cached document, retrieving it if absent or stale
    pub async fn get(&self, url: &str) -> Result<Arc<DiscoveryDocument>, DiscoveryError> {
        let cached = self.documents.load().get(url).cloned();
        match cached {
            Some(doc) if self.clock.now().0 < doc.fetched_at.0.saturating_add(self.max_age.0) => Ok(doc),
            previous => self.fetch(url, previous.as_deref()).await,
        }
    }

    /// Retrieves the document again, regardless of its age
    pub async fn refresh(&self, url: &str) -> Result<Arc<DiscoveryDocument>, DiscoveryError> {
        let previous = self.documents.load().get(url).cloned();
        self.fetch(url, previous.as_deref()).await
    }

    #[tracing::instrument(skip(self, previous), fields(discovery.url = %url))]
    async fn fetch(
        &self,
        url: &str,
        previous: Option<&DiscoveryDocument>,
    ) -> Result<Arc<DiscoveryDocument>, DiscoveryError> {
        tracing::debug!("retrieving discovery document");

        let config: OidcConfiguration = self.get_json(self.client.get(url), url).await?;

        let mut request = self.client.get(&config.jwks_uri);
        let reusable = previous.filter(|p| p.jwks_uri == config.jwks_uri);
        if let Some(etag) = reusable.and_then(|p| p.etag.as_ref()) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let response = self.send(request, &config.jwks_uri).await?;
        let (jwks, etag) = match (response.status(), reusable) {
            (StatusCode::NOT_MODIFIED, Some(previous)) => {
                tracing::debug!("JWKS not modified");
                (previous.jwks.clone(), previous.etag.clone())
            }
            _ => {
                let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
                let jwks = response.json::<Jwks>().await.map_err(|source| {
                    DiscoveryError::InvalidDocument {
                        url: config.jwks_uri.clone(),
                        source,
                    }
                })?;
                tracing::info!(jwks.url = %config.jwks_uri, keys = jwks.keys().len(), "JWKS refreshed");
                (jwks, etag)
            }
        };

        let document = Arc::new(DiscoveryDocument {
            issuer: config.issuer,
            jwks_uri: config.jwks_uri,
            jwks,
            fetched_at: self.clock.now(),
            etag,
        });

        self.documents.rcu(|documents| {
            let mut documents = HashMap::clone(documents);
            documents.insert(url.to_owned(), Arc::clone(&document));
            documents
        });

        Ok(document)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, DiscoveryError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| DiscoveryError::Request {
                url: url.to_owned(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED || status.is_success() {
            Ok(response)
        } else {
            tracing::warn!(
                http.status_code = status.as_u16(),
                %url,
                "discovery failed; unexpected response status"
            );
            Err(DiscoveryError::Status {
                url: url.to_owned(),
                status,
            })
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T, DiscoveryError> {
        self.send(request, url)
            .await?
            .json::<T>()
            .await
            .map_err(|source| DiscoveryError::InvalidDocument {
                url: url.to_owned(),
                source,
            })
    }
}

//! Single-flight token requests, one in flight per audience
//!
//! The first request for an audience becomes the leader and does the work on
//! the runtime. Requests arriving while the leader is busy are queued behind
//! it and receive the same outcome, in the order they arrived.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aliri::jwt;
use aliri_clock::{Clock, System};
use credo_oidc::TokenValidator;
use credo_tokens::{
    freshness::{Freshness, FreshnessPolicy},
    grants::GrantClient,
    store::TokenStore,
    AudienceKey, AudienceKeyRef, TokenRecord,
};
use tokio::{runtime::Handle, sync::oneshot};

use crate::{
    events::{AuthEvent, EventBus},
    login::LoginTransport,
    state::{Activity, StateMachine},
    AuthError, Config,
};

/// Receives the outcome of a token request
pub type TokenCallback = Box<dyn FnOnce(Result<TokenRecord, AuthError>) + Send + 'static>;

pub(crate) enum Waiter {
    /// Delivered through the dispatch queue
    Callback(TokenCallback),
    /// Delivered directly to an awaiting task
    Internal(oneshot::Sender<Result<TokenRecord, AuthError>>),
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Internal(_) => f.write_str("Internal"),
        }
    }
}

/// The collaborators a coordinator resolves requests with
#[derive(Debug)]
pub(crate) struct Services {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<TokenStore>,
    pub(crate) grants: Arc<GrantClient>,
    pub(crate) validator: TokenValidator,
    pub(crate) login: Arc<dyn LoginTransport>,
    pub(crate) state: Arc<StateMachine>,
    pub(crate) events: EventBus,
    pub(crate) runtime: Handle,
}

#[derive(Debug)]
struct Inner {
    services: Services,
    policy: FreshnessPolicy,
    pending: Mutex<HashMap<AudienceKey, Vec<Waiter>>>,
}

#[derive(Clone, Debug)]
pub(crate) struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub(crate) fn new(services: Services) -> Self {
        let policy = FreshnessPolicy::new(services.config.safe_window());
        Self {
            inner: Arc::new(Inner {
                services,
                policy,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn services(&self) -> &Services {
        &self.inner.services
    }

    pub(crate) fn policy(&self) -> &FreshnessPolicy {
        &self.inner.policy
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<AudienceKey, Vec<Waiter>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the waiter, starting work for the audience if none is in flight
    pub(crate) fn request(&self, audience: AudienceKey, force_refresh: bool, waiter: Waiter) {
        let leader = {
            let mut pending = self.pending();
            let queue = pending.entry(audience.clone()).or_default();
            queue.push(waiter);
            queue.len() == 1
        };

        if !leader {
            tracing::debug!(%audience, force_refresh, "joining in-flight token request");
            return;
        }

        tracing::debug!(%audience, force_refresh, "starting token request");
        self.services().events.emit(AuthEvent::TokenRequestStarted {
            audience: audience.clone(),
        });

        let leader = Leader {
            coordinator: self.clone(),
            audience,
            settled: false,
        };
        self.services().runtime.spawn(async move {
            let result = leader
                .coordinator
                .resolve(&leader.audience, force_refresh)
                .await;
            leader.finish(result);
        });
    }

    /// Requests a token and waits for the outcome
    pub(crate) async fn token(
        &self,
        audience: AudienceKey,
        force_refresh: bool,
    ) -> Result<TokenRecord, AuthError> {
        let (tx, rx) = oneshot::channel();
        self.request(audience, force_refresh, Waiter::Internal(tx));
        rx.await.unwrap_or(Err(AuthError::Cancelled))
    }

    async fn resolve(
        &self,
        audience: &AudienceKeyRef,
        force_refresh: bool,
    ) -> Result<TokenRecord, AuthError> {
        if audience.is_main() {
            self.resolve_main(force_refresh).await
        } else {
            self.resolve_audience(audience, force_refresh).await
        }
    }

    async fn resolve_main(&self, force_refresh: bool) -> Result<TokenRecord, AuthError> {
        let services = self.services();
        let record = services.store.get(AudienceKeyRef::main()).await;

        match (self.policy().decide(record.as_ref(), force_refresh, System.now()), record) {
            (Freshness::Fresh, Some(record)) => {
                tracing::trace!("cached session is fresh");
                self.validate_main(&record).await?;
                Ok(record)
            }
            (Freshness::NeedsRefresh, Some(record)) => {
                let _guard = services.state.track(Activity::Refreshing);
                match services.grants.refresh(record.refresh_token()).await {
                    Ok(refreshed) => self.accept_main(refreshed).await,
                    Err(error) if error.is_invalid_grant() => {
                        tracing::warn!("refresh token was refused; removing session");
                        self.discard(AudienceKeyRef::main()).await;
                        Err(AuthError::ExpiredRefreshCredentials)
                    }
                    Err(error) => Err(error.into()),
                }
            }
            (_, record) if services.config.interactive_reauth() => {
                tracing::debug!(stored = record.is_some(), "session requires interactive login");
                self.login().await
            }
            (_, Some(_)) => {
                tracing::info!("refresh token expired; removing session");
                self.discard(AudienceKeyRef::main()).await;
                Err(AuthError::ExpiredRefreshCredentials)
            }
            (_, None) => Err(AuthError::NoValidCredentials),
        }
    }

    async fn resolve_audience(
        &self,
        audience: &AudienceKeyRef,
        force_refresh: bool,
    ) -> Result<TokenRecord, AuthError> {
        let services = self.services();
        let record = services.store.get(audience).await;

        if let (Freshness::Fresh, Some(record)) = (
            self.policy().decide(record.as_ref(), force_refresh, System.now()),
            record,
        ) {
            tracing::trace!(%audience, "cached audience token is fresh");
            return Ok(record);
        }

        if services.store.get(AudienceKeyRef::main()).await.is_none() {
            tracing::debug!(%audience, "no session to request an audience token with");
            return Err(AuthError::NoValidCredentials);
        }

        let main = self.token(AudienceKey::main(), false).await?;

        let _guard = services.state.track(Activity::Refreshing);
        let record = services.grants.rpt(main.access_token(), audience).await?;
        services
            .validator
            .validate(
                record.access_token().as_str(),
                None,
                &services.config.discovery_url(),
            )
            .await?;
        services.store.put(audience, &record).await?;

        tracing::info!(
            %audience,
            expires_in = record.until_expired().0,
            "obtained audience token"
        );
        Ok(record)
    }

    /// Runs the login transport and accepts the resulting session
    pub(crate) async fn login(&self) -> Result<TokenRecord, AuthError> {
        let services = self.services();
        let _guard = services.state.track(Activity::Authenticating);
        let response = services.login.start_login(&services.config).await?;
        self.accept_main(services.grants.main_record(response)).await
    }

    /// Validates and persists a new main session
    ///
    /// Emits [`AuthEvent::EmailVerificationSucceeded`] when the stored session
    /// was unverified and the new one is verified.
    pub(crate) async fn accept_main(&self, record: TokenRecord) -> Result<TokenRecord, AuthError> {
        let services = self.services();
        self.validate_main(&record).await?;

        let previous = services.store.get(AudienceKeyRef::main()).await;
        services.store.put(AudienceKeyRef::main(), &record).await?;

        if previous.map_or(false, |p| !p.email_verified()) && record.email_verified() {
            tracing::info!("email address verified");
            services.events.emit(AuthEvent::EmailVerificationSucceeded);
        }

        tracing::info!(expires_in = record.until_expired().0, "session tokens stored");
        Ok(record)
    }

    async fn validate_main(&self, record: &TokenRecord) -> Result<(), AuthError> {
        let services = self.services();
        let discovery_url = services.config.discovery_url();
        match record.id_token() {
            Some(id_token) => {
                let audience = jwt::AudienceRef::from_str(services.config.client_id().as_str());
                services
                    .validator
                    .validate(id_token.as_str(), Some(audience), &discovery_url)
                    .await?;
            }
            None => {
                services
                    .validator
                    .validate(record.access_token().as_str(), None, &discovery_url)
                    .await?;
            }
        }
        Ok(())
    }

    async fn discard(&self, audience: &AudienceKeyRef) {
        if let Err(error) = self.services().store.delete(audience).await {
            tracing::warn!(
                %audience,
                error = (&error as &dyn std::error::Error),
                "unable to remove stored tokens"
            );
        }
    }

    fn complete(&self, audience: &AudienceKeyRef, result: Result<TokenRecord, AuthError>) {
        let services = self.services();
        let result = settle(audience, result);

        let waiters = self.pending().remove(audience).unwrap_or_default();

        match &result {
            Ok(_) => {
                tracing::debug!(%audience, waiters = waiters.len(), "token request succeeded");
                services.events.emit(AuthEvent::TokenRequestSucceeded {
                    audience: audience.to_owned(),
                });
            }
            Err(error) => {
                if let AuthError::AudienceMismatch { .. } = error {
                    tracing::error!(%audience, %error, "token request resolved for the wrong audience");
                    services.events.emit(AuthEvent::InternalError {
                        message: error.to_string(),
                    });
                } else {
                    tracing::debug!(%audience, %error, waiters = waiters.len(), "token request failed");
                }
                services.events.emit(AuthEvent::TokenRequestFailed {
                    audience: audience.to_owned(),
                    error: error.clone(),
                });
            }
        }

        for waiter in waiters {
            let outcome = result.clone();
            match waiter {
                Waiter::Callback(callback) => {
                    services.events.dispatcher().enqueue(move || callback(outcome));
                }
                Waiter::Internal(tx) => {
                    let _ = tx.send(outcome);
                }
            }
        }
    }
}

/// Owns the queue for an audience until its outcome is delivered
///
/// If the leading task unwinds or is dropped by the runtime before
/// finishing, every queued waiter receives [`AuthError::Cancelled`] and the
/// audience becomes available to new requests.
#[derive(Debug)]
struct Leader {
    coordinator: Coordinator,
    audience: AudienceKey,
    settled: bool,
}

impl Leader {
    fn finish(mut self, result: Result<TokenRecord, AuthError>) {
        self.settled = true;
        self.coordinator.complete(&self.audience, result);
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        tracing::error!(audience = %self.audience, "token request abandoned before completing");
        self.coordinator
            .services()
            .events
            .emit(AuthEvent::InternalError {
                message: format!("token request for {} was abandoned", self.audience),
            });
        self.coordinator
            .complete(&self.audience, Err(AuthError::Cancelled));
    }
}

/// Refuses a record that was issued for a different audience than requested
fn settle(
    audience: &AudienceKeyRef,
    result: Result<TokenRecord, AuthError>,
) -> Result<TokenRecord, AuthError> {
    match result {
        Ok(record) if record.audience() != audience => Err(AuthError::AudienceMismatch {
            expected: audience.to_owned(),
            actual: record.audience().to_owned(),
        }),
        other => other,
    }
}

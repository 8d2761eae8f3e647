use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use aliri_clock::{Clock, System};
use credo_oidc::{DiscoveryCache, TokenValidator};
use credo_tokens::{
    freshness::Freshness,
    grants::GrantClient,
    store::{KeyMaterial, SecureStorage, TokenStore},
    AudienceKey, AudienceKeyRef, TokenRecord,
};
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};

use crate::{
    coordinator::{Coordinator, Services, TokenCallback, Waiter},
    dispatch::{self, DispatchPump},
    events::{AuthEvent, EventBus, SubscriptionId, LOGOUT_WITHOUT_CREDENTIALS},
    login::{LoginTransport, UnsupportedPlatform},
    state::{Activity, AuthState, Begin, StateMachine},
    AuthError, Config, RawConfig,
};

const USER_AGENT: &str = concat!("credo/", env!("CARGO_PKG_VERSION"));

/// An error constructing an [`Authenticator`]
#[derive(Debug, Error)]
pub enum BuildError {
    /// No runtime was provided and none is running on this thread
    #[error("no tokio runtime available to run token requests on")]
    NoRuntime(#[from] TryCurrentError),
}

/// Configures and constructs an [`Authenticator`]
pub struct AuthenticatorBuilder {
    raw: RawConfig,
    storage: Arc<dyn SecureStorage>,
    key_material: KeyMaterial,
    login: Arc<dyn LoginTransport>,
    runtime: Option<Handle>,
}

impl fmt::Debug for AuthenticatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthenticatorBuilder")
            .field("raw", &self.raw)
            .field("storage", &self.storage)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl AuthenticatorBuilder {
    /// Uses the provided platform login flow
    #[must_use]
    pub fn with_login_transport<L>(mut self, login: L) -> Self
    where
        L: LoginTransport + 'static,
    {
        self.login = Arc::new(login);
        self
    }

    /// Runs token requests on the provided runtime
    ///
    /// Defaults to the runtime current when [`build`][Self::build] is called.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Constructs the authenticator and the pump that delivers its callbacks
    ///
    /// The authenticator starts [uninitialized][AuthState::Uninitialized].
    pub fn build(self) -> Result<(Authenticator, DispatchPump), BuildError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };
        let (dispatcher, pump) = dispatch::channel();

        let authenticator = Authenticator {
            shared: Arc::new(Shared {
                raw: self.raw,
                storage: self.storage,
                key_material: self.key_material,
                login: self.login,
                runtime,
                events: EventBus::new(dispatcher),
                state: Arc::new(StateMachine::default()),
                coordinator: RwLock::new(None),
            }),
        };

        Ok((authenticator, pump))
    }
}

struct Shared {
    raw: RawConfig,
    storage: Arc<dyn SecureStorage>,
    key_material: KeyMaterial,
    login: Arc<dyn LoginTransport>,
    runtime: Handle,
    events: EventBus,
    state: Arc<StateMachine>,
    coordinator: RwLock<Option<Coordinator>>,
}

/// Manages the credentials of a single user
///
/// Cloning an authenticator produces another handle to the same state.
/// Callbacks passed to [`request_token`][Self::request_token] and listeners
/// registered with [`subscribe`][Self::subscribe] run only when the
/// [`DispatchPump`] returned alongside the authenticator is driven.
#[derive(Clone)]
pub struct Authenticator {
    shared: Arc<Shared>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("state", &self.state())
            .field("login", &self.shared.login)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Starts configuring an authenticator
    ///
    /// Credentials are sealed with a key derived from `key_material` before
    /// being written to `storage`.
    pub fn builder<S>(raw: RawConfig, storage: S, key_material: KeyMaterial) -> AuthenticatorBuilder
    where
        S: SecureStorage + 'static,
    {
        AuthenticatorBuilder {
            raw,
            storage: Arc::new(storage),
            key_material,
            login: Arc::new(UnsupportedPlatform),
            runtime: None,
        }
    }

    /// The current lifecycle state
    pub fn state(&self) -> AuthState {
        self.shared.state.state()
    }

    /// Whether the given sub-flow is running
    pub fn is_active(&self, activity: Activity) -> bool {
        self.shared.state.is_active(activity)
    }

    /// Registers a listener for lifecycle events
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    /// Removes a listener, returning whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    fn coordinator(&self) -> Result<Coordinator, AuthError> {
        self.shared.state.ensure_ready()?;
        self.shared
            .coordinator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AuthError::NotInitialized)
    }

    /// Validates the configuration and prepares the authenticator for use
    ///
    /// Calling this while initialization is in progress, or after it has
    /// succeeded, does nothing. After a failure it may be called again.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), AuthError> {
        if let Begin::Skipped(state) = self.shared.state.begin_initialize() {
            tracing::debug!(%state, "skipping initialization");
            return Ok(());
        }

        match self.build_coordinator().await {
            Ok(coordinator) => {
                *self
                    .shared
                    .coordinator
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(coordinator.clone());
                self.shared.state.finish_initialize(true);
                self.shared.events.emit(AuthEvent::InitializationSucceeded);

                let services = coordinator.services();
                if services.config.refresh_on_init()
                    && services.store.get(AudienceKeyRef::main()).await.is_some()
                {
                    tracing::debug!("refreshing stored session");
                    coordinator.request(
                        AudienceKey::main(),
                        true,
                        Waiter::Callback(Box::new(|result| {
                            if let Err(error) = result {
                                tracing::info!(%error, "stored session could not be refreshed");
                            }
                        })),
                    );
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "initialization failed");
                self.shared.state.finish_initialize(false);
                self.shared.events.emit(AuthEvent::InitializationFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn build_coordinator(&self) -> Result<Coordinator, AuthError> {
        let shared = &self.shared;
        let config = Arc::new(shared.raw.validate()?);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| AuthError::NetworkError {
                status: None,
                body: None,
                message: error.to_string(),
            })?;

        let discovery = DiscoveryCache::new(client.clone())
            .with_max_age(config.discovery_max_age())
            .with_timeout(config.request_timeout());
        let validator = TokenValidator::new(Arc::new(discovery))
            .with_approved_algorithms(config.approved_algorithms().to_vec());

        let grants = GrantClient::new(client, config.endpoints().clone(), config.client_id().clone())
            .with_scope(config.scope())
            .with_timeout(config.request_timeout())
            .with_id_token_issuers(config.id_token_subject_issuers().to_vec());

        let store = TokenStore::new(Arc::clone(&shared.storage), &shared.key_material)?;

        shared.login.initialize(&config).await?;

        tracing::info!(issuer = config.issuer(), client_id = %config.client_id(), "authenticator configured");

        Ok(Coordinator::new(Services {
            config,
            store: Arc::new(store),
            grants: Arc::new(grants),
            validator,
            login: Arc::clone(&shared.login),
            state: Arc::clone(&shared.state),
            events: shared.events.clone(),
            runtime: shared.runtime.clone(),
        }))
    }

    /// Requests credentials for the audience, delivering them to `callback`
    ///
    /// Concurrent requests for the same audience share a single network
    /// exchange. The callback runs on the dispatch pump.
    pub fn request_token<F>(&self, audience: AudienceKey, force_refresh: bool, callback: F)
    where
        F: FnOnce(Result<TokenRecord, AuthError>) + Send + 'static,
    {
        let callback: TokenCallback = Box::new(callback);
        match self.coordinator() {
            Ok(coordinator) => coordinator.request(audience, force_refresh, Waiter::Callback(callback)),
            Err(error) => {
                tracing::debug!(%audience, %error, "token requested before initialization");
                self.shared
                    .events
                    .dispatcher()
                    .enqueue(move || callback(Err(error)));
            }
        }
    }

    /// Requests credentials for the audience and waits for them
    ///
    /// Shares in-flight work with [`request_token`][Self::request_token].
    pub async fn token(
        &self,
        audience: AudienceKey,
        force_refresh: bool,
    ) -> Result<TokenRecord, AuthError> {
        self.coordinator()?.token(audience, force_refresh).await
    }

    /// Runs the platform login flow and stores the resulting session
    #[tracing::instrument(skip(self))]
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let coordinator = self.coordinator()?;
        let events = &self.shared.events;

        events.emit(AuthEvent::AuthenticationStarted);
        match coordinator.login().await {
            Ok(_) => {
                events.emit(AuthEvent::AuthenticationSucceeded);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "authentication failed");
                events.emit(AuthEvent::AuthenticationFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Exchanges a token from an external identity provider for a session
    #[tracing::instrument(skip(self, subject_token))]
    pub async fn token_exchange(
        &self,
        subject_token: &str,
        subject_issuer: &str,
    ) -> Result<(), AuthError> {
        let coordinator = self.coordinator()?;
        let events = &self.shared.events;

        events.emit(AuthEvent::TokenExchangeStarted);
        let result = async {
            let _guard = coordinator.services().state.track(Activity::Refreshing);
            let record = coordinator
                .services()
                .grants
                .exchange(subject_token, subject_issuer)
                .await?;
            coordinator.accept_main(record).await
        }
        .await;

        match result {
            Ok(_) => {
                events.emit(AuthEvent::TokenExchangeSucceeded);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "token exchange failed");
                events.emit(AuthEvent::TokenExchangeFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Revokes the session and removes every stored credential
    ///
    /// Local credentials are removed even when the authority cannot be
    /// reached.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), AuthError> {
        let coordinator = self.coordinator()?;
        let services = coordinator.services();
        let events = &self.shared.events;
        let _guard = services.state.track(Activity::LoggingOut);

        events.emit(AuthEvent::LogoutStarted);

        let main = match coordinator.token(AudienceKey::main(), false).await {
            Ok(main) => main,
            Err(error) => {
                tracing::info!(%error, "{}", LOGOUT_WITHOUT_CREDENTIALS);
                self.clear_store(&coordinator).await;
                events.emit(AuthEvent::LogoutFailed {
                    message: LOGOUT_WITHOUT_CREDENTIALS.to_owned(),
                });
                return Err(error);
            }
        };

        let revoked = services.grants.logout(main.refresh_token()).await;
        self.clear_store(&coordinator).await;

        match revoked {
            Ok(()) => {
                events.emit(AuthEvent::LogoutSucceeded);
                Ok(())
            }
            Err(error) => {
                let error = AuthError::from(error);
                events.emit(AuthEvent::LogoutFailed {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn clear_store(&self, coordinator: &Coordinator) {
        if let Err(error) = coordinator.services().store.clear().await {
            tracing::error!(
                error = (&error as &dyn std::error::Error),
                "unable to clear credential storage"
            );
            self.shared.events.emit(AuthEvent::InternalError {
                message: AuthError::from(error).to_string(),
            });
        }
    }

    /// Whether the user's email address is verified, according to the current session
    pub async fn is_email_verified(&self) -> Result<bool, AuthError> {
        let record = self.token(AudienceKey::main(), false).await?;
        Ok(record.email_verified())
    }

    /// Whether the stored session records a verified email address
    ///
    /// Makes no network requests. Reports `false` when no session is stored.
    pub async fn is_cached_email_verified(&self) -> Result<bool, AuthError> {
        let coordinator = self.coordinator()?;
        Ok(coordinator
            .services()
            .store
            .get(AudienceKeyRef::main())
            .await
            .map_or(false, |record| record.email_verified()))
    }

    /// Asks the authority to send a verification email to the user
    #[tracing::instrument(skip(self))]
    pub async fn send_verification_email(&self) -> Result<(), AuthError> {
        let coordinator = self.coordinator()?;
        let events = &self.shared.events;

        let result = async {
            let record = coordinator.token(AudienceKey::main(), true).await?;
            if record.email_verified() {
                return Err(AuthError::EmailAlreadyVerified);
            }
            coordinator
                .services()
                .grants
                .send_verification_email(record.access_token())
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                events.emit(AuthEvent::EmailVerificationSent);
                Ok(())
            }
            Err(error) => {
                events.emit(AuthEvent::EmailVerificationFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Whether the stored session can no longer be renewed without the user
    ///
    /// Makes no network requests.
    pub async fn needs_authentication(&self) -> Result<bool, AuthError> {
        let coordinator = self.coordinator()?;
        let record = coordinator
            .services()
            .store
            .get(AudienceKeyRef::main())
            .await;
        let freshness = coordinator
            .policy()
            .decide(record.as_ref(), false, System.now());
        Ok(freshness == Freshness::NeedsReauth)
    }

    /// The validated configuration, once initialized
    pub fn config(&self) -> Option<Arc<Config>> {
        self.coordinator()
            .ok()
            .map(|coordinator| Arc::clone(&coordinator.services().config))
    }
}

//! Lifecycle notifications
//!
//! Listeners registered through [`Authenticator::subscribe`][crate::Authenticator::subscribe]
//! are invoked from the dispatch pump, in the same order as the callbacks of
//! the operations that produced the events.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use credo_tokens::AudienceKey;

use crate::{dispatch::Dispatcher, AuthError};

/// The message reported when logout finds no credentials to revoke
pub const LOGOUT_WITHOUT_CREDENTIALS: &str =
    "Unable to find valid credentials. Cleaning up credential storage.";

/// A notable change in the authenticator's lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthEvent {
    /// The authenticator is ready for use
    InitializationSucceeded,
    /// The authenticator could not be initialized
    InitializationFailed {
        /// Why initialization failed
        error: AuthError,
    },
    /// An interactive login has begun
    AuthenticationStarted,
    /// An interactive login produced a new session
    AuthenticationSucceeded,
    /// An interactive login failed
    AuthenticationFailed {
        /// Why the login failed
        error: AuthError,
    },
    /// A token request for the audience has begun network or cache work
    TokenRequestStarted {
        /// The requested audience
        audience: AudienceKey,
    },
    /// A token request for the audience has resolved successfully
    TokenRequestSucceeded {
        /// The requested audience
        audience: AudienceKey,
    },
    /// A token request for the audience has failed
    TokenRequestFailed {
        /// The requested audience
        audience: AudienceKey,
        /// Why the request failed
        error: AuthError,
    },
    /// An external token is being exchanged for a session
    TokenExchangeStarted,
    /// An external token was exchanged for a session
    TokenExchangeSucceeded,
    /// An external token could not be exchanged
    TokenExchangeFailed {
        /// Why the exchange failed
        error: AuthError,
    },
    /// The session is being revoked
    LogoutStarted,
    /// The session was revoked and local credentials removed
    LogoutSucceeded,
    /// The session could not be revoked; local credentials were still removed
    LogoutFailed {
        /// A description of the failure
        message: String,
    },
    /// The authority accepted a request to send a verification email
    EmailVerificationSent,
    /// The user's email address became verified
    EmailVerificationSucceeded,
    /// A verification email could not be requested
    EmailVerificationFailed {
        /// Why the request failed
        error: AuthError,
    },
    /// An internal inconsistency was detected
    InternalError {
        /// A description of the inconsistency
        message: String,
    },
}

/// Identifies a registered listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

/// Fans events out to listeners through the dispatch queue
#[derive(Clone)]
pub(crate) struct EventBus {
    listeners: Arc<RwLock<Vec<(SubscriptionId, Listener)>>>,
    next_id: Arc<AtomicU64>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let count = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus")
            .field("listeners", &count)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self {
            listeners: Arc::default(),
            next_id: Arc::new(AtomicU64::new(0)),
            dispatcher,
        }
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Queues delivery of the event to every listener registered right now
    pub(crate) fn emit(&self, event: AuthEvent) {
        tracing::trace!(?event, "emitting event");
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        if listeners.is_empty() {
            return;
        }

        self.dispatcher.enqueue(move || {
            for listener in &listeners {
                listener(&event);
            }
        });
    }
}

//! The authenticator's lifecycle state

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::AuthError;

/// The initialization state of an authenticator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Initialization has not been requested
    Uninitialized,
    /// Initialization is in progress
    Initializing,
    /// The authenticator accepts operations
    Ready,
    /// The last initialization failed; it may be attempted again
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

/// A sub-flow that may be running while the authenticator is ready
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Activity {
    /// An interactive login
    Authenticating,
    /// A refresh, exchange, or audience token grant
    Refreshing,
    /// Revoking the session
    LoggingOut,
}

impl Activity {
    const fn index(self) -> usize {
        match self {
            Self::Authenticating => 0,
            Self::Refreshing => 1,
            Self::LoggingOut => 2,
        }
    }
}

/// The outcome of a request to begin initialization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Begin {
    /// The caller should perform initialization
    Started,
    /// Nothing to do; the authenticator is already in the given state
    Skipped(AuthState),
}

#[derive(Debug)]
struct Inner {
    state: AuthState,
    active: [usize; 3],
}

/// Tracks initialization and running sub-flows
#[derive(Debug)]
pub(crate) struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: AuthState::Uninitialized,
                active: [0; 3],
            }),
        }
    }
}

impl StateMachine {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> AuthState {
        self.lock().state
    }

    pub(crate) fn begin_initialize(&self) -> Begin {
        let mut inner = self.lock();
        match inner.state {
            AuthState::Uninitialized | AuthState::Failed => {
                tracing::info!(from = %inner.state, "initializing authenticator");
                inner.state = AuthState::Initializing;
                Begin::Started
            }
            state => {
                tracing::debug!(%state, "initialization already requested");
                Begin::Skipped(state)
            }
        }
    }

    pub(crate) fn finish_initialize(&self, succeeded: bool) {
        let mut inner = self.lock();
        inner.state = if succeeded {
            AuthState::Ready
        } else {
            AuthState::Failed
        };
        tracing::info!(state = %inner.state, "initialization finished");
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), AuthError> {
        match self.lock().state {
            AuthState::Ready => Ok(()),
            _ => Err(AuthError::NotInitialized),
        }
    }

    pub(crate) fn is_active(&self, activity: Activity) -> bool {
        self.lock().active[activity.index()] > 0
    }

    pub(crate) fn track(self: &Arc<Self>, activity: Activity) -> ActivityGuard {
        self.lock().active[activity.index()] += 1;
        tracing::trace!(?activity, "activity started");
        ActivityGuard {
            machine: Arc::clone(self),
            activity,
        }
    }
}

/// Marks an activity as running until dropped
#[derive(Debug)]
pub(crate) struct ActivityGuard {
    machine: Arc<StateMachine>,
    activity: Activity,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut inner = self.machine.lock();
        let count = &mut inner.active[self.activity.index()];
        *count = count.saturating_sub(1);
        tracing::trace!(activity = ?self.activity, "activity finished");
    }
}

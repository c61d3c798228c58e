//! Session context
//!
//! The queue and the façade need two things from the signed-in user: the id
//! writes are scoped under and a handle to the remote store. Both live in a
//! [`SessionContext`] that is created at startup, activated on sign-in and
//! deactivated on sign-out. Anything that must wait for a session does so
//! through [`SessionContext::wait_ready`], which never blocks longer than the
//! caller allows.

use remote_store::RemoteStore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// An authenticated user and their remote store
#[derive(Clone)]
pub struct Session {
    user_id: String,
    remote: Arc<dyn RemoteStore>,
}

impl Session {
    /// Create a session
    pub fn new(user_id: impl Into<String>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { user_id: user_id.into(), remote }
    }

    /// Id all remote writes are scoped under
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Remote store handle
    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("user_id", &self.user_id).finish_non_exhaustive()
    }
}

/// Outcome of waiting for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A session is active
    Ready,
    /// The wait ran out; callers continue without a session
    TimedOut,
}

/// Holder of the current session, shared by the queue and the façade
#[derive(Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl SessionContext {
    /// Create a context with no active session
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Make `session` the active session
    pub fn activate(&self, session: Session) {
        tracing::info!("Session activated for {}", session.user_id());
        self.tx.send_replace(Some(session));
    }

    /// Drop the active session, returning it if there was one
    pub fn deactivate(&self) -> Option<Session> {
        let previous = self.tx.send_replace(None);
        if let Some(session) = &previous {
            tracing::info!("Session ended for {}", session.user_id());
        }
        previous
    }

    /// The active session, if any
    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// Whether a session is active
    pub fn is_active(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    /// Wait until a session is active, for at most `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let mut rx = self.tx.subscribe();

        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|session| session.is_some())).await,
            Ok(Ok(_))
        );

        if ready {
            Readiness::Ready
        } else {
            tracing::warn!("No session after {:?}, continuing without one", timeout);
            Readiness::TimedOut
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

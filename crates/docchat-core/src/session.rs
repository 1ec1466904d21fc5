//! Identity collaborator contract and the session gate.
//!
//! `AuthProvider` is whatever owns user accounts. `SessionGate` follows one
//! access token through that provider and exposes `{user, loading}` to the
//! code it is handed to.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An account known to the auth provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }
}

/// An authenticated session identified by its bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a sign-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user: User,
    /// Token that confirms the e-mail address. `None` when the account was
    /// confirmed on creation.
    pub confirmation_token: Option<String>,
}

/// Every way an auth operation can fail.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Email not confirmed")]
    EmailNotConfirmed,
    #[error("Invalid login credentials")]
    InvalidCredentials,
    #[error("Email already registered")]
    EmailAlreadyRegistered,
    #[error("Email already confirmed")]
    EmailAlreadyConfirmed,
    #[error("User not found")]
    UserNotFound,
    #[error("Invalid or expired confirmation token")]
    InvalidConfirmationToken,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Password must be at least {min_len} characters")]
    WeakPassword { min_len: usize },
    #[error("Session not found or expired")]
    SessionNotFound,
    #[error("Auth provider failure: {0}")]
    Provider(String),
}

/// Session-change notification published by a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut { access_token: String, user_id: Uuid },
    UserUpdated(User),
}

/// The identity collaborator.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;

    async fn confirm_email(&self, token: &str) -> Result<User, AuthError>;

    /// Issue a fresh confirmation token for an unconfirmed account.
    async fn resend_confirmation(&self, email: &str) -> Result<String, AuthError>;

    /// Look up a live session. Expired or unknown tokens yield `Ok(None)`.
    async fn get_session(&self, access_token: &str) -> Result<Option<Session>, AuthError>;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// What a gated consumer sees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub user: Option<User>,
    pub loading: bool,
}

impl SessionState {
    fn loading() -> Self {
        Self {
            user: None,
            loading: true,
        }
    }

    pub fn is_signed_out(&self) -> bool {
        !self.loading && self.user.is_none()
    }
}

/// Tracks one access token for as long as the gate is alive.
///
/// The session is fetched once on mount, then kept current from the
/// provider's notifications. Dropping the gate unsubscribes.
pub struct SessionGate {
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionGate {
    pub fn mount(provider: Arc<dyn AuthProvider>, access_token: impl Into<String>) -> Self {
        let token = access_token.into();
        let (tx, rx) = watch::channel(SessionState::loading());
        // Subscribe before fetching so no change between the two is lost.
        let mut events = provider.subscribe();

        let task = tokio::spawn(async move {
            let user = fetch_user(provider.as_ref(), &token).await;
            tx.send_replace(SessionState {
                user,
                loading: false,
            });

            loop {
                match events.recv().await {
                    Ok(AuthEvent::SignedIn(session)) if session.access_token == token => {
                        tx.send_replace(SessionState {
                            user: Some(session.user),
                            loading: false,
                        });
                    }
                    Ok(AuthEvent::SignedOut { access_token, .. }) if access_token == token => {
                        debug!("Gated session signed out");
                        tx.send_replace(SessionState {
                            user: None,
                            loading: false,
                        });
                    }
                    Ok(AuthEvent::UserUpdated(user)) => {
                        let matches = tx
                            .borrow()
                            .user
                            .as_ref()
                            .is_some_and(|current| current.id == user.id);
                        if matches {
                            tx.send_replace(SessionState {
                                user: Some(user),
                                loading: false,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Session events lagged, refetching");
                        let user = fetch_user(provider.as_ref(), &token).await;
                        tx.send_replace(SessionState {
                            user,
                            loading: false,
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { state: rx, task }
    }

    /// Current `{user, loading}` snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the initial fetch has resolved.
    pub async fn ready(&mut self) -> SessionState {
        // A closed channel keeps its last value, which is all we can report.
        let _ = self.state.wait_for(|s| !s.loading).await;
        self.state()
    }
}

impl Drop for SessionGate {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn fetch_user(provider: &dyn AuthProvider, token: &str) -> Option<User> {
    match provider.get_session(token).await {
        Ok(session) => session.map(|s| s.user),
        Err(e) => {
            warn!(error = %e, "Session fetch failed");
            None
        }
    }
}

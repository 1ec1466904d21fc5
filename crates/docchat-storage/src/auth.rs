//! SQLite-backed e-mail/password accounts and bearer sessions.

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docchat_core::config::AuthConfig;
use docchat_core::error::DocchatError;
use docchat_core::session::{AuthError, AuthEvent, AuthProvider, Session, SignUpOutcome, User};

use crate::db::Database;
use crate::repository::{from_millis, now_millis, parse_uuid, storage_err, OptionalExt};

const TOKEN_LEN: usize = 16;
const EVENT_CAPACITY: usize = 64;

/// Argon2id cost used for new password hashes.
///
/// Stored hashes are PHC strings that carry their own parameters, so
/// changing the cost never invalidates existing accounts.
#[derive(Clone, Copy, Debug)]
struct PasswordPolicy {
    memory_kib: u32,
    iterations: u32,
}

impl PasswordPolicy {
    fn hash(&self, password: &str) -> Result<String, AuthError> {
        let params = Params::new(self.memory_kib, self.iterations, 1, None)
            .map_err(|e| AuthError::Provider(format!("Invalid hash parameters: {}", e)))?;
        let salt = SaltString::generate(&mut OsRng);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Provider(format!("Password hashing failed: {}", e)))
    }
}

/// Check `password` against a stored PHC string.
fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored).map_err(|e| {
        warn!(error = %e, "Unparseable stored password hash");
        AuthError::Provider(format!("Corrupt password hash: {}", e))
    })?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::Provider(format!(
            "Password verification failed: {}",
            e
        ))),
    }
}

/// Run Argon2 work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Provider(format!("Hashing task failed: {}", e)))?
}

/// Stored credentials for one account.
struct UserRecord {
    user: User,
    password_hash: String,
}

/// Auth provider over the local SQLite store.
pub struct LocalAuthProvider {
    db: Arc<Database>,
    config: AuthConfig,
    policy: PasswordPolicy,
    events: broadcast::Sender<AuthEvent>,
}

impl LocalAuthProvider {
    pub fn new(db: Arc<Database>, config: AuthConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let policy = PasswordPolicy {
            memory_kib: config.hash_memory_kib,
            iterations: config.hash_iterations,
        };
        Self {
            db,
            config,
            policy,
            events,
        }
    }

    fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, AuthError> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT id, email, email_confirmed_at, created_at, password_hash
                     FROM users WHERE email = ?1",
                    rusqlite::params![email],
                    |row| Ok(row_to_record(row)),
                )
                .optional()
                .map_err(storage_err)?
                .transpose()
            })
            .map_err(provider_err)
    }

    fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT id, email, email_confirmed_at, created_at, password_hash
                     FROM users WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| Ok(row_to_record(row)),
                )
                .optional()
                .map_err(storage_err)?
                .transpose()
            })
            .map(|record| record.map(|r| r.user))
            .map_err(provider_err)
    }

    fn publish(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < self.config.min_password_len {
            return Err(AuthError::WeakPassword {
                min_len: self.config.min_password_len,
            });
        }
        if self.find_by_email(&email)?.is_some() {
            return Err(AuthError::EmailAlreadyRegistered);
        }

        let policy = self.policy;
        let password = password.to_string();
        let password_hash = blocking(move || policy.hash(&password)).await?;

        let now = now_millis();
        let user = User {
            id: Uuid::new_v4(),
            email,
            email_confirmed_at: self.config.auto_confirm.then_some(now),
            created_at: now,
        };
        let confirmation_token = (!self.config.auto_confirm).then(new_token);

        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, password_hash,
                                    email_confirmed_at, confirmation_token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user.id.to_string(),
                    user.email,
                    password_hash,
                    user.email_confirmed_at.map(|t| t.timestamp_millis()),
                    confirmation_token,
                    user.created_at.timestamp_millis(),
                ],
            )
            .map_err(storage_err)
        });
        if let Err(e) = inserted {
            // Lost a race against a concurrent sign-up for the same address.
            if self.find_by_email(&user.email)?.is_some() {
                return Err(AuthError::EmailAlreadyRegistered);
            }
            return Err(provider_err(e));
        }

        info!(user_id = %user.id, confirmed = user.is_confirmed(), "User signed up");
        if let Some(token) = &confirmation_token {
            debug!(user_id = %user.id, token = %token, "Confirmation token issued");
        }
        Ok(SignUpOutcome {
            user,
            confirmation_token,
        })
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;
        let record = self
            .find_by_email(&email)?
            .ok_or(AuthError::InvalidCredentials)?;

        let password = password.to_string();
        let stored = record.password_hash.clone();
        if !blocking(move || verify_password(&password, &stored)).await? {
            return Err(AuthError::InvalidCredentials);
        }
        if !record.user.is_confirmed() {
            return Err(AuthError::EmailNotConfirmed);
        }

        let now = now_millis();
        let session = Session {
            access_token: new_token(),
            user: record.user,
            expires_at: now + Duration::hours(i64::from(self.config.session_ttl_hours)),
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO auth_sessions (token, user_id, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        session.access_token,
                        session.user.id.to_string(),
                        now.timestamp_millis(),
                        session.expires_at.timestamp_millis(),
                    ],
                )
                .map_err(storage_err)
            })
            .map_err(provider_err)?;

        info!(user_id = %session.user.id, "User signed in");
        self.publish(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let user_id = self
            .db
            .with_conn(|conn| {
                let user_id: Option<String> = conn
                    .query_row(
                        "SELECT user_id FROM auth_sessions WHERE token = ?1",
                        rusqlite::params![access_token],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(storage_err)?;
                conn.execute(
                    "DELETE FROM auth_sessions WHERE token = ?1",
                    rusqlite::params![access_token],
                )
                .map_err(storage_err)?;
                user_id.map(|id| parse_uuid(&id)).transpose()
            })
            .map_err(provider_err)?
            .ok_or(AuthError::SessionNotFound)?;

        info!(%user_id, "User signed out");
        self.publish(AuthEvent::SignedOut {
            access_token: access_token.to_string(),
            user_id,
        });
        Ok(())
    }

    async fn confirm_email(&self, token: &str) -> Result<User, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidConfirmationToken);
        }
        let now = now_millis();
        let user_id = self
            .db
            .with_conn(|conn| {
                let id: Option<String> = conn
                    .query_row(
                        "SELECT id FROM users WHERE confirmation_token = ?1",
                        rusqlite::params![token],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(storage_err)?;
                let Some(id) = id else {
                    return Ok(None);
                };
                conn.execute(
                    "UPDATE users SET email_confirmed_at = ?2, confirmation_token = NULL
                     WHERE id = ?1",
                    rusqlite::params![id, now.timestamp_millis()],
                )
                .map_err(storage_err)?;
                parse_uuid(&id).map(Some)
            })
            .map_err(provider_err)?
            .ok_or(AuthError::InvalidConfirmationToken)?;

        let user = self
            .find_user_by_id(user_id)?
            .ok_or(AuthError::UserNotFound)?;
        info!(user_id = %user.id, "Email confirmed");
        self.publish(AuthEvent::UserUpdated(user.clone()));
        Ok(user)
    }

    async fn resend_confirmation(&self, email: &str) -> Result<String, AuthError> {
        let email = normalize_email(email)?;
        let record = self.find_by_email(&email)?.ok_or(AuthError::UserNotFound)?;
        if record.user.is_confirmed() {
            return Err(AuthError::EmailAlreadyConfirmed);
        }

        let token = new_token();
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE users SET confirmation_token = ?2 WHERE id = ?1",
                    rusqlite::params![record.user.id.to_string(), token],
                )
                .map_err(storage_err)
            })
            .map_err(provider_err)?;

        debug!(user_id = %record.user.id, token = %token, "Confirmation token reissued");
        Ok(token)
    }

    async fn get_session(&self, access_token: &str) -> Result<Option<Session>, AuthError> {
        let now = Utc::now();
        let found = self
            .db
            .with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT s.expires_at, u.id, u.email, u.email_confirmed_at, u.created_at,
                                u.password_hash
                         FROM auth_sessions s JOIN users u ON u.id = s.user_id
                         WHERE s.token = ?1",
                        rusqlite::params![access_token],
                        |row| {
                            let expires_at: i64 = row.get(0)?;
                            Ok((expires_at, row_to_record_at(row, 1)))
                        },
                    )
                    .optional()
                    .map_err(storage_err)?;

                let Some((expires_at, record)) = row else {
                    return Ok(None);
                };
                let expires_at = from_millis(expires_at);
                if now >= expires_at {
                    conn.execute(
                        "DELETE FROM auth_sessions WHERE token = ?1",
                        rusqlite::params![access_token],
                    )
                    .map_err(storage_err)?;
                    debug!("Expired session removed");
                    return Ok(None);
                }
                Ok(Some((expires_at, record?.user)))
            })
            .map_err(provider_err)?;

        Ok(found.map(|(expires_at, user)| Session {
            access_token: access_token.to_string(),
            user,
            expires_at,
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<UserRecord, DocchatError> {
    row_to_record_at(row, 0)
}

fn row_to_record_at(row: &rusqlite::Row<'_>, base: usize) -> Result<UserRecord, DocchatError> {
    let id: String = row.get(base).map_err(storage_err)?;
    let email: String = row.get(base + 1).map_err(storage_err)?;
    let confirmed_at: Option<i64> = row.get(base + 2).map_err(storage_err)?;
    let created_at: i64 = row.get(base + 3).map_err(storage_err)?;
    let password_hash: String = row.get(base + 4).map_err(storage_err)?;

    Ok(UserRecord {
        user: User {
            id: parse_uuid(&id)?,
            email,
            email_confirmed_at: confirmed_at.map(from_millis),
            created_at: from_millis(created_at),
        },
        password_hash,
    })
}

fn provider_err(e: DocchatError) -> AuthError {
    AuthError::Provider(e.to_string())
}

/// Trim and lowercase an address, rejecting anything without a local part
/// and a dotted domain.
fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(AuthError::InvalidEmail)
    }
}

fn new_token() -> String {
    let mut buf = [0u8; TOKEN_LEN];
    rand::rng().fill(&mut buf[..]);
    hex::encode(buf)
}

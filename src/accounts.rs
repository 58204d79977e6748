//! Account Lifecycle
//! Mission: Register, activate and log in users on top of the gate's own stores
//!
//! Registration creates an inactive user plus a one-time invitation and sends a welcome
//! notification. If the notification cannot be sent the account is removed again, so a user
//! never ends up stored without a way to activate it.

use anyhow::{anyhow, Context};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::jwt::TokenAuthenticator;
use crate::auth::models::{User, UserWithToken};
use crate::auth::password::PasswordHash;
use crate::config::AccountConfig;
use crate::error::{GateError, Scheme};
use crate::notify::Notifier;
use crate::resolver::CacheAsideUserResolver;
use crate::store::{Invitation, NewUser, StoreError, UserStore};

const DEFAULT_ROLE: &str = "user";
const MIN_USERNAME_LEN: usize = 3;
const MAX_FIELD_LEN: usize = 255;
const MIN_PASSWORD_LEN: usize = 8;
// bcrypt ignores everything past 72 bytes
const MAX_PASSWORD_LEN: usize = 72;

pub struct AccountService {
    users: Arc<dyn UserStore>,
    resolver: Arc<CacheAsideUserResolver>,
    tokens: Arc<TokenAuthenticator>,
    notifier: Arc<dyn Notifier>,
    config: AccountConfig,
    frontend_url: String,
}

impl AccountService {
    pub fn new(
        users: Arc<dyn UserStore>,
        resolver: Arc<CacheAsideUserResolver>,
        tokens: Arc<TokenAuthenticator>,
        notifier: Arc<dyn Notifier>,
        config: AccountConfig,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            users,
            resolver,
            tokens,
            notifier,
            config,
            frontend_url: frontend_url.into(),
        }
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserWithToken, GateError> {
        validate_registration(username, email, password)?;

        let cost = self.config.bcrypt_cost;
        let plain = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || PasswordHash::set(&plain, cost))
            .await
            .context("Password hashing task failed")??;

        let plain_token = Uuid::new_v4().to_string();
        let ttl = chrono::Duration::from_std(self.config.invitation_ttl)
            .context("Invitation TTL out of range")?;
        let invitation = Invitation {
            token_hash: hash_invitation(&plain_token),
            expires_at: Utc::now() + ttl,
        };

        let user = self
            .users
            .create(
                NewUser {
                    username: username.to_string(),
                    email: email.to_string(),
                    password_hash,
                    role_name: DEFAULT_ROLE.to_string(),
                },
                invitation,
            )
            .await
            .map_err(|e| match e {
                StoreError::DuplicateEmail => {
                    GateError::Conflict("a user with that email already exists".to_string())
                }
                StoreError::DuplicateUsername => {
                    GateError::Conflict("a user with that username already exists".to_string())
                }
                other => other.into(),
            })?;

        let activation_url = format!(
            "{}/confirm/{}",
            self.frontend_url.trim_end_matches('/'),
            plain_token
        );
        if let Err(notify_err) = self.notifier.send_welcome(&user, &activation_url).await {
            error!(user_id = user.id, error = %notify_err, "Welcome notification failed, removing account");
            if let Err(delete_err) = self.users.delete(user.id).await {
                error!(user_id = user.id, error = %delete_err, "Failed to remove account after notification failure");
            }
            return Err(GateError::InternalFailure(
                notify_err.context("welcome notification failed"),
            ));
        }

        info!(user_id = user.id, username = %user.username, "👤 User registered");
        Ok(UserWithToken {
            user,
            token: plain_token,
        })
    }

    /// Redeem an invitation token. Returns the activated user id.
    pub async fn activate(&self, token: &str) -> Result<i64, GateError> {
        let user_id = self
            .users
            .activate(&hash_invitation(token))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => GateError::NotFound("invitation"),
                other => other.into(),
            })?;

        self.resolver.invalidate(user_id).await?;
        info!(user_id, "✅ User activated");
        Ok(user_id)
    }

    /// Exchange email and password for a signed access token.
    pub async fn issue_token(&self, email: &str, password: &str) -> Result<String, GateError> {
        let user = match self.users.get_by_email(email).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                debug!("Token requested for unknown or inactive account");
                return Err(GateError::InvalidCredentials(Scheme::Bearer));
            }
            Err(other) => return Err(other.into()),
        };

        if !self.password_matches(&user, password).await? {
            debug!(user_id = user.id, "Token requested with wrong password");
            return Err(GateError::InvalidCredentials(Scheme::Bearer));
        }

        let token = self.tokens.issue_for(user.id)?;
        info!(user_id = user.id, "🔐 Access token issued");
        Ok(token)
    }

    pub async fn delete(&self, user_id: i64) -> Result<(), GateError> {
        self.users.delete(user_id).await.map_err(|e| match e {
            StoreError::NotFound => GateError::NotFound("user"),
            other => other.into(),
        })?;
        self.resolver.invalidate(user_id).await?;

        info!(user_id, "🗑️ User deleted");
        Ok(())
    }

    async fn password_matches(&self, user: &User, password: &str) -> Result<bool, GateError> {
        let stored = PasswordHash::from_stored(user.password_hash.clone());
        let plain = password.to_string();
        tokio::task::spawn_blocking(move || stored.matches(&plain))
            .await
            .map_err(|e| GateError::InternalFailure(anyhow!("password check task failed: {e}")))
    }
}

/// Invitations are stored by digest only.
pub fn hash_invitation(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn validate_registration(username: &str, email: &str, password: &str) -> Result<(), GateError> {
    let username_len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_FIELD_LEN).contains(&username_len) {
        return Err(GateError::Validation(format!(
            "username must be between {MIN_USERNAME_LEN} and {MAX_FIELD_LEN} characters"
        )));
    }
    if email.len() > MAX_FIELD_LEN || !email.contains('@') {
        return Err(GateError::Validation("email is not valid".to_string()));
    }
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&password.len()) {
        return Err(GateError::Validation(format!(
            "password must be between {MIN_PASSWORD_LEN} and {MAX_PASSWORD_LEN} bytes"
        )));
    }
    Ok(())
}

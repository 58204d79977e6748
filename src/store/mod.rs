//! Identity Storage Contracts
//! Mission: Describe what the gate needs from the durable store and the cache, nothing more
//!
//! Two families of backends satisfy these traits:
//! - `sqlite`: the durable store used by the binary
//! - `memory`: in-process store and cache, used by tests and cache-enabled deployments
//!   without an external cache

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::auth::models::{Role, User};
use crate::auth::password::PasswordHash;

pub use memory::{MemoryStore, MemoryUserCache};
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("duplicate email")]
    DuplicateEmail,
    #[error("duplicate username")]
    DuplicateUsername,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A user that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: PasswordHash,
    pub role_name: String,
}

/// Activation invitation, stored by hash only.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Durable user records. Lookups only see activated users.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<User, StoreError>;

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// Store an inactive user together with its invitation, atomically.
    async fn create(&self, user: NewUser, invitation: Invitation) -> Result<User, StoreError>;

    /// Activate the user holding an unexpired invitation; returns the user id.
    async fn activate(&self, token_hash: &str) -> Result<i64, StoreError>;

    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Role, StoreError>;
}

/// Cache backend. Each call is atomic per key; get-then-set is not.
#[async_trait]
pub trait UserCache: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn set(&self, user: &User) -> Result<(), StoreError>;

    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}

pub fn user_cache_key(id: i64) -> String {
    format!("user:{id}")
}

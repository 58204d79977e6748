//! In-memory store and cache backends.
//!
//! `MemoryStore` mirrors the durable store's semantics (active-only lookups, unique email and
//! username, invitations). `MemoryUserCache` stores JSON under `user:<id>` with a TTL, like an
//! external key-value cache would. Both can be switched offline or slowed down, which is how
//! outage and deadline behaviour is exercised.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{user_cache_key, Invitation, NewUser, RoleStore, StoreError, UserCache, UserStore};
use crate::auth::models::{Role, User};

/// Shared knobs for simulating a slow or unreachable backend.
#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

impl Faults {
    async fn enter(&self, backend: &str) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(anyhow!("{backend} is unreachable")));
        }
        Ok(())
    }
}

struct MemoryState {
    next_id: i64,
    users: HashMap<i64, User>,
    roles: HashMap<String, Role>,
    // token hash -> (user id, expiry)
    invitations: HashMap<String, (i64, chrono::DateTime<Utc>)>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Faults,
    reads: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store seeded with the default roles.
    pub fn new() -> Self {
        let roles = Role::defaults()
            .into_iter()
            .map(|role| (role.name.clone(), role))
            .collect();

        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                users: HashMap::new(),
                roles,
                invitations: HashMap::new(),
            }),
            faults: Faults::default(),
            reads: AtomicUsize::new(0),
        }
    }

    /// Insert an already-active user directly, bypassing invitations.
    pub fn insert_active(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        role_name: &str,
    ) -> Result<User, StoreError> {
        let mut state = self.state.lock();
        let role = state
            .roles
            .get(role_name)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        let id = state.next_id;
        state.next_id += 1;

        let user = User {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_active: true,
            created_at: Utc::now().to_rfc3339(),
            role,
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    pub fn insert_role(&self, role: Role) {
        self.state.lock().roles.insert(role.name.clone(), role);
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `get_by_id` calls that reached this store.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.state.lock().users.contains_key(&id)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.faults.enter("store").await?;

        let state = self.state.lock();
        state
            .users
            .get(&id)
            .filter(|u| u.is_active)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.faults.enter("store").await?;

        let state = self.state.lock();
        state
            .users
            .values()
            .find(|u| u.email == email && u.is_active)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, user: NewUser, invitation: Invitation) -> Result<User, StoreError> {
        self.faults.enter("store").await?;

        let mut state = self.state.lock();
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::DuplicateEmail);
        }
        if state.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::DuplicateUsername);
        }

        let role = state
            .roles
            .get(&user.role_name)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        let id = state.next_id;
        state.next_id += 1;

        let stored = User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash.into_string(),
            is_active: false,
            created_at: Utc::now().to_rfc3339(),
            role,
        };
        state.users.insert(id, stored.clone());
        state
            .invitations
            .insert(invitation.token_hash, (id, invitation.expires_at));

        Ok(stored)
    }

    async fn activate(&self, token_hash: &str) -> Result<i64, StoreError> {
        self.faults.enter("store").await?;

        let mut state = self.state.lock();
        let (user_id, expires_at) = *state
            .invitations
            .get(token_hash)
            .ok_or(StoreError::NotFound)?;
        if expires_at <= Utc::now() {
            return Err(StoreError::NotFound);
        }

        let user = state.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.is_active = true;
        state.invitations.retain(|_, (id, _)| *id != user_id);

        Ok(user_id)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.faults.enter("store").await?;

        let mut state = self.state.lock();
        state.users.remove(&id).ok_or(StoreError::NotFound)?;
        state.invitations.retain(|_, (user_id, _)| *user_id != id);
        Ok(())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn get_by_name(&self, name: &str) -> Result<Role, StoreError> {
        self.faults.enter("store").await?;

        self.state
            .lock()
            .roles
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

struct CacheSlot {
    payload: String,
    expires_at: Instant,
}

/// TTL-bounded user cache holding serialized records.
pub struct MemoryUserCache {
    entries: Mutex<HashMap<String, CacheSlot>>,
    ttl: Duration,
    faults: Faults,
    fail_writes: AtomicBool,
}

impl MemoryUserCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            faults: Faults::default(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Reject writes while reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Reads already ignore them.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, slot| slot.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl UserCache for MemoryUserCache {
    async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.faults.enter("cache").await?;

        let key = user_cache_key(id);
        let payload = {
            let mut entries = self.entries.lock();
            let fresh = entries
                .get(&key)
                .map(|slot| slot.expires_at > Instant::now());
            match fresh {
                Some(true) => entries[&key].payload.clone(),
                Some(false) => {
                    entries.remove(&key);
                    return Ok(None);
                }
                None => return Ok(None),
            }
        };

        let user = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt cache entry at {key}"))?;
        Ok(Some(user))
    }

    async fn set(&self, user: &User) -> Result<(), StoreError> {
        self.faults.enter("cache").await?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(anyhow!("cache rejected write")));
        }

        let payload = serde_json::to_string(user).context("Failed to serialize user")?;
        self.entries.lock().insert(
            user_cache_key(user.id),
            CacheSlot {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.faults.enter("cache").await?;
        self.entries.lock().remove(&user_cache_key(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::PasswordHash;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            password_hash: PasswordHash::from_stored("hash"),
            role_name: "user".to_string(),
        }
    }

    fn invitation(hash: &str, valid_for: chrono::Duration) -> Invitation {
        Invitation {
            token_hash: hash.to_string(),
            expires_at: Utc::now() + valid_for,
        }
    }

    #[tokio::test]
    async fn test_created_users_are_hidden_until_activated() {
        let store = MemoryStore::new();
        let user = store
            .create(new_user("alice"), invitation("h1", chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(!user.is_active);

        assert!(matches!(
            store.get_by_id(user.id).await,
            Err(StoreError::NotFound)
        ));

        assert_eq!(store.activate("h1").await.unwrap(), user.id);
        let active = store.get_by_email("alice@example.com").await.unwrap();
        assert_eq!(active.id, user.id);
        assert_eq!(active.role.name, "user");

        // Invitation is single-use.
        assert!(matches!(store.activate("h1").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_expired_invitation_cannot_activate() {
        let store = MemoryStore::new();
        store
            .create(new_user("bob"), invitation("h2", chrono::Duration::seconds(-1)))
            .await
            .unwrap();

        assert!(matches!(store.activate("h2").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_duplicates_rejected() {
        let store = MemoryStore::new();
        store
            .create(new_user("carol"), invitation("a", chrono::Duration::hours(1)))
            .await
            .unwrap();

        let mut same_email = new_user("carol2");
        same_email.email = "carol@example.com".to_string();
        assert!(matches!(
            store
                .create(same_email, invitation("b", chrono::Duration::hours(1)))
                .await,
            Err(StoreError::DuplicateEmail)
        ));

        let mut same_name = new_user("carol");
        same_name.email = "other@example.com".to_string();
        assert!(matches!(
            store
                .create(same_name, invitation("c", chrono::Duration::hours(1)))
                .await,
            Err(StoreError::DuplicateUsername)
        ));
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let store = MemoryStore::new();
        let user = store.insert_active("dave", "dave@example.com", "h", "user").unwrap();

        store.set_offline(true);
        assert!(matches!(
            store.get_by_id(user.id).await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.reads(), 1);

        store.set_offline(false);
        assert_eq!(store.get_by_id(user.id).await.unwrap().username, "dave");
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_ttl() {
        let store = MemoryStore::new();
        let user = store.insert_active("erin", "erin@example.com", "h", "admin").unwrap();

        let cache = MemoryUserCache::new(Duration::from_millis(50));
        assert!(cache.get(user.id).await.unwrap().is_none());

        cache.set(&user).await.unwrap();
        let cached = cache.get(user.id).await.unwrap().unwrap();
        assert_eq!(cached.username, "erin");
        assert_eq!(cached.role.level, 3);
        assert!(cached.password_hash.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(user.id).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_failures_are_errors() {
        let store = MemoryStore::new();
        let user = store.insert_active("frank", "frank@example.com", "h", "user").unwrap();
        let cache = MemoryUserCache::new(Duration::from_secs(60));

        cache.set_fail_writes(true);
        assert!(cache.set(&user).await.is_err());
        assert!(cache.get(user.id).await.unwrap().is_none());

        cache.set_offline(true);
        assert!(cache.get(user.id).await.is_err());
    }
}

//! Cache-aside user resolution.
//!
//! The cache is consulted first; on a miss the durable store is read and the cache is
//! populated before returning. Cache failures (read or write) are hard errors so a cache
//! outage is never hidden behind silent store fallbacks.
//!
//! Concurrent misses for one id may each reach the store. With single-flight enabled a
//! per-id async lock serializes them: the first caller loads and populates, the others wake
//! up, re-check the cache and return the populated entry.

use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::auth::models::User;
use crate::config::CacheConfig;
use crate::error::GateError;
use crate::store::{StoreError, UserCache, UserStore};

pub struct CacheAsideUserResolver {
    store: Arc<dyn UserStore>,
    // None when caching is disabled
    cache: Option<Arc<dyn UserCache>>,
    in_flight: Option<InFlight>,
}

impl CacheAsideUserResolver {
    pub fn new(
        store: Arc<dyn UserStore>,
        cache: Arc<dyn UserCache>,
        config: &CacheConfig,
    ) -> Self {
        if !config.enabled {
            return Self::uncached(store);
        }

        Self {
            store,
            cache: Some(cache),
            in_flight: config.single_flight.then(InFlight::default),
        }
    }

    /// Resolver that always reads the durable store.
    pub fn uncached(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            cache: None,
            in_flight: None,
        }
    }

    pub fn caching_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn resolve(&self, id: i64) -> Result<User, GateError> {
        let Some(cache) = &self.cache else {
            return self.load(id).await;
        };

        if let Some(user) = self.cached(cache.as_ref(), id).await? {
            return Ok(user);
        }

        let Some(in_flight) = &self.in_flight else {
            return self.fill(cache.as_ref(), id).await;
        };

        let _flight = in_flight.acquire(id).await;
        // Whoever held the lock before us may have populated the entry already.
        match self.cached(cache.as_ref(), id).await? {
            Some(user) => Ok(user),
            None => self.fill(cache.as_ref(), id).await,
        }
    }

    /// Drop the cached copy of `id`. No-op when caching is disabled.
    pub async fn invalidate(&self, id: i64) -> Result<(), GateError> {
        if let Some(cache) = &self.cache {
            cache.delete(id).await.map_err(cache_failure)?;
            debug!(user_id = id, "Invalidated cached user");
        }
        Ok(())
    }

    async fn cached(&self, cache: &dyn UserCache, id: i64) -> Result<Option<User>, GateError> {
        let cached = cache.get(id).await.map_err(cache_failure)?;
        if cached.is_some() {
            debug!(user_id = id, "User cache hit");
        }
        Ok(cached)
    }

    async fn fill(&self, cache: &dyn UserCache, id: i64) -> Result<User, GateError> {
        debug!(user_id = id, "User cache miss, loading from store");
        let user = self.load(id).await?;

        cache.set(&user).await.map_err(cache_failure)?;
        debug!(user_id = id, "Populated user cache");

        Ok(user)
    }

    async fn load(&self, id: i64) -> Result<User, GateError> {
        self.store.get_by_id(id).await.map_err(|e| match e {
            StoreError::NotFound => GateError::NotFound("user"),
            other => other.into(),
        })
    }
}

fn cache_failure(err: StoreError) -> GateError {
    match err {
        StoreError::Backend(e) => GateError::InternalFailure(e.context("user cache failure")),
        other => GateError::InternalFailure(anyhow!("user cache failure: {other}")),
    }
}

type FlightLock = Arc<AsyncMutex<()>>;

/// Per-id async locks, created on demand and dropped when the last holder leaves.
#[derive(Default)]
struct InFlight {
    locks: Mutex<HashMap<i64, FlightLock>>,
}

impl InFlight {
    async fn acquire(&self, id: i64) -> FlightGuard<'_> {
        let lock = self.locks.lock().entry(id).or_default().clone();
        let guard = lock.clone().lock_owned().await;

        FlightGuard {
            owner: self,
            id,
            lock,
            guard: Some(guard),
        }
    }
}

struct FlightGuard<'a> {
    owner: &'a InFlight,
    id: i64,
    lock: FlightLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.owner.locks.lock();
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.id);
        }
    }
}

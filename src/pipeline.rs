//! Request gating pipeline.
//!
//! Sequences the gate stages in a fixed order:
//!
//! 1. rate limiter (keyed by client address, before any credential work)
//! 2. bearer token validation, or Basic operator credentials on operator routes
//! 3. cache-aside user resolution
//! 4. role precedence, only for ownership-checked operations
//!
//! Every stage short-circuits. The pipeline keeps no per-request state; the resolved
//! [`Caller`] is handed to the protected operation as an argument.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::authorizer::RoleAuthorizer;
use crate::auth::header::{parse_basic, parse_bearer};
use crate::auth::jwt::TokenAuthenticator;
use crate::auth::models::Caller;
use crate::auth::password::constant_time_eq;
use crate::config::{GateConfig, OperatorConfig};
use crate::error::{GateError, Scheme};
use crate::middleware::rate_limit::{RateDecision, RateLimiter};
use crate::resolver::CacheAsideUserResolver;
use crate::store::{RoleStore, UserCache, UserStore};

/// Point in time by which a request's I/O stages must finish.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Run one I/O stage; expiry becomes `Timeout`, never a rejection.
    pub async fn run<T, F>(&self, stage: &'static str, fut: F) -> Result<T, GateError>
    where
        F: Future<Output = Result<T, GateError>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(stage, "Gate stage exceeded request deadline");
                Err(GateError::Timeout { stage })
            }
        }
    }
}

pub struct RequestPipeline {
    limiter: RateLimiter,
    tokens: Arc<TokenAuthenticator>,
    resolver: Arc<CacheAsideUserResolver>,
    authorizer: RoleAuthorizer,
    operator: OperatorConfig,
    request_deadline: Duration,
}

impl RequestPipeline {
    pub fn new(
        limiter: RateLimiter,
        tokens: Arc<TokenAuthenticator>,
        resolver: Arc<CacheAsideUserResolver>,
        authorizer: RoleAuthorizer,
        operator: OperatorConfig,
        request_deadline: Duration,
    ) -> Self {
        Self {
            limiter,
            tokens,
            resolver,
            authorizer,
            operator,
            request_deadline,
        }
    }

    /// Wire every stage from configuration and the given backends.
    pub fn from_config(
        config: &GateConfig,
        users: Arc<dyn UserStore>,
        roles: Arc<dyn RoleStore>,
        cache: Arc<dyn UserCache>,
    ) -> Self {
        Self::new(
            RateLimiter::new(config.rate_limit.clone()),
            Arc::new(TokenAuthenticator::new(config.token.clone())),
            Arc::new(CacheAsideUserResolver::new(users, cache, &config.cache)),
            RoleAuthorizer::new(roles),
            config.operator.clone(),
            config.request_deadline,
        )
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn tokens(&self) -> &Arc<TokenAuthenticator> {
        &self.tokens
    }

    pub fn resolver(&self) -> &Arc<CacheAsideUserResolver> {
        &self.resolver
    }

    /// A fresh deadline using the configured per-request budget.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.request_deadline)
    }

    pub fn admit(&self, key: &str) -> Result<(), GateError> {
        match self.limiter.allow(key) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after } => Err(GateError::RateLimited { retry_after }),
        }
    }

    /// Validate `Authorization: Bearer <token>` and resolve its subject.
    pub async fn authenticate_bearer(
        &self,
        header: Option<&str>,
        deadline: Deadline,
    ) -> Result<Caller, GateError> {
        let token = parse_bearer(header)?;
        let claims = self.tokens.validate_token(token)?;
        let user_id = claims
            .user_id()
            .ok_or_else(|| GateError::MalformedCredentials {
                scheme: Scheme::Bearer,
                reason: "subject is not a user id".to_string(),
            })?;

        let user = deadline
            .run("resolve user", self.resolver.resolve(user_id))
            .await
            .map_err(|e| match e {
                GateError::NotFound(_) => {
                    debug!(user_id, "Token subject no longer resolves to an active user");
                    GateError::InvalidCredentials(Scheme::Bearer)
                }
                other => other,
            })?;

        Ok(Caller { user, claims })
    }

    /// Check `Authorization: Basic ...` against the configured operator credentials.
    pub fn authenticate_operator(&self, header: Option<&str>) -> Result<(), GateError> {
        let (username, password) = parse_basic(header)?;

        // Evaluate both so a wrong username costs the same as a wrong password.
        let user_ok = constant_time_eq(&username, &self.operator.username);
        let pass_ok = constant_time_eq(&password, &self.operator.password);
        if !(user_ok & pass_ok) {
            warn!("Rejected operator credentials");
            return Err(GateError::InvalidCredentials(Scheme::Basic));
        }

        Ok(())
    }

    /// Allow owners unconditionally, everyone else by role level.
    pub async fn authorize_owned(
        &self,
        caller: &Caller,
        resource_owner_id: i64,
        required_role: &str,
        deadline: Deadline,
    ) -> Result<(), GateError> {
        let allowed = deadline
            .run(
                "authorize",
                self.authorizer
                    .authorize(&caller.user, resource_owner_id, required_role),
            )
            .await?;

        if !allowed {
            debug!(
                user_id = caller.id(),
                resource_owner_id, required_role, "Role check denied"
            );
            return Err(GateError::Forbidden);
        }
        Ok(())
    }

    /// Rate limit, authenticate, then run `op` with the resolved caller.
    pub async fn run<T, F, Fut>(
        &self,
        client_key: &str,
        header: Option<&str>,
        deadline: Deadline,
        op: F,
    ) -> Result<T, GateError>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        self.admit(client_key)?;
        let caller = self.authenticate_bearer(header, deadline).await?;
        op(caller).await
    }

    /// Like [`run`](Self::run), plus an ownership/role check before `op`.
    pub async fn run_owned<T, F, Fut>(
        &self,
        client_key: &str,
        header: Option<&str>,
        resource_owner_id: i64,
        required_role: &str,
        deadline: Deadline,
        op: F,
    ) -> Result<T, GateError>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        self.admit(client_key)?;
        let caller = self.authenticate_bearer(header, deadline).await?;
        self.authorize_owned(&caller, resource_owner_id, required_role, deadline)
            .await?;
        op(caller).await
    }
}

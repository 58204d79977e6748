//! Authentication Middleware
//! Mission: Put the gate in front of handlers without handlers touching headers themselves

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::auth::header::authorization;
use crate::auth::models::Caller;
use crate::error::{GateError, Scheme};
use crate::pipeline::{Deadline, RequestPipeline};

/// Extractor for bearer-authenticated routes.
///
/// Carries the resolved caller plus the request deadline so later stages (role checks) share
/// one budget with authentication.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub caller: Caller,
    pub deadline: Deadline,
}

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    Arc<RequestPipeline>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let pipeline = Arc::<RequestPipeline>::from_ref(state);
        let deadline = pipeline.deadline();

        let header = authorization(&parts.headers, Scheme::Bearer)?;
        let caller = pipeline
            .authenticate_bearer(header, deadline)
            .await
            .inspect_err(|e| debug!(path = %parts.uri.path(), reason = %e, "Bearer authentication failed"))?;

        Ok(Authenticated { caller, deadline })
    }
}

/// Basic-auth guard for operator-only routes.
pub async fn operator_auth(
    State(pipeline): State<Arc<RequestPipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let verdict = authorization(request.headers(), Scheme::Basic)
        .and_then(|header| pipeline.authenticate_operator(header));

    match verdict {
        Ok(()) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

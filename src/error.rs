//! Gate Error Taxonomy
//! Mission: One error type for every way a request can be stopped at the gate

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::auth::jwt::TokenError;
use crate::store::StoreError;

/// Which credential scheme a rejection belongs to.
///
/// Basic rejections carry a `WWW-Authenticate` challenge; bearer rejections do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Bearer,
    Basic,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("authorization header is missing")]
    MissingCredentials(Scheme),

    #[error("authorization header is malformed: {reason}")]
    MalformedCredentials { scheme: Scheme, reason: String },

    #[error("invalid credentials")]
    InvalidCredentials(Scheme),

    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("role '{0}' not found")]
    RoleNotFound(String),

    #[error("insufficient role for this action")]
    Forbidden,

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("{stage} did not complete before the request deadline")]
    Timeout { stage: &'static str },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("internal failure: {0:#}")]
    InternalFailure(#[from] anyhow::Error),
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::MissingCredentials(_)
            | GateError::MalformedCredentials { .. }
            | GateError::InvalidCredentials(_)
            | GateError::Expired
            | GateError::NotYetValid => StatusCode::UNAUTHORIZED,
            GateError::Forbidden => StatusCode::FORBIDDEN,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::Conflict(_) => StatusCode::CONFLICT,
            GateError::Validation(_) => StatusCode::BAD_REQUEST,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GateError::RoleNotFound(_) | GateError::InternalFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for "you are not allowed" outcomes, false for "could not decide".
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        )
    }

    fn scheme(&self) -> Option<Scheme> {
        match self {
            GateError::MissingCredentials(scheme)
            | GateError::MalformedCredentials { scheme, .. }
            | GateError::InvalidCredentials(scheme) => Some(*scheme),
            _ => None,
        }
    }
}

impl From<TokenError> for GateError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => GateError::Expired,
            TokenError::NotYetValid => GateError::NotYetValid,
            TokenError::InvalidSignature => GateError::InvalidCredentials(Scheme::Bearer),
            TokenError::Malformed(reason) => GateError::MalformedCredentials {
                scheme: Scheme::Bearer,
                reason,
            },
            TokenError::Signing(e) => GateError::InternalFailure(e),
        }
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GateError::NotFound("record"),
            StoreError::DuplicateEmail => {
                GateError::Conflict("a user with that email already exists".into())
            }
            StoreError::DuplicateUsername => {
                GateError::Conflict("a user with that username already exists".into())
            }
            StoreError::Backend(e) => GateError::InternalFailure(e),
        }
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs.
        let message = match &self {
            GateError::InternalFailure(e) => {
                error!(error = %format!("{e:#}"), "Internal failure while gating request");
                "the server encountered a problem".to_string()
            }
            GateError::RoleNotFound(role) => {
                error!(role = %role, "Required role is not defined");
                "the server encountered a problem".to_string()
            }
            other => other.to_string(),
        };

        let mut response = match &self {
            GateError::RateLimited { retry_after } => {
                let secs = retry_after_secs(*retry_after);
                let body = json!({
                    "error": "rate_limit_exceeded",
                    "message": message,
                    "retry_after_seconds": secs,
                });
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            _ => (status, Json(json!({ "error": message }))).into_response(),
        };

        if self.scheme() == Some(Scheme::Basic) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="restricted", charset="UTF-8""#),
            );
        }

        response
    }
}

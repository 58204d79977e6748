use axum::{
    extract::{FromRef, State},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::accounts::AccountService;
use crate::auth::api as auth_api;
use crate::auth::middleware::operator_auth;
use crate::middleware::{rate_limit_middleware, request_logging};
use crate::pipeline::RequestPipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub accounts: Arc<AccountService>,
    pub env: String,
}

impl FromRef<AppState> for Arc<RequestPipeline> {
    fn from_ref(state: &AppState) -> Self {
        state.pipeline.clone()
    }
}

/// Create the API router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the rate limiter and
/// request logging key on the client address.
pub fn create_router(state: AppState) -> Router {
    let pipeline = state.pipeline.clone();

    let operator_routes = Router::new()
        .route("/v1/health", get(health_check))
        .route_layer(middleware::from_fn_with_state(
            pipeline.clone(),
            operator_auth,
        ));

    let account_routes = Router::new()
        .route("/v1/authentication/user", post(auth_api::register_user))
        .route("/v1/authentication/token", post(auth_api::create_token))
        .route("/v1/users/activate/:token", put(auth_api::activate_user));

    let user_routes = Router::new()
        .route("/v1/users/me", get(auth_api::get_current_user))
        .route(
            "/v1/users/:id",
            get(auth_api::get_user).delete(auth_api::delete_user),
        );

    let mut app = Router::new()
        .merge(operator_routes)
        .merge(account_routes)
        .merge(user_routes)
        .with_state(state);

    if pipeline.limiter().enabled() {
        app = app.layer(middleware::from_fn_with_state(
            pipeline,
            rate_limit_middleware,
        ));
    }

    app.layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
}

// ===== Route Handlers =====

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    env: String,
    version: &'static str,
}

/// Health check endpoint (operator only)
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        env: state.env.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

//! Authentication API Endpoints
//! Mission: Registration, activation, token issuance and user management behind the gate

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::api::routes::AppState;
use crate::auth::middleware::Authenticated;
use crate::auth::models::{CreateTokenRequest, RegisterUserRequest, User, UserWithToken};
use crate::error::GateError;

/// Only admins may act on accounts they do not own.
const USER_ADMIN_ROLE: &str = "admin";

/// Register - POST /v1/authentication/user
pub async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<UserWithToken>), GateError> {
    let deadline = state.pipeline.deadline();
    let created = deadline
        .run(
            "register user",
            state
                .accounts
                .register(&payload.username, &payload.email, payload.password.expose()),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Login - POST /v1/authentication/token
pub async fn create_token(
    State(state): State<AppState>,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<String>), GateError> {
    let deadline = state.pipeline.deadline();
    let token = deadline
        .run(
            "issue token",
            state
                .accounts
                .issue_token(&payload.email, payload.password.expose()),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(token)))
}

/// Activate - PUT /v1/users/activate/:token
pub async fn activate_user(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, GateError> {
    state
        .pipeline
        .deadline()
        .run("activate user", state.accounts.activate(&token))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current user - GET /v1/users/me
pub async fn get_current_user(Authenticated { caller, .. }: Authenticated) -> Json<User> {
    Json(caller.user)
}

/// User profile - GET /v1/users/:id
pub async fn get_user(
    State(state): State<AppState>,
    Authenticated { deadline, .. }: Authenticated,
    Path(user_id): Path<i64>,
) -> Result<Json<User>, GateError> {
    let user = deadline
        .run("resolve user", state.pipeline.resolver().resolve(user_id))
        .await?;
    Ok(Json(user))
}

/// Delete user - DELETE /v1/users/:id (owner or admin)
pub async fn delete_user(
    State(state): State<AppState>,
    Authenticated { caller, deadline }: Authenticated,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, GateError> {
    state
        .pipeline
        .authorize_owned(&caller, user_id, USER_ADMIN_ROLE, deadline)
        .await?;

    deadline
        .run("delete user", state.accounts.delete(user_id))
        .await?;

    info!(user_id, deleted_by = caller.id(), "User removed via API");
    Ok(StatusCode::NO_CONTENT)
}

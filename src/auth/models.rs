//! Authentication Models
//! Mission: Define the identity records the gate reads and the claims it signs

use serde::{Deserialize, Serialize};

use crate::auth::password::Secret;

/// Role reference data. Higher `level` outranks lower.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub description: String,
}

impl Role {
    pub fn new(id: i64, name: &str, level: i64, description: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            level,
            description: description.to_string(),
        }
    }

    /// The roles every fresh store is seeded with.
    pub fn defaults() -> Vec<Role> {
        vec![
            Role::new(1, "user", 1, "A user can create posts and comments"),
            Role::new(2, "moderator", 2, "A moderator can update other users posts"),
            Role::new(3, "admin", 3, "An admin can update and delete other users posts"),
        ]
    }
}

/// User account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub is_active: bool,
    pub created_at: String,
    pub role: Role,
}

/// The identity a request was authenticated as. Handed to protected operations explicitly.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: User,
    pub claims: TokenClaims,
}

impl Caller {
    pub fn id(&self) -> i64 {
        self.user.id
    }

    pub fn role_level(&self) -> i64 {
        self.user.role.level
    }
}

/// JWT claims payload. Every field is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String, // subject (user id)
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl TokenClaims {
    /// Subject as a user id, if it is one.
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// Registration request body
#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    pub email: String,
    pub password: Secret,
}

/// Token request body
#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub email: String,
    pub password: Secret,
}

/// Registration response: the new user plus the plain invitation token.
#[derive(Debug, Serialize)]
pub struct UserWithToken {
    pub user: User,
    pub token: String,
}

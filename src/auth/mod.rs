//! Authentication Module
//! Mission: Decide who a request is and what it may touch

pub mod api;
pub mod authorizer;
pub mod header;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod password;

pub use authorizer::RoleAuthorizer;
pub use jwt::{TokenAuthenticator, TokenError};
pub use middleware::{operator_auth, Authenticated};
pub use models::{Caller, Role, TokenClaims, User};
pub use password::{PasswordHash, Secret};

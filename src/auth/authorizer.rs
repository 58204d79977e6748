//! Role precedence checks.

use std::sync::Arc;
use tracing::debug;

use crate::auth::models::User;
use crate::error::GateError;
use crate::store::{RoleStore, StoreError};

/// Decides whether a caller may act on a resource.
///
/// Owners may always act on their own resources. Everyone else needs a role whose level is at
/// least the level of the named required role. Levels form one global order.
pub struct RoleAuthorizer {
    roles: Arc<dyn RoleStore>,
}

impl RoleAuthorizer {
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    pub async fn authorize(
        &self,
        caller: &User,
        resource_owner_id: i64,
        required_role: &str,
    ) -> Result<bool, GateError> {
        if caller.id == resource_owner_id {
            return Ok(true);
        }

        let required = self
            .roles
            .get_by_name(required_role)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => GateError::RoleNotFound(required_role.to_string()),
                other => other.into(),
            })?;

        let allowed = caller.role.level >= required.level;
        debug!(
            user_id = caller.id,
            caller_role = %caller.role.name,
            required_role = %required.name,
            allowed,
            "Role precedence check"
        );

        Ok(allowed)
    }
}

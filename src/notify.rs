//! Account Notifications
//! Mission: Tell a freshly registered user how to activate their account

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::auth::models::User;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_welcome(&self, user: &User, activation_url: &str) -> Result<()>;
}

/// Writes the activation link to the log instead of delivering mail.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_welcome(&self, user: &User, activation_url: &str) -> Result<()> {
        info!(
            user_id = user.id,
            username = %user.username,
            activation_url,
            "📨 Welcome notification queued"
        );
        Ok(())
    }
}

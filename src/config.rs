//! Gate Configuration
//! Mission: Read every tunable from the environment once, at startup

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEV_TOKEN_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";
const DEV_OPERATOR_PASSWORD: &str = "admin";

/// Top-level configuration for the gate and the binary around it.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub addr: String,
    pub env: String,
    pub db_path: String,
    pub frontend_url: String,
    pub token: TokenConfig,
    pub operator: OperatorConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub accounts: AccountConfig,
    /// Budget for the I/O stages of one request.
    pub request_deadline: Duration,
}

/// Token signing parameters. Issuer and audience are constants, not per-request values.
#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub ttl: Duration,
    pub issuer: String,
    pub audience: String,
    pub leeway: Duration,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway", &self.leeway)
            .finish()
    }
}

/// Credentials for operator-only routes (Basic auth).
#[derive(Clone)]
pub struct OperatorConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for OperatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub user_ttl: Duration,
    /// Collapse concurrent misses for one id into a single store read.
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_ttl: Duration::from_secs(60),
            single_flight: false,
        }
    }
}

/// Fixed-window admission budget per caller key.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Maximum admitted requests per window.
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 20,
            window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub bcrypt_cost: u32,
    pub invitation_ttl: Duration,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: bcrypt::DEFAULT_COST,
            invitation_ttl: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

impl GateConfig {
    pub fn from_env() -> Result<Self> {
        let issuer = env::var("AUTH_TOKEN_ISSUER").unwrap_or_else(|_| "gatehouse".to_string());
        let audience = env::var("AUTH_TOKEN_AUDIENCE").unwrap_or_else(|_| issuer.clone());

        let secret = env::var("AUTH_TOKEN_SECRET").unwrap_or_else(|_| {
            warn!("AUTH_TOKEN_SECRET not set, using the development secret");
            DEV_TOKEN_SECRET.to_string()
        });

        let operator_password = env::var("AUTH_BASIC_PASS").unwrap_or_else(|_| {
            warn!("AUTH_BASIC_PASS not set, operator routes use the default password");
            DEV_OPERATOR_PASSWORD.to_string()
        });

        Ok(Self {
            addr: env::var("ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            env: env::var("ENV").unwrap_or_else(|_| "development".to_string()),
            db_path: env::var("AUTH_DB_PATH").unwrap_or_else(|_| "gatehouse.db".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            token: TokenConfig {
                secret,
                ttl: secs_var("AUTH_TOKEN_TTL_SECS", 3 * 24 * 3600)?,
                issuer,
                audience,
                leeway: secs_var("AUTH_TOKEN_LEEWAY_SECS", 0)?,
            },
            operator: OperatorConfig {
                username: env::var("AUTH_BASIC_USER").unwrap_or_else(|_| "admin".to_string()),
                password: operator_password,
            },
            cache: CacheConfig {
                enabled: flag_var("CACHE_ENABLED", false),
                user_ttl: secs_var("CACHE_USER_TTL_SECS", 60)?,
                single_flight: flag_var("CACHE_SINGLE_FLIGHT", false),
            },
            rate_limit: RateLimitConfig {
                enabled: flag_var("RATELIMITER_ENABLED", true),
                max_requests: parse_var("RATELIMITER_REQUESTS_COUNT", 20)?,
                window: secs_var("RATELIMITER_WINDOW_SECS", 5)?,
            },
            accounts: AccountConfig {
                bcrypt_cost: parse_var("AUTH_BCRYPT_COST", bcrypt::DEFAULT_COST)?,
                invitation_ttl: secs_var("MAIL_INVITATION_TTL_SECS", 3 * 24 * 3600)?,
            },
            request_deadline: Duration::from_millis(parse_var("REQUEST_DEADLINE_MS", 5000)?),
        })
    }
}

fn flag_var(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {name}: {raw:?}")),
        _ => Ok(default),
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    parse_var(name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; the process environment is shared.

    #[test]
    fn test_flag_var_accepts_common_spellings() {
        for (i, value) in ["1", "true", "TRUE", "on", "ON"].iter().enumerate() {
            let name = format!("GATEHOUSE_TEST_FLAG_ON_{i}");
            env::set_var(&name, value);
            assert!(flag_var(&name, false));
        }

        env::set_var("GATEHOUSE_TEST_FLAG_OFF", "nope");
        assert!(!flag_var("GATEHOUSE_TEST_FLAG_OFF", true));
        assert!(flag_var("GATEHOUSE_TEST_FLAG_UNSET", true));
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("GATEHOUSE_TEST_COUNT_BAD", "twenty");
        assert!(parse_var::<u32>("GATEHOUSE_TEST_COUNT_BAD", 20).is_err());

        env::set_var("GATEHOUSE_TEST_COUNT_GOOD", " 7 ");
        assert_eq!(parse_var::<u32>("GATEHOUSE_TEST_COUNT_GOOD", 20).unwrap(), 7);
        assert_eq!(parse_var::<u32>("GATEHOUSE_TEST_COUNT_UNSET", 20).unwrap(), 20);
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let token = TokenConfig {
            secret: "super-secret".to_string(),
            ttl: Duration::from_secs(60),
            issuer: "gatehouse".to_string(),
            audience: "gatehouse".to_string(),
            leeway: Duration::ZERO,
        };
        let operator = OperatorConfig {
            username: "ops".to_string(),
            password: "hunter2".to_string(),
        };

        assert!(!format!("{token:?}").contains("super-secret"));
        assert!(!format!("{operator:?}").contains("hunter2"));
    }
}

//! User Storage
//! Mission: Durable user, role and invitation records in SQLite

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;

use super::{Invitation, NewUser, RoleStore, StoreError, UserStore};
use crate::auth::models::{Role, User};

const USER_COLUMNS: &str = "u.id, u.username, u.email, u.password, u.is_active, u.created_at,
     r.id, r.name, r.level, r.description";

/// User storage with SQLite backend
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database and make sure the schema and default roles exist.
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open auth database at {db_path}"))?;
        init_db(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow!("store task failed: {e}")))?
    }
}

fn init_db(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

         CREATE TABLE IF NOT EXISTS roles (
             id INTEGER PRIMARY KEY,
             name TEXT UNIQUE NOT NULL,
             level INTEGER NOT NULL,
             description TEXT NOT NULL DEFAULT ''
         );

         CREATE TABLE IF NOT EXISTS users (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             username TEXT UNIQUE NOT NULL,
             email TEXT UNIQUE NOT NULL,
             password TEXT NOT NULL,
             is_active INTEGER NOT NULL DEFAULT 0,
             role_id INTEGER NOT NULL REFERENCES roles(id),
             created_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS user_invitations (
             token TEXT PRIMARY KEY,
             user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
             expiry INTEGER NOT NULL
         );",
    )
    .context("Failed to initialize auth schema")?;

    let mut seeded = 0;
    for role in Role::defaults() {
        seeded += conn
            .execute(
                "INSERT OR IGNORE INTO roles (id, name, level, description) VALUES (?1, ?2, ?3, ?4)",
                params![role.id, role.name, role.level, role.description],
            )
            .context("Failed to seed roles")?;
    }
    if seeded > 0 {
        info!(roles = seeded, "Seeded default roles");
    }

    Ok(())
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
        role: Role {
            id: row.get(6)?,
            name: row.get(7)?,
            level: row.get(8)?,
            description: row.get(9)?,
        },
    })
}

fn select_active_user(
    conn: &Connection,
    filter: &str,
    value: &dyn rusqlite::ToSql,
) -> Result<User, StoreError> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users u JOIN roles r ON u.role_id = r.id
         WHERE {filter} = ?1 AND u.is_active = 1"
    );
    conn.query_row(&sql, params![value], user_from_row)
        .optional()
        .context("Failed to query user")?
        .ok_or(StoreError::NotFound)
}

fn classify_insert(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            if message.contains("users.email") {
                return StoreError::DuplicateEmail;
            }
            if message.contains("users.username") {
                return StoreError::DuplicateUsername;
            }
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context("Failed to insert user"))
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        self.with_conn(move |conn| select_active_user(conn, "u.id", &id))
            .await
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        let email = email.to_string();
        self.with_conn(move |conn| select_active_user(conn, "u.email", &email))
            .await
    }

    async fn create(&self, user: NewUser, invitation: Invitation) -> Result<User, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;

            let role = tx
                .query_row(
                    "SELECT id, name, level, description FROM roles WHERE name = ?1",
                    params![user.role_name],
                    |row| {
                        Ok(Role {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            level: row.get(2)?,
                            description: row.get(3)?,
                        })
                    },
                )
                .optional()
                .context("Failed to look up role")?
                .ok_or(StoreError::NotFound)?;

            let created_at = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO users (username, email, password, is_active, role_id, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![
                    user.username,
                    user.email,
                    user.password_hash.as_str(),
                    role.id,
                    created_at,
                ],
            )
            .map_err(classify_insert)?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO user_invitations (token, user_id, expiry) VALUES (?1, ?2, ?3)",
                params![invitation.token_hash, id, invitation.expires_at.timestamp()],
            )
            .context("Failed to insert invitation")?;

            tx.commit().context("Failed to commit user creation")?;

            info!(user_id = id, username = %user.username, "Created user");

            Ok(User {
                id,
                username: user.username,
                email: user.email,
                password_hash: user.password_hash.into_string(),
                is_active: false,
                created_at,
                role,
            })
        })
        .await
    }

    async fn activate(&self, token_hash: &str) -> Result<i64, StoreError> {
        let token_hash = token_hash.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;

            let user_id: i64 = tx
                .query_row(
                    "SELECT user_id FROM user_invitations WHERE token = ?1 AND expiry > ?2",
                    params![token_hash, Utc::now().timestamp()],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to look up invitation")?
                .ok_or(StoreError::NotFound)?;

            tx.execute(
                "UPDATE users SET is_active = 1 WHERE id = ?1",
                params![user_id],
            )
            .context("Failed to activate user")?;
            tx.execute(
                "DELETE FROM user_invitations WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to clean up invitations")?;

            tx.commit().context("Failed to commit activation")?;

            info!(user_id, "Activated user");
            Ok(user_id)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            tx.execute(
                "DELETE FROM user_invitations WHERE user_id = ?1",
                params![id],
            )
            .context("Failed to delete invitations")?;
            let rows_affected = tx
                .execute("DELETE FROM users WHERE id = ?1", params![id])
                .context("Failed to delete user")?;
            tx.commit().context("Failed to commit deletion")?;

            if rows_affected == 0 {
                return Err(StoreError::NotFound);
            }

            info!(user_id = id, "Deleted user");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RoleStore for SqliteStore {
    async fn get_by_name(&self, name: &str) -> Result<Role, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, level, description FROM roles WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Role {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        level: row.get(2)?,
                        description: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query role")?
            .ok_or(StoreError::NotFound)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::PasswordHash;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (SqliteStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let store = SqliteStore::open(db_path).unwrap();
        (store, temp_file)
    }

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            password_hash: PasswordHash::from_stored("$2b$04$placeholder"),
            role_name: "user".to_string(),
        }
    }

    fn invitation(hash: &str) -> Invitation {
        Invitation {
            token_hash: hash.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_default_roles_seeded() {
        let (store, _temp) = create_test_store();

        let admin = store.get_by_name("admin").await.unwrap();
        let user = store.get_by_name("user").await.unwrap();
        assert!(admin.level > user.level);

        assert!(matches!(
            store.get_by_name("superuser").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        SqliteStore::open(db_path).unwrap();
        let store = SqliteStore::open(db_path).unwrap();
        assert_eq!(store.get_by_name("moderator").await.unwrap().level, 2);
    }

    #[tokio::test]
    async fn test_create_activate_and_lookup() {
        let (store, _temp) = create_test_store();

        let created = store.create(new_user("trader1"), invitation("tok1")).await.unwrap();
        assert!(!created.is_active);
        assert_eq!(created.role.name, "user");

        // Inactive users are invisible to lookups.
        assert!(matches!(
            store.get_by_id(created.id).await,
            Err(StoreError::NotFound)
        ));

        assert_eq!(store.activate("tok1").await.unwrap(), created.id);

        let by_id = store.get_by_id(created.id).await.unwrap();
        assert_eq!(by_id.username, "trader1");
        assert!(by_id.is_active);
        assert_eq!(by_id.password_hash, "$2b$04$placeholder");

        let by_email = store.get_by_email("trader1@example.com").await.unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_email_and_username() {
        let (store, _temp) = create_test_store();
        store.create(new_user("viewer1"), invitation("a")).await.unwrap();

        let mut same_email = new_user("viewer2");
        same_email.email = "viewer1@example.com".to_string();
        assert!(matches!(
            store.create(same_email, invitation("b")).await,
            Err(StoreError::DuplicateEmail)
        ));

        let mut same_name = new_user("viewer1");
        same_name.email = "someone@example.com".to_string();
        assert!(matches!(
            store.create(same_name, invitation("c")).await,
            Err(StoreError::DuplicateUsername)
        ));
    }

    #[tokio::test]
    async fn test_unknown_role_rejected() {
        let (store, _temp) = create_test_store();
        let mut user = new_user("ghost");
        user.role_name = "superuser".to_string();

        assert!(matches!(
            store.create(user, invitation("g")).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_user() {
        let (store, _temp) = create_test_store();
        let user = store.create(new_user("tempuser"), invitation("t")).await.unwrap();

        store.delete(user.id).await.unwrap();

        assert!(matches!(store.activate("t").await, Err(StoreError::NotFound)));
        assert!(matches!(store.delete(user.id).await, Err(StoreError::NotFound)));
    }
}

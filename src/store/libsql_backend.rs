//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use, so one connection is
//! reused for all operations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Account, Group, User};
use crate::store::migrations;
use crate::store::traits::{Store, StoreCounts};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Convert `Option<String>` to a libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|_| StoreError::Query(format!("{entity} has malformed uuid {s}")))
}

/// Column order: 0:id, 1:display_name, 2:premium, 3:created_at, 4:updated_at
fn row_to_user(row: &libsql::Row) -> Result<User, StoreError> {
    Ok(User {
        id: row.get::<i64>(0).map_err(query_err)?,
        display_name: row.get::<String>(1).map_err(query_err)?,
        premium: row.get::<i64>(2).map_err(query_err)? != 0,
        created_at: parse_datetime(&row.get::<String>(3).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(4).map_err(query_err)?),
    })
}

/// Column order: 0:id, 1:owner_id, 2:phone, 3:api_id, 4:api_hash,
/// 5:session_blob, 6:active, 7:created_at, 8:last_used_at
fn row_to_account(row: &libsql::Row) -> Result<Account, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let last_used: Option<String> = row.get(8).ok();
    Ok(Account {
        id: parse_uuid(&id_str, "account")?,
        owner_id: row.get::<i64>(1).map_err(query_err)?,
        phone: row.get::<String>(2).map_err(query_err)?,
        api_id: row.get::<String>(3).map_err(query_err)?,
        api_hash: row.get::<String>(4).map_err(query_err)?,
        session_blob: row.get::<String>(5).map_err(query_err)?,
        active: row.get::<i64>(6).map_err(query_err)? != 0,
        created_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
        last_used_at: last_used.as_deref().map(parse_datetime),
    })
}

/// Column order: 0:id, 1:name, 2:remote_id, 3:invite_ref, 4:account_id,
/// 5:owner_id, 6:member_count, 7:created_at
fn row_to_group(row: &libsql::Row) -> Result<Group, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let account_str: String = row.get(4).map_err(query_err)?;
    Ok(Group {
        id: parse_uuid(&id_str, "group")?,
        name: row.get::<String>(1).map_err(query_err)?,
        remote_id: row.get::<i64>(2).map_err(query_err)?,
        invite_ref: row.get::<String>(3).map_err(query_err)?,
        account_id: parse_uuid(&account_str, "group.account")?,
        owner_id: row.get::<i64>(5).map_err(query_err)?,
        member_count: row.get::<i64>(6).map_err(query_err)? as u32,
        created_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
    })
}

const ACCOUNT_COLUMNS: &str =
    "id, owner_id, phone, api_id, api_hash, session_blob, active, created_at, last_used_at";
const GROUP_COLUMNS: &str =
    "id, name, remote_id, invite_ref, account_id, owner_id, member_count, created_at";

async fn count_scalar(conn: &Connection, sql: &str) -> Result<u64, StoreError> {
    let mut rows = conn.query(sql, ()).await.map_err(query_err)?;
    match rows.next().await.map_err(query_err)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u64),
        None => Ok(0),
    }
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run(self.conn()).await
    }

    async fn upsert_user(
        &self,
        id: i64,
        display_name: &str,
        premium: bool,
    ) -> Result<User, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO users (id, display_name, premium, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     premium = excluded.premium,
                     updated_at = excluded.updated_at",
                params![id, display_name, premium as i64, now],
            )
            .await
            .map_err(query_err)?;

        self.find_user(id).await?.ok_or(StoreError::NotFound {
            entity: "user".into(),
            id: id.to_string(),
        })
    }

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, display_name, premium, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    account.id.to_string(),
                    account.owner_id,
                    account.phone.as_str(),
                    account.api_id.as_str(),
                    account.api_hash.as_str(),
                    account.session_blob.as_str(),
                    account.active as i64,
                    account.created_at.to_rfc3339(),
                    opt_text_owned(account.last_used_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    StoreError::Constraint(format!("insert_account: {msg}"))
                } else {
                    StoreError::Query(format!("insert_account: {msg}"))
                }
            })?;
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn accounts_by_owner(
        &self,
        owner_id: i64,
        active_only: bool,
    ) -> Result<Vec<Account>, StoreError> {
        let sql = if active_only {
            format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts
                 WHERE owner_id = ?1 AND active = 1 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts
                 WHERE owner_id = ?1 ORDER BY created_at DESC"
            )
        };
        let mut rows = self
            .conn()
            .query(&sql, params![owner_id])
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn count_active_accounts(&self, owner_id: i64) -> Result<usize, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM accounts WHERE owner_id = ?1 AND active = 1",
                params![owner_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as usize),
            None => Ok(0),
        }
    }

    async fn touch_account(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE accounts SET last_used_at = ?2 WHERE id = ?1",
                params![id.to_string(), when.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn deactivate_account(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE accounts SET active = 0 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "account".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_group(&self, group: &Group) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!("INSERT INTO groups ({GROUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    group.id.to_string(),
                    group.name.as_str(),
                    group.remote_id,
                    group.invite_ref.as_str(),
                    group.account_id.to_string(),
                    group.owner_id,
                    group.member_count as i64,
                    group.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn groups_by_owner(&self, owner_id: i64) -> Result<Vec<Group>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS} FROM groups
                     WHERE owner_id = ?1 ORDER BY created_at DESC"
                ),
                params![owner_id],
            )
            .await
            .map_err(query_err)?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            groups.push(row_to_group(&row)?);
        }
        Ok(groups)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        Ok(StoreCounts {
            users: count_scalar(self.conn(), "SELECT COUNT(*) FROM users").await?,
            accounts: count_scalar(self.conn(), "SELECT COUNT(*) FROM accounts WHERE active = 1")
                .await?,
            groups: count_scalar(self.conn(), "SELECT COUNT(*) FROM groups").await?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

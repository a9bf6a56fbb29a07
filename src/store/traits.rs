//! Backend-agnostic `Store` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Account, Group, User};

/// Aggregate counts for the status surfaces.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreCounts {
    pub users: u64,
    pub accounts: u64,
    pub groups: u64,
}

/// Backend-agnostic store covering users, accounts, and groups.
///
/// Uniqueness (user identity, account id) is enforced here, not by callers.
/// No multi-record transactional guarantees are offered or required.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Insert the user on first contact, refresh display name and premium
    /// flag on later ones. Returns the stored record.
    async fn upsert_user(
        &self,
        id: i64,
        display_name: &str,
        premium: bool,
    ) -> Result<User, StoreError>;

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Accounts owned by a user, newest first.
    async fn accounts_by_owner(
        &self,
        owner_id: i64,
        active_only: bool,
    ) -> Result<Vec<Account>, StoreError>;

    /// Active-account count for the quota guard.
    async fn count_active_accounts(&self, owner_id: i64) -> Result<usize, StoreError>;

    /// Refresh the last-used timestamp.
    async fn touch_account(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), StoreError>;

    /// Clear the active flag. Rows are never hard-deleted.
    async fn deactivate_account(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Groups ──────────────────────────────────────────────────────

    async fn insert_group(&self, group: &Group) -> Result<(), StoreError>;

    /// Groups created on behalf of a user, newest first.
    async fn groups_by_owner(&self, owner_id: i64) -> Result<Vec<Group>, StoreError>;

    // ── Stats ───────────────────────────────────────────────────────

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}

//! Bulk operation orchestrator — runs a bounded sequence of rate-limited
//! remote create operations with live progress and a reconciled tally.
//!
//! One run owns one connection: connect once, create `n` times with a pause
//! between items, disconnect once. A single item's failure never aborts the
//! run; only the initial connect can.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::automation::{ClientConnector, CreateOutcome};
use crate::error::BulkError;
use crate::models::{Account, ClientCredentials, Group};
use crate::store::Store;

/// Accepted bounds for a bulk run's target count.
pub const MIN_BULK_COUNT: usize = 1;
pub const MAX_BULK_COUNT: usize = 20;

/// Snapshot emitted after each item. Counts are monotone within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BulkProgress {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Final reconciled outcome of a run.
#[derive(Debug, Clone)]
pub struct BulkSummary {
    pub requested: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Item index (1-based) and reason for each failed item.
    pub failures: Vec<(usize, String)>,
    /// True when the run stopped early through its cancellation token.
    pub cancelled: bool,
}

/// Orchestrates bulk and single create operations against one account.
pub struct BulkRunner {
    store: Arc<dyn Store>,
    connector: Arc<dyn ClientConnector>,
    item_delay: Duration,
}

impl BulkRunner {
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn ClientConnector>, item_delay: Duration) -> Self {
        Self {
            store,
            connector,
            item_delay,
        }
    }

    /// Run `count` create operations for `account`, reporting progress on
    /// `progress` and stopping early if `cancel` fires.
    ///
    /// `creds` must already carry the decrypted session string. The count is
    /// validated before any remote call; a failed connect aborts with zero
    /// items attempted.
    pub async fn run(
        &self,
        account: &Account,
        creds: ClientCredentials,
        count: usize,
        name_prefix: &str,
        progress: mpsc::Sender<BulkProgress>,
        cancel: CancellationToken,
    ) -> Result<BulkSummary, BulkError> {
        if !(MIN_BULK_COUNT..=MAX_BULK_COUNT).contains(&count) {
            return Err(BulkError::CountOutOfRange {
                requested: count,
                min: MIN_BULK_COUNT,
                max: MAX_BULK_COUNT,
            });
        }

        let mut client = self
            .connector
            .connect(&creds)
            .await
            .map_err(BulkError::Connect)?;

        if let Err(e) = self.store.touch_account(account.id, Utc::now()).await {
            tracing::warn!(account_id = %account.id, "Could not refresh last-used timestamp: {e}");
        }

        // Names are unique within the run by construction.
        let run_stamp = Utc::now().timestamp();

        let mut summary = BulkSummary {
            requested: count,
            completed: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
            cancelled: false,
        };

        for i in 1..=count {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                tracing::info!(
                    account_id = %account.id,
                    completed = summary.completed,
                    "Bulk run cancelled"
                );
                break;
            }

            let name = format!("{name_prefix} {run_stamp}-{i}");
            match client.create_group(&name).await {
                Ok(CreateOutcome::Created {
                    remote_id,
                    invite_ref,
                    member_count,
                }) => {
                    let group = Group {
                        id: Uuid::new_v4(),
                        name,
                        remote_id,
                        invite_ref,
                        account_id: account.id,
                        owner_id: account.owner_id,
                        member_count,
                        created_at: Utc::now(),
                    };
                    match self.store.insert_group(&group).await {
                        Ok(()) => summary.succeeded += 1,
                        Err(e) => {
                            summary.failed += 1;
                            summary.failures.push((i, format!("persist failed: {e}")));
                        }
                    }
                }
                Ok(CreateOutcome::Failed { reason }) => {
                    summary.failed += 1;
                    summary.failures.push((i, reason));
                }
                Err(e) => {
                    // Transport trouble on one item is that item's failure,
                    // not the run's.
                    summary.failed += 1;
                    summary.failures.push((i, e.to_string()));
                }
            }
            summary.completed = i;

            let snapshot = BulkProgress {
                completed: i,
                total: count,
                succeeded: summary.succeeded,
                failed: summary.failed,
            };
            if progress.send(snapshot).await.is_err() {
                tracing::debug!("Progress receiver dropped; run continues");
            }

            if i < count && !cancel.is_cancelled() {
                tokio::time::sleep(self.item_delay).await;
            }
        }

        client.disconnect().await;
        tracing::info!(
            account_id = %account.id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Bulk run finished"
        );
        Ok(summary)
    }

    /// Create one group directly: same connect/create/persist/disconnect
    /// contract as a run, with no sink and no pacing.
    pub async fn create_single(
        &self,
        account: &Account,
        creds: ClientCredentials,
        name: &str,
    ) -> Result<Group, BulkError> {
        let mut client = self
            .connector
            .connect(&creds)
            .await
            .map_err(BulkError::Connect)?;

        if let Err(e) = self.store.touch_account(account.id, Utc::now()).await {
            tracing::warn!(account_id = %account.id, "Could not refresh last-used timestamp: {e}");
        }

        let outcome = client.create_group(name).await;
        client.disconnect().await;

        let (remote_id, invite_ref, member_count) = match outcome {
            Ok(CreateOutcome::Created {
                remote_id,
                invite_ref,
                member_count,
            }) => (remote_id, invite_ref, member_count),
            Ok(CreateOutcome::Failed { reason }) => return Err(BulkError::Create(reason)),
            Err(e) => return Err(BulkError::Create(e.to_string())),
        };

        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            remote_id,
            invite_ref,
            account_id: account.id,
            owner_id: account.owner_id,
            member_count,
            created_at: Utc::now(),
        };
        self.store.insert_group(&group).await?;
        Ok(group)
    }
}

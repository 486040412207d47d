//! Access to the coordination table.

use super::model::{GlobalBackupModel, TaskKey, TaskStatus};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};

#[async_trait]
pub trait GlobalBackupStore: Send + Sync {
    /// Create the table, or add columns an older release did not have.
    async fn ensure_table(&self) -> Result<()>;

    async fn insert_tasks(&self, rows: &[GlobalBackupModel]) -> Result<()>;

    /// Every row of one local instance.
    async fn list_for_node(&self, host: &str, port: u16) -> Result<Vec<GlobalBackupModel>>;

    async fn list_by_backup_id(&self, backup_id: &str) -> Result<Vec<GlobalBackupModel>>;

    async fn get(&self, key: &TaskKey) -> Result<Option<GlobalBackupModel>>;

    /// Set `new` only if the row's current status is one of `expected`.
    /// `pid` replaces the owner when given. True when the row changed.
    async fn compare_and_set_status(
        &self,
        key: &TaskKey,
        expected: &[TaskStatus],
        new: &TaskStatus,
        pid: Option<i32>,
        now: DateTime<Local>,
    ) -> Result<bool>;

    /// Delete rows created before `cutoff`. Returns the number removed.
    async fn purge_before(&self, cutoff: DateTime<Local>) -> Result<u64>;
}

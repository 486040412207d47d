//! Manifest persistence and status reporting.
//!
//! A [`Reporter`] is built once per invocation and handed to whatever needs
//! to emit manifest or status records.

pub mod audit;
pub mod client;

use crate::config::BackupConfig;
use crate::index::{IndexContent, StatusInfo};
use crate::utils::errors::Result;
use chrono::{DateTime, Local};
use client::{UploadClient, NOT_UPLOADED};
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlPool;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const RESULT_LOG: &str = "dbareport_result.log";
pub const STATUS_LOG: &str = "dbareport_status.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStage {
    Begin,
    Dumping,
    Tarring,
    Reporting,
    Success,
    Failed,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRecord {
    pub backup_id: String,
    pub bill_id: String,
    pub cluster_id: i64,
    pub mysql_host: String,
    pub mysql_port: u16,
    pub status: BackupStage,
    pub status_time: DateTime<Local>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// One line of the result log: one per file next to the manifest.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultRecord {
    pub backup_id: String,
    pub bill_id: String,
    pub bk_biz_id: i64,
    pub cluster_id: i64,
    pub cluster_address: String,
    pub shard_value: i32,
    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_role: String,
    pub backup_type: String,
    pub data_schema_grant: String,
    pub is_full_backup: bool,
    pub backup_begin_time: DateTime<Local>,
    pub backup_end_time: DateTime<Local>,
    pub backup_consistent_time: DateTime<Local>,
    pub master_status: Option<StatusInfo>,
    pub slave_status: Option<StatusInfo>,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub task_id: String,
}

pub struct Reporter {
    backup_dir: PathBuf,
    backup_id: String,
    bill_id: String,
    cluster_id: i64,
    mysql_host: String,
    mysql_port: u16,
    client: Option<UploadClient>,
}

impl Reporter {
    pub fn new(cfg: &BackupConfig) -> Self {
        Self {
            backup_dir: cfg.public.backup_dir.clone(),
            backup_id: cfg.public.backup_id.clone(),
            bill_id: cfg.public.bill_id.clone(),
            cluster_id: cfg.public.cluster_id,
            mysql_host: cfg.public.mysql_host.clone(),
            mysql_port: cfg.public.mysql_port,
            client: UploadClient::from_config(&cfg.backup_client),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Write `<target>.index` next to the archive parts.
    pub fn write_index(&self, index: &IndexContent) -> Result<PathBuf> {
        let path = index.save(&self.backup_dir)?;
        info!(backup_id = %index.backup_id, path = %path.display(), "Manifest written");
        Ok(path)
    }

    /// Upload every standalone file and the manifest, recording task ids.
    /// With uploads disabled every task id is `-1`.
    pub async fn upload_files(&self, index: &mut IndexContent) -> Result<String> {
        let Some(client) = &self.client else {
            for item in index.file_list.iter_mut().filter(|f| f.is_standalone()) {
                item.task_id = Some(NOT_UPLOADED.to_string());
            }
            return Ok(NOT_UPLOADED.to_string());
        };

        let positions: Vec<usize> = index
            .file_list
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_standalone())
            .map(|(i, _)| i)
            .collect();
        let paths: Vec<PathBuf> = positions
            .iter()
            .map(|&i| self.backup_dir.join(&index.file_list[i].file_name))
            .collect();

        let results = client.upload_all(paths, &index.backup_id).await;
        for (pos, result) in positions.into_iter().zip(results) {
            index.file_list[pos].task_id = Some(result?);
        }

        // Manifest last, so it carries the task ids of everything else
        let index_path = self.write_index(index)?;
        client.upload(&index_path, &index.backup_id).await
    }

    /// Append one JSON line per archived file to the result log.
    pub fn append_result_log(&self, index: &IndexContent, index_task_id: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.backup_dir.join(RESULT_LOG))?;

        let record = |name: &str, size: u64, file_type: String, task_id: &str| ResultRecord {
            backup_id: index.backup_id.clone(),
            bill_id: index.bill_id.clone(),
            bk_biz_id: index.bk_biz_id,
            cluster_id: index.cluster_id,
            cluster_address: index.cluster_address.clone(),
            shard_value: index.shard_value,
            mysql_host: index.backup_host.clone(),
            mysql_port: index.backup_port,
            mysql_role: index.mysql_role.to_string(),
            backup_type: index.backup_type.to_string(),
            data_schema_grant: index.data_schema_grant.clone(),
            is_full_backup: index.is_full_backup,
            backup_begin_time: index.backup_begin_time,
            backup_end_time: index.backup_end_time,
            backup_consistent_time: index.backup_consistent_time,
            master_status: index.binlog_info.show_master_status.clone(),
            slave_status: index.binlog_info.show_slave_status.clone(),
            file_name: name.to_string(),
            file_size: size,
            file_type,
            task_id: task_id.to_string(),
        };

        for item in index.standalone_files() {
            let task_id = item.task_id.as_deref().unwrap_or(NOT_UPLOADED);
            let line = serde_json::to_string(&record(
                &item.file_name,
                item.file_size,
                item.file_type.to_string(),
                task_id,
            ))?;
            writeln!(file, "{}", line)?;
        }

        let index_name = index.index_file_name();
        let index_size = std::fs::metadata(self.backup_dir.join(&index_name))
            .map(|m| m.len())
            .unwrap_or(0);
        let line = serde_json::to_string(&record(
            &index_name,
            index_size,
            "index".to_string(),
            index_task_id,
        ))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Mirror the manifest into the instance's audit table.
    pub async fn report_audit(&self, pool: &MySqlPool, index: &IndexContent) -> Result<()> {
        audit::report_audit(pool, index).await
    }

    /// Append a stage transition to the status log. Never fails the backup.
    pub fn report_status(&self, status: BackupStage, message: &str) {
        let record = StatusRecord {
            backup_id: self.backup_id.clone(),
            bill_id: self.bill_id.clone(),
            cluster_id: self.cluster_id,
            mysql_host: self.mysql_host.clone(),
            mysql_port: self.mysql_port,
            status,
            status_time: Local::now(),
            message: message.to_string(),
        };
        let write = || -> Result<()> {
            std::fs::create_dir_all(&self.backup_dir)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.backup_dir.join(STATUS_LOG))?;
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(backup_id = %self.backup_id, "Failed to write status log: {}", e);
        }
    }
}

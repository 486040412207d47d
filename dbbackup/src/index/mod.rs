//! The backup manifest (`<target>.index`).
//!
//! An [`IndexContent`] makes an archive self-describing: identity, point in
//! time markers, replication coordinates and the ordered list of produced
//! files. It is written beside the archive parts and is all a restore needs.

pub mod classify;
pub mod metadata;
pub mod sidecar;

use crate::config::{BackupConfig, BackupType, MysqlRole, Scope, StorageEngine};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const INDEX_SUFFIX: &str = "index";

/// Destination directories containing this marker hold database/table
/// subset backups and are never treated as full backups.
pub const SPECIFIC_BACKUP_MARKER: &str = "dbbak_specific";

/// Sentinel for "uncompressed size could not be determined".
pub const UNKNOWN_SIZE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Schema,
    Data,
    Metadata,
    Priv,
    Tar,
    Part,
    Index,
    Other,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Schema => "schema",
            FileType::Data => "data",
            FileType::Metadata => "metadata",
            FileType::Priv => "priv",
            FileType::Tar => "tar",
            FileType::Part => "part",
            FileType::Index => "index",
            FileType::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// One replication coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub binlog_file: String,
    pub binlog_pos: u64,
    #[serde(default)]
    pub gtid: String,
    /// The peer this coordinate is relative to
    #[serde(default)]
    pub master_host: String,
    #[serde(default)]
    pub master_port: u16,
}

impl StatusInfo {
    pub fn is_empty(&self) -> bool {
        self.binlog_file.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogStatusInfo {
    #[serde(default)]
    pub show_master_status: Option<StatusInfo>,
    #[serde(default)]
    pub show_slave_status: Option<StatusInfo>,
}

/// One entry of the manifest file list.
///
/// Entries with `tar_file_name` set describe a capture file stored inside
/// that archive part; entries without it are files sitting next to the
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarFileItem {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar_file_name: Option<String>,
    /// Artifact store task id, `-1` when not uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl TarFileItem {
    /// A standalone file next to the manifest, typed from its name.
    pub fn standalone(file_name: impl Into<String>, file_size: u64) -> Self {
        let file_name = file_name.into();
        let c = classify::classify(&file_name);
        Self {
            file_name,
            file_size,
            file_type: c.file_type,
            database: c.database,
            table: c.table,
            tar_file_name: None,
            task_id: None,
        }
    }

    /// A capture file archived inside `tar_file_name`.
    pub fn member(file_name: impl Into<String>, file_size: u64, tar_file_name: &str) -> Self {
        let mut item = Self::standalone(file_name, file_size);
        item.tar_file_name = Some(tar_file_name.to_string());
        item
    }

    pub fn is_standalone(&self) -> bool {
        self.tar_file_name.is_none()
    }
}

/// When the captured data became transactionally consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistentTime {
    /// Reported by the capture tool
    Recorded(DateTime<Local>),
    /// Tool gave no checkpoint, wall clock at manifest time used instead
    WallClockFallback(DateTime<Local>),
}

impl ConsistentTime {
    pub fn value(&self) -> DateTime<Local> {
        match self {
            ConsistentTime::Recorded(t) | ConsistentTime::WallClockFallback(t) => *t,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ConsistentTime::WallClockFallback(_))
    }
}

/// What a dumper learns about its own run, merged into the manifest.
#[derive(Debug, Clone)]
pub struct BackupMetaInfo {
    pub begin_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub consistent_time: ConsistentTime,
    pub binlog_info: BinlogStatusInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexContent {
    pub backup_id: String,
    #[serde(default)]
    pub bill_id: String,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cloud_id: i64,
    #[serde(default)]
    pub cluster_id: i64,
    #[serde(default)]
    pub cluster_address: String,
    #[serde(default)]
    pub shard_value: i32,

    pub backup_host: String,
    pub backup_port: u16,
    pub mysql_role: MysqlRole,
    #[serde(default)]
    pub mysql_version: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub storage_engine: StorageEngine,
    pub data_schema_grant: String,
    #[serde(default)]
    pub backup_charset: String,
    pub is_full_backup: bool,

    pub backup_begin_time: DateTime<Local>,
    pub backup_end_time: DateTime<Local>,
    pub backup_consistent_time: DateTime<Local>,
    /// Set when the consistent time is the wall clock fallback
    #[serde(default)]
    pub consistent_time_is_fallback: bool,

    #[serde(default)]
    pub binlog_info: BinlogStatusInfo,

    /// Target name shared by every produced file
    pub target_name: String,
    #[serde(default)]
    pub encrypt_enable: bool,
    #[serde(default)]
    pub file_list: Vec<TarFileItem>,
    #[serde(default)]
    pub total_filesize: u64,
    #[serde(default = "unknown_size")]
    pub total_size_kb_uncompress: i64,
}

fn unknown_size() -> i64 {
    UNKNOWN_SIZE
}

/// A backup is full only when it captures both data and schema of
/// everything, and isn't written under a subset-backup directory.
pub fn compute_is_full(scope: Scope, has_object_filter: bool, destination: &Path) -> bool {
    if !(scope.data && scope.schema) || has_object_filter {
        return false;
    }
    !destination.to_string_lossy().contains(SPECIFIC_BACKUP_MARKER)
}

impl IndexContent {
    /// Start a manifest after a successful capture.
    pub fn new(
        cfg: &BackupConfig,
        target_name: &str,
        mysql_version: &str,
        meta: BackupMetaInfo,
    ) -> Result<Self> {
        let scope = cfg.scope()?;
        let p = &cfg.public;
        Ok(Self {
            backup_id: p.backup_id.clone(),
            bill_id: p.bill_id.clone(),
            bk_biz_id: p.bk_biz_id,
            bk_cloud_id: p.bk_cloud_id,
            cluster_id: p.cluster_id,
            cluster_address: p.cluster_address.clone(),
            shard_value: p.shard_value,
            backup_host: p.mysql_host.clone(),
            backup_port: p.mysql_port,
            mysql_role: p.mysql_role,
            mysql_version: mysql_version.to_string(),
            backup_type: p.backup_type,
            storage_engine: p.storage_engine,
            data_schema_grant: scope.to_string(),
            backup_charset: p.mysql_charset.clone(),
            is_full_backup: compute_is_full(scope, cfg.has_object_filter(), &p.backup_dir),
            backup_begin_time: meta.begin_time,
            backup_end_time: meta.end_time,
            backup_consistent_time: meta.consistent_time.value(),
            consistent_time_is_fallback: meta.consistent_time.is_fallback(),
            binlog_info: meta.binlog_info,
            target_name: target_name.to_string(),
            encrypt_enable: cfg.encrypt_opt.encrypt_enable,
            file_list: Vec::new(),
            total_filesize: 0,
            total_size_kb_uncompress: UNKNOWN_SIZE,
        })
    }

    pub fn index_file_name(&self) -> String {
        format!("{}.{}", self.target_name, INDEX_SUFFIX)
    }

    /// Append a file-list entry. The manifest never lists itself.
    pub fn add_file(&mut self, item: TarFileItem) {
        if item.file_type == FileType::Index {
            return;
        }
        self.file_list.push(item);
        self.total_filesize = self.standalone_files().map(|f| f.file_size).sum();
    }

    /// Files stored next to the manifest (archive parts and grants).
    pub fn standalone_files(&self) -> impl Iterator<Item = &TarFileItem> {
        self.file_list.iter().filter(|f| f.is_standalone())
    }

    /// Archive parts in index order.
    pub fn archive_parts(&self) -> Vec<&TarFileItem> {
        self.standalone_files()
            .filter(|f| matches!(f.file_type, FileType::Tar | FileType::Part))
            .collect()
    }

    pub fn priv_file(&self) -> Option<&TarFileItem> {
        self.standalone_files().find(|f| f.file_type == FileType::Priv)
    }

    /// Serialize beside the archive as `<target>.index`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.index_file_name());
        let tmp = dir.join(format!(".{}.tmp", self.index_file_name()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let index: IndexContent = serde_json::from_slice(&data)?;
        if index.backup_id.is_empty() || index.target_name.is_empty() {
            return Err(BackupError::Metadata(format!(
                "{} is missing backup_id or target_name",
                path.display()
            )));
        }
        Ok(index)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use chrono::TimeZone;
    use tempfile::TempDir;

    pub(crate) fn sample_meta() -> BackupMetaInfo {
        let t = Local.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        BackupMetaInfo {
            begin_time: t,
            end_time: t + chrono::Duration::minutes(5),
            consistent_time: ConsistentTime::Recorded(t + chrono::Duration::seconds(3)),
            binlog_info: BinlogStatusInfo {
                show_master_status: Some(StatusInfo {
                    binlog_file: "binlog20000.000042".to_string(),
                    binlog_pos: 1234,
                    gtid: String::new(),
                    master_host: "127.0.0.1".to_string(),
                    master_port: 3306,
                }),
                show_slave_status: Some(StatusInfo {
                    binlog_file: "binlog20000.000017".to_string(),
                    binlog_pos: 99,
                    gtid: "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5".to_string(),
                    master_host: "10.0.0.9".to_string(),
                    master_port: 3306,
                }),
            },
        }
    }

    #[test]
    fn test_compute_is_full() {
        let all = Scope::ALL;
        let dir = Path::new("/data/dbbak");
        assert!(compute_is_full(all, false, dir));
        assert!(!compute_is_full(all, true, dir));
        assert!(!compute_is_full(Scope::parse("schema").unwrap(), false, dir));
        assert!(!compute_is_full(Scope::parse("data").unwrap(), false, dir));
        assert!(compute_is_full(Scope::parse("data,schema").unwrap(), false, dir));
        assert!(!compute_is_full(all, false, Path::new("/data/dbbak/dbbak_specific/1")));
    }

    #[test]
    fn test_manifest_never_lists_itself() {
        let cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "t", "5.7.20", sample_meta()).unwrap();
        index.add_file(TarFileItem::standalone("t.index", 10));
        index.add_file(TarFileItem::standalone("t_0.tar", 100));
        assert_eq!(index.file_list.len(), 1);
        assert_eq!(index.total_filesize, 100);
    }

    #[test]
    fn test_total_size_counts_standalone_files_only() {
        let cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "t", "5.7.20", sample_meta()).unwrap();
        index.add_file(TarFileItem::member("db1.t1.00000.sql", 70, "t_0.tar"));
        index.add_file(TarFileItem::standalone("t_0.tar", 80));
        index.add_file(TarFileItem::standalone("t.priv", 5));
        assert_eq!(index.total_filesize, 85);
        assert_eq!(index.archive_parts().len(), 1);
        assert_eq!(index.priv_file().map(|f| f.file_size), Some(5));
    }

    #[test]
    fn test_save_and_load_round_trip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "100_h_127.0.0.1_3306_x_logical", "5.7.20", sample_meta())?;
        index.add_file(TarFileItem::member("db1.t1-schema.sql", 10, "p_0.tar"));
        index.add_file(TarFileItem::member("db1.t1.00000.sql", 20, "p_0.tar"));
        index.add_file(TarFileItem::standalone("p_0.tar", 40));
        index.add_file(TarFileItem::standalone("p.priv", 3));

        let path = index.save(dir.path())?;
        assert!(path.ends_with("100_h_127.0.0.1_3306_x_logical.index"));
        let loaded = IndexContent::load(&path)?;

        let types = |i: &IndexContent| i.file_list.iter().map(|f| f.file_type).collect::<Vec<_>>();
        assert_eq!(types(&loaded), types(&index));
        assert_eq!(loaded.total_filesize, index.total_filesize);
        assert_eq!(loaded.binlog_info, index.binlog_info);
        assert_eq!(loaded, index);
        Ok(())
    }

    #[test]
    fn test_load_rejects_incomplete_manifest() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("bad.index");
        let cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "t", "5.7", sample_meta())?;
        index.backup_id.clear();
        std::fs::write(&path, serde_json::to_vec(&index)?)?;
        assert!(matches!(IndexContent::load(&path), Err(BackupError::Metadata(_))));
        Ok(())
    }
}

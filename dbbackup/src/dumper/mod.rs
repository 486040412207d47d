//! Capture strategies.
//!
//! A [`Dumper`] wraps one external capture tool. The variant is picked from
//! the backup type, the storage engine and, for logical backups, whether the
//! runtime C library can run the parallel dumper.

pub mod grants;
pub mod logical;
pub mod mysqldump;
pub mod physical;
pub mod pipeline;
pub mod rocksdb;

pub use pipeline::run_dump;

use crate::config::{BackupConfig, BackupType, StorageEngine, UseMysqldump};
use crate::index::{BackupMetaInfo, StatusInfo};
use crate::utils::cmd::weekday_log_path;
use crate::utils::deadline::{next_deadline, parse_time_of_day};
use crate::utils::errors::Result;
use crate::utils::glibc::{glibc_version, supports_parallel_dumper};
use crate::utils::mysqlconn::{slave_status, SlaveStatus};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tracing::{info, warn};

#[async_trait]
pub trait Dumper: Send + Sync {
    /// Short tool name, also used for the weekday log file.
    fn tool(&self) -> &'static str;

    /// Check the server version against what this tool supports.
    async fn init_config(&mut self, server_version: &str) -> Result<()>;

    /// Run the capture. With `enforce_deadline` the tool is killed at the
    /// configured finish-by time.
    async fn execute(&mut self, enforce_deadline: bool) -> Result<()>;

    /// Times and replication coordinates of the finished capture.
    async fn prepare_backup_meta_info(&self, cfg: &BackupConfig) -> Result<BackupMetaInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumperKind {
    Mydumper,
    Mysqldump,
    Xtrabackup,
    MyrocksHotbackup,
}

/// Where and under which name one backup is captured.
#[derive(Debug, Clone)]
pub struct DumpContext {
    pub cfg: BackupConfig,
    pub target_name: String,
    pub capture_dir: PathBuf,
    pub log_dir: PathBuf,
    pub started_at: DateTime<Local>,
}

/// `<bk_biz_id>_<hostname>_<ip>_<port>_<yyyymmddHHMMSS>_<logical|xtra>`
pub fn target_name(cfg: &BackupConfig, hostname: &str, now: DateTime<Local>) -> String {
    let kind = match cfg.public.backup_type {
        BackupType::Logical => "logical",
        BackupType::Physical => "xtra",
    };
    format!(
        "{}_{}_{}_{}_{}_{}",
        cfg.public.bk_biz_id,
        hostname,
        cfg.public.mysql_host,
        cfg.public.mysql_port,
        now.format("%Y%m%d%H%M%S"),
        kind
    )
}

impl DumpContext {
    pub fn new(cfg: &BackupConfig, hostname: &str, now: DateTime<Local>) -> Self {
        let target = target_name(cfg, hostname, now);
        Self {
            capture_dir: cfg.public.backup_dir.join(&target),
            target_name: target,
            log_dir: cfg.log_dir(),
            cfg: cfg.clone(),
            started_at: now,
        }
    }

    pub fn log_path(&self, tool: &str) -> PathBuf {
        weekday_log_path(&self.log_dir, tool, self.cfg.public.mysql_port, Local::now())
    }

    pub fn priv_path(&self) -> PathBuf {
        self.cfg
            .public
            .backup_dir
            .join(format!("{}.priv", self.target_name))
    }

    /// Kill time for the capture tool, if one applies.
    pub fn deadline(&self, enforce: bool) -> Result<Option<DateTime<Local>>> {
        let raw = self.cfg.public.backup_timeout.trim();
        if !enforce || raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(next_deadline(Local::now(), parse_time_of_day(raw)?)))
    }

    pub fn tool_dir(&self) -> Option<&std::path::Path> {
        self.cfg.public.tool_dir.as_deref()
    }
}

/// Pure selection rule; `glibc` is only consulted for logical backups.
pub fn select_kind(cfg: &BackupConfig, glibc: Option<(u32, u32)>) -> DumperKind {
    match cfg.public.backup_type {
        BackupType::Physical => match cfg.public.storage_engine {
            StorageEngine::Innodb => DumperKind::Xtrabackup,
            StorageEngine::Rocksdb => DumperKind::MyrocksHotbackup,
        },
        BackupType::Logical => match cfg.logical_backup.use_mysqldump {
            UseMysqldump::Yes => DumperKind::Mysqldump,
            UseMysqldump::No => DumperKind::Mydumper,
            UseMysqldump::Auto if supports_parallel_dumper(glibc) => DumperKind::Mydumper,
            UseMysqldump::Auto => DumperKind::Mysqldump,
        },
    }
}

/// Build the dumper for this backup, probing glibc when it matters.
pub async fn new_dumper(ctx: DumpContext) -> Result<Box<dyn Dumper>> {
    let needs_probe = ctx.cfg.public.backup_type == BackupType::Logical
        && ctx.cfg.logical_backup.use_mysqldump == UseMysqldump::Auto;
    let glibc = if needs_probe { glibc_version().await } else { None };

    let kind = select_kind(&ctx.cfg, glibc);
    if needs_probe && kind == DumperKind::Mysqldump {
        warn!(?glibc, "glibc too old for the parallel dumper, using mysqldump");
    }
    info!(?kind, target = %ctx.target_name, "Selected dumper");

    Ok(match kind {
        DumperKind::Mydumper => Box::new(logical::LogicalDumper::new(ctx)?),
        DumperKind::Mysqldump => Box::new(mysqldump::MysqldumpDumper::new(ctx)?),
        DumperKind::Xtrabackup => Box::new(physical::PhysicalDumper::new(ctx)?),
        DumperKind::MyrocksHotbackup => Box::new(rocksdb::RocksdbDumper::new(ctx)?),
    })
}

/// Split `extra_opt` into arguments.
pub(crate) fn extra_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Live replication source of a replica, read before the capture starts.
/// Failures only cost the upstream address in the manifest.
pub(crate) async fn upstream_of(cfg: &BackupConfig) -> Option<SlaveStatus> {
    if !cfg.public.mysql_role.is_replica() {
        return None;
    }
    let pool = match cfg.conn_param().connect().await {
        Ok(pool) => pool,
        Err(e) => {
            warn!("Cannot read replication source: {}", e);
            return None;
        }
    };
    let status = slave_status(&pool).await;
    pool.close().await;
    match status {
        Ok(status) => status,
        Err(e) => {
            warn!("SHOW SLAVE STATUS failed: {}", e);
            None
        }
    }
}

/// The instance's own coordinate is relative to itself.
pub(crate) fn own_status(cfg: &BackupConfig, mut status: StatusInfo) -> StatusInfo {
    status.master_host = cfg.public.mysql_host.clone();
    status.master_port = cfg.public.mysql_port;
    status
}

/// Fill the source address a tool left out of the replica coordinate.
pub(crate) fn with_upstream(mut status: StatusInfo, upstream: Option<&SlaveStatus>) -> StatusInfo {
    if let Some(up) = upstream {
        if status.master_host.is_empty() {
            status.master_host = up.master_host.clone();
            status.master_port = up.master_port;
        }
        if status.gtid.is_empty() {
            status.gtid = up.executed_gtid_set.clone();
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use chrono::TimeZone;

    #[test]
    fn test_target_name() {
        let mut cfg = sample_config();
        let now = Local.with_ymd_and_hms(2024, 3, 1, 2, 3, 4).unwrap();
        assert_eq!(
            target_name(&cfg, "db-host-1", now),
            "100_db-host-1_127.0.0.1_3306_20240301020304_logical"
        );
        cfg.public.backup_type = BackupType::Physical;
        assert!(target_name(&cfg, "h", now).ends_with("_xtra"));
    }

    #[test]
    fn test_select_kind() {
        let mut cfg = sample_config();
        assert_eq!(select_kind(&cfg, Some((2, 17))), DumperKind::Mydumper);
        assert_eq!(select_kind(&cfg, Some((2, 12))), DumperKind::Mysqldump);
        assert_eq!(select_kind(&cfg, None), DumperKind::Mysqldump);

        cfg.logical_backup.use_mysqldump = UseMysqldump::Yes;
        assert_eq!(select_kind(&cfg, Some((2, 17))), DumperKind::Mysqldump);
        cfg.logical_backup.use_mysqldump = UseMysqldump::No;
        assert_eq!(select_kind(&cfg, None), DumperKind::Mydumper);

        cfg.public.backup_type = BackupType::Physical;
        assert_eq!(select_kind(&cfg, None), DumperKind::Xtrabackup);
        cfg.public.storage_engine = StorageEngine::Rocksdb;
        assert_eq!(select_kind(&cfg, None), DumperKind::MyrocksHotbackup);
    }

    #[test]
    fn test_deadline_only_when_enforced() {
        let cfg = sample_config();
        let ctx = DumpContext::new(&cfg, "h", Local::now());
        assert!(ctx.deadline(false).unwrap().is_none());
        let d = ctx.deadline(true).unwrap().unwrap();
        assert!(d > Local::now());
        assert!(ctx.capture_dir.starts_with("/data/dbbak"));
        assert!(ctx.priv_path().to_string_lossy().ends_with(".priv"));
    }

    #[test]
    fn test_upstream_fills_only_missing_fields() {
        let up = SlaveStatus {
            master_host: "10.0.0.1".to_string(),
            master_port: 3306,
            executed_gtid_set: "uuid:1-10".to_string(),
            ..Default::default()
        };
        let status = StatusInfo {
            binlog_file: "binlog.000007".to_string(),
            binlog_pos: 154,
            ..Default::default()
        };
        let filled = with_upstream(status, Some(&up));
        assert_eq!(filled.master_host, "10.0.0.1");
        assert_eq!(filled.gtid, "uuid:1-10");

        let kept = with_upstream(
            StatusInfo {
                master_host: "10.0.0.9".to_string(),
                master_port: 3307,
                ..Default::default()
            },
            Some(&up),
        );
        assert_eq!(kept.master_port, 3307);

        let own = own_status(&sample_config(), StatusInfo::default());
        assert_eq!(own.master_host, "127.0.0.1");
    }
}

//! Physical capture of MyRocks instances with myrocks_hotbackup.
//!
//! The tool takes a RocksDB checkpoint plus the MySQL system files. It
//! writes the binlog sidecar only on instances with binlog enabled, so a
//! missing one is not an error here.

use super::{extra_args, own_status, upstream_of, with_upstream, DumpContext, Dumper};
use crate::config::BackupConfig;
use crate::index::sidecar::{
    parse_binlog_info, parse_slave_info, parse_timestamp_info, read_sidecar, BINLOG_INFO, SLAVE_INFO,
    TIMESTAMP_INFO,
};
use crate::index::{BackupMetaInfo, BinlogStatusInfo, ConsistentTime};
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{version_number, SlaveStatus};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;

/// Scratch checkpoint directory inside the capture directory.
const CHECKPOINT_DIR: &str = ".rocksdb_checkpoint";

pub struct RocksdbDumper {
    ctx: DumpContext,
    program: PathBuf,
    upstream: Option<SlaveStatus>,
    begin: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
}

pub fn hotbackup_args(ctx: &DumpContext) -> Vec<String> {
    let cfg = &ctx.cfg;
    let mut args = vec![
        format!("--host={}", cfg.public.mysql_host),
        format!("--port={}", cfg.public.mysql_port),
        format!("--user={}", cfg.public.mysql_user),
        format!("--password={}", cfg.public.mysql_passwd),
        format!("--checkpoint_dir={}", ctx.capture_dir.join(CHECKPOINT_DIR).display()),
        format!("--backup_dir={}", ctx.capture_dir.display()),
        "--stream=disabled".to_string(),
    ];
    args.extend(extra_args(&cfg.physical_backup.extra_opt));
    args
}

impl RocksdbDumper {
    pub fn new(ctx: DumpContext) -> Result<Self> {
        let program = find_tool("myrocks_hotbackup", None, ctx.tool_dir())?;
        Ok(Self {
            ctx,
            program,
            upstream: None,
            begin: None,
            end: None,
        })
    }
}

#[async_trait]
impl Dumper for RocksdbDumper {
    fn tool(&self) -> &'static str {
        "myrocks_hotbackup"
    }

    async fn init_config(&mut self, server_version: &str) -> Result<()> {
        if version_number(server_version) < 5_006_000 {
            return Err(BackupError::validation(format!(
                "rocksdb backup needs MySQL 5.6 or later, server is {}",
                server_version
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, enforce_deadline: bool) -> Result<()> {
        tokio::fs::create_dir_all(&self.ctx.capture_dir).await?;
        self.upstream = upstream_of(&self.ctx.cfg).await;
        self.begin = Some(Local::now());
        ExternalCommand::new(self.tool(), &self.program)
            .args(hotbackup_args(&self.ctx))
            .log_to(self.ctx.log_path(self.tool()))
            .deadline(self.ctx.deadline(enforce_deadline)?)
            .run()
            .await?;

        let checkpoint = self.ctx.capture_dir.join(CHECKPOINT_DIR);
        if checkpoint.exists() {
            tokio::fs::remove_dir_all(&checkpoint).await?;
        }
        self.end = Some(Local::now());
        Ok(())
    }

    async fn prepare_backup_meta_info(&self, cfg: &BackupConfig) -> Result<BackupMetaInfo> {
        let dir = &self.ctx.capture_dir;
        let times = read_sidecar(dir, TIMESTAMP_INFO)?
            .text()
            .map(parse_timestamp_info)
            .unwrap_or_default();
        let master = read_sidecar(dir, BINLOG_INFO)?
            .text()
            .and_then(parse_binlog_info)
            .map(|s| own_status(cfg, s));
        let slave = if cfg.public.mysql_role.is_replica() {
            read_sidecar(dir, SLAVE_INFO)?
                .text()
                .and_then(parse_slave_info)
                .map(|s| with_upstream(s, self.upstream.as_ref()))
        } else {
            None
        };

        Ok(BackupMetaInfo {
            begin_time: times.begin.or(self.begin).unwrap_or(self.ctx.started_at),
            end_time: times.end.or(self.end).unwrap_or_else(Local::now),
            consistent_time: match times.consistent {
                Some(t) => ConsistentTime::Recorded(t),
                None => ConsistentTime::WallClockFallback(Local::now()),
            },
            binlog_info: BinlogStatusInfo {
                show_master_status: master,
                show_slave_status: slave,
            },
        })
    }
}

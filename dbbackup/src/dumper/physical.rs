//! Hot physical capture of InnoDB instances with xtrabackup.

use super::{extra_args, own_status, upstream_of, with_upstream, DumpContext, Dumper};
use crate::config::BackupConfig;
use crate::index::sidecar::{
    parse_binlog_info, parse_slave_info, parse_timestamp_info, read_sidecar, Sidecar, BINLOG_INFO,
    SLAVE_INFO, TIMESTAMP_INFO,
};
use crate::index::{BackupMetaInfo, BinlogStatusInfo, ConsistentTime};
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{version_number, SlaveStatus};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tracing::warn;

pub struct PhysicalDumper {
    ctx: DumpContext,
    program: PathBuf,
    upstream: Option<SlaveStatus>,
    begin: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
}

pub fn xtrabackup_args(ctx: &DumpContext) -> Vec<String> {
    let cfg = &ctx.cfg;
    let pb = &cfg.physical_backup;
    let mut args = Vec::new();
    // must come first
    if !pb.default_file.as_os_str().is_empty() {
        args.push(format!("--defaults-file={}", pb.default_file.display()));
    }
    args.extend([
        "--backup".to_string(),
        format!("--host={}", cfg.public.mysql_host),
        format!("--port={}", cfg.public.mysql_port),
        format!("--user={}", cfg.public.mysql_user),
        format!("--password={}", cfg.public.mysql_passwd),
        format!("--target-dir={}", ctx.capture_dir.display()),
        format!("--parallel={}", pb.threads),
        format!("--throttle={}", pb.throttle),
        "--no-timestamp".to_string(),
    ]);
    if cfg.public.mysql_role.is_replica() {
        args.push("--slave-info".to_string());
    }
    args.extend(extra_args(&pb.extra_opt));
    args
}

impl PhysicalDumper {
    pub fn new(ctx: DumpContext) -> Result<Self> {
        let program = find_tool("xtrabackup", None, ctx.tool_dir())?;
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
impl Dumper for PhysicalDumper {
    fn tool(&self) -> &'static str {
        "xtrabackup"
    }

    async fn init_config(&mut self, server_version: &str) -> Result<()> {
        if version_number(server_version) < 5_005_000 {
            return Err(BackupError::validation(format!(
                "physical backup is not supported on MySQL {}",
                server_version
            )));
        }
        let default_file = &self.ctx.cfg.physical_backup.default_file;
        if !default_file.as_os_str().is_empty() && !default_file.is_file() {
            return Err(BackupError::validation(format!(
                "default_file {} not found",
                default_file.display()
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, enforce_deadline: bool) -> Result<()> {
        if let Some(parent) = self.ctx.capture_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.upstream = upstream_of(&self.ctx.cfg).await;
        self.begin = Some(Local::now());
        ExternalCommand::new(self.tool(), &self.program)
            .args(xtrabackup_args(&self.ctx))
            .log_to(self.ctx.log_path(self.tool()))
            .deadline(self.ctx.deadline(enforce_deadline)?)
            .run()
            .await?;
        self.end = Some(Local::now());
        Ok(())
    }

    async fn prepare_backup_meta_info(&self, cfg: &BackupConfig) -> Result<BackupMetaInfo> {
        let dir = &self.ctx.capture_dir;
        let begin = self.begin.unwrap_or(self.ctx.started_at);
        let end = self.end.unwrap_or_else(Local::now);

        let times = match read_sidecar(dir, TIMESTAMP_INFO)? {
            Sidecar::Found(text) => parse_timestamp_info(&text),
            Sidecar::Missing => {
                warn!(dir = %dir.display(), "No timestamp sidecar, using wall clock as consistent time");
                Default::default()
            }
        };
        let consistent = match times.consistent {
            Some(t) => ConsistentTime::Recorded(t),
            None => ConsistentTime::WallClockFallback(Local::now()),
        };

        let master = match read_sidecar(dir, BINLOG_INFO)? {
            Sidecar::Found(text) => parse_binlog_info(&text).map(|s| own_status(cfg, s)),
            Sidecar::Missing => {
                return Err(BackupError::Metadata(format!(
                    "{} missing from {}",
                    BINLOG_INFO,
                    dir.display()
                )))
            }
        };

        let slave = if cfg.public.mysql_role.is_replica() {
            read_sidecar(dir, SLAVE_INFO)?
                .text()
                .and_then(parse_slave_info)
                .map(|s| with_upstream(s, self.upstream.as_ref()))
        } else {
            None
        };

        Ok(BackupMetaInfo {
            begin_time: times.begin.unwrap_or(begin),
            end_time: times.end.unwrap_or(end),
            consistent_time: consistent,
            binlog_info: BinlogStatusInfo {
                show_master_status: master,
                show_slave_status: slave,
            },
        })
    }
}

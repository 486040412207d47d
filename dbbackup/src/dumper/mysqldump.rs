//! Single-threaded logical capture with mysqldump, used where the runtime
//! C library is too old for mydumper.

use super::{extra_args, own_status, upstream_of, DumpContext, Dumper};
use crate::config::{split_list, BackupConfig, Scope};
use crate::index::sidecar::parse_slave_info;
use crate::index::{BackupMetaInfo, BinlogStatusInfo, ConsistentTime, StatusInfo};
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{is_system_database, SlaveStatus};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

/// The binlog coordinate comment sits in the first lines of the dump.
const HEADER_SCAN_BYTES: u64 = 64 * 1024;

pub struct MysqldumpDumper {
    ctx: DumpContext,
    program: PathBuf,
    scope: Scope,
    databases: Vec<String>,
    upstream: Option<SlaveStatus>,
    begin: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
}

pub fn dump_file_name(target: &str) -> String {
    format!("{}.sql", target)
}

/// Read the `-- CHANGE MASTER TO ...` comment written by `--master-data=2`.
pub fn read_dump_header(path: &Path) -> Result<Option<StatusInfo>> {
    let mut head = Vec::new();
    std::fs::File::open(path)?
        .take(HEADER_SCAN_BYTES)
        .read_to_end(&mut head)?;
    let text = String::from_utf8_lossy(&head);
    let change_master: String = text
        .lines()
        .filter(|l| l.trim_start().starts_with("-- CHANGE MASTER TO") || l.contains("gtid_purged"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(parse_slave_info(&change_master).filter(|s| !s.is_empty()))
}

pub fn mysqldump_args(ctx: &DumpContext, scope: Scope, databases: &[String]) -> Vec<String> {
    let cfg = &ctx.cfg;
    let mut args = vec![
        format!("--host={}", cfg.public.mysql_host),
        format!("--port={}", cfg.public.mysql_port),
        format!("--user={}", cfg.public.mysql_user),
        format!("--password={}", cfg.public.mysql_passwd),
        format!("--default-character-set={}", cfg.public.mysql_charset),
        "--single-transaction".to_string(),
        "--master-data=2".to_string(),
        "--quick".to_string(),
        "--hex-blob".to_string(),
        "--routines".to_string(),
        "--triggers".to_string(),
        "--events".to_string(),
    ];
    if !scope.data {
        args.push("--no-data".to_string());
    }
    if !scope.schema {
        args.push("--no-create-info".to_string());
        args.push("--no-create-db".to_string());
        args.push("--skip-routines".to_string());
        args.push("--skip-triggers".to_string());
    }
    args.extend(extra_args(&cfg.logical_backup.extra_opt));
    args.push("--databases".to_string());
    args.extend(databases.iter().cloned());
    args
}

impl MysqldumpDumper {
    pub fn new(ctx: DumpContext) -> Result<Self> {
        let program = find_tool("mysqldump", None, ctx.tool_dir())?;
        let scope = ctx.cfg.scope()?;
        Ok(Self {
            ctx,
            program,
            scope,
            databases: Vec::new(),
            upstream: None,
            begin: None,
            end: None,
        })
    }

    fn dump_path(&self) -> PathBuf {
        self.ctx.capture_dir.join(dump_file_name(&self.ctx.target_name))
    }

    async fn resolve_databases(&self) -> Result<Vec<String>> {
        let listed = split_list(&self.ctx.cfg.logical_backup.databases);
        if !listed.is_empty() {
            return Ok(listed);
        }
        let pool = self.ctx.cfg.conn_param().connect().await?;
        let all: Vec<String> = sqlx::query_scalar("SHOW DATABASES").fetch_all(&pool).await?;
        pool.close().await;
        Ok(filter_databases(all, &split_list(&self.ctx.cfg.logical_backup.exclude_databases)))
    }
}

/// User databases minus system ones and the configured exclusions.
pub fn filter_databases(all: Vec<String>, exclude: &[String]) -> Vec<String> {
    all.into_iter()
        .filter(|d| !is_system_database(d) && d != "test" && !exclude.contains(d))
        .collect()
}

#[async_trait]
impl Dumper for MysqldumpDumper {
    fn tool(&self) -> &'static str {
        "mysqldump"
    }

    async fn init_config(&mut self, _server_version: &str) -> Result<()> {
        let lb = &self.ctx.cfg.logical_backup;
        if !lb.regex.trim().is_empty() || !lb.tables.trim().is_empty() {
            return Err(BackupError::validation(
                "mysqldump capture supports database lists only, not table or regex filters",
            ));
        }
        Ok(())
    }

    async fn execute(&mut self, enforce_deadline: bool) -> Result<()> {
        tokio::fs::create_dir_all(&self.ctx.capture_dir).await?;
        self.upstream = upstream_of(&self.ctx.cfg).await;
        self.begin = Some(Local::now());

        if self.scope.data || self.scope.schema {
            self.databases = self.resolve_databases().await?;
            if self.databases.is_empty() {
                return Err(BackupError::validation("no user databases to back up"));
            }
            ExternalCommand::new(self.tool(), &self.program)
                .args(mysqldump_args(&self.ctx, self.scope, &self.databases))
                .stdout_file(self.dump_path())
                .log_to(self.ctx.log_path(self.tool()))
                .deadline(self.ctx.deadline(enforce_deadline)?)
                .run()
                .await?;
        } else {
            info!("Grants-only backup, skipping mysqldump");
        }

        self.end = Some(Local::now());
        Ok(())
    }

    async fn prepare_backup_meta_info(&self, cfg: &BackupConfig) -> Result<BackupMetaInfo> {
        let begin = self.begin.unwrap_or(self.ctx.started_at);
        let end = self.end.unwrap_or_else(Local::now);

        let master = if self.dump_path().is_file() {
            read_dump_header(&self.dump_path())?.map(|s| own_status(cfg, s))
        } else {
            None
        };
        let slave = self.upstream.as_ref().map(|up| StatusInfo {
            binlog_file: up.relay_master_log_file.clone(),
            binlog_pos: up.exec_master_log_pos,
            gtid: up.executed_gtid_set.clone(),
            master_host: up.master_host.clone(),
            master_port: up.master_port,
        });

        // --single-transaction makes the snapshot at the start of the dump
        let consistent = if master.is_some() {
            ConsistentTime::Recorded(begin)
        } else {
            ConsistentTime::WallClockFallback(Local::now())
        };
        Ok(BackupMetaInfo {
            begin_time: begin,
            end_time: end,
            consistent_time: consistent,
            binlog_info: BinlogStatusInfo {
                show_master_status: master,
                show_slave_status: slave,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use tempfile::TempDir;

    #[test]
    fn test_read_dump_header() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("t.sql");
        std::fs::write(
            &path,
            "-- MySQL dump 10.13\n--\n\
             -- Position to start replication or point-in-time recovery from\n--\n\n\
             -- CHANGE MASTER TO MASTER_LOG_FILE='binlog20000.000042', MASTER_LOG_POS=9876;\n\n\
             CREATE DATABASE db1;\n",
        )?;
        let status = read_dump_header(&path)?.unwrap();
        assert_eq!(status.binlog_file, "binlog20000.000042");
        assert_eq!(status.binlog_pos, 9876);

        std::fs::write(&path, "-- MySQL dump\nCREATE DATABASE db1;\n")?;
        assert!(read_dump_header(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn test_filter_databases() {
        let all = ["mysql", "db1", "sys", "test", "db2", "archive", "infodba_schema"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(filter_databases(all, &["archive".to_string()]), vec!["db1", "db2"]);
    }

    #[test]
    fn test_args_for_schema_only() {
        let cfg = sample_config();
        let ctx = DumpContext::new(&cfg, "h", Local::now());
        let dbs = vec!["db1".to_string()];
        let args = mysqldump_args(&ctx, Scope::parse("schema").unwrap(), &dbs);
        assert!(args.contains(&"--no-data".to_string()));
        assert!(args.contains(&"--master-data=2".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("db1"));
        assert_eq!(dump_file_name("tgt"), "tgt.sql");
    }
}

//! Parallel logical capture with mydumper.

use super::{extra_args, own_status, upstream_of, with_upstream, DumpContext, Dumper};
use crate::config::{split_list, BackupConfig, Scope};
use crate::index::metadata::parse_metadata_file;
use crate::index::{BackupMetaInfo, BinlogStatusInfo, ConsistentTime};
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{version_number, SlaveStatus, SYSTEM_DATABASES};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tracing::info;

/// Written by mydumper into the output directory.
pub const METADATA_FILE: &str = "metadata";

/// Extra databases a full logical backup never captures.
const SKIPPED_DATABASES: &[&str] = &["test"];

pub struct LogicalDumper {
    ctx: DumpContext,
    program: PathBuf,
    scope: Scope,
    upstream: Option<SlaveStatus>,
    begin: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
}

/// The `--regex` filter: a configured raw regex wins, otherwise system and
/// excluded databases are cut out and the database/table lists narrow the rest.
pub fn build_regex(cfg: &BackupConfig) -> String {
    let raw = cfg.logical_backup.regex.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }

    let mut excluded: Vec<String> = SYSTEM_DATABASES
        .iter()
        .chain(SKIPPED_DATABASES)
        .map(|d| regex::escape(d))
        .collect();
    excluded.extend(
        split_list(&cfg.logical_backup.exclude_databases)
            .iter()
            .map(|d| regex::escape(d)),
    );

    let tables = split_list(&cfg.logical_backup.tables);
    let databases = split_list(&cfg.logical_backup.databases);
    let include = if !tables.is_empty() {
        let alts: Vec<String> = tables
            .iter()
            .map(|t| {
                let (db, table) = t.split_once('.').unwrap_or(("", t.as_str()));
                if db.is_empty() {
                    format!("[^.]+\\.{}", regex::escape(table))
                } else {
                    format!("{}\\.{}", regex::escape(db), regex::escape(table))
                }
            })
            .collect();
        format!("({})$", alts.join("|"))
    } else if !databases.is_empty() {
        let alts: Vec<String> = databases.iter().map(|d| regex::escape(d)).collect();
        format!("({})\\.", alts.join("|"))
    } else {
        String::new()
    };

    format!("^(?!({})\\.){}", excluded.join("|"), include)
}

/// mydumper arguments, credentials included.
pub fn mydumper_args(ctx: &DumpContext, scope: Scope) -> Vec<String> {
    let cfg = &ctx.cfg;
    let lb = &cfg.logical_backup;
    let mut args = vec![
        format!("--host={}", cfg.public.mysql_host),
        format!("--port={}", cfg.public.mysql_port),
        format!("--user={}", cfg.public.mysql_user),
        format!("--password={}", cfg.public.mysql_passwd),
        format!("--outputdir={}", ctx.capture_dir.display()),
        format!("--threads={}", lb.threads),
        format!("--chunk-filesize={}", lb.chunk_filesize),
        format!("--set-names={}", cfg.public.mysql_charset),
        format!("--regex={}", build_regex(cfg)),
        "--events".to_string(),
        "--routines".to_string(),
        "--triggers".to_string(),
        "--verbose=2".to_string(),
    ];
    if !scope.schema {
        args.push("--no-schemas".to_string());
    }
    if !scope.data {
        args.push("--no-data".to_string());
    }
    if !lb.disable_compress {
        args.push("--compress".to_string());
    }
    if lb.trx_consistency_only {
        args.push("--trx-consistency-only".to_string());
    }
    if lb.flush_retry_count > 0 {
        args.push(format!("--long-query-retries={}", lb.flush_retry_count));
    }
    args.extend(extra_args(&lb.extra_opt));
    args
}

impl LogicalDumper {
    pub fn new(ctx: DumpContext) -> Result<Self> {
        let program = find_tool("mydumper", None, ctx.tool_dir())?;
        let scope = ctx.cfg.scope()?;
        Ok(Self {
            ctx,
            program,
            scope,
            upstream: None,
            begin: None,
            end: None,
        })
    }

    /// Grants-only backups leave the capture directory empty.
    fn captures_objects(&self) -> bool {
        self.scope.data || self.scope.schema
    }
}

#[async_trait]
impl Dumper for LogicalDumper {
    fn tool(&self) -> &'static str {
        "mydumper"
    }

    async fn init_config(&mut self, server_version: &str) -> Result<()> {
        if self.ctx.cfg.logical_backup.trx_consistency_only && version_number(server_version) < 5_006_000 {
            return Err(BackupError::validation(format!(
                "trx_consistency_only needs MySQL 5.6 or later, server is {}",
                server_version
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, enforce_deadline: bool) -> Result<()> {
        tokio::fs::create_dir_all(&self.ctx.capture_dir).await?;
        self.upstream = upstream_of(&self.ctx.cfg).await;
        self.begin = Some(Local::now());

        if self.captures_objects() {
            ExternalCommand::new(self.tool(), &self.program)
                .args(mydumper_args(&self.ctx, self.scope))
                .log_to(self.ctx.log_path(self.tool()))
                .deadline(self.ctx.deadline(enforce_deadline)?)
                .run()
                .await?;
        } else {
            info!("Grants-only backup, skipping mydumper");
        }

        self.end = Some(Local::now());
        Ok(())
    }

    async fn prepare_backup_meta_info(&self, cfg: &BackupConfig) -> Result<BackupMetaInfo> {
        let begin = self.begin.unwrap_or(self.ctx.started_at);
        let end = self.end.unwrap_or_else(Local::now);

        let path = self.ctx.capture_dir.join(METADATA_FILE);
        if !self.captures_objects() || !path.is_file() {
            if self.captures_objects() {
                return Err(BackupError::Metadata(format!("{} missing", path.display())));
            }
            return Ok(BackupMetaInfo {
                begin_time: begin,
                end_time: end,
                consistent_time: ConsistentTime::WallClockFallback(Local::now()),
                binlog_info: BinlogStatusInfo::default(),
            });
        }

        let md = parse_metadata_file(&path)?;
        let consistent = match md.begin_time {
            Some(t) => ConsistentTime::Recorded(t),
            None => ConsistentTime::WallClockFallback(Local::now()),
        };
        let slave = if cfg.public.mysql_role.is_replica() {
            md.slave.map(|s| with_upstream(s, self.upstream.as_ref()))
        } else {
            None
        };
        Ok(BackupMetaInfo {
            begin_time: md.begin_time.unwrap_or(begin),
            end_time: md.end_time.unwrap_or(end),
            consistent_time: consistent,
            binlog_info: BinlogStatusInfo {
                show_master_status: md.master.map(|m| own_status(cfg, m)),
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

    fn dumper(cfg: &BackupConfig) -> LogicalDumper {
        let ctx = DumpContext::new(cfg, "host", Local::now());
        LogicalDumper {
            scope: cfg.scope().unwrap(),
            ctx,
            program: PathBuf::from("/usr/bin/mydumper"),
            upstream: None,
            begin: None,
            end: None,
        }
    }

    #[test]
    fn test_regex_from_database_list() {
        let cfg = sample_config();
        let re = build_regex(&cfg);
        assert!(re.starts_with("^(?!(mysql|sys|information_schema|performance_schema|infodba_schema|db_infobase|test"));
        assert!(re.ends_with("(db1|db2)\\."));
    }

    #[test]
    fn test_regex_tables_and_excludes() {
        let mut cfg = sample_config();
        cfg.logical_backup.tables = "db1.t1,orders".to_string();
        cfg.logical_backup.exclude_databases = "archive".to_string();
        let re = build_regex(&cfg);
        assert!(re.contains("|archive)\\.)"));
        assert!(re.ends_with("(db1\\.t1|[^.]+\\.orders)$"));

        cfg.logical_backup.regex = "^db9\\.".to_string();
        assert_eq!(build_regex(&cfg), "^db9\\.");
    }

    #[test]
    fn test_args_follow_scope() {
        let cfg = sample_config();
        let d = dumper(&cfg);
        let args = mydumper_args(&d.ctx, Scope::parse("schema").unwrap());
        assert!(args.contains(&"--no-data".to_string()));
        assert!(!args.contains(&"--no-schemas".to_string()));
        assert!(args.contains(&"--compress".to_string()));
        assert!(args.iter().any(|a| a == "--threads=8"));

        let args = mydumper_args(&d.ctx, Scope::parse("data").unwrap());
        assert!(args.contains(&"--no-schemas".to_string()));
    }

    #[tokio::test]
    async fn test_init_rejects_trx_consistency_on_old_server() {
        let mut cfg = sample_config();
        cfg.logical_backup.trx_consistency_only = true;
        let mut d = dumper(&cfg);
        assert!(d.init_config("5.5.60-log").await.is_err());
        assert!(d.init_config("5.7.20").await.is_ok());
    }

    #[tokio::test]
    async fn test_meta_from_metadata_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut cfg = sample_config();
        cfg.public.backup_dir = dir.path().to_path_buf();
        let d = dumper(&cfg);
        std::fs::create_dir_all(&d.ctx.capture_dir)?;
        std::fs::write(
            d.ctx.capture_dir.join(METADATA_FILE),
            "Started dump at: 2024-03-01 02:00:00\n\
             [master]\nFile = binlog.000010\nPosition = 1234\nExecuted_Gtid_Set = \n\n\
             [replication]\nSOURCE_HOST = \"10.0.0.1\"\nSOURCE_PORT = 3306\n\
             SOURCE_LOG_FILE = \"binlog.000020\"\nSOURCE_LOG_POS = 5678\n\
             Finished dump at: 2024-03-01 02:10:00\n",
        )?;

        let meta = d.prepare_backup_meta_info(&cfg).await?;
        let master = meta.binlog_info.show_master_status.unwrap();
        assert_eq!(master.binlog_file, "binlog.000010");
        assert_eq!(master.master_host, "127.0.0.1");
        let slave = meta.binlog_info.show_slave_status.unwrap();
        assert_eq!(slave.binlog_pos, 5678);
        assert!(!meta.consistent_time.is_fallback());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_metadata_is_an_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut cfg = sample_config();
        cfg.public.backup_dir = dir.path().to_path_buf();
        let d = dumper(&cfg);
        let err = d.prepare_backup_meta_info(&cfg).await.unwrap_err();
        assert!(matches!(err, BackupError::Metadata(_)));
        Ok(())
    }
}

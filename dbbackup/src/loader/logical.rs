//! Logical restore: myloader for mydumper output, the mysql client for
//! everything else.

use super::{LoadContext, Loader};
use crate::config::split_list;
use crate::dumper::extra_args;
use crate::dumper::logical::METADATA_FILE;
use crate::fs::walker::{walk_sorted, WalkOptions};
use crate::index::classify::classify;
use crate::index::FileType;
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use crate::utils::glibc::{glibc_version, supports_parallel_dumper};
use crate::utils::mysqlconn::version_number;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Pick myloader when the capture came from mydumper and the C library
/// can run it.
pub async fn new_loader(ctx: LoadContext) -> Result<Box<dyn Loader>> {
    let mydumper_layout = ctx.data_dir.join(METADATA_FILE).is_file();
    if mydumper_layout && supports_parallel_dumper(glibc_version().await) {
        return Ok(Box::new(MyloaderLoader::new(ctx)?));
    }
    if mydumper_layout {
        warn!("glibc too old for myloader, loading files with the mysql client");
    }
    Ok(Box::new(MysqlClientLoader::new(ctx)?))
}

/// `--regex` for myloader built from the load filters.
pub fn load_filter_regex(databases: &[String], tables: &[String]) -> Option<String> {
    if !tables.is_empty() {
        let alts: Vec<String> = tables.iter().map(|t| regex::escape(t)).collect();
        return Some(format!("^({})$", alts.join("|")));
    }
    if !databases.is_empty() {
        let alts: Vec<String> = databases.iter().map(|d| regex::escape(d)).collect();
        return Some(format!("^({})\\.", alts.join("|")));
    }
    None
}

fn server_major_minor(version: &str) -> u32 {
    version_number(version) / 1_000
}

fn warn_on_downgrade(backup_version: &str, server_version: &str) {
    if server_major_minor(server_version) < server_major_minor(backup_version) {
        warn!(
            backup = %backup_version,
            server = %server_version,
            "Loading a dump into an older server"
        );
    }
}

pub struct MyloaderLoader {
    ctx: LoadContext,
    program: PathBuf,
}

impl MyloaderLoader {
    pub fn new(ctx: LoadContext) -> Result<Self> {
        let program = find_tool("myloader", None, ctx.tool_dir())?;
        Ok(Self { ctx, program })
    }

    pub fn args(ctx: &LoadContext) -> Vec<String> {
        let cfg = &ctx.cfg;
        let load = &cfg.logical_load;
        let mut args = vec![
            format!("--host={}", cfg.public.mysql_host),
            format!("--port={}", cfg.public.mysql_port),
            format!("--user={}", cfg.public.mysql_user),
            format!("--password={}", cfg.public.mysql_passwd),
            format!("--directory={}", ctx.data_dir.display()),
            format!("--threads={}", load.threads),
            "--verbose=2".to_string(),
        ];
        if load.enable_binlog {
            args.push("--enable-binlog".to_string());
        }
        if let Some(re) = load_filter_regex(&split_list(&load.databases), &split_list(&load.tables)) {
            args.push(format!("--regex={}", re));
        }
        args.extend(extra_args(&load.extra_opt));
        args
    }
}

#[async_trait]
impl Loader for MyloaderLoader {
    fn tool(&self) -> &'static str {
        "myloader"
    }

    async fn init_config(&mut self, server_version: &str) -> Result<()> {
        warn_on_downgrade(&self.ctx.index.mysql_version, server_version);
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        ExternalCommand::new(self.tool(), &self.program)
            .args(Self::args(&self.ctx))
            .log_to(self.ctx.log_path(self.tool()))
            .run()
            .await
    }
}

/// One file to replay through the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFile {
    pub path: PathBuf,
    pub database: Option<String>,
    pub table: Option<String>,
}

/// Schema files first: database DDL, tables, views, then triggers and the rest.
fn schema_rank(name: &str) -> u8 {
    let name = name.trim_end_matches(".zst").trim_end_matches(".gz");
    if name.ends_with("-schema-create.sql") {
        0
    } else if name.ends_with("-schema.sql") {
        1
    } else if name.ends_with("-schema-view.sql") {
        2
    } else {
        3
    }
}

fn wanted(file: &SqlFile, databases: &[String], tables: &[String]) -> bool {
    // mysqldump output names no database and is always replayed whole
    let Some(db) = &file.database else {
        return true;
    };
    if !databases.is_empty() && !databases.contains(db) {
        return false;
    }
    match (&file.table, tables.is_empty()) {
        (_, true) | (None, false) => true,
        (Some(t), false) => tables.contains(&format!("{}.{}", db, t)),
    }
}

/// Split the unpacked directory into ordered schema files and data files.
pub fn plan_files(dir: &Path, databases: &[String], tables: &[String]) -> Result<(Vec<SqlFile>, Vec<SqlFile>)> {
    let mut schema = Vec::new();
    let mut data = Vec::new();
    for file in walk_sorted(dir, &WalkOptions::default())? {
        let c = classify(&file.file_name());
        let sql = SqlFile {
            path: file.path.clone(),
            database: c.database,
            table: c.table,
        };
        if !wanted(&sql, databases, tables) {
            continue;
        }
        match c.file_type {
            FileType::Schema => schema.push(sql),
            FileType::Data => data.push(sql),
            _ => {}
        }
    }
    schema.sort_by(|a, b| {
        let rank = |f: &SqlFile| schema_rank(&f.path.to_string_lossy());
        rank(a).cmp(&rank(b)).then_with(|| a.path.cmp(&b.path))
    });
    Ok((schema, data))
}

/// A configured mysql client invocation, cheap to clone into workers.
#[derive(Debug, Clone)]
pub struct MysqlClient {
    program: PathBuf,
    base_args: Vec<String>,
    log_file: PathBuf,
    scratch_dir: PathBuf,
}

impl MysqlClient {
    pub fn from_context(ctx: &LoadContext, program: PathBuf) -> Self {
        let cfg = &ctx.cfg;
        let charset = if ctx.index.backup_charset.is_empty() {
            cfg.public.mysql_charset.clone()
        } else {
            ctx.index.backup_charset.clone()
        };
        let mut init: Vec<String> = Vec::new();
        if !cfg.logical_load.enable_binlog {
            init.push("SET SESSION sql_log_bin=0".to_string());
        }
        if !cfg.logical_load.init_command.trim().is_empty() {
            init.push(cfg.logical_load.init_command.trim().trim_end_matches(';').to_string());
        }

        let mut base_args = vec![
            format!("--host={}", cfg.public.mysql_host),
            format!("--port={}", cfg.public.mysql_port),
            format!("--user={}", cfg.public.mysql_user),
            format!("--password={}", cfg.public.mysql_passwd),
            format!("--default-character-set={}", charset),
            "--max-allowed-packet=1G".to_string(),
        ];
        if !init.is_empty() {
            base_args.push(format!("--init-command={}", init.join(";")));
        }
        base_args.extend(extra_args(&cfg.logical_load.extra_opt));

        Self {
            program,
            base_args,
            log_file: ctx.log_path("mysql"),
            scratch_dir: ctx.data_dir.clone(),
        }
    }

    pub fn command(&self, input: &Path, database: Option<&str>) -> ExternalCommand {
        let mut cmd = ExternalCommand::new("mysql", &self.program).args(self.base_args.iter().cloned());
        if let Some(db) = database {
            cmd = cmd.arg(format!("--database={}", db));
        }
        cmd.stdin_file(input).log_to(&self.log_file)
    }

    /// Replay one file, decompressing zstd members first.
    pub async fn source(&self, file: &SqlFile) -> Result<()> {
        let name = file.path.to_string_lossy().to_string();
        if name.ends_with(".gz") {
            return Err(BackupError::validation(format!(
                "{} is gzip compressed; load it with myloader",
                name
            )));
        }
        if !name.ends_with(".zst") {
            return self.command(&file.path, file.database.as_deref()).run().await;
        }

        let source = file.path.clone();
        let scratch = self.scratch_dir.clone();
        let plain = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
            let mut decoder = zstd::stream::read::Decoder::new(std::fs::File::open(&source)?)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&scratch)?;
            std::io::copy(&mut decoder, tmp.as_file_mut())?;
            Ok(tmp)
        })
        .await
        .map_err(|e| BackupError::Process(format!("decompress task failed: {}", e)))??;
        self.command(plain.path(), file.database.as_deref()).run().await
    }
}

pub struct MysqlClientLoader {
    ctx: LoadContext,
    client: MysqlClient,
}

impl MysqlClientLoader {
    pub fn new(ctx: LoadContext) -> Result<Self> {
        let program = find_tool("mysql", None, ctx.tool_dir())?;
        let client = MysqlClient::from_context(&ctx, program);
        Ok(Self { ctx, client })
    }
}

#[async_trait]
impl Loader for MysqlClientLoader {
    fn tool(&self) -> &'static str {
        "mysql"
    }

    async fn init_config(&mut self, server_version: &str) -> Result<()> {
        warn_on_downgrade(&self.ctx.index.mysql_version, server_version);
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        let load = &self.ctx.cfg.logical_load;
        let (schema, data) = plan_files(
            &self.ctx.data_dir,
            &split_list(&load.databases),
            &split_list(&load.tables),
        )?;
        info!(schema = schema.len(), data = data.len(), "Replaying dump files");

        for file in &schema {
            self.client.source(file).await?;
        }

        let permits = Arc::new(Semaphore::new(load.threads.max(1)));
        let mut handles = Vec::with_capacity(data.len());
        for file in data {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BackupError::Process(e.to_string()))?;
            let client = self.client.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                client.source(&file).await
            }));
        }

        let mut first_error = None;
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| BackupError::Process(format!("load task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                warn!("Data file failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::index::tests::sample_meta;
    use crate::index::IndexContent;
    use tempfile::TempDir;

    fn context(dir: &Path) -> LoadContext {
        let cfg = sample_config();
        LoadContext {
            index: IndexContent::new(&cfg, "tgt", "5.7.20", sample_meta()).unwrap(),
            cfg,
            data_dir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
        }
    }

    #[test]
    fn test_plan_orders_schema_and_filters() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for name in [
            "db1.t1-schema-triggers.sql",
            "db1.t1-schema.sql",
            "db1.v1-schema-view.sql",
            "db1-schema-create.sql",
            "db1.t1.00000.sql",
            "db1.t1.00001.sql.zst",
            "db2.t9.00000.sql",
            "metadata",
        ] {
            std::fs::write(dir.path().join(name), b"--")?;
        }

        let (schema, data) = plan_files(dir.path(), &["db1".to_string()], &[])?;
        let names: Vec<String> = schema
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "db1-schema-create.sql",
                "db1.t1-schema.sql",
                "db1.v1-schema-view.sql",
                "db1.t1-schema-triggers.sql"
            ]
        );
        assert_eq!(data.len(), 2);
        assert!(data.iter().all(|f| f.database.as_deref() == Some("db1")));

        let (_, data) = plan_files(dir.path(), &[], &["db2.t9".to_string()])?;
        assert_eq!(data.len(), 1);
        Ok(())
    }

    #[test]
    fn test_mysqldump_file_always_loaded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("100_h_127.0.0.1_3306_20240301020000_logical.sql"), b"--")?;
        let (schema, data) = plan_files(dir.path(), &["db1".to_string()], &[])?;
        assert!(schema.is_empty());
        assert_eq!(data.len(), 1);
        assert!(data[0].database.is_none());
        Ok(())
    }

    #[test]
    fn test_client_command_disables_binlog() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut ctx = context(dir.path());
        ctx.cfg.logical_load.init_command = "SET foreign_key_checks=0;".to_string();
        let client = MysqlClient::from_context(&ctx, PathBuf::from("/usr/bin/mysql"));
        let cmd = client.command(Path::new("/x/db1.t1.00000.sql"), Some("db1"));
        let args = cmd.get_args();
        assert!(args
            .iter()
            .any(|a| a == "--init-command=SET SESSION sql_log_bin=0;SET foreign_key_checks=0"));
        assert_eq!(args.last().map(String::as_str), Some("--database=db1"));
        assert!(!cmd.display().contains("secret"));
        Ok(())
    }

    #[tokio::test]
    async fn test_gzip_member_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = context(dir.path());
        let client = MysqlClient::from_context(&ctx, PathBuf::from("/usr/bin/mysql"));
        let file = SqlFile {
            path: dir.path().join("db1.t1.00000.sql.gz"),
            database: Some("db1".to_string()),
            table: Some("t1".to_string()),
        };
        assert!(matches!(client.source(&file).await, Err(BackupError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_myloader_args() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut ctx = context(dir.path());
        ctx.cfg.logical_load.databases = "db1".to_string();
        ctx.cfg.logical_load.enable_binlog = true;
        let args = MyloaderLoader::args(&ctx);
        assert!(args.contains(&"--enable-binlog".to_string()));
        assert!(args.contains(&"--regex=^(db1)\\.".to_string()));
        assert_eq!(load_filter_regex(&[], &[]), None);
        Ok(())
    }
}

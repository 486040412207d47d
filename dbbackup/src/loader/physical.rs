//! Physical restore into an empty data directory.

use super::{LoadContext, Loader};
use crate::config::StorageEngine;
use crate::utils::cmd::{find_tool, ExternalCommand};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn new_loader(ctx: LoadContext) -> Result<Box<dyn Loader>> {
    Ok(match ctx.index.storage_engine {
        StorageEngine::Innodb => Box::new(XtrabackupLoader::new(ctx)?),
        StorageEngine::Rocksdb => Box::new(RocksdbLoader::new(ctx)?),
    })
}

/// Copy-back refuses to overwrite; a missing directory is created by the tool.
pub fn ensure_empty_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(BackupError::validation("mysql_load_dir is required for a physical load"));
    }
    if !dir.exists() {
        return Ok(());
    }
    if std::fs::read_dir(dir)?.next().is_some() {
        return Err(BackupError::validation(format!(
            "load directory {} is not empty",
            dir.display()
        )));
    }
    Ok(())
}

pub struct XtrabackupLoader {
    ctx: LoadContext,
    program: PathBuf,
}

impl XtrabackupLoader {
    pub fn new(ctx: LoadContext) -> Result<Self> {
        let program = find_tool("xtrabackup", None, ctx.tool_dir())?;
        Ok(Self { ctx, program })
    }

    fn defaults_file(&self) -> Option<String> {
        let f = &self.ctx.cfg.physical_load.default_file;
        (!f.as_os_str().is_empty()).then(|| format!("--defaults-file={}", f.display()))
    }

    pub fn prepare_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.defaults_file().into_iter().collect();
        args.push("--prepare".to_string());
        args.push(format!("--target-dir={}", self.ctx.data_dir.display()));
        args
    }

    pub fn restore_args(&self) -> Vec<String> {
        let load = &self.ctx.cfg.physical_load;
        let mut args: Vec<String> = self.defaults_file().into_iter().collect();
        args.push(if load.copy_back { "--copy-back" } else { "--move-back" }.to_string());
        args.push(format!("--target-dir={}", self.ctx.data_dir.display()));
        args.push(format!("--datadir={}", load.mysql_load_dir.display()));
        args.push(format!("--parallel={}", load.threads));
        args
    }
}

#[async_trait]
impl Loader for XtrabackupLoader {
    fn tool(&self) -> &'static str {
        "xtrabackup"
    }

    async fn init_config(&mut self, _server_version: &str) -> Result<()> {
        ensure_empty_dir(&self.ctx.cfg.physical_load.mysql_load_dir)
    }

    async fn execute(&mut self) -> Result<()> {
        let log = self.ctx.log_path(self.tool());
        ExternalCommand::new(self.tool(), &self.program)
            .args(self.prepare_args())
            .log_to(&log)
            .run()
            .await?;
        info!(dir = %self.ctx.data_dir.display(), "Backup prepared");

        ExternalCommand::new(self.tool(), &self.program)
            .args(self.restore_args())
            .log_to(&log)
            .run()
            .await?;
        info!(datadir = %self.ctx.cfg.physical_load.mysql_load_dir.display(), "Backup restored");
        Ok(())
    }
}

/// MyRocks checkpoints need no prepare; files are moved into place.
pub struct RocksdbLoader {
    ctx: LoadContext,
    program: PathBuf,
}

impl RocksdbLoader {
    pub fn new(ctx: LoadContext) -> Result<Self> {
        let program = find_tool("myrocks_hotbackup", None, ctx.tool_dir())?;
        Ok(Self { ctx, program })
    }

    pub fn args(&self) -> Vec<String> {
        let load_dir = &self.ctx.cfg.physical_load.mysql_load_dir;
        let rocks = load_dir.join(".rocksdb");
        vec![
            "--move_back".to_string(),
            format!("--backup_dir={}", self.ctx.data_dir.display()),
            format!("--mysqld_datadir={}", load_dir.display()),
            format!("--rocksdb_datadir={}", rocks.display()),
            format!("--rocksdb_waldir={}", rocks.display()),
        ]
    }
}

#[async_trait]
impl Loader for RocksdbLoader {
    fn tool(&self) -> &'static str {
        "myrocks_hotbackup"
    }

    async fn init_config(&mut self, _server_version: &str) -> Result<()> {
        ensure_empty_dir(&self.ctx.cfg.physical_load.mysql_load_dir)
    }

    async fn execute(&mut self) -> Result<()> {
        ExternalCommand::new(self.tool(), &self.program)
            .args(self.args())
            .log_to(self.ctx.log_path(self.tool()))
            .run()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::index::tests::sample_meta;
    use crate::index::IndexContent;
    use tempfile::TempDir;

    fn loader(load_dir: &Path, copy_back: bool) -> XtrabackupLoader {
        let mut cfg = sample_config();
        cfg.physical_load.mysql_load_dir = load_dir.to_path_buf();
        cfg.physical_load.copy_back = copy_back;
        XtrabackupLoader {
            ctx: LoadContext {
                index: IndexContent::new(&cfg, "tgt", "5.7.20", sample_meta()).unwrap(),
                cfg,
                data_dir: PathBuf::from("/data/dbbak/tgt"),
                log_dir: PathBuf::from("/tmp"),
            },
            program: PathBuf::from("/usr/bin/xtrabackup"),
        }
    }

    #[test]
    fn test_ensure_empty_dir() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        assert!(ensure_empty_dir(dir.path()).is_ok());
        assert!(ensure_empty_dir(&dir.path().join("missing")).is_ok());
        std::fs::write(dir.path().join("ibdata1"), b"x")?;
        assert!(matches!(ensure_empty_dir(dir.path()), Err(BackupError::Validation(_))));
        assert!(ensure_empty_dir(Path::new("")).is_err());
        Ok(())
    }

    #[test]
    fn test_copy_or_move_back() {
        let l = loader(Path::new("/data/mysqldata/3306"), true);
        assert_eq!(l.prepare_args(), vec!["--prepare", "--target-dir=/data/dbbak/tgt"]);
        let args = l.restore_args();
        assert_eq!(args[0], "--copy-back");
        assert!(args.contains(&"--datadir=/data/mysqldata/3306".to_string()));

        let l = loader(Path::new("/data/mysqldata/3306"), false);
        assert_eq!(l.restore_args()[0], "--move-back");
    }
}

//! Restore: unpack a backup and replay it into an instance.

pub mod logical;
pub mod physical;
pub mod safety;
pub mod unpack;

use crate::config::{split_list, BackupConfig, BackupType, EncryptOptConfig, EncryptTool};
use crate::index::{FileType, IndexContent};
use crate::packager::encrypt::{suffix_for, Encryptor};
use crate::utils::cmd::weekday_log_path;
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::server_version;
use async_trait::async_trait;
use chrono::Local;
use safety::{check_target_databases, drop_databases, InitConnectGuard};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[async_trait]
pub trait Loader: Send {
    fn tool(&self) -> &'static str;

    /// Check the target against the backup before touching it.
    async fn init_config(&mut self, server_version: &str) -> Result<()>;

    async fn execute(&mut self) -> Result<()>;
}

/// An unpacked backup ready to be replayed.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub cfg: BackupConfig,
    pub index: IndexContent,
    /// `<work_dir>/<target>`
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl LoadContext {
    pub fn log_path(&self, tool: &str) -> PathBuf {
        weekday_log_path(&self.log_dir, tool, self.cfg.public.mysql_port, Local::now())
    }

    pub fn tool_dir(&self) -> Option<&Path> {
        self.cfg.public.tool_dir.as_deref()
    }
}

fn index_path_for(cfg: &BackupConfig) -> Result<PathBuf> {
    let path = match cfg.public.backup_type {
        BackupType::Logical => &cfg.logical_load.index_file_path,
        BackupType::Physical => &cfg.physical_load.index_file_path,
    };
    if path.as_os_str().is_empty() {
        return Err(BackupError::validation("index_file_path is required for a load"));
    }
    Ok(path.clone())
}

/// The decryptor matching the suffix the parts were written with.
fn decryptor_for(cfg: &BackupConfig, index: &IndexContent) -> Result<Option<Encryptor>> {
    if !index.encrypt_enable {
        return Ok(None);
    }
    let xb = suffix_for(EncryptTool::Xbcrypt);
    let tool = if index.archive_parts().iter().any(|p| p.file_name.ends_with(xb)) {
        EncryptTool::Xbcrypt
    } else {
        EncryptTool::Openssl
    };
    let opts = EncryptOptConfig {
        encrypt_enable: true,
        encrypt_tool: tool,
        passphrase: cfg.encrypt_opt.passphrase.clone(),
    };
    Encryptor::from_config(&opts, cfg.public.tool_dir.as_deref())
}

/// Databases a logical load writes to: the configured list, or every
/// database the backup holds objects for.
pub fn target_databases(cfg: &BackupConfig, index: &IndexContent) -> Vec<String> {
    let configured = split_list(&cfg.logical_load.databases);
    if !configured.is_empty() {
        return configured;
    }
    index
        .file_list
        .iter()
        .filter(|f| matches!(f.file_type, FileType::Schema | FileType::Data))
        .filter_map(|f| f.database.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Restore the backup named by the load section's `index_file_path`.
pub async fn run_load(cfg: &BackupConfig) -> Result<()> {
    let index_path = index_path_for(cfg)?;
    let index = IndexContent::load(&index_path)?;
    if index.backup_type != cfg.public.backup_type {
        return Err(BackupError::validation(format!(
            "{} holds a {} backup, configured load is {}",
            index_path.display(),
            index.backup_type,
            cfg.public.backup_type
        )));
    }

    let targets = target_databases(cfg, &index);
    if index.backup_type == BackupType::Logical {
        check_target_databases(&targets)?;
    }

    let backup_dir = index_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    info!(backup_id = %index.backup_id, target = %index.target_name, "Starting load");

    let decryptor = decryptor_for(cfg, &index)?;
    let data_dir = unpack::unpack_backup(&index, &backup_dir, &backup_dir, decryptor.as_ref()).await?;
    let ctx = LoadContext {
        cfg: cfg.clone(),
        index,
        data_dir: data_dir.clone(),
        log_dir: cfg.log_dir(),
    };

    let result = match ctx.index.backup_type {
        BackupType::Logical => load_logical(ctx, &targets).await,
        BackupType::Physical => {
            let version = ctx.index.mysql_version.clone();
            let mut loader = physical::new_loader(ctx)?;
            loader.init_config(&version).await?;
            loader.execute().await
        }
    };

    if data_dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
            warn!(dir = %data_dir.display(), "Cannot remove unpacked backup: {}", e);
        }
    }
    result
}

async fn load_logical(ctx: LoadContext, targets: &[String]) -> Result<()> {
    let pool = ctx.cfg.conn_param().connect().await?;
    let version = server_version(&pool).await?;
    let drop_first = ctx.cfg.logical_load.drop_databases;

    let mut loader = logical::new_loader(ctx).await?;
    loader.init_config(&version).await?;

    let guard = InitConnectGuard::disable(&pool).await?;
    let result = async {
        if drop_first {
            drop_databases(&pool, targets).await?;
        }
        loader.execute().await
    }
    .await;
    let restored = guard.restore().await;
    pool.close().await;

    result?;
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::index::tests::sample_meta;
    use crate::index::TarFileItem;

    #[test]
    fn test_target_databases_from_manifest() {
        let mut cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "tgt", "5.7.20", sample_meta()).unwrap();
        for name in ["db2.t1-schema.sql", "db1.t1.00000.sql", "db2-schema-create.sql", "metadata"] {
            index.add_file(TarFileItem::member(name, 10, "tgt_0.tar"));
        }
        assert_eq!(target_databases(&cfg, &index), vec!["db1", "db2"]);

        cfg.logical_load.databases = "only_me".to_string();
        assert_eq!(target_databases(&cfg, &index), vec!["only_me"]);
    }

    #[test]
    fn test_index_path_required() {
        let cfg = sample_config();
        assert!(matches!(index_path_for(&cfg), Err(BackupError::Validation(_))));
    }

    #[test]
    fn test_decryptor_follows_part_suffix() {
        let mut cfg = sample_config();
        cfg.encrypt_opt.passphrase = "pw".to_string();
        let mut index = IndexContent::new(&cfg, "tgt", "5.7.20", sample_meta()).unwrap();
        assert!(decryptor_for(&cfg, &index).unwrap().is_none());

        index.encrypt_enable = true;
        index.add_file(TarFileItem::standalone("tgt_0.tar.xb", 10));
        // xbcrypt is rarely installed on build hosts; only the suffix choice matters here
        match decryptor_for(&cfg, &index) {
            Ok(Some(enc)) => assert_eq!(enc.suffix(), ".xb"),
            Ok(None) => panic!("encrypted backup produced no decryptor"),
            Err(e) => assert!(matches!(e, BackupError::Validation(ref m) if m.contains("xbcrypt"))),
        }
    }
}

//! One complete backup: capture, package, report.

use super::{grants, new_dumper, DumpContext};
use crate::config::BackupConfig;
use crate::index::IndexContent;
use crate::packager::encrypt::Encryptor;
use crate::packager::{package, PackageOptions};
use crate::report::{BackupStage, Reporter};
use crate::utils::errors::Result;
use crate::utils::mysqlconn::server_version;
use chrono::Local;
use tracing::{error, info};

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Run a backup and record the failure stage if it does not complete.
pub async fn run_dump(cfg: &BackupConfig, reporter: &Reporter, enforce_deadline: bool) -> Result<IndexContent> {
    match dump(cfg, reporter, enforce_deadline).await {
        Ok(index) => {
            reporter.report_status(BackupStage::Success, "");
            Ok(index)
        }
        Err(e) => {
            error!(backup_id = %cfg.public.backup_id, "Backup failed: {}", e);
            reporter.report_status(BackupStage::Failed, &e.to_string());
            Err(e)
        }
    }
}

async fn dump(cfg: &BackupConfig, reporter: &Reporter, enforce_deadline: bool) -> Result<IndexContent> {
    let scope = cfg.scope()?;
    reporter.report_status(BackupStage::Begin, "");

    let pool = cfg.conn_param().connect().await?;
    let version = server_version(&pool).await?;
    let ctx = DumpContext::new(cfg, &local_hostname(), Local::now());
    info!(
        backup_id = %cfg.public.backup_id,
        target = %ctx.target_name,
        version = %version,
        scope = %scope,
        "Starting backup"
    );

    let mut dumper = new_dumper(ctx.clone()).await?;
    dumper.init_config(&version).await?;

    reporter.report_status(BackupStage::Dumping, dumper.tool());
    dumper.execute(enforce_deadline).await?;
    if scope.grant {
        grants::dump_grants(&pool, &version, &ctx.priv_path()).await?;
    }
    let meta = dumper.prepare_backup_meta_info(cfg).await?;

    let mut index = IndexContent::new(cfg, &ctx.target_name, &version, meta)?;
    reporter.report_status(BackupStage::Tarring, "");
    let encryptor = Encryptor::from_config(&cfg.encrypt_opt, ctx.tool_dir())?
        .map(|e| e.with_log(ctx.log_path("encrypt")));
    package(
        &PackageOptions::from_config(cfg),
        &ctx.capture_dir,
        &mut index,
        encryptor.as_ref(),
        reporter,
    )
    .await?;

    reporter.report_status(BackupStage::Reporting, "");
    let index_task = reporter.upload_files(&mut index).await?;
    reporter.write_index(&index)?;
    reporter.append_result_log(&index, &index_task)?;
    reporter.report_audit(&pool, &index).await?;
    pool.close().await;

    info!(
        backup_id = %index.backup_id,
        files = index.standalone_files().count(),
        total = index.total_filesize,
        "Backup finished"
    );
    Ok(index)
}

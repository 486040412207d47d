//! Turning archive parts back into a capture directory.

use crate::index::{FileType, IndexContent};
use crate::packager::encrypt::Encryptor;
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Every standalone file the manifest lists must exist with its recorded size.
pub fn verify_parts(index: &IndexContent, dir: &Path) -> Result<()> {
    for item in index.standalone_files() {
        let path = dir.join(&item.file_name);
        let meta = std::fs::metadata(&path).map_err(|e| {
            BackupError::Consistency(format!("{} listed in manifest but unreadable: {}", path.display(), e))
        })?;
        if meta.len() != item.file_size {
            return Err(BackupError::Consistency(format!(
                "{} is {} bytes, manifest says {}",
                path.display(),
                meta.len(),
                item.file_size
            )));
        }
    }
    Ok(())
}

/// Concatenate split parts, in manifest order, into one tar.
pub fn reassemble(parts: &[PathBuf], out: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(out)?);
    let mut total = 0u64;
    for part in parts {
        total += std::io::copy(&mut File::open(part)?, &mut writer)?;
    }
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(total)
}

pub fn extract(tar_path: &Path, work_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(File::open(tar_path)?);
    archive.set_preserve_permissions(true);
    archive
        .unpack(work_dir)
        .map_err(|e| BackupError::Archive(format!("unpack {}: {}", tar_path.display(), e)))
}

/// Verify, decrypt, reassemble and unpack the archive described by `index`
/// from `backup_dir` into `work_dir`. Returns `<work_dir>/<target>`.
pub async fn unpack_backup(
    index: &IndexContent,
    backup_dir: &Path,
    work_dir: &Path,
    encryptor: Option<&Encryptor>,
) -> Result<PathBuf> {
    verify_parts(index, backup_dir)?;
    let archives = index.archive_parts();
    if archives.is_empty() {
        return Err(BackupError::Consistency(format!(
            "manifest {} lists no archive parts",
            index.index_file_name()
        )));
    }
    let split = archives.iter().all(|a| a.file_type == FileType::Part);

    let mut plain = Vec::with_capacity(archives.len());
    let mut decrypted = Vec::new();
    for item in &archives {
        let path = backup_dir.join(&item.file_name);
        match (index.encrypt_enable, encryptor) {
            (true, Some(enc)) => {
                let out = enc.decrypt(&path).await?;
                decrypted.push(out.clone());
                plain.push(out);
            }
            (true, None) => {
                return Err(BackupError::validation(
                    "backup is encrypted but no passphrase is configured",
                ))
            }
            (false, _) => plain.push(path),
        }
    }

    tokio::fs::create_dir_all(work_dir).await?;
    let target = index.target_name.clone();
    let job_dir = work_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        if split {
            let whole = job_dir.join(format!("{}.tar", target));
            let size = reassemble(&plain, &whole)?;
            info!(tar = %whole.display(), size, parts = plain.len(), "Parts reassembled");
            extract(&whole, &job_dir)?;
            std::fs::remove_file(&whole)?;
        } else {
            for tar in &plain {
                extract(tar, &job_dir)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| BackupError::Process(format!("unpack task failed: {}", e)))??;

    for path in decrypted {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(file = %path.display(), "Cannot remove decrypted part: {}", e);
        }
    }

    let out = work_dir.join(&index.target_name);
    if !out.is_dir() {
        return Err(BackupError::Consistency(format!(
            "archive did not contain {}",
            index.target_name
        )));
    }
    info!(dir = %out.display(), "Backup unpacked");
    Ok(out)
}

//! Turns a capture directory into size-bounded, optionally encrypted
//! archive parts and fills in the manifest's file list.

pub mod encrypt;
pub mod mapping;
pub mod splitting;

use crate::config::{BackupConfig, BackupType};
use crate::fs::walker::{walk_sorted, CaptureFile, WalkOptions};
use crate::index::{IndexContent, TarFileItem, UNKNOWN_SIZE};
use crate::report::Reporter;
use crate::utils::errors::{BackupError, Result};
use crate::utils::ratelimit::RateLimiter;
use encrypt::Encryptor;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    /// One part per threshold worth of whole capture files
    Mapping,
    /// One tar split by byte range
    Splitting,
}

impl From<BackupType> for PackageKind {
    fn from(t: BackupType) -> Self {
        match t {
            BackupType::Logical => PackageKind::Mapping,
            BackupType::Physical => PackageKind::Splitting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub kind: PackageKind,
    /// Part size in bytes
    pub threshold: u64,
    /// Bytes per second, 0 = unlimited
    pub io_limit: u64,
}

impl PackageOptions {
    pub fn from_config(cfg: &BackupConfig) -> Self {
        Self {
            kind: cfg.public.backup_type.into(),
            threshold: cfg.tar_size_threshold_bytes(),
            io_limit: cfg.public.io_limit_mb_per_sec.saturating_mul(1024 * 1024),
        }
    }
}

/// Decoded size of zstd members, raw size of everything else, in KB.
/// Any decode failure yields [`UNKNOWN_SIZE`].
pub fn uncompressed_size_kb(files: &[CaptureFile]) -> i64 {
    let mut total = 0u64;
    for file in files {
        if file.file_name().ends_with(".zst") {
            match zstd_decoded_len(&file.path) {
                Ok(n) => total += n,
                Err(e) => {
                    warn!(file = %file.path.display(), "Cannot size compressed file: {}", e);
                    return UNKNOWN_SIZE;
                }
            }
        } else {
            total += file.size;
        }
    }
    (total / 1024) as i64
}

fn zstd_decoded_len(path: &Path) -> io::Result<u64> {
    let mut decoder = zstd::stream::read::Decoder::new(std::fs::File::open(path)?)?;
    io::copy(&mut decoder, &mut io::sink())
}

/// Package `capture_dir` into `index.target_name` parts next to the
/// manifest, encrypt them if configured, record the grants file and persist
/// the manifest.
pub async fn package(
    opts: &PackageOptions,
    capture_dir: &Path,
    index: &mut IndexContent,
    encryptor: Option<&Encryptor>,
    reporter: &Reporter,
) -> Result<PathBuf> {
    let out_dir = reporter.backup_dir().to_path_buf();
    let target = index.target_name.clone();

    let files = walk_sorted(capture_dir, &WalkOptions::default())?;
    index.total_size_kb_uncompress = uncompressed_size_kb(&files);

    let job_opts = opts.clone();
    let job_capture = capture_dir.to_path_buf();
    let job_out = out_dir.clone();
    let job_target = target.clone();
    let mut items = tokio::task::spawn_blocking(move || {
        let limiter = RateLimiter::new(job_opts.io_limit);
        match job_opts.kind {
            PackageKind::Mapping => {
                mapping::mapping_package(&job_capture, &job_out, &job_target, job_opts.threshold, &limiter)
            }
            PackageKind::Splitting => splitting::splitting_package(
                &job_capture,
                &job_out,
                &job_target,
                job_opts.threshold,
                &limiter,
            ),
        }
    })
    .await
    .map_err(|e| BackupError::Process(format!("packaging task failed: {}", e)))??;

    if let Some(enc) = encryptor {
        for item in items.iter_mut().filter(|i| i.is_standalone()) {
            let encrypted = enc.encrypt(&out_dir.join(&item.file_name)).await?;
            item.file_size = tokio::fs::metadata(&encrypted).await?.len();
            item.file_name = format!("{}{}", item.file_name, enc.suffix());
        }
        let suffix = enc.suffix();
        for item in items.iter_mut().filter(|i| !i.is_standalone()) {
            if let Some(part) = item.tar_file_name.take() {
                item.tar_file_name = Some(format!("{}{}", part, suffix));
            }
        }
    }

    for item in items {
        index.add_file(item);
    }

    let priv_name = format!("{}.priv", target);
    let priv_path = out_dir.join(&priv_name);
    if priv_path.is_file() {
        let size = std::fs::metadata(&priv_path)?.len();
        index.add_file(TarFileItem::standalone(priv_name, size));
    }

    if capture_dir.exists() {
        std::fs::remove_dir_all(capture_dir)?;
    }

    info!(
        backup_id = %index.backup_id,
        parts = index.archive_parts().len(),
        total = index.total_filesize,
        "Packaging finished"
    );
    reporter.write_index(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::index::tests::sample_meta;
    use crate::index::FileType;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_uncompressed_size_counts_decoded_bytes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut enc = zstd::stream::write::Encoder::new(
            std::fs::File::create(dir.path().join("db.t.00000.sql.zst"))?,
            3,
        )?;
        enc.write_all(&vec![b'a'; 8192])?;
        enc.finish()?;
        std::fs::write(dir.path().join("db.t-schema.sql"), vec![b'b'; 2048])?;

        let files = walk_sorted(dir.path(), &WalkOptions::default())?;
        assert_eq!(uncompressed_size_kb(&files), 10);
        Ok(())
    }

    #[test]
    fn test_uncompressed_size_unknown_on_corrupt_member() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("db.t.00000.sql.zst"), b"definitely not zstd")?;
        let files = walk_sorted(dir.path(), &WalkOptions::default())?;
        assert_eq!(uncompressed_size_kb(&files), UNKNOWN_SIZE);
        Ok(())
    }

    /// Physical, data-only backup of 3.5 thresholds worth of capture output.
    #[tokio::test]
    async fn test_physical_split_into_four_parts() -> anyhow::Result<()> {
        let backup_dir = TempDir::new()?;
        let mut cfg = sample_config();
        cfg.public.backup_dir = backup_dir.path().to_path_buf();
        cfg.public.backup_type = BackupType::Physical;
        cfg.public.data_schema_grant = "data".to_string();
        cfg.logical_backup.databases.clear();

        let threshold: u64 = 64 * 1024;
        let target = "100_host_127.0.0.1_3306_20240301020000_xtra";
        let capture = backup_dir.path().join(target);
        std::fs::create_dir_all(&capture)?;
        std::fs::write(capture.join("ibdata1"), vec![3u8; (threshold * 7 / 2) as usize])?;

        let reporter = Reporter::new(&cfg);
        let mut index = IndexContent::new(&cfg, target, "5.7.20", sample_meta())?;
        let opts = PackageOptions {
            kind: PackageKind::Splitting,
            threshold,
            io_limit: 0,
        };
        let index_path = package(&opts, &capture, &mut index, None, &reporter).await?;

        let parts = index.archive_parts();
        let names: Vec<&str> = parts.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(
            names,
            (0..4)
                .map(|n| format!("{}.tar.part_{}", target, n))
                .collect::<Vec<_>>()
        );
        assert!(parts.iter().all(|p| p.file_type == FileType::Part));
        let sum: u64 = parts.iter().map(|p| p.file_size).sum();
        assert_eq!(index.total_filesize, sum);
        assert!(!index.is_full_backup);
        assert!(!capture.exists());

        let reloaded = IndexContent::load(&index_path)?;
        assert_eq!(reloaded.total_filesize, sum);
        assert_eq!(reloaded.binlog_info, index.binlog_info);
        Ok(())
    }

    #[tokio::test]
    async fn test_logical_package_records_members_and_priv() -> anyhow::Result<()> {
        let backup_dir = TempDir::new()?;
        let mut cfg = sample_config();
        cfg.public.backup_dir = backup_dir.path().to_path_buf();

        let target = "100_host_127.0.0.1_3306_20240301020000_logical";
        let capture = backup_dir.path().join(target);
        std::fs::create_dir_all(&capture)?;
        std::fs::write(capture.join("db1.t1-schema.sql"), b"CREATE TABLE t1 (id int);")?;
        std::fs::write(capture.join("db1.t1.00000.sql"), b"INSERT INTO t1 VALUES (1);")?;
        std::fs::write(capture.join("metadata"), b"[master]\nFile = b.000001\nPosition = 4\n")?;
        std::fs::write(backup_dir.path().join(format!("{}.priv", target)), b"GRANT ALL;")?;

        let reporter = Reporter::new(&cfg);
        let mut index = IndexContent::new(&cfg, target, "5.7.20", sample_meta())?;
        let opts = PackageOptions {
            kind: PackageKind::Mapping,
            threshold: 1 << 20,
            io_limit: 0,
        };
        package(&opts, &capture, &mut index, None, &reporter).await?;

        let types: Vec<FileType> = index.file_list.iter().map(|f| f.file_type).collect();
        assert_eq!(
            types,
            vec![
                FileType::Schema,
                FileType::Data,
                FileType::Metadata,
                FileType::Tar,
                FileType::Priv
            ]
        );
        assert_eq!(index.archive_parts().len(), 1);
        assert!(index.total_size_kb_uncompress >= 0);
        Ok(())
    }
}

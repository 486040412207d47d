//! Physical packaging: one tar of the whole capture, split afterwards.
//!
//! The capture directory becomes `<target>.tar` with no size boundary. If that
//! exceeds the threshold it is cut into `<target>.tar.part_<N>` by byte range
//! and the whole tar is removed.

use crate::index::TarFileItem;
use crate::utils::errors::{BackupError, Result};
use crate::utils::ratelimit::{copy_throttled, remove_file_throttled, RateLimiter, ThrottledWriter};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::info;

pub fn tar_name(target: &str) -> String {
    format!("{}.tar", target)
}

pub fn split_part_name(target: &str, n: usize) -> String {
    format!("{}.tar.part_{}", target, n)
}

/// Archive the capture directory as `<target>/...` into a single tar.
fn archive_whole(capture_dir: &Path, tar_path: &Path, target: &str, limiter: &RateLimiter) -> Result<u64> {
    let file = File::create(tar_path)?;
    let mut builder = tar::Builder::new(ThrottledWriter::new(file, limiter));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(target, capture_dir)
        .map_err(|e| BackupError::Archive(format!("archive {}: {}", capture_dir.display(), e)))?;
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    writer.into_inner().sync_all()?;
    Ok(std::fs::metadata(tar_path)?.len())
}

/// Cut `tar_path` into parts of at most `threshold` bytes.
pub fn split_file(
    tar_path: &Path,
    out_dir: &Path,
    target: &str,
    threshold: u64,
    limiter: &RateLimiter,
) -> Result<Vec<TarFileItem>> {
    let mut reader = BufReader::new(File::open(tar_path)?);
    let total = std::fs::metadata(tar_path)?.len();
    let mut items = Vec::new();
    let mut copied_total = 0u64;
    let mut n = 0usize;

    while copied_total < total {
        let name = split_part_name(target, n);
        let path = out_dir.join(&name);
        let mut out = File::create(&path)?;
        let copied = copy_throttled(&mut reader, &mut out, limiter, Some(threshold))?;
        out.sync_all()?;
        if copied == 0 {
            std::fs::remove_file(&path)?;
            break;
        }
        info!(part = %name, size = copied, "Split part written");
        items.push(TarFileItem::standalone(name, copied));
        copied_total += copied;
        n += 1;
    }

    if copied_total != total {
        return Err(BackupError::Archive(format!(
            "split {} wrote {} of {} bytes",
            tar_path.display(),
            copied_total,
            total
        )));
    }
    Ok(items)
}

pub fn splitting_package(
    capture_dir: &Path,
    out_dir: &Path,
    target: &str,
    threshold: u64,
    limiter: &RateLimiter,
) -> Result<Vec<TarFileItem>> {
    if threshold == 0 {
        return Err(BackupError::validation("archive part threshold must be positive"));
    }
    let name = tar_name(target);
    let tar_path = out_dir.join(&name);
    let size = archive_whole(capture_dir, &tar_path, target, limiter)?;
    info!(tar = %name, size, "Capture archived");

    if size <= threshold {
        return Ok(vec![TarFileItem::standalone(name, size)]);
    }

    let parts = split_file(&tar_path, out_dir, target, threshold, limiter)?;
    remove_file_throttled(&tar_path, limiter)?;
    Ok(parts)
}

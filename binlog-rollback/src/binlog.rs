//! Binlog discovery and snapshotting.

use crate::error::{Result, RollbackError};
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BINLOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];

#[derive(Debug, Clone, PartialEq)]
pub struct BinlogFile {
    pub path: PathBuf,
    pub name: String,
    /// Timestamp of the first event
    pub start: DateTime<Local>,
}

/// Timestamp of the first event, read from the header after the magic.
pub fn read_start_time(path: &Path) -> Result<DateTime<Local>> {
    let mut head = [0u8; 8];
    File::open(path)?.read_exact(&mut head).map_err(|e| {
        RollbackError::precheck(format!("{}: cannot read binlog header: {}", path.display(), e))
    })?;
    if head[..4] != BINLOG_MAGIC {
        return Err(RollbackError::precheck(format!("{} is not a binlog file", path.display())));
    }
    let ts = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    Local
        .timestamp_opt(ts as i64, 0)
        .single()
        .ok_or_else(|| RollbackError::precheck(format!("{}: bad event timestamp {}", path.display(), ts)))
}

fn open(path: PathBuf) -> Result<BinlogFile> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let start = read_start_time(&path)?;
    Ok(BinlogFile { path, name, start })
}

/// `<basename>.<N>` files in `dir`, ordered by sequence number.
pub fn list_binlogs(dir: &Path, basename: &str) -> Result<Vec<BinlogFile>> {
    let pattern = Regex::new(&format!(r"^{}\.(\d+)$", regex::escape(basename)))
        .map_err(|e| RollbackError::validation(format!("binlog basename {:?}: {}", basename, e)))?;
    let mut numbered = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(seq) = pattern.captures(&name).and_then(|c| c[1].parse::<u64>().ok()) else {
            continue;
        };
        numbered.push((seq, entry.path()));
    }
    numbered.sort();
    numbered.into_iter().map(|(_, path)| open(path)).collect()
}

/// Explicitly named binlogs, each of which must exist in `dir`.
pub fn explicit_binlogs(dir: &Path, names: &[String]) -> Result<Vec<BinlogFile>> {
    let mut files = names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            if !path.is_file() {
                return Err(RollbackError::precheck(format!("binlog {} does not exist", path.display())));
            }
            open(path)
        })
        .collect::<Result<Vec<_>>>()?;
    files.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// Files whose span overlaps `[start, stop]`. A file spans from its own
/// first event to the first event of the next file; the newest is open ended.
pub fn select_window(files: &[BinlogFile], start: DateTime<Local>, stop: DateTime<Local>) -> Result<Vec<BinlogFile>> {
    let none = || RollbackError::NoCandidateBinlogs { start, stop };
    let oldest = files.first().ok_or_else(none)?;
    if start < oldest.start {
        return Err(none());
    }
    let selected: Vec<BinlogFile> = files
        .iter()
        .enumerate()
        .filter(|(i, f)| {
            let end = files.get(i + 1).map(|next| next.start);
            f.start <= stop && end.map_or(true, |e| e > start)
        })
        .map(|(_, f)| f.clone())
        .collect();
    if selected.is_empty() {
        return Err(none());
    }
    Ok(selected)
}

/// Link (or copy, across filesystems) `files` into `dest` so the decoder
/// reads a stable set even if the server purges or rotates meanwhile.
pub fn snapshot(files: &[BinlogFile], dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        let target = dest.join(&file.name);
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        if let Err(e) = std::fs::hard_link(&file.path, &target) {
            debug!(binlog = %file.name, "hard link failed ({}), copying", e);
            std::fs::copy(&file.path, &target)?;
        }
        out.push(target);
    }
    info!(count = out.len(), dir = %dest.display(), "Binlogs snapshotted");
    Ok(out)
}

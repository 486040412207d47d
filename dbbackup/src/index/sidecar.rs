//! Sidecar files written by the physical capture tools.
//!
//! Each sidecar may be absent (engine-specific, or the capture stopped early)
//! and may be stored zstd-compressed, in which case it's decompressed into a
//! temporary file before parsing.

use super::StatusInfo;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const TIMESTAMP_INFO: &str = "xtrabackup_timestamp_info";
pub const BINLOG_INFO: &str = "xtrabackup_binlog_info";
pub const SLAVE_INFO: &str = "xtrabackup_slave_info";

lazy_static! {
    static ref LOG_FILE_RE: Regex = Regex::new(r"(?i)MASTER_LOG_FILE\s*=\s*'([^']+)'").unwrap();
    static ref LOG_POS_RE: Regex = Regex::new(r"(?i)MASTER_LOG_POS\s*=\s*(\d+)").unwrap();
    static ref GTID_PURGED_RE: Regex = Regex::new(r"(?i)gtid_purged\s*=\s*'([^']*)'").unwrap();
}

/// Outcome of looking for a sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sidecar {
    Found(String),
    Missing,
}

impl Sidecar {
    pub fn text(&self) -> Option<&str> {
        match self {
            Sidecar::Found(text) => Some(text),
            Sidecar::Missing => None,
        }
    }
}

/// Read `<dir>/<name>`, or `<dir>/<name>.zst` decompressed.
pub fn read_sidecar(dir: &Path, name: &str) -> Result<Sidecar> {
    let plain = dir.join(name);
    if plain.is_file() {
        return Ok(Sidecar::Found(std::fs::read_to_string(&plain)?));
    }

    let compressed = dir.join(format!("{}.zst", name));
    if !compressed.is_file() {
        return Ok(Sidecar::Missing);
    }

    let source = std::fs::File::open(&compressed)?;
    let mut decoder = zstd::stream::read::Decoder::new(source)?;
    let mut tmp = tempfile::tempfile()?;
    std::io::copy(&mut decoder, &mut tmp).map_err(|e| {
        BackupError::Metadata(format!("decompress {}: {}", compressed.display(), e))
    })?;
    tmp.seek(SeekFrom::Start(0))?;
    let mut text = String::new();
    tmp.read_to_string(&mut text)?;
    Ok(Sidecar::Found(text))
}

/// Times recorded by the capture tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampInfo {
    pub begin: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
    pub consistent: Option<DateTime<Local>>,
}

/// `key = YYYY-mm-dd HH:MM:SS` lines; unknown keys are ignored.
pub fn parse_timestamp_info(text: &str) -> TimestampInfo {
    let mut info = TimestampInfo::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let Some(ts) = parse_local(value.trim()) else {
            continue;
        };
        if key.contains("consistent") {
            info.consistent = Some(ts);
        } else if key.contains("begin") || key.contains("start") {
            info.begin = Some(ts);
        } else if key.contains("end") || key.contains("finish") {
            info.end = Some(ts);
        }
    }
    info
}

/// `<file>\t<pos>[\t<gtid>]`. A multi-source GTID set continues over the
/// following lines and is joined back into one value.
pub fn parse_binlog_info(text: &str) -> Option<StatusInfo> {
    let mut fields = text.trim_start().splitn(3, '\t');
    let binlog_file = fields.next()?.trim();
    if binlog_file.is_empty() || binlog_file.contains('\n') {
        return None;
    }
    let binlog_pos = fields.next()?.trim().parse().ok()?;
    let gtid: String = fields.next().unwrap_or_default().split_whitespace().collect();
    Some(StatusInfo {
        binlog_file: binlog_file.to_string(),
        binlog_pos,
        gtid,
        ..Default::default()
    })
}

/// `CHANGE MASTER TO MASTER_LOG_FILE='..', MASTER_LOG_POS=..` with an
/// optional `SET GLOBAL gtid_purged='..'` line.
pub fn parse_slave_info(text: &str) -> Option<StatusInfo> {
    let gtid = GTID_PURGED_RE
        .captures(text)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let file = LOG_FILE_RE.captures(text).map(|c| c[1].to_string());
    let pos = LOG_POS_RE.captures(text).and_then(|c| c[1].parse().ok());
    match (file, pos) {
        (Some(binlog_file), Some(binlog_pos)) => Some(StatusInfo {
            binlog_file,
            binlog_pos,
            gtid,
            ..Default::default()
        }),
        _ if !gtid.is_empty() => Some(StatusInfo {
            gtid,
            ..Default::default()
        }),
        _ => None,
    }
}

fn parse_local(raw: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

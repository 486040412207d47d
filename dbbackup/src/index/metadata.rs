//! Parser for the logical dumper's `metadata` file.
//!
//! Two layouts are in the field. Newer dumpers write INI-like sections:
//!
//! ```text
//! # Started dump at: 2024-03-01 02:00:00
//! [master]
//! File = binlog20000.000042
//! Position = 1234
//! Executed_Gtid_Set = ''
//!
//! [`db1`.`t1`]
//! real_table_name=t1
//! rows = 10
//! # Finished dump at: 2024-03-01 02:05:00
//! ```
//!
//! Older ones write `SHOW MASTER STATUS:` blocks with `Key: value` lines.
//! Both are handled by the same line scanner: a header line switches the
//! current section and later key/value lines are recorded under it.

use super::StatusInfo;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::collections::BTreeMap;
use std::path::Path;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpMetadata {
    pub begin_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub master: Option<StatusInfo>,
    pub slave: Option<StatusInfo>,
    /// Per-table sections, keyed by the raw section name
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Section {
    None,
    Master,
    Slave,
    Table(String),
}

pub fn parse_metadata_file(path: &Path) -> Result<DumpMetadata> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BackupError::Metadata(format!("read {}: {}", path.display(), e)))?;
    parse_metadata(&text)
}

pub fn parse_metadata(text: &str) -> Result<DumpMetadata> {
    let mut meta = DumpMetadata::default();
    let mut section = Section::None;
    let mut master: BTreeMap<String, String> = BTreeMap::new();
    let mut slave: BTreeMap<String, String> = BTreeMap::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let marker = line.trim_start_matches('#').trim();
        if let Some(ts) = marker.strip_prefix("Started dump at:") {
            meta.begin_time = Some(parse_time(ts)?);
            continue;
        }
        if let Some(ts) = marker.strip_prefix("Finished dump at:") {
            meta.end_time = Some(parse_time(ts)?);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        if let Some(next) = section_header(line) {
            section = next;
            if let Section::Table(name) = &section {
                meta.tables.entry(name.clone()).or_default();
            }
            continue;
        }

        let Some((key, value)) = split_key_value(line) else {
            continue;
        };
        match &section {
            Section::Master => {
                master.insert(key, value);
            }
            Section::Slave => {
                slave.insert(key, value);
            }
            Section::Table(name) => {
                meta.tables.entry(name.clone()).or_default().insert(key, value);
            }
            Section::None => {}
        }
    }

    if !master.is_empty() {
        meta.master = Some(status_from_map(&master)?);
    }
    if !slave.is_empty() {
        meta.slave = Some(status_from_map(&slave)?);
    }
    Ok(meta)
}

fn section_header(line: &str) -> Option<Section> {
    let upper = line.to_ascii_uppercase();
    if upper.starts_with("SHOW MASTER STATUS") {
        return Some(Section::Master);
    }
    if upper.starts_with("SHOW SLAVE STATUS") {
        return Some(Section::Slave);
    }
    let inner = line.strip_prefix('[')?.strip_suffix(']')?.trim();
    Some(match inner.to_ascii_lowercase().as_str() {
        "master" | "source" => Section::Master,
        "replication" | "slave" => Section::Slave,
        _ => Section::Table(inner.to_string()),
    })
}

/// `key = value` or `key: value`, with quotes and trailing comments removed.
fn split_key_value(line: &str) -> Option<(String, String)> {
    let eq = line.find('=');
    let colon = line.find(':');
    let pos = match (eq, colon) {
        (Some(e), Some(c)) => e.min(c),
        (Some(e), None) => e,
        (None, Some(c)) => c,
        (None, None) => return None,
    };
    let key = line[..pos].trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    Some((key, clean_value(&line[pos + 1..])))
}

fn clean_value(raw: &str) -> String {
    let mut out = String::new();
    let mut quote: Option<char> = None;
    for ch in raw.trim().chars() {
        match (quote, ch) {
            (None, '#') => break,
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (_, c) => out.push(c),
        }
    }
    out.trim().to_string()
}

fn status_from_map(map: &BTreeMap<String, String>) -> Result<StatusInfo> {
    let pick = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| map.get(*k).filter(|v| !v.is_empty()).cloned())
            .unwrap_or_default()
    };

    let pos_raw = pick(&[
        "position",
        "pos",
        "source_log_pos",
        "master_log_pos",
        "exec_master_log_pos",
    ]);
    let binlog_pos = if pos_raw.is_empty() {
        0
    } else {
        pos_raw
            .parse()
            .map_err(|_| BackupError::Metadata(format!("bad binlog position {:?}", pos_raw)))?
    };
    let port_raw = pick(&["source_port", "master_port", "port"]);

    Ok(StatusInfo {
        binlog_file: pick(&[
            "file",
            "log",
            "source_log_file",
            "master_log_file",
            "relay_master_log_file",
        ]),
        binlog_pos,
        gtid: pick(&["executed_gtid_set", "gtid"]),
        master_host: pick(&["source_host", "master_host", "host"]),
        master_port: port_raw.parse().unwrap_or(0),
    })
}

fn parse_time(raw: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .map_err(|e| BackupError::Metadata(format!("bad dump time {:?}: {}", raw.trim(), e)))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| BackupError::Metadata(format!("nonexistent local time {:?}", raw.trim())))
}

//! Convert old `KEY=VALUE` `.info` backup descriptions into `.index` manifests.

use crate::config::{BackupType, EncryptTool, MysqlRole, Scope, StorageEngine};
use crate::index::{
    BinlogStatusInfo, FileType, IndexContent, StatusInfo, TarFileItem, UNKNOWN_SIZE,
};
use crate::packager::encrypt::suffix_for;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const LEGACY_SUFFIX: &str = "info";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse `KEY=VALUE` lines. Keys are upper-cased; blank lines and `#`
/// comments are skipped.
pub fn parse_legacy_info(text: &str) -> Result<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            BackupError::Metadata(format!("line {}: expected KEY=VALUE, got {:?}", n + 1, line))
        })?;
        fields.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
    }
    Ok(fields)
}

struct Fields(BTreeMap<String, String>);

impl Fields {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| BackupError::Metadata(format!("{} is missing", key)))
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| BackupError::Metadata(format!("{} is not a number: {:?}", key, v)))
            })
            .transpose()
    }

    fn time(&self, key: &str) -> Result<DateTime<Local>> {
        let raw = self.required(key)?;
        let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
            .map_err(|e| BackupError::Metadata(format!("{} {:?}: {}", key, raw, e)))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| BackupError::Metadata(format!("{} {:?} does not exist locally", key, raw)))
    }
}

fn legacy_backup_type(raw: &str) -> Result<BackupType> {
    match raw.to_ascii_lowercase().as_str() {
        "logical" | "gztab" | "mydumper" => Ok(BackupType::Logical),
        "physical" | "xtra" | "xtrabackup" => Ok(BackupType::Physical),
        other => Err(BackupError::Metadata(format!("unknown BACKUP_TYPE {:?}", other))),
    }
}

fn legacy_role(raw: &str) -> Result<MysqlRole> {
    match raw.to_ascii_lowercase().as_str() {
        "master" => Ok(MysqlRole::Master),
        "slave" => Ok(MysqlRole::Slave),
        "repeater" => Ok(MysqlRole::Repeater),
        "orphan" => Ok(MysqlRole::Orphan),
        other => Err(BackupError::Metadata(format!("unknown ROLE {:?}", other))),
    }
}

/// `FILE_LIST` holds comma separated `name;size;type` entries.
pub fn parse_file_list(raw: &str) -> Result<Vec<TarFileItem>> {
    let mut items = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(';').map(str::trim).collect();
        let (name, size, kind) = match parts.as_slice() {
            [name, size] => (*name, *size, ""),
            [name, size, kind] => (*name, *size, *kind),
            _ => {
                return Err(BackupError::Metadata(format!(
                    "FILE_LIST entry {:?} is not name;size;type",
                    entry
                )))
            }
        };
        let size: u64 = size
            .parse()
            .map_err(|_| BackupError::Metadata(format!("bad size in FILE_LIST entry {:?}", entry)))?;

        let mut item = TarFileItem::standalone(name, size);
        match kind.to_ascii_lowercase().as_str() {
            "index" | "info" => continue,
            "tar" => item.file_type = FileType::Tar,
            "part" => item.file_type = FileType::Part,
            "priv" => item.file_type = FileType::Priv,
            _ => {}
        }
        items.push(item);
    }
    Ok(items)
}

/// Build a manifest from the fields of `<target>.info`.
pub fn convert(text: &str, target_name: &str) -> Result<IndexContent> {
    let f = Fields(parse_legacy_info(text)?);

    let host = f.required("HOST")?.to_string();
    let port: u16 = f
        .number("PORT")?
        .ok_or_else(|| BackupError::Metadata("PORT is missing".to_string()))?;
    let role = f.get("ROLE").map(legacy_role).transpose()?.unwrap_or(MysqlRole::Master);
    let scope = Scope::parse(f.get("DATA_SCHEMA_GRANT").unwrap_or("all"))?;
    let begin = f.time("START_TIME")?;
    let end = f.time("END_TIME")?;

    let coordinate = StatusInfo {
        binlog_file: f.get("BINLOG_FILE").unwrap_or_default().to_string(),
        binlog_pos: f.number("BINLOG_POS")?.unwrap_or(0),
        gtid: String::new(),
        master_host: f.get("MASTER_HOST").unwrap_or(&host).to_string(),
        master_port: f.number("MASTER_PORT")?.unwrap_or(port),
    };
    let upstream = coordinate.master_host != host || coordinate.master_port != port;
    let binlog_info = match (coordinate.is_empty(), upstream) {
        (true, _) => BinlogStatusInfo::default(),
        (false, true) => BinlogStatusInfo {
            show_master_status: None,
            show_slave_status: Some(coordinate),
        },
        (false, false) => BinlogStatusInfo {
            show_master_status: Some(coordinate),
            show_slave_status: None,
        },
    };

    let files = parse_file_list(f.required("FILE_LIST")?)?;
    let encrypted = [EncryptTool::Openssl, EncryptTool::Xbcrypt]
        .iter()
        .any(|t| files.iter().any(|i| i.file_name.ends_with(suffix_for(*t))));

    let mut index = IndexContent {
        backup_id: f.required("BACKUP_ID")?.to_string(),
        bill_id: f.get("BILL_ID").unwrap_or_default().to_string(),
        bk_biz_id: f.number("BK_BIZ_ID")?.unwrap_or(0),
        bk_cloud_id: f.number("BK_CLOUD_ID")?.unwrap_or(0),
        cluster_id: f.number("CLUSTER_ID")?.unwrap_or(0),
        cluster_address: f.get("CLUSTER_ADDRESS").unwrap_or_default().to_string(),
        shard_value: f.number("SHARD_VALUE")?.unwrap_or(0),
        backup_host: host,
        backup_port: port,
        mysql_role: role,
        mysql_version: f.get("MYSQL_VERSION").unwrap_or_default().to_string(),
        backup_type: legacy_backup_type(f.get("BACKUP_TYPE").unwrap_or("logical"))?,
        storage_engine: StorageEngine::default(),
        data_schema_grant: scope.to_string(),
        backup_charset: f.get("CHARSET").unwrap_or("binary").to_string(),
        is_full_backup: scope.is_all(),
        backup_begin_time: begin,
        backup_end_time: end,
        // the old format never recorded a consistency point
        backup_consistent_time: begin,
        consistent_time_is_fallback: true,
        binlog_info,
        target_name: target_name.to_string(),
        encrypt_enable: encrypted,
        file_list: Vec::new(),
        total_filesize: 0,
        total_size_kb_uncompress: UNKNOWN_SIZE,
    };
    for item in files {
        index.add_file(item);
    }
    if index.archive_parts().is_empty() {
        return Err(BackupError::Metadata("FILE_LIST names no archive".to_string()));
    }
    Ok(index)
}

/// Convert `<target>.info` and write `<target>.index` into `output_dir`.
pub fn migrate(info_path: &Path, output_dir: &Path) -> Result<PathBuf> {
    let target = info_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BackupError::validation(format!("{} has no file name", info_path.display())))?;
    let text = std::fs::read_to_string(info_path)?;
    let index = convert(&text, &target)?;
    std::fs::create_dir_all(output_dir)?;
    let path = index.save(output_dir)?;
    info!(
        backup_id = %index.backup_id,
        from = %info_path.display(),
        to = %path.display(),
        "Legacy backup description migrated"
    );
    Ok(path)
}

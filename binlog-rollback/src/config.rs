//! Flashback job configuration, from an INI or JSON file.

use crate::error::{Result, RollbackError};
use crate::filter::FilterRule;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use dbbackup::config::split_list;
use dbbackup::utils::mysqlconn::MysqlConnParam;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashbackConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,

    /// `YYYY-MM-DD HH:MM:SS`, local time
    pub start_time: String,
    /// Defaults to now
    #[serde(default)]
    pub stop_time: String,

    /// Comma separated
    #[serde(default)]
    pub databases: String,
    /// Comma separated, `db.table` or bare table names
    #[serde(default)]
    pub tables: String,

    /// Decoder row filter; `@column` references are resolved to ordinals
    #[serde(default)]
    pub rows_filter: String,
    /// CSV file whose header names columns and whose rows are matched as OR-ed tuples
    #[serde(default)]
    pub rows_filter_file: Option<PathBuf>,
    #[serde(default)]
    pub filter_rules: Vec<FilterRule>,

    /// Defaults to the directory of `@@log_bin_basename`
    #[serde(default)]
    pub binlog_dir: Option<PathBuf>,
    /// Explicit comma separated binlog names inside `binlog_dir`; skips the time scan
    #[serde(default)]
    pub binlog_files: String,

    pub work_dir: PathBuf,
    /// Write the replayed statements to the binlog
    #[serde(default)]
    pub recover_binlog: bool,
    /// Decode only, leave `flashback.sql` for review
    #[serde(default)]
    pub parse_only: bool,

    #[serde(default)]
    pub decoder_path: Option<PathBuf>,
    #[serde(default)]
    pub mysql_client_path: Option<PathBuf>,
    #[serde(default)]
    pub tool_dir: Option<PathBuf>,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

pub fn parse_time(raw: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .map_err(|e| RollbackError::validation(format!("time {:?} is not {}: {}", raw, TIME_FORMAT, e)))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| RollbackError::validation(format!("time {:?} does not exist locally", raw)))
}

impl FlashbackConfig {
    /// Load from `path` (JSON by extension, INI otherwise), overlay
    /// `FLASHBACK_*` environment variables and `overrides`, then validate.
    pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => config::FileFormat::Json,
            _ => config::FileFormat::Ini,
        };
        let mut builder = config::Config::builder()
            .add_source(config::File::from(path).format(format))
            .add_source(config::Environment::with_prefix("FLASHBACK").prefix_separator("_"));
        for (key, value) in overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }
        let cfg: FlashbackConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(RollbackError::validation("host and port must be set"));
        }
        if self.user.trim().is_empty() {
            return Err(RollbackError::validation("user must be set"));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(RollbackError::validation("work_dir must be set"));
        }
        let (start, stop) = self.window(Local::now())?;
        if start >= stop {
            return Err(RollbackError::validation(format!(
                "start_time {} is not before stop_time {}",
                start.format(TIME_FORMAT),
                stop.format(TIME_FORMAT)
            )));
        }
        let sources = [
            !self.rows_filter.trim().is_empty(),
            self.rows_filter_file.is_some(),
            !self.filter_rules.is_empty(),
        ];
        if sources.iter().filter(|s| **s).count() > 1 {
            return Err(RollbackError::validation(
                "use only one of rows_filter, rows_filter_file and filter_rules",
            ));
        }
        if !self.binlog_files.trim().is_empty() && self.binlog_dir.is_none() {
            return Err(RollbackError::validation("binlog_files needs binlog_dir"));
        }
        Ok(())
    }

    /// `[start, stop]`, with an empty stop meaning `now`.
    pub fn window(&self, now: DateTime<Local>) -> Result<(DateTime<Local>, DateTime<Local>)> {
        let start = parse_time(&self.start_time)?;
        let stop = if self.stop_time.trim().is_empty() {
            now
        } else {
            parse_time(&self.stop_time)?
        };
        Ok((start, stop))
    }

    pub fn database_list(&self) -> Vec<String> {
        split_list(&self.databases)
    }

    pub fn table_list(&self) -> Vec<String> {
        split_list(&self.tables)
    }

    pub fn binlog_file_list(&self) -> Vec<String> {
        split_list(&self.binlog_files)
    }

    pub fn conn_param(&self) -> MysqlConnParam {
        MysqlConnParam::new(&self.host, self.port, &self.user, &self.password)
    }

    pub fn binlog_work_dir(&self) -> PathBuf {
        self.work_dir.join("binlog")
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join("flashback.sql")
    }
}

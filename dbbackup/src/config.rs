//! Configuration for one backup or restore invocation.
//!
//! Loaded from an INI file (one per instance/port), overlaid with
//! `DBBACKUP_*` environment variables and CLI overrides, validated once and
//! then treated as immutable.

use crate::utils::deadline::parse_time_of_day;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Smallest allowed archive part, in MB.
pub const MIN_TAR_SIZE_THRESHOLD_MB: u64 = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub public: PublicConfig,
    #[serde(default)]
    pub backup_client: BackupClientConfig,
    #[serde(default)]
    pub logical_backup: LogicalBackupConfig,
    #[serde(default)]
    pub physical_backup: PhysicalBackupConfig,
    #[serde(default)]
    pub logical_load: LogicalLoadConfig,
    #[serde(default)]
    pub physical_load: PhysicalLoadConfig,
    #[serde(default)]
    pub encrypt_opt: EncryptOptConfig,
    #[serde(default)]
    pub spider: SpiderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Logical,
    Physical,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Logical => write!(f, "logical"),
            BackupType::Physical => write!(f, "physical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MysqlRole {
    Master,
    Slave,
    Repeater,
    Orphan,
}

impl MysqlRole {
    /// Roles whose backups should also record upstream replication coordinates.
    pub fn is_replica(&self) -> bool {
        matches!(self, MysqlRole::Slave | MysqlRole::Repeater)
    }
}

impl fmt::Display for MysqlRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MysqlRole::Master => "master",
            MysqlRole::Slave => "slave",
            MysqlRole::Repeater => "repeater",
            MysqlRole::Orphan => "orphan",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[default]
    Innodb,
    Rocksdb,
}

/// Which parts of an instance a backup captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scope {
    pub data: bool,
    pub schema: bool,
    pub grant: bool,
}

impl Scope {
    pub const ALL: Scope = Scope {
        data: true,
        schema: true,
        grant: true,
    };

    /// Parse a comma separated set such as `data,schema` or `all`.
    pub fn parse(value: &str) -> Result<Scope> {
        let mut scope = Scope::default();
        for token in value.split(',').map(|t| t.trim().to_lowercase()) {
            match token.as_str() {
                "" => {}
                "all" => scope = Scope::ALL,
                "data" => scope.data = true,
                "schema" => scope.schema = true,
                "grant" => scope.grant = true,
                other => {
                    return Err(BackupError::validation(format!(
                        "unknown data_schema_grant item {:?}",
                        other
                    )))
                }
            }
        }
        if scope.is_empty() {
            return Err(BackupError::validation(
                "data_schema_grant must name at least one of data, schema, grant",
            ));
        }
        Ok(scope)
    }

    pub fn is_empty(&self) -> bool {
        !(self.data || self.schema || self.grant)
    }

    pub fn is_all(&self) -> bool {
        *self == Scope::ALL
    }

    pub fn schema_only(&self) -> bool {
        self.schema && !self.data
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "all");
        }
        let mut parts = Vec::new();
        if self.data {
            parts.push("data");
        }
        if self.schema {
            parts.push("schema");
        }
        if self.grant {
            parts.push("grant");
        }
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicConfig {
    #[serde(default)]
    pub backup_id: String,
    #[serde(default)]
    pub bill_id: String,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cloud_id: i64,
    #[serde(default)]
    pub cluster_id: i64,
    #[serde(default)]
    pub cluster_address: String,
    #[serde(default)]
    pub shard_value: i32,

    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_user: String,
    #[serde(default)]
    pub mysql_passwd: String,
    #[serde(default = "default_charset")]
    pub mysql_charset: String,
    pub mysql_role: MysqlRole,

    /// Destination directory for capture output, archive parts and the manifest
    pub backup_dir: PathBuf,
    /// `HH:MM:SS` the backup must finish by; empty disables the deadline
    #[serde(default)]
    pub backup_timeout: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub storage_engine: StorageEngine,
    #[serde(default = "default_data_schema_grant")]
    pub data_schema_grant: String,
    /// MB/s for archive I/O, 0 = unlimited
    #[serde(default = "default_io_limit")]
    pub io_limit_mb_per_sec: u64,
    /// Archive part size in MB
    #[serde(default = "default_tar_size_threshold")]
    pub tar_size_threshold: u64,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Directory holding the capture/replay binaries; `$PATH` otherwise
    #[serde(default)]
    pub tool_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupClientConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UseMysqldump {
    #[default]
    Auto,
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalBackupConfig {
    #[serde(default = "default_logical_threads")]
    pub threads: usize,
    /// mydumper chunk size in MB
    #[serde(default = "default_chunk_filesize")]
    pub chunk_filesize: u64,
    /// Raw mydumper `--regex` filter
    #[serde(default)]
    pub regex: String,
    /// Comma separated database list
    #[serde(default)]
    pub databases: String,
    /// Comma separated `db.table` list
    #[serde(default)]
    pub tables: String,
    #[serde(default)]
    pub exclude_databases: String,
    #[serde(default)]
    pub disable_compress: bool,
    #[serde(default = "default_flush_retry_count")]
    pub flush_retry_count: u32,
    #[serde(default)]
    pub trx_consistency_only: bool,
    #[serde(default)]
    pub use_mysqldump: UseMysqldump,
    #[serde(default)]
    pub extra_opt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalBackupConfig {
    #[serde(default = "default_physical_threads")]
    pub threads: usize,
    #[serde(default = "default_throttle")]
    pub throttle: u32,
    /// The instance's my.cnf
    #[serde(default)]
    pub default_file: PathBuf,
    #[serde(default)]
    pub extra_opt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalLoadConfig {
    #[serde(default)]
    pub index_file_path: PathBuf,
    #[serde(default = "default_logical_threads")]
    pub threads: usize,
    #[serde(default)]
    pub databases: String,
    #[serde(default)]
    pub tables: String,
    /// Drop the target databases before loading
    #[serde(default)]
    pub drop_databases: bool,
    #[serde(default)]
    pub enable_binlog: bool,
    /// Statement run by every loader session, e.g. `set foreign_key_checks=0`
    #[serde(default)]
    pub init_command: String,
    #[serde(default)]
    pub extra_opt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalLoadConfig {
    #[serde(default)]
    pub index_file_path: PathBuf,
    #[serde(default = "default_physical_threads")]
    pub threads: usize,
    /// Target data directory
    #[serde(default)]
    pub mysql_load_dir: PathBuf,
    #[serde(default)]
    pub default_file: PathBuf,
    /// Copy instead of move when placing files into the data directory
    #[serde(default = "default_true")]
    pub copy_back: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptTool {
    #[default]
    Openssl,
    Xbcrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptOptConfig {
    #[serde(default)]
    pub encrypt_enable: bool,
    #[serde(default)]
    pub encrypt_tool: EncryptTool,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// Running rows older than this are declared failed
    #[serde(default = "default_running_ceiling_hours")]
    pub running_ceiling_hours: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Comma separated ports of the other instances on this node that take part in cluster backups
    #[serde(default)]
    pub local_ports: String,
}

// Default values
fn default_charset() -> String {
    "binary".to_string()
}

fn default_data_schema_grant() -> String {
    "all".to_string()
}

fn default_io_limit() -> u64 {
    300
}

fn default_tar_size_threshold() -> u64 {
    8192
}

fn default_upload_concurrency() -> usize {
    2
}

fn default_logical_threads() -> usize {
    4
}

fn default_physical_threads() -> usize {
    2
}

fn default_chunk_filesize() -> u64 {
    2048
}

fn default_flush_retry_count() -> u32 {
    3
}

fn default_throttle() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

fn default_running_ceiling_hours() -> i64 {
    48
}

fn default_retention_days() -> i64 {
    7
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_reconnects() -> u32 {
    5
}

impl Default for BackupClientConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url: String::new(),
            token: String::new(),
            concurrency: default_upload_concurrency(),
        }
    }
}

impl Default for LogicalBackupConfig {
    fn default() -> Self {
        Self {
            threads: default_logical_threads(),
            chunk_filesize: default_chunk_filesize(),
            regex: String::new(),
            databases: String::new(),
            tables: String::new(),
            exclude_databases: String::new(),
            disable_compress: false,
            flush_retry_count: default_flush_retry_count(),
            trx_consistency_only: false,
            use_mysqldump: UseMysqldump::Auto,
            extra_opt: String::new(),
        }
    }
}

impl Default for PhysicalBackupConfig {
    fn default() -> Self {
        Self {
            threads: default_physical_threads(),
            throttle: default_throttle(),
            default_file: PathBuf::new(),
            extra_opt: String::new(),
        }
    }
}

impl Default for LogicalLoadConfig {
    fn default() -> Self {
        Self {
            index_file_path: PathBuf::new(),
            threads: default_logical_threads(),
            databases: String::new(),
            tables: String::new(),
            drop_databases: false,
            enable_binlog: false,
            init_command: String::new(),
            extra_opt: String::new(),
        }
    }
}

impl Default for PhysicalLoadConfig {
    fn default() -> Self {
        Self {
            index_file_path: PathBuf::new(),
            threads: default_physical_threads(),
            mysql_load_dir: PathBuf::new(),
            default_file: PathBuf::new(),
            copy_back: true,
        }
    }
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            running_ceiling_hours: default_running_ceiling_hours(),
            retention_days: default_retention_days(),
            poll_interval_secs: default_poll_interval_secs(),
            max_reconnects: default_max_reconnects(),
            local_ports: String::new(),
        }
    }
}

/// Split a comma separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Parse `section.key=value` CLI overrides.
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| BackupError::validation(format!("override {:?} is not key=value", raw)))?;
    let key = key.trim();
    if key.is_empty() || !key.contains('.') {
        return Err(BackupError::validation(format!(
            "override key {:?} must look like section.key",
            key
        )));
    }
    Ok((key.to_lowercase(), value.trim().to_string()))
}

impl BackupConfig {
    /// Load an INI file, overlay environment and CLI overrides, then validate.
    pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .add_source(
                config::Environment::with_prefix("DBBACKUP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        for (key, value) in overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }
        let mut cfg: BackupConfig = builder.build()?.try_deserialize()?;
        if cfg.public.backup_id.trim().is_empty() {
            cfg.public.backup_id = uuid::Uuid::new_v4().to_string();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fail fast on anything that would otherwise surface mid-backup.
    pub fn validate(&self) -> Result<()> {
        let p = &self.public;
        self.scope()?;

        p.mysql_host.parse::<IpAddr>().map_err(|_| {
            BackupError::validation(format!("mysql_host {:?} is not a valid IP", p.mysql_host))
        })?;
        if p.mysql_port == 0 {
            return Err(BackupError::validation("mysql_port must be set"));
        }
        if p.mysql_user.trim().is_empty() {
            return Err(BackupError::validation("mysql_user must be set"));
        }
        if p.tar_size_threshold < MIN_TAR_SIZE_THRESHOLD_MB {
            return Err(BackupError::validation(format!(
                "tar_size_threshold must be at least {} MB, got {}",
                MIN_TAR_SIZE_THRESHOLD_MB, p.tar_size_threshold
            )));
        }
        if p.backup_dir.as_os_str().is_empty() {
            return Err(BackupError::validation("backup_dir must be set"));
        }
        if !p.backup_timeout.trim().is_empty() {
            parse_time_of_day(&p.backup_timeout)?;
        }
        if self.logical_backup.threads == 0 || self.physical_backup.threads == 0 {
            return Err(BackupError::validation("threads must be at least 1"));
        }
        if self.encrypt_opt.encrypt_enable && self.encrypt_opt.passphrase.is_empty() {
            return Err(BackupError::validation(
                "encrypt_enable requires a non-empty passphrase",
            ));
        }
        if self.backup_client.enable && self.backup_client.url.trim().is_empty() {
            return Err(BackupError::validation("backup_client.enable requires url"));
        }
        Ok(())
    }

    pub fn scope(&self) -> Result<Scope> {
        Scope::parse(&self.public.data_schema_grant)
    }

    /// True when a logical backup is restricted to some databases or tables.
    pub fn has_object_filter(&self) -> bool {
        let l = &self.logical_backup;
        self.public.backup_type == BackupType::Logical
            && (!l.regex.trim().is_empty()
                || !l.databases.trim().is_empty()
                || !l.tables.trim().is_empty())
    }

    pub fn tar_size_threshold_bytes(&self) -> u64 {
        self.public.tar_size_threshold * 1024 * 1024
    }

    pub fn log_dir(&self) -> PathBuf {
        self.public
            .log_dir
            .clone()
            .unwrap_or_else(|| self.public.backup_dir.join("logs"))
    }

    pub fn conn_param(&self) -> crate::utils::mysqlconn::MysqlConnParam {
        crate::utils::mysqlconn::MysqlConnParam::new(
            &self.public.mysql_host,
            self.public.mysql_port,
            &self.public.mysql_user,
            &self.public.mysql_passwd,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) const SAMPLE_INI: &str = r#"
[public]
backup_id = 6f1d2c1e-1111-2222-3333-444455556666
bill_id = 1001
bk_biz_id = 100
cluster_id = 7
cluster_address = demo.db.example
mysql_host = 127.0.0.1
mysql_port = 3306
mysql_user = backup
mysql_passwd = secret
mysql_role = slave
backup_dir = /data/dbbak
backup_timeout = 09:00:00
backup_type = logical
data_schema_grant = data,schema
tar_size_threshold = 1024

[logical_backup]
threads = 8
databases = db1,db2
"#;

    pub(crate) fn sample_config() -> BackupConfig {
        let mut file = NamedTempFile::with_suffix(".ini").unwrap();
        file.write_all(SAMPLE_INI.as_bytes()).unwrap();
        BackupConfig::load(file.path(), &[]).unwrap()
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("all").unwrap(), Scope::ALL);
        assert_eq!(Scope::parse("ALL").unwrap(), Scope::ALL);
        let s = Scope::parse(" data , schema ").unwrap();
        assert!(s.data && s.schema && !s.grant);
        assert!(Scope::parse("grant").unwrap().grant);
        assert!(Scope::parse("").is_err());
        assert!(Scope::parse(",,").is_err());
        assert!(Scope::parse("data,tables").is_err());
    }

    #[test]
    fn test_scope_display_round_trips() {
        for raw in ["all", "data", "schema", "grant", "data,schema", "schema,grant"] {
            let scope = Scope::parse(raw).unwrap();
            assert_eq!(Scope::parse(&scope.to_string()).unwrap(), scope);
            assert!(!scope.is_empty());
        }
    }

    #[test]
    fn test_load_from_ini() {
        let cfg = sample_config();
        assert_eq!(cfg.public.mysql_port, 3306);
        assert_eq!(cfg.public.backup_type, BackupType::Logical);
        assert_eq!(cfg.public.mysql_role, MysqlRole::Slave);
        assert_eq!(cfg.logical_backup.threads, 8);
        assert_eq!(cfg.physical_backup.threads, 2);
        assert_eq!(split_list(&cfg.logical_backup.databases), vec!["db1", "db2"]);
        assert!(cfg.has_object_filter());
        assert_eq!(cfg.tar_size_threshold_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = NamedTempFile::with_suffix(".ini").unwrap();
        file.write_all(SAMPLE_INI.as_bytes()).unwrap();
        let overrides = vec![
            parse_override("public.backup_type=physical").unwrap(),
            parse_override("public.data_schema_grant=all").unwrap(),
        ];
        let cfg = BackupConfig::load(file.path(), &overrides).unwrap();
        assert_eq!(cfg.public.backup_type, BackupType::Physical);
        assert!(cfg.scope().unwrap().is_all());
        assert!(!cfg.has_object_filter());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = sample_config();
        cfg.public.mysql_host = "db-host.local".to_string();
        assert!(matches!(cfg.validate(), Err(BackupError::Validation(_))));

        let mut cfg = sample_config();
        cfg.public.tar_size_threshold = 64;
        assert!(matches!(cfg.validate(), Err(BackupError::Validation(_))));

        let mut cfg = sample_config();
        cfg.public.data_schema_grant = String::new();
        assert!(matches!(cfg.validate(), Err(BackupError::Validation(_))));

        let mut cfg = sample_config();
        cfg.public.backup_timeout = "9am".to_string();
        assert!(matches!(cfg.validate(), Err(BackupError::Validation(_))));

        let mut cfg = sample_config();
        cfg.encrypt_opt.encrypt_enable = true;
        assert!(matches!(cfg.validate(), Err(BackupError::Validation(_))));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("Public.Mysql_Port = 3307").unwrap(),
            ("public.mysql_port".to_string(), "3307".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("nosection=1").is_err());
    }
}

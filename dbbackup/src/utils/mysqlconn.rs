//! MySQL connection helpers shared by dumpers, loaders, the coordinator and flashback.

use crate::utils::errors::{BackupError, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// MySQL error numbers that mean "the table or column we expect is not there".
const ER_NO_SUCH_TABLE: u16 = 1146;
const ER_BAD_FIELD_ERROR: u16 = 1054;
const ER_BAD_DB_ERROR: u16 = 1049;
/// A value outgrew its column; repaired by widening the column.
const ER_DATA_TOO_LONG: u16 = 1406;

/// Timeout for cheap safety probes (`SHOW OPEN TABLES`, variable reads).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Databases that belong to the server or the tooling, never to users.
pub const SYSTEM_DATABASES: &[&str] = &[
    "mysql",
    "sys",
    "information_schema",
    "performance_schema",
    "infodba_schema",
    "db_infobase",
];

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.iter().any(|s| s.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone)]
pub struct MysqlConnParam {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl MysqlConnParam {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            database: None,
        }
    }

    pub fn options(&self) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .charset("utf8mb4");
        if let Some(db) = &self.database {
            opts = opts.database(db);
        }
        opts
    }

    pub async fn connect(&self) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(self.options())
            .await?;
        Ok(pool)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Run a safety probe under [`PROBE_TIMEOUT`].
pub async fn probe<T, F>(what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Process(format!("{} timed out after {:?}", what, PROBE_TIMEOUT))),
    }
}

pub async fn server_version(pool: &MySqlPool) -> Result<String> {
    let version: String = sqlx::query_scalar("SELECT VERSION()").fetch_one(pool).await?;
    Ok(version)
}

/// Read a global variable as text. `None` when the server doesn't know it.
pub async fn global_variable(pool: &MySqlPool, name: &str) -> Result<Option<String>> {
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BackupError::validation(format!("bad variable name {:?}", name)));
    }
    let sql = format!("SELECT CAST(@@global.{} AS CHAR)", name);
    match sqlx::query_scalar::<_, Option<String>>(&sql).fetch_one(pool).await {
        Ok(value) => Ok(value),
        // ER_UNKNOWN_SYSTEM_VARIABLE
        Err(sqlx::Error::Database(e)) if mysql_error_number(e.as_ref()) == Some(1193) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `(major, minor, patch)` from strings like `5.7.20-tmysql-3.1.5-log`.
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let head = version.split(['-', '_']).next().unwrap_or("");
    let mut nums = head.split('.').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    (
        nums.next().unwrap_or(0),
        nums.next().unwrap_or(0),
        nums.next().unwrap_or(0),
    )
}

/// Packs a version for ordering comparisons: 5.7.20 -> 5_007_020.
pub fn version_number(version: &str) -> u32 {
    let (a, b, c) = parse_version(version);
    a * 1_000_000 + b * 1_000 + c
}

fn mysql_error_number(e: &dyn sqlx::error::DatabaseError) -> Option<u16> {
    e.try_downcast_ref::<MySqlDatabaseError>().map(|m| m.number())
}

pub fn is_schema_drift(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            if let Some(n) = mysql_error_number(db.as_ref()) {
                return matches!(
                    n,
                    ER_NO_SUCH_TABLE | ER_BAD_FIELD_ERROR | ER_BAD_DB_ERROR | ER_DATA_TOO_LONG
                );
            }
            let msg = db.message().to_lowercase();
            msg.contains("doesn't exist") || msg.contains("unknown column") || msg.contains("data too long")
        }
        _ => false,
    }
}

/// True for errors where reconnecting may help.
pub fn is_transient(e: &BackupError) -> bool {
    matches!(
        e,
        BackupError::Database(sqlx::Error::Io(_))
            | BackupError::Database(sqlx::Error::PoolTimedOut)
            | BackupError::Database(sqlx::Error::PoolClosed)
            | BackupError::Database(sqlx::Error::WorkerCrashed)
            | BackupError::Io(_)
    )
}

/// `SHOW SLAVE STATUS` reduced to the fields the engine needs. `None` on a non-replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaveStatus {
    pub master_host: String,
    pub master_port: u16,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub executed_gtid_set: String,
}

pub async fn slave_status(pool: &MySqlPool) -> Result<Option<SlaveStatus>> {
    use sqlx::Executor;
    let row = pool.fetch_optional("SHOW SLAVE STATUS").await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let text = |col: &str| -> String {
        row.try_get::<Option<String>, _>(col)
            .ok()
            .flatten()
            .unwrap_or_default()
    };
    let number = |col: &str| -> u64 {
        row.try_get::<Option<u64>, _>(col)
            .ok()
            .flatten()
            .or_else(|| text(col).parse().ok())
            .unwrap_or(0)
    };
    Ok(Some(SlaveStatus {
        master_host: text("Master_Host"),
        master_port: number("Master_Port") as u16,
        relay_master_log_file: text("Relay_Master_Log_File"),
        exec_master_log_pos: number("Exec_Master_Log_Pos"),
        executed_gtid_set: text("Executed_Gtid_Set"),
    }))
}

/// `DATA_TYPE` of `schema.table.column`, `None` if the column is missing.
pub async fn column_type(pool: &MySqlPool, schema: &str, table: &str, column: &str) -> Result<Option<String>> {
    let data_type: Option<String> = sqlx::query_scalar(
        "SELECT DATA_TYPE FROM information_schema.COLUMNS \
         WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND COLUMN_NAME = ?",
    )
    .bind(schema)
    .bind(table)
    .bind(column)
    .fetch_optional(pool)
    .await?;
    Ok(data_type)
}

fn text_rank(data_type: &str) -> Option<u8> {
    let base = data_type.split(|c: char| c.is_whitespace() || c == '(').next()?;
    match base.to_ascii_lowercase().as_str() {
        "tinytext" => Some(1),
        "text" => Some(2),
        "mediumtext" => Some(3),
        "longtext" => Some(4),
        _ => None,
    }
}

/// True when a text column of type `current` is narrower than `definition`.
/// Non-text types are never touched.
pub fn needs_widening(current: &str, definition: &str) -> bool {
    match (text_rank(current), text_rank(definition)) {
        (Some(have), Some(want)) => have < want,
        _ => false,
    }
}

/// Create `schema.table` if missing, add any of `columns` it lacks and
/// widen text columns an older release declared narrower.
/// Idempotent; safe to call on a table created by an older release.
pub async fn ensure_table(
    pool: &MySqlPool,
    schema: &str,
    table: &str,
    create_sql: &str,
    columns: &[(&str, &str)],
) -> Result<()> {
    sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(schema)))
        .execute(pool)
        .await?;
    sqlx::query(create_sql).execute(pool).await?;

    for (column, definition) in columns {
        let action = match column_type(pool, schema, table, column).await? {
            None => "ADD",
            Some(current) if needs_widening(&current, definition) => "MODIFY",
            Some(_) => continue,
        };
        info!(table = %table, column = %column, action, "Altering column");
        sqlx::query(&format!(
            "ALTER TABLE {}.{} {} COLUMN {} {}",
            quote_ident(schema),
            quote_ident(table),
            action,
            quote_ident(column),
            definition
        ))
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Run `op`; on a missing table/column (or undersized column) error run
/// `repair` and retry once.
/// A second drift error is reported as [`BackupError::SchemaDrift`].
pub async fn retry_after_repair<T, Op, OpFut, Rep, RepFut>(table: &str, op: Op, repair: Rep) -> Result<T>
where
    Op: Fn() -> OpFut,
    OpFut: Future<Output = Result<T>>,
    Rep: FnOnce() -> RepFut,
    RepFut: Future<Output = Result<()>>,
{
    match op().await {
        Err(e) if e.is_schema_drift() => {
            warn!(table = %table, "Schema drift, repairing table: {}", e);
            repair().await?;
            op().await.map_err(|e| {
                if e.is_schema_drift() {
                    BackupError::SchemaDrift {
                        table: table.to_string(),
                        message: e.to_string(),
                    }
                } else {
                    e
                }
            })
        }
        other => other,
    }
}

/// Quote an identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a string literal for statements that can't take bind parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("5.7.20-tmysql-3.1.5-log"), (5, 7, 20));
        assert_eq!(parse_version("8.0.32"), (8, 0, 32));
        assert_eq!(parse_version("10.4.12-MariaDB"), (10, 4, 12));
        assert_eq!(parse_version("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_version_number_orders() {
        assert!(version_number("5.6.24") < version_number("5.7.1"));
        assert!(version_number("8.0.0") > version_number("5.7.44-log"));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("a`b"), "`a``b`");
        assert_eq!(quote_literal("it's"), "'it\\'s'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[tokio::test]
    async fn test_retry_after_repair_retries_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let repaired = AtomicUsize::new(0);
        let (calls_ref, repaired_ref) = (&calls, &repaired);
        let result = retry_after_repair(
            "t",
            move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BackupError::SchemaDrift {
                        table: "t".into(),
                        message: "missing".into(),
                    })
                } else {
                    Ok(7)
                }
            },
            move || async move {
                repaired_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(repaired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_repair_second_drift_is_fatal() {
        let result: Result<()> = retry_after_repair(
            "global_backup",
            || async {
                Err(BackupError::SchemaDrift {
                    table: "global_backup".into(),
                    message: "still missing".into(),
                })
            },
            || async { Ok(()) },
        )
        .await;
        assert!(matches!(result, Err(BackupError::SchemaDrift { table, .. }) if table == "global_backup"));
    }

    #[test]
    fn test_needs_widening() {
        assert!(needs_widening("text", "mediumtext"));
        assert!(needs_widening("TINYTEXT", "longtext"));
        assert!(needs_widening("text", "mediumtext NOT NULL"));
        assert!(!needs_widening("mediumtext", "mediumtext"));
        assert!(!needs_widening("longtext", "mediumtext"));
        assert!(!needs_widening("varchar", "mediumtext"));
        assert!(!needs_widening("text", "varchar(255)"));
    }

    #[test]
    fn test_non_database_errors_are_not_drift() {
        assert!(!is_schema_drift(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&BackupError::Database(sqlx::Error::PoolTimedOut)));
        assert!(!is_transient(&BackupError::validation("x")));
    }
}

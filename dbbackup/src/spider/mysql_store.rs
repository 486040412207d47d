//! `infodba_schema.global_backup` over sqlx.

use super::model::{GlobalBackupModel, TaskKey, TaskStatus, Wrapper};
use super::store::GlobalBackupStore;
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{ensure_table, quote_literal, retry_after_repair};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

pub const SCHEMA: &str = "infodba_schema";
pub const TABLE: &str = "global_backup";

const COLUMNS: &str = "ServerName, Wrapper, Host, Port, ShardValue, BackupId, Status, Pid, CreatedAt, UpdatedAt";

/// Columns added after the first release, checked on every repair.
const LATE_COLUMNS: &[(&str, &str)] = &[
    ("Pid", "INT NOT NULL DEFAULT 0"),
    ("UpdatedAt", "DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP"),
];

/// A shard the table is partitioned over on a routing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub shard_value: i32,
    pub server_name: String,
}

/// Table DDL. With partitions the table is a routing table whose rows
/// live on the shard owning their `ShardValue`.
pub fn create_table_sql(partitions: &[Partition]) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS `{}`.`{}` (\
         ServerName VARCHAR(64) NOT NULL DEFAULT '', \
         Wrapper VARCHAR(64) NOT NULL DEFAULT '', \
         Host VARCHAR(64) NOT NULL, \
         Port INT NOT NULL, \
         ShardValue INT NOT NULL DEFAULT 0, \
         BackupId VARCHAR(64) NOT NULL, \
         Status VARCHAR(255) NOT NULL DEFAULT 'init', \
         Pid INT NOT NULL DEFAULT 0, \
         CreatedAt DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         UpdatedAt DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         PRIMARY KEY (BackupId, Host, Port, ShardValue), \
         KEY idx_status (Status), \
         KEY idx_created_at (CreatedAt))",
        SCHEMA, TABLE
    );
    if partitions.is_empty() {
        sql.push_str(" ENGINE=InnoDB DEFAULT CHARSET=utf8mb4");
        return sql;
    }
    sql.push_str(&format!(
        " ENGINE=SPIDER DEFAULT CHARSET=utf8mb4 COMMENT={} PARTITION BY LIST (ShardValue) (",
        quote_literal(&format!("wrapper \"mysql\", table \"{}\"", TABLE))
    ));
    let parts: Vec<String> = partitions
        .iter()
        .map(|p| {
            format!(
                "PARTITION pt{} VALUES IN ({}) COMMENT = {} ENGINE = SPIDER",
                p.shard_value,
                p.shard_value,
                quote_literal(&format!("database \"{}\", srv \"{}\"", SCHEMA, p.server_name))
            )
        })
        .collect();
    sql.push_str(&parts.join(", "));
    sql.push(')');
    sql
}

fn local_time(naive: NaiveDateTime) -> DateTime<Local> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

fn row_to_model(row: &MySqlRow) -> Result<GlobalBackupModel> {
    let wrapper: String = row.try_get("Wrapper")?;
    let status: String = row.try_get("Status")?;
    let port: i32 = row.try_get("Port")?;
    Ok(GlobalBackupModel {
        backup_id: row.try_get("BackupId")?,
        host: row.try_get("Host")?,
        port: u16::try_from(port)
            .map_err(|_| BackupError::validation(format!("port {} out of range", port)))?,
        shard_value: row.try_get("ShardValue")?,
        server_name: row.try_get("ServerName")?,
        wrapper: Wrapper::parse(&wrapper).unwrap_or(Wrapper::Mysql),
        status: status.parse().unwrap_or(TaskStatus::Unknown),
        pid: row.try_get("Pid")?,
        created_at: local_time(row.try_get("CreatedAt")?),
        updated_at: local_time(row.try_get("UpdatedAt")?),
    })
}

pub struct MysqlGlobalBackupStore {
    pool: MySqlPool,
    partitions: Vec<Partition>,
}

impl MysqlGlobalBackupStore {
    /// Plain table on a storage instance.
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            partitions: Vec::new(),
        }
    }

    /// Routing table on a spider node.
    pub fn partitioned(pool: MySqlPool, partitions: Vec<Partition>) -> Self {
        Self { pool, partitions }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    fn table() -> String {
        format!("`{}`.`{}`", SCHEMA, TABLE)
    }

    async fn repair(&self) -> Result<()> {
        ensure_table(&self.pool, SCHEMA, TABLE, &create_table_sql(&self.partitions), LATE_COLUMNS).await
    }

    async fn fetch(&self, sql: &str, binds: &[&str]) -> Result<Vec<GlobalBackupModel>> {
        retry_after_repair(
            TABLE,
            || async {
                let mut query = sqlx::query(sql);
                for b in binds {
                    query = query.bind(*b);
                }
                let rows = query.fetch_all(&self.pool).await?;
                rows.iter().map(row_to_model).collect::<Result<Vec<_>>>()
            },
            || self.repair(),
        )
        .await
    }
}

#[async_trait]
impl GlobalBackupStore for MysqlGlobalBackupStore {
    async fn ensure_table(&self) -> Result<()> {
        self.repair().await
    }

    async fn insert_tasks(&self, rows: &[GlobalBackupModel]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            Self::table(),
            COLUMNS
        );
        retry_after_repair(
            TABLE,
            || async {
                let mut tx = self.pool.begin().await?;
                for row in rows {
                    sqlx::query(&sql)
                        .bind(&row.server_name)
                        .bind(row.wrapper.as_str())
                        .bind(&row.host)
                        .bind(i32::from(row.port))
                        .bind(row.shard_value)
                        .bind(&row.backup_id)
                        .bind(row.status.to_string())
                        .bind(row.pid)
                        .bind(row.created_at.naive_local())
                        .bind(row.updated_at.naive_local())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok::<_, BackupError>(())
            },
            || self.repair(),
        )
        .await
    }

    async fn list_for_node(&self, host: &str, port: u16) -> Result<Vec<GlobalBackupModel>> {
        let port = port.to_string();
        let sql = format!(
            "SELECT {} FROM {} WHERE Host = ? AND Port = ? ORDER BY CreatedAt",
            COLUMNS,
            Self::table()
        );
        self.fetch(&sql, &[host, &port]).await
    }

    async fn list_by_backup_id(&self, backup_id: &str) -> Result<Vec<GlobalBackupModel>> {
        let sql = format!("SELECT {} FROM {} WHERE BackupId = ?", COLUMNS, Self::table());
        self.fetch(&sql, &[backup_id]).await
    }

    async fn get(&self, key: &TaskKey) -> Result<Option<GlobalBackupModel>> {
        let port = key.port.to_string();
        let shard = key.shard_value.to_string();
        let sql = format!(
            "SELECT {} FROM {} WHERE BackupId = ? AND Host = ? AND Port = ? AND ShardValue = ?",
            COLUMNS,
            Self::table()
        );
        Ok(self
            .fetch(&sql, &[&key.backup_id, &key.host, &port, &shard])
            .await?
            .into_iter()
            .next())
    }

    async fn compare_and_set_status(
        &self,
        key: &TaskKey,
        expected: &[TaskStatus],
        new: &TaskStatus,
        pid: Option<i32>,
        now: DateTime<Local>,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; expected.len()].join(", ");
        let pid_clause = if pid.is_some() { ", Pid = ?" } else { "" };
        let sql = format!(
            "UPDATE {} SET Status = ?, UpdatedAt = ?{} \
             WHERE BackupId = ? AND Host = ? AND Port = ? AND ShardValue = ? AND Status IN ({})",
            Self::table(),
            pid_clause,
            placeholders
        );
        let affected = retry_after_repair(
            TABLE,
            || async {
                let mut query = sqlx::query(&sql).bind(new.to_string()).bind(now.naive_local());
                if let Some(pid) = pid {
                    query = query.bind(pid);
                }
                query = query
                    .bind(&key.backup_id)
                    .bind(&key.host)
                    .bind(i32::from(key.port))
                    .bind(key.shard_value);
                for status in expected {
                    query = query.bind(status.to_string());
                }
                Ok::<_, BackupError>(query.execute(&self.pool).await?.rows_affected())
            },
            || self.repair(),
        )
        .await?;
        Ok(affected == 1)
    }

    async fn purge_before(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE CreatedAt < ?", Self::table());
        retry_after_repair(
            TABLE,
            || async {
                Ok::<_, BackupError>(sqlx::query(&sql)
                    .bind(cutoff.naive_local())
                    .execute(&self.pool)
                    .await?
                    .rows_affected())
            },
            || self.repair(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_table_ddl() {
        let sql = create_table_sql(&[]);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `infodba_schema`.`global_backup`"));
        assert!(sql.contains("PRIMARY KEY (BackupId, Host, Port, ShardValue)"));
        assert!(sql.contains("KEY idx_status (Status)"));
        assert!(sql.contains("KEY idx_created_at (CreatedAt)"));
        assert!(sql.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));
        assert!(!sql.contains("PARTITION"));
    }

    #[test]
    fn test_spider_table_is_list_partitioned() {
        let parts = vec![
            Partition { shard_value: 0, server_name: "SPT0".to_string() },
            Partition { shard_value: 1, server_name: "SPT1".to_string() },
        ];
        let sql = create_table_sql(&parts);
        assert!(sql.contains("ENGINE=SPIDER"));
        assert!(sql.contains("PARTITION BY LIST (ShardValue)"));
        assert!(sql.contains("PARTITION pt0 VALUES IN (0) COMMENT = 'database \"infodba_schema\", srv \"SPT0\"'"));
        assert!(sql.contains("PARTITION pt1 VALUES IN (1)"));
        assert!(sql.ends_with(')'));
    }
}

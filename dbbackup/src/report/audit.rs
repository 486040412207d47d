//! Per-instance audit table `infodba_schema.local_backup_report`.
//!
//! One row per (BackupId, MysqlRole, ShardValue) holding the manifest and
//! its binlog coordinates as embedded JSON, so backup history is queryable
//! from the instance itself.

use crate::index::IndexContent;
use crate::utils::errors::Result;
use crate::utils::mysqlconn::{ensure_table, retry_after_repair};
use sqlx::mysql::MySqlPool;
use tracing::info;

pub const AUDIT_SCHEMA: &str = "infodba_schema";
pub const AUDIT_TABLE: &str = "local_backup_report";

const CREATE_AUDIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS `infodba_schema`.`local_backup_report` (
  `BackupId` varchar(64) NOT NULL,
  `MysqlRole` varchar(30) NOT NULL,
  `ShardValue` int NOT NULL DEFAULT 0,
  `BillId` varchar(32) NOT NULL DEFAULT '',
  `BkBizId` bigint NOT NULL DEFAULT 0,
  `ClusterId` bigint NOT NULL DEFAULT 0,
  `ClusterAddress` varchar(255) NOT NULL DEFAULT '',
  `MysqlHost` varchar(64) NOT NULL DEFAULT '',
  `MysqlPort` int NOT NULL DEFAULT 0,
  `BackupType` varchar(30) NOT NULL DEFAULT '',
  `DataSchemaGrant` varchar(32) NOT NULL DEFAULT '',
  `IsFullBackup` tinyint NOT NULL DEFAULT 0,
  `BackupBeginTime` datetime NOT NULL,
  `BackupEndTime` datetime NOT NULL,
  `ConsistentBackupTime` datetime NOT NULL,
  `BinlogInfo` mediumtext,
  `FileList` longtext,
  `ExtraFields` longtext,
  `BackupTotalSize` bigint NOT NULL DEFAULT 0,
  PRIMARY KEY (`BackupId`, `MysqlRole`, `ShardValue`),
  KEY `idx_begin` (`BackupBeginTime`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8
"#;

/// Columns added after the first release, or widened since; repaired in
/// place on older tables.
const AUDIT_COLUMNS: &[(&str, &str)] = &[
    ("ClusterAddress", "varchar(255) NOT NULL DEFAULT ''"),
    ("DataSchemaGrant", "varchar(32) NOT NULL DEFAULT ''"),
    ("IsFullBackup", "tinyint NOT NULL DEFAULT 0"),
    ("ConsistentBackupTime", "datetime NULL"),
    ("BinlogInfo", "mediumtext"),
    ("FileList", "longtext"),
    ("ExtraFields", "longtext"),
    ("BackupTotalSize", "bigint NOT NULL DEFAULT 0"),
];

pub async fn repair_audit_table(pool: &MySqlPool) -> Result<()> {
    ensure_table(pool, AUDIT_SCHEMA, AUDIT_TABLE, CREATE_AUDIT_TABLE, AUDIT_COLUMNS).await
}

async fn replace_row(pool: &MySqlPool, index: &IndexContent) -> Result<()> {
    let binlog_info = serde_json::to_string(&index.binlog_info)?;
    let file_list = serde_json::to_string(&index.file_list)?;
    let extra = serde_json::to_string(index)?;

    sqlx::query(
        "REPLACE INTO `infodba_schema`.`local_backup_report` \
         (BackupId, MysqlRole, ShardValue, BillId, BkBizId, ClusterId, ClusterAddress, \
          MysqlHost, MysqlPort, BackupType, DataSchemaGrant, IsFullBackup, \
          BackupBeginTime, BackupEndTime, ConsistentBackupTime, \
          BinlogInfo, FileList, ExtraFields, BackupTotalSize) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&index.backup_id)
    .bind(index.mysql_role.to_string())
    .bind(index.shard_value)
    .bind(&index.bill_id)
    .bind(index.bk_biz_id)
    .bind(index.cluster_id)
    .bind(&index.cluster_address)
    .bind(&index.backup_host)
    .bind(index.backup_port)
    .bind(index.backup_type.to_string())
    .bind(&index.data_schema_grant)
    .bind(index.is_full_backup)
    .bind(index.backup_begin_time.naive_local())
    .bind(index.backup_end_time.naive_local())
    .bind(index.backup_consistent_time.naive_local())
    .bind(binlog_info)
    .bind(file_list)
    .bind(extra)
    .bind(index.total_filesize as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the manifest, creating or repairing the table on first use.
pub async fn report_audit(pool: &MySqlPool, index: &IndexContent) -> Result<()> {
    retry_after_repair(
        AUDIT_TABLE,
        move || replace_row(pool, index),
        move || repair_audit_table(pool),
    )
    .await?;
    info!(backup_id = %index.backup_id, "Audit row written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::index::tests::sample_meta;
    use crate::index::TarFileItem;
    use crate::utils::mysqlconn::needs_widening;

    /// `text` tops out at 64 KiB.
    const TEXT_MAX: usize = 65_535;

    #[test]
    fn test_manifest_columns_hold_large_file_lists() {
        let cfg = sample_config();
        let mut index = IndexContent::new(&cfg, "100_h_127.0.0.1_3306_x_logical", "5.7.20", sample_meta()).unwrap();
        for part in 0..20 {
            let tar = format!("100_h_127.0.0.1_3306_x_logical_{}.tar", part);
            for n in 0..60 {
                index.add_file(TarFileItem::member(format!("shop.order_items_{}.{:05}.sql", n, part), 4096, &tar));
            }
            index.add_file(TarFileItem::standalone(tar, 1 << 30));
        }
        let file_list = serde_json::to_string(&index.file_list).unwrap();
        assert!(file_list.len() > TEXT_MAX, "{} bytes", file_list.len());

        for column in ["BinlogInfo", "FileList", "ExtraFields"] {
            let (_, definition) = AUDIT_COLUMNS.iter().find(|(c, _)| *c == column).unwrap();
            assert!(needs_widening("text", definition), "{} is {}", column, definition);
            assert!(CREATE_AUDIT_TABLE.contains(&format!("`{}` {},", column, definition)));
        }
    }
}

//! Control-node side: fan a cluster backup out to every shard and wait for it.

use super::model::{GlobalBackupModel, TaskStatus, Wrapper};
use super::mysql_store::Partition;
use super::store::GlobalBackupStore;
use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::is_transient;
use chrono::{DateTime, Local};
use sqlx::{MySqlPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One entry of `mysql.servers` on a routing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderServer {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub wrapper: Wrapper,
}

impl SpiderServer {
    /// Shard number encoded as the trailing digits of the server name,
    /// e.g. `SPT3` and `SPT_SLAVE3` are both shard 3.
    pub fn shard_value(&self) -> Option<i32> {
        let digits: String = self
            .server_name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

/// Only the primary routing node schedules. Nodes without the variable are never leader.
pub async fn is_leader(pool: &MySqlPool) -> Result<bool> {
    match sqlx::query_scalar::<_, i64>("SELECT CAST(@@tc_is_primary AS SIGNED)")
        .fetch_one(pool)
        .await
    {
        Ok(v) => Ok(v == 1),
        Err(sqlx::Error::Database(e)) => {
            debug!("tc_is_primary unavailable: {}", e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn list_servers(pool: &MySqlPool) -> Result<Vec<SpiderServer>> {
    let rows = sqlx::query("SELECT Server_name, Host, Port, Wrapper FROM mysql.servers")
        .fetch_all(pool)
        .await?;
    let mut servers = Vec::with_capacity(rows.len());
    for row in rows {
        let server_name: String = row.try_get("Server_name")?;
        let wrapper: String = row.try_get("Wrapper")?;
        let Some(wrapper) = Wrapper::parse(&wrapper) else {
            warn!(server = %server_name, wrapper = %wrapper, "Skipping server with unknown wrapper");
            continue;
        };
        let port: i32 = row.try_get("Port")?;
        servers.push(SpiderServer {
            server_name,
            host: row.try_get("Host")?,
            port: u16::try_from(port)
                .map_err(|_| BackupError::validation(format!("port {} out of range", port)))?,
            wrapper,
        });
    }
    Ok(servers)
}

/// Partitions of the routing table: one per master shard.
pub fn partitions(servers: &[SpiderServer]) -> Vec<Partition> {
    let mut parts: Vec<Partition> = servers
        .iter()
        .filter(|s| s.wrapper == Wrapper::Mysql)
        .filter_map(|s| {
            s.shard_value().map(|v| Partition {
                shard_value: v,
                server_name: s.server_name.clone(),
            })
        })
        .collect();
    parts.sort_by_key(|p| p.shard_value);
    parts.dedup_by_key(|p| p.shard_value);
    parts
}

/// One row per shard instance. Slave rows ride on their master's
/// partition and start as `replicated`.
pub fn plan_tasks(backup_id: &str, servers: &[SpiderServer], now: DateTime<Local>) -> Vec<GlobalBackupModel> {
    servers
        .iter()
        .filter(|s| matches!(s.wrapper, Wrapper::Mysql | Wrapper::MysqlSlave))
        .filter_map(|s| {
            let Some(shard_value) = s.shard_value() else {
                warn!(server = %s.server_name, "Server name carries no shard number, skipped");
                return None;
            };
            Some(GlobalBackupModel {
                backup_id: backup_id.to_string(),
                host: s.host.clone(),
                port: s.port,
                shard_value,
                server_name: s.server_name.clone(),
                wrapper: s.wrapper,
                status: s.wrapper.initial_status(),
                pid: 0,
                created_at: now,
                updated_at: now,
            })
        })
        .collect()
}

/// Insert the rows of a new cluster backup and return its id.
pub async fn schedule_tasks<S: GlobalBackupStore + ?Sized>(
    store: &S,
    servers: &[SpiderServer],
    now: DateTime<Local>,
) -> Result<String> {
    let backup_id = uuid::Uuid::new_v4().to_string();
    let rows = plan_tasks(&backup_id, servers, now);
    if rows.is_empty() {
        return Err(BackupError::validation("mysql.servers lists no shard to back up"));
    }
    store.ensure_table().await?;
    store.insert_tasks(&rows).await?;
    info!(backup_id = %backup_id, shards = rows.len(), "Cluster backup scheduled");
    Ok(backup_id)
}

/// Poll until no row of `backup_id` is pending. Returns the final rows.
/// Up to `max_reconnects` consecutive transient errors are tolerated.
pub async fn wait_for<S: GlobalBackupStore + ?Sized>(
    store: &S,
    backup_id: &str,
    poll_interval: Duration,
    max_reconnects: u32,
) -> Result<Vec<GlobalBackupModel>> {
    let mut failures = 0u32;
    loop {
        match store.list_by_backup_id(backup_id).await {
            Ok(rows) => {
                failures = 0;
                if rows.is_empty() {
                    return Err(BackupError::validation(format!(
                        "no task rows for backup {}",
                        backup_id
                    )));
                }
                let pending = rows.iter().filter(|r| r.status.is_pending()).count();
                if pending == 0 {
                    return Ok(rows);
                }
                debug!(backup_id = %backup_id, pending, total = rows.len(), "Waiting for shards");
            }
            Err(e) if is_transient(&e) => {
                failures += 1;
                if failures > max_reconnects {
                    return Err(e);
                }
                warn!(backup_id = %backup_id, attempt = failures, "Lost coordinator connection: {}", e);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Rows that did not finish successfully, as `host:port status`.
pub fn unsuccessful(rows: &[GlobalBackupModel]) -> Vec<String> {
    rows.iter()
        .filter(|r| r.status != TaskStatus::Success)
        .map(|r| format!("{}:{} {}", r.host, r.port, r.status))
        .collect()
}

//! Guards around a logical restore into a live instance.

use crate::utils::errors::{BackupError, Result};
use crate::utils::mysqlconn::{global_variable, is_system_database, probe, quote_ident, quote_literal};
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tracing::{info, warn};

/// Restoring into a system database is never allowed.
pub fn check_target_databases(databases: &[String]) -> Result<()> {
    let system: Vec<&str> = databases
        .iter()
        .map(String::as_str)
        .filter(|d| is_system_database(d))
        .collect();
    if system.is_empty() {
        Ok(())
    } else {
        Err(BackupError::validation(format!(
            "refusing to load into system database(s): {}",
            system.join(",")
        )))
    }
}

/// Clears `@@global.init_connect` for the duration of a load. The saved
/// value must be handed back through [`InitConnectGuard::restore`].
pub struct InitConnectGuard {
    pool: MySqlPool,
    saved: Option<String>,
}

impl InitConnectGuard {
    pub async fn disable(pool: &MySqlPool) -> Result<Self> {
        let saved = probe("read init_connect", global_variable(pool, "init_connect"))
            .await?
            .filter(|v| !v.is_empty());
        if saved.is_some() {
            sqlx::query("SET GLOBAL init_connect = ''").execute(pool).await?;
            info!("init_connect cleared for load");
        }
        Ok(Self {
            pool: pool.clone(),
            saved,
        })
    }

    pub async fn restore(self) -> Result<()> {
        if let Some(value) = self.saved {
            sqlx::query(&format!("SET GLOBAL init_connect = {}", quote_literal(&value)))
                .execute(&self.pool)
                .await?;
            info!("init_connect restored");
        }
        Ok(())
    }
}

/// Tables of `database` that some session is using right now.
async fn tables_in_use(pool: &MySqlPool, database: &str) -> Result<Vec<String>> {
    let sql = format!("SHOW OPEN TABLES FROM {} WHERE In_use > 0", quote_ident(database));
    let rows = probe("show open tables", async {
        Ok(sqlx::query(&sql).fetch_all(pool).await?)
    })
    .await?;
    Ok(rows
        .iter()
        .filter_map(|r| r.try_get::<String, _>("Table").ok())
        .collect())
}

/// Drop each database before loading, refusing when any table is in use.
pub async fn drop_databases(pool: &MySqlPool, databases: &[String]) -> Result<()> {
    check_target_databases(databases)?;
    for db in databases {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?")
                .bind(db)
                .fetch_optional(pool)
                .await?;
        if exists.is_none() {
            continue;
        }
        let busy = tables_in_use(pool, db).await?;
        if !busy.is_empty() {
            return Err(BackupError::validation(format!(
                "database {} has tables in use: {}",
                db,
                busy.join(",")
            )));
        }
        warn!(database = %db, "Dropping database before load");
        sqlx::query(&format!("DROP DATABASE {}", quote_ident(db)))
            .execute(pool)
            .await?;
    }
    Ok(())
}

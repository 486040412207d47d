//! Account and privilege capture into `<target>.priv`.

use crate::utils::errors::Result;
use crate::utils::mysqlconn::{quote_literal, version_number};
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// Accounts the server creates for itself.
pub const SYSTEM_ACCOUNTS: &[&str] = &["mysql.session", "mysql.sys", "mysql.infoschema"];

pub fn is_system_account(user: &str) -> bool {
    SYSTEM_ACCOUNTS.contains(&user)
}

pub fn account(user: &str, host: &str) -> String {
    format!("{}@{}", quote_literal(user), quote_literal(host))
}

/// Statements recreating one account: `CREATE USER` first if known, then grants.
pub fn render_account(create: Option<&str>, grants: &[String]) -> String {
    let mut out = String::new();
    if let Some(create) = create {
        let stmt = create.replacen("CREATE USER", "CREATE USER IF NOT EXISTS", 1);
        let _ = writeln!(out, "{};", stmt.trim_end_matches(';'));
    }
    for grant in grants {
        let _ = writeln!(out, "{};", grant.trim_end_matches(';'));
    }
    out
}

/// Write every non-system account to `out`. Returns the number of accounts.
pub async fn dump_grants(pool: &MySqlPool, server_version: &str, out: &Path) -> Result<usize> {
    let rows = sqlx::query("SELECT CAST(user AS CHAR) AS user, CAST(host AS CHAR) AS host FROM mysql.user")
        .fetch_all(pool)
        .await?;
    let has_create_user = version_number(server_version) >= 5_007_000;

    let mut text = String::new();
    let mut count = 0usize;
    for row in rows {
        let user: String = row.try_get("user")?;
        let host: String = row.try_get("host")?;
        if is_system_account(&user) {
            continue;
        }
        let who = account(&user, &host);

        let create = if has_create_user {
            match sqlx::query_scalar::<_, String>(&format!("SHOW CREATE USER {}", who))
                .fetch_one(pool)
                .await
            {
                Ok(stmt) => Some(stmt),
                Err(e) => {
                    warn!(account = %who, "SHOW CREATE USER failed: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let grants: Vec<String> = sqlx::query_scalar(&format!("SHOW GRANTS FOR {}", who))
            .fetch_all(pool)
            .await?;

        text.push_str(&render_account(create.as_deref(), &grants));
        count += 1;
    }

    tokio::fs::write(out, text).await?;
    info!(accounts = count, file = %out.display(), "Grants captured");
    Ok(count)
}

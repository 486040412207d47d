//! Cluster backup coordination for sharded (spider) deployments.
//!
//! The routing node schedules one row per shard into
//! `infodba_schema.global_backup`; an agent on every storage node claims
//! and runs its rows one at a time.

pub mod agent;
pub mod model;
pub mod mysql_store;
pub mod process;
pub mod schedule;
pub mod store;

pub use agent::{CheckOutcome, NodeAgent, RunOutcome};
pub use model::{GlobalBackupModel, TaskKey, TaskStatus, Wrapper};
pub use mysql_store::MysqlGlobalBackupStore;
pub use store::GlobalBackupStore;

use crate::config::BackupConfig;
use crate::daemon::ShutdownCoordinator;
use crate::dumper::run_dump;
use crate::report::Reporter;
use crate::utils::errors::{BackupError, Result};
use agent::{node_ports, run_claimed, AgentOptions, CommandLauncher};
use chrono::Local;
use process::ProcInspector;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schedule a cluster backup from the routing node. `None` when this
/// node is not the leader.
pub async fn schedule_command(cfg: &BackupConfig, wait: bool) -> Result<Option<String>> {
    let pool = cfg.conn_param().connect().await?;
    if !schedule::is_leader(&pool).await? {
        info!(host = %cfg.public.mysql_host, port = cfg.public.mysql_port, "Not the primary routing node, nothing to schedule");
        return Ok(None);
    }
    let servers = schedule::list_servers(&pool).await?;
    let store = MysqlGlobalBackupStore::partitioned(pool, schedule::partitions(&servers));
    let backup_id = schedule::schedule_tasks(&store, &servers, Local::now()).await?;

    if wait {
        let rows = schedule::wait_for(
            &store,
            &backup_id,
            Duration::from_secs(cfg.spider.poll_interval_secs),
            cfg.spider.max_reconnects,
        )
        .await?;
        let failed = schedule::unsuccessful(&rows);
        if !failed.is_empty() {
            return Err(BackupError::Process(format!(
                "cluster backup {} incomplete: {}",
                backup_id,
                failed.join(", ")
            )));
        }
        info!(backup_id = %backup_id, shards = rows.len(), "Cluster backup finished");
    }
    store.pool().close().await;
    Ok(Some(backup_id))
}

/// Node check. The first config names this node's host and credentials;
/// every config is the `run` config for its own port.
pub async fn check_command(
    configs: &[(PathBuf, BackupConfig)],
    daemon: bool,
    log_file: Option<PathBuf>,
) -> Result<()> {
    let (_, primary) = configs
        .first()
        .ok_or_else(|| BackupError::validation("check needs at least one config file"))?;

    let mut ports = node_ports(primary);
    let mut by_port = HashMap::new();
    for (path, cfg) in configs {
        if !ports.contains(&cfg.public.mysql_port) {
            ports.push(cfg.public.mysql_port);
        }
        by_port.insert(cfg.public.mysql_port, path.clone());
    }

    let mut shards = Vec::with_capacity(ports.len());
    for port in ports {
        let mut param = primary.conn_param();
        param.port = port;
        let store = MysqlGlobalBackupStore::new(param.connect().await?);
        store.ensure_table().await?;
        shards.push((port, Arc::new(store)));
    }

    let agent = NodeAgent::new(shards, ProcInspector::default(), AgentOptions::from_config(primary));
    let launcher = CommandLauncher::new(std::env::current_exe()?, by_port, log_file);

    if !daemon {
        let outcome = agent.check_once(&launcher, Local::now()).await?;
        info!(outcome = ?outcome, "Node check done");
        return Ok(());
    }

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let mut shutdown = coordinator.subscribe();
    tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.wait_for_signal().await }
    });
    let interval = Duration::from_secs(primary.spider.poll_interval_secs.max(1));
    info!(interval_secs = interval.as_secs(), "Node check daemon started");
    loop {
        match agent.check_once(&launcher, Local::now()).await {
            Ok(outcome) => debug!(outcome = ?outcome, "Node check pass"),
            Err(e) => warn!("Node check pass failed: {}", e),
        }
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Node check daemon stopped");
    Ok(())
}

/// Claim and run this instance's row of `backup_id`.
pub async fn run_command(cfg: &BackupConfig, backup_id: &str) -> Result<RunOutcome> {
    let store = MysqlGlobalBackupStore::new(cfg.conn_param().connect().await?);
    let task = store
        .list_for_node(&cfg.public.mysql_host, cfg.public.mysql_port)
        .await?
        .into_iter()
        .find(|r| r.backup_id == backup_id && r.status.is_runnable());
    let Some(task) = task else {
        info!(backup_id = %backup_id, "No runnable row for this instance");
        return Ok(RunOutcome::Skipped);
    };

    let mut task_cfg = cfg.clone();
    task_cfg.public.backup_id = backup_id.to_string();
    task_cfg.public.shard_value = task.shard_value;
    let reporter = Reporter::new(&task_cfg);

    let pid = std::process::id() as i32;
    let outcome = run_claimed(&store, &task.key(), pid, || async {
        run_dump(&task_cfg, &reporter, true).await.map(|_| ())
    })
    .await?;
    store.pool().close().await;
    Ok(outcome)
}

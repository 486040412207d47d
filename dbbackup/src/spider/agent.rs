//! Per-node agent: reconcile local rows, pick the next one and run it.

use super::model::{GlobalBackupModel, TaskKey, TaskStatus};
use super::process::ProcessInspector;
use super::store::GlobalBackupStore;
use crate::config::{split_list, BackupConfig};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const REASON_NO_PID: &str = "no pid";
pub const REASON_PID_MISMATCH: &str = "pid not match";
pub const REASON_TOO_LONG: &str = "running too long";
pub const QUIT_KILLED: &str = "killed";
pub const QUIT_CANCELLED: &str = "cancelled";

const MAX_REASON_LEN: usize = 200;
const KILL_VERIFY_ATTEMPTS: u32 = 5;
const KILL_VERIFY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub host: String,
    pub running_ceiling: ChronoDuration,
    pub retention: ChronoDuration,
}

impl AgentOptions {
    pub fn from_config(cfg: &BackupConfig) -> Self {
        Self {
            host: cfg.public.mysql_host.clone(),
            running_ceiling: ChronoDuration::hours(cfg.spider.running_ceiling_hours),
            retention: ChronoDuration::days(cfg.spider.retention_days),
        }
    }
}

/// Ports taking part in cluster backups on this node: the configured
/// instance first, then `local_ports`.
pub fn node_ports(cfg: &BackupConfig) -> Vec<u16> {
    let mut ports = vec![cfg.public.mysql_port];
    for raw in split_list(&cfg.spider.local_ports) {
        match raw.parse::<u16>() {
            Ok(p) if !ports.contains(&p) => ports.push(p),
            Ok(_) => {}
            Err(_) => warn!(port = %raw, "Ignoring invalid entry in local_ports"),
        }
    }
    ports
}

/// Starts the process that runs a claimed task.
pub trait Launcher: Send + Sync {
    fn launch(&self, task: &GlobalBackupModel) -> Result<()>;
}

/// Re-executes this binary as `spiderbackup run` in its own process group,
/// so a later `quit` can kill the whole tree.
pub struct CommandLauncher {
    exe: PathBuf,
    configs: HashMap<u16, PathBuf>,
    log_file: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(exe: PathBuf, configs: HashMap<u16, PathBuf>, log_file: Option<PathBuf>) -> Self {
        Self { exe, configs, log_file }
    }

    pub fn args(&self, task: &GlobalBackupModel) -> Result<Vec<String>> {
        let config = self.configs.get(&task.port).ok_or_else(|| {
            BackupError::validation(format!("no config file for local port {}", task.port))
        })?;
        let mut args = Vec::new();
        if let Some(log) = &self.log_file {
            args.push("--log-file".to_string());
            args.push(log.display().to_string());
        }
        args.extend([
            "spiderbackup".to_string(),
            "run".to_string(),
            "-c".to_string(),
            config.display().to_string(),
            "--backup-id".to_string(),
            task.backup_id.clone(),
        ]);
        Ok(args)
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, task: &GlobalBackupModel) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.exe)
            .args(self.args(task)?)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(task = %task.key(), pid = ?child.id(), "Launched cluster backup task");
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!("Failed to reap task process: {}", e);
            }
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pick {
    Next(GlobalBackupModel),
    /// A row on this node is already running
    Busy(TaskKey),
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Launched(TaskKey),
    Busy(TaskKey),
    Idle,
}

/// One agent per node. Every local port has its own store since each
/// instance holds its own partition of the coordination table.
pub struct NodeAgent<S: GlobalBackupStore, P: ProcessInspector> {
    shards: Vec<(u16, Arc<S>)>,
    inspector: P,
    opts: AgentOptions,
}

impl<S: GlobalBackupStore, P: ProcessInspector> NodeAgent<S, P> {
    pub fn new(shards: Vec<(u16, Arc<S>)>, inspector: P, opts: AgentOptions) -> Self {
        Self {
            shards,
            inspector,
            opts,
        }
    }

    fn store_for(&self, port: u16) -> Result<&Arc<S>> {
        self.shards
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, s)| s)
            .ok_or_else(|| BackupError::validation(format!("port {} is not local to this node", port)))
    }

    async fn node_rows(&self) -> Result<Vec<GlobalBackupModel>> {
        let mut rows = Vec::new();
        for (port, store) in &self.shards {
            rows.extend(store.list_for_node(&self.opts.host, *port).await?);
        }
        Ok(rows)
    }

    async fn transition(
        &self,
        row: &GlobalBackupModel,
        new: TaskStatus,
        now: DateTime<Local>,
    ) -> Result<bool> {
        let changed = self
            .store_for(row.port)?
            .compare_and_set_status(&row.key(), &[row.status.clone()], &new, None, now)
            .await?;
        if changed {
            info!(task = %row.key(), from = %row.status, to = %new, "Task status changed");
        }
        Ok(changed)
    }

    /// Why a `running` row is no longer really running, if it isn't.
    fn stale_reason(&self, row: &GlobalBackupModel, now: DateTime<Local>) -> Option<&'static str> {
        if row.pid <= 0 {
            return Some(REASON_NO_PID);
        }
        let Some(cmdline) = self.inspector.cmdline(row.pid) else {
            return Some(REASON_NO_PID);
        };
        // an empty command line means /proc is hidden from us; trust the pid
        if !cmdline.is_empty() && !cmdline.contains(&row.backup_id) {
            return Some(REASON_PID_MISMATCH);
        }
        if now - row.updated_at > self.opts.running_ceiling {
            if let Err(e) = self.inspector.kill_group(row.pid) {
                warn!(task = %row.key(), pid = row.pid, "Cannot kill overdue task: {}", e);
            }
            return Some(REASON_TOO_LONG);
        }
        None
    }

    /// Fail `running` rows whose process is gone, replaced or overdue.
    pub async fn reconcile(&self, now: DateTime<Local>) -> Result<usize> {
        let mut changed = 0;
        for row in self.node_rows().await? {
            if row.status != TaskStatus::Running {
                continue;
            }
            if let Some(reason) = self.stale_reason(&row, now) {
                warn!(task = %row.key(), pid = row.pid, reason, "Reconciling stale task");
                if self.transition(&row, TaskStatus::failed(reason), now).await? {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn wait_gone(&self, pid: i32) -> bool {
        for _ in 0..KILL_VERIFY_ATTEMPTS {
            if !self.inspector.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(KILL_VERIFY_INTERVAL).await;
        }
        !self.inspector.is_alive(pid)
    }

    /// Kill the process group of every `quit` row not yet handled.
    pub async fn enforce_quit(&self, now: DateTime<Local>) -> Result<usize> {
        let mut changed = 0;
        for row in self.node_rows().await? {
            let TaskStatus::Quit(reason) = &row.status else {
                continue;
            };
            if reason == QUIT_KILLED || reason == QUIT_CANCELLED {
                continue;
            }
            let mark = if row.pid > 0 && self.inspector.is_alive(row.pid) {
                if let Err(e) = self.inspector.kill_group(row.pid) {
                    warn!(task = %row.key(), pid = row.pid, "killpg failed: {}", e);
                    continue;
                }
                if !self.wait_gone(row.pid).await {
                    warn!(task = %row.key(), pid = row.pid, "Task process survived SIGKILL");
                    continue;
                }
                QUIT_KILLED
            } else {
                QUIT_CANCELLED
            };
            if self.transition(&row, TaskStatus::quit(mark), now).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Drop rows past retention from every local store.
    pub async fn purge(&self, now: DateTime<Local>) -> Result<u64> {
        let cutoff = now - self.opts.retention;
        let mut seen: Vec<&Arc<S>> = Vec::new();
        let mut removed = 0;
        for (_, store) in &self.shards {
            if seen.iter().any(|s| Arc::ptr_eq(s, store)) {
                continue;
            }
            seen.push(store);
            removed += store.purge_before(cutoff).await?;
        }
        if removed > 0 {
            info!(removed, "Purged expired task rows");
        }
        Ok(removed)
    }

    /// Earliest-created runnable row across every local port, unless
    /// something on this node is already running.
    pub async fn pick_next(&self) -> Result<Pick> {
        let rows = self.node_rows().await?;
        if let Some(running) = rows.iter().find(|r| r.status == TaskStatus::Running) {
            return Ok(Pick::Busy(running.key()));
        }
        Ok(rows
            .into_iter()
            .filter(|r| r.status.is_runnable())
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.port.cmp(&b.port))
                    .then_with(|| a.shard_value.cmp(&b.shard_value))
            })
            .map_or(Pick::Idle, Pick::Next))
    }

    /// One full pass of the node check.
    pub async fn check_once(&self, launcher: &dyn Launcher, now: DateTime<Local>) -> Result<CheckOutcome> {
        self.reconcile(now).await?;
        self.enforce_quit(now).await?;
        self.purge(now).await?;
        Ok(match self.pick_next().await? {
            Pick::Next(task) => {
                launcher.launch(&task)?;
                CheckOutcome::Launched(task.key())
            }
            Pick::Busy(key) => CheckOutcome::Busy(key),
            Pick::Idle => CheckOutcome::Idle,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another agent got the row first, or it is no longer runnable
    Skipped,
    Succeeded,
    Failed(String),
}

fn short_reason(e: &BackupError) -> String {
    let text = e.to_string().replace('\n', " ");
    match text.char_indices().nth(MAX_REASON_LEN) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

async fn finish<S: GlobalBackupStore + ?Sized>(store: &S, key: &TaskKey, status: TaskStatus) -> Result<()> {
    if !store
        .compare_and_set_status(key, &[TaskStatus::Running], &status, None, Local::now())
        .await?
    {
        let now = store.get(key).await?.map(|r| r.status.to_string());
        warn!(task = %key, wanted = %status, current = ?now, "Row changed while the task ran");
    }
    Ok(())
}

/// Claim `key` for `pid` and run `job` if the claim wins.
pub async fn run_claimed<S, F, Fut>(store: &S, key: &TaskKey, pid: i32, job: F) -> Result<RunOutcome>
where
    S: GlobalBackupStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(row) = store.get(key).await? else {
        info!(task = %key, "Task row vanished, nothing to run");
        return Ok(RunOutcome::Skipped);
    };
    if !row.status.is_runnable() {
        info!(task = %key, status = %row.status, "Task is not runnable, skipping");
        return Ok(RunOutcome::Skipped);
    }
    let claimed = store
        .compare_and_set_status(
            key,
            &[TaskStatus::Init, TaskStatus::Replicated],
            &TaskStatus::Running,
            Some(pid),
            Local::now(),
        )
        .await?;
    if !claimed {
        info!(task = %key, "Task claimed elsewhere, skipping");
        return Ok(RunOutcome::Skipped);
    }
    info!(task = %key, pid, "Task claimed");

    match job().await {
        Ok(()) => {
            finish(store, key, TaskStatus::Success).await?;
            Ok(RunOutcome::Succeeded)
        }
        Err(e) => {
            let reason = short_reason(&e);
            warn!(task = %key, "Task failed: {}", reason);
            finish(store, key, TaskStatus::failed(reason.clone())).await?;
            Ok(RunOutcome::Failed(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::spider::model::Wrapper;
    use crate::spider::process::fake::FakeInspector;
    use crate::spider::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const HOST: &str = "10.0.0.1";

    fn row(id: &str, host: &str, port: u16, status: TaskStatus, pid: i32, age_min: i64) -> GlobalBackupModel {
        let at = Local::now() - ChronoDuration::minutes(age_min);
        GlobalBackupModel {
            backup_id: id.to_string(),
            host: host.to_string(),
            port,
            shard_value: 0,
            server_name: "SPT0".to_string(),
            wrapper: Wrapper::Mysql,
            status,
            pid,
            created_at: at,
            updated_at: at,
        }
    }

    fn opts() -> AgentOptions {
        AgentOptions {
            host: HOST.to_string(),
            running_ceiling: ChronoDuration::hours(48),
            retention: ChronoDuration::days(7),
        }
    }

    fn agent(store: &Arc<MemoryStore>, ports: &[u16], inspector: FakeInspector) -> NodeAgent<MemoryStore, FakeInspector> {
        NodeAgent::new(
            ports.iter().map(|p| (*p, store.clone())).collect(),
            inspector,
            opts(),
        )
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<TaskKey>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, task: &GlobalBackupModel) -> Result<()> {
            self.launched.lock().unwrap().push(task.key());
            Ok(())
        }
    }

    #[test]
    fn test_node_ports() {
        let mut cfg = sample_config();
        cfg.spider.local_ports = "3307, 3306,bogus,3308".to_string();
        assert_eq!(node_ports(&cfg), vec![3306, 3307, 3308]);
    }

    #[test]
    fn test_launcher_args_need_port_config() {
        let launcher = CommandLauncher::new(
            PathBuf::from("/usr/local/bin/dbbackup"),
            HashMap::from([(20000, PathBuf::from("/etc/dbbackup.20000.ini"))]),
            Some(PathBuf::from("/data/dbbak/logs/spiderbackup_run.log")),
        );
        let task = row("b1", HOST, 20000, TaskStatus::Init, 0, 0);
        assert_eq!(
            launcher.args(&task).unwrap(),
            vec![
                "--log-file",
                "/data/dbbak/logs/spiderbackup_run.log",
                "spiderbackup",
                "run",
                "-c",
                "/etc/dbbackup.20000.ini",
                "--backup-id",
                "b1"
            ]
        );
        let other = row("b1", HOST, 20001, TaskStatus::Init, 0, 0);
        assert!(launcher.args(&other).is_err());
    }

    #[tokio::test]
    async fn test_picks_earliest_runnable_across_ports() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            row("newer", HOST, 20000, TaskStatus::Init, 0, 5),
            row("oldest", HOST, 20001, TaskStatus::Replicated, 0, 30),
            row("middle", HOST, 20000, TaskStatus::Init, 0, 10),
            row("elsewhere", "10.0.0.9", 20000, TaskStatus::Init, 0, 60),
            row("done", HOST, 20000, TaskStatus::Success, 0, 90),
        ]));
        let a = agent(&store, &[20000, 20001], FakeInspector::default());
        match a.pick_next().await.unwrap() {
            Pick::Next(task) => assert_eq!(task.backup_id, "oldest"),
            other => panic!("unexpected pick {:?}", other),
        }

        let launcher = RecordingLauncher::default();
        let outcome = a.check_once(&launcher, Local::now()).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Launched(ref k) if k.backup_id == "oldest"));
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_running_row_blocks_the_node() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            row("busy", HOST, 20001, TaskStatus::Running, 4242, 5),
            row("waiting", HOST, 20000, TaskStatus::Init, 0, 30),
        ]));
        let a = agent(&store, &[20000, 20001], FakeInspector::with(&[(4242, "dbbackup spiderbackup run --backup-id busy")]));
        let launcher = RecordingLauncher::default();
        let outcome = a.check_once(&launcher, Local::now()).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Busy(ref k) if k.backup_id == "busy"));
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_agents_race_for_one_row() {
        let store = Arc::new(MemoryStore::with_rows(vec![row("b1", HOST, 20000, TaskStatus::Init, 0, 1)]));
        let first = agent(&store, &[20000], FakeInspector::default());
        let second = agent(&store, &[20000], FakeInspector::default());

        let (Pick::Next(a), Pick::Next(b)) = (first.pick_next().await.unwrap(), second.pick_next().await.unwrap()) else {
            panic!("both agents should see the row");
        };
        let (ka, kb) = (a.key(), b.key());
        assert_eq!(ka, kb);

        let runs = AtomicU32::new(0);
        let job = || async {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok::<(), BackupError>(())
        };
        let (ra, rb) = tokio::join!(
            run_claimed(store.as_ref(), &ka, 100, job),
            run_claimed(store.as_ref(), &kb, 200, job)
        );
        let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, RunOutcome::Skipped));
        assert_eq!(outcomes, vec![RunOutcome::Succeeded, RunOutcome::Skipped]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.status_of(&ka), Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn test_failed_job_records_reason() {
        let store = MemoryStore::with_rows(vec![row("b1", HOST, 20000, TaskStatus::Replicated, 0, 1)]);
        let key = store.snapshot()[0].key();
        let outcome = run_claimed(&store, &key, 100, || async {
            Err::<(), _>(BackupError::Consistency("part 2 missing".to_string()))
        })
        .await
        .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(ref r) if r.contains("part 2 missing")));
        assert!(matches!(store.status_of(&key), Some(TaskStatus::Failed(ref r)) if r.contains("part 2 missing")));
        assert_eq!(store.snapshot()[0].pid, 100);

        // finished rows are never claimed again
        let again = run_claimed(&store, &key, 101, || async { Ok::<(), BackupError>(()) }).await.unwrap();
        assert_eq!(again, RunOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_vanished_process_fails_only_its_row() {
        let rows: Vec<GlobalBackupModel> = (0..4)
            .map(|i| {
                let mut r = row("cluster1", &format!("10.0.0.{}", i + 1), 20000, TaskStatus::Running, 1000 + i, 10);
                r.shard_value = i;
                r
            })
            .collect();
        let store = Arc::new(MemoryStore::with_rows(rows));
        // this node is 10.0.0.1 and pid 1000 is gone
        let a = agent(&store, &[20000], FakeInspector::with(&[(1001, "dbbackup spiderbackup run --backup-id cluster1")]));
        assert_eq!(a.reconcile(Local::now()).await.unwrap(), 1);

        for r in store.snapshot() {
            if r.host == HOST {
                assert_eq!(r.status, TaskStatus::failed(REASON_NO_PID));
            } else {
                assert_eq!(r.status, TaskStatus::Running, "{}", r.host);
            }
        }
    }

    #[tokio::test]
    async fn test_reconcile_reasons() {
        let mut overdue = row("old", HOST, 20002, TaskStatus::Running, 3003, 0);
        overdue.updated_at = Local::now() - ChronoDuration::hours(49);
        let store = Arc::new(MemoryStore::with_rows(vec![
            row("nopid", HOST, 20000, TaskStatus::Running, 0, 1),
            row("reused", HOST, 20001, TaskStatus::Running, 2002, 1),
            overdue,
            row("healthy", HOST, 20003, TaskStatus::Running, 4004, 1),
        ]));
        let inspector = FakeInspector::with(&[
            (2002, "/usr/sbin/sshd -D"),
            (3003, "dbbackup spiderbackup run --backup-id old"),
            (4004, "dbbackup spiderbackup run --backup-id healthy"),
        ]);
        let a = agent(&store, &[20000, 20001, 20002, 20003], inspector);
        assert_eq!(a.reconcile(Local::now()).await.unwrap(), 3);

        let status = |id: &str| store.snapshot().into_iter().find(|r| r.backup_id == id).unwrap().status;
        assert_eq!(status("nopid"), TaskStatus::failed(REASON_NO_PID));
        assert_eq!(status("reused"), TaskStatus::failed(REASON_PID_MISMATCH));
        assert_eq!(status("old"), TaskStatus::failed(REASON_TOO_LONG));
        assert_eq!(status("healthy"), TaskStatus::Running);
        assert_eq!(*a.inspector.killed.lock().unwrap(), vec![3003]);
    }

    #[tokio::test]
    async fn test_quit_kills_process_group() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            row("live", HOST, 20000, TaskStatus::quit(""), 5005, 1),
            row("never_started", HOST, 20001, TaskStatus::quit("by operator"), 0, 1),
            row("handled", HOST, 20002, TaskStatus::quit(QUIT_KILLED), 6006, 1),
        ]));
        let inspector = FakeInspector::with(&[(5005, "dbbackup spiderbackup run --backup-id live")]);
        let a = agent(&store, &[20000, 20001, 20002], inspector);
        assert_eq!(a.enforce_quit(Local::now()).await.unwrap(), 2);
        assert_eq!(*a.inspector.killed.lock().unwrap(), vec![5005]);

        let status = |id: &str| store.snapshot().into_iter().find(|r| r.backup_id == id).unwrap().status;
        assert_eq!(status("live"), TaskStatus::quit(QUIT_KILLED));
        assert_eq!(status("never_started"), TaskStatus::quit(QUIT_CANCELLED));
        assert_eq!(status("handled"), TaskStatus::quit(QUIT_KILLED));
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            row("ancient", HOST, 20000, TaskStatus::Success, 0, 60 * 24 * 8),
            row("recent", HOST, 20000, TaskStatus::Success, 0, 60),
        ]));
        let a = agent(&store, &[20000, 20001], FakeInspector::default());
        assert_eq!(a.purge(Local::now()).await.unwrap(), 1);
        let left: Vec<String> = store.snapshot().into_iter().map(|r| r.backup_id).collect();
        assert_eq!(left, vec!["recent"]);
    }
}

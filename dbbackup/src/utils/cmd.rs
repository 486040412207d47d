//! External tool execution.
//!
//! Every capture/replay tool runs in its own process group with its combined
//! output appended to a weekday-rotated log file. A deadline, when set, kills
//! the whole group.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Datelike, Local};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bytes of tool output attached to an error.
const ERROR_TAIL_BYTES: u64 = 4096;

/// Log files older than this are truncated before reuse.
const LOG_ROTATE_AGE: Duration = Duration::from_secs(24 * 3600);

/// `<dir>/<tool>_<port>_<weekday>.log`, weekday counted from Sunday = 0.
pub fn weekday_log_path(dir: &Path, tool: &str, port: u16, now: DateTime<Local>) -> PathBuf {
    let weekday = now.weekday().num_days_from_sunday();
    dir.join(format!("{}_{}_{}.log", tool, port, weekday))
}

/// Open a weekday log for appending, truncating it first if it still holds last week's run.
pub fn open_rotated_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let stale = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .map(|age| age > LOG_ROTATE_AGE)
            .unwrap_or(false),
        Err(_) => false,
    };

    let mut options = OpenOptions::new();
    options.create(true);
    if stale {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path)
}

/// Read at most the last `max` bytes of a file, lossily decoded.
pub fn read_tail(path: &Path, max: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > max {
        let _ = file.seek(SeekFrom::Start(len - max));
    }
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Read `reader` to EOF keeping only the last `max` bytes. Piped output
/// must be drained while the child runs or a full pipe blocks it.
async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > max {
                    tail.drain(..tail.len() - max);
                }
            }
        }
    }
    tail
}

/// Hide credentials in a rendered command line.
pub fn mask_password(arg: &str) -> String {
    for prefix in ["--password=", "--passwd=", "--encrypt-key=", "-pass=", "pass:"] {
        if let Some(pos) = arg.find(prefix) {
            return format!("{}{}xxxx", &arg[..pos], prefix);
        }
    }
    if arg.starts_with("-p") && arg.len() > 2 && !arg.starts_with("--") {
        return "-pxxxx".to_string();
    }
    arg.to_string()
}

/// One invocation of an external tool.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    stdin_file: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    deadline: Option<DateTime<Local>>,
}

impl ExternalCommand {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdin_file: None,
            stdout_file: None,
            log_file: None,
            deadline: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Feed a file to the tool's stdin.
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Send stdout to a file; stderr still goes to the log.
    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn deadline(mut self, deadline: Option<DateTime<Local>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Command line with credentials masked, for logging.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| mask_password(a)));
        parts.join(" ")
    }

    fn build(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        match &self.stdin_file {
            Some(path) => {
                cmd.stdin(Stdio::from(File::open(path)?));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        let log = match &self.log_file {
            Some(path) => Some(open_rotated_log(path)?),
            None => None,
        };

        match (&self.stdout_file, &log) {
            (Some(out), _) => {
                cmd.stdout(Stdio::from(File::create(out)?));
            }
            (None, Some(file)) => {
                cmd.stdout(Stdio::from(file.try_clone()?));
            }
            (None, None) => {
                cmd.stdout(Stdio::piped());
            }
        }
        match log {
            Some(file) => {
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stderr(Stdio::piped());
            }
        }
        Ok(cmd)
    }

    /// Run to completion. Non-zero exit and deadline expiry are hard failures.
    pub async fn run(&self) -> Result<()> {
        info!(tool = %self.tool, "Running: {}", self.display());
        let mut child = self.build()?.spawn().map_err(|e| BackupError::ExternalTool {
            tool: self.tool.clone(),
            status: "spawn".to_string(),
            output: format!("{}: {}", self.program.display(), e),
        })?;
        let stdout_drain: Option<JoinHandle<Vec<u8>>> =
            child.stdout.take().map(|out| tokio::spawn(drain_tail(out, 0)));
        let stderr_drain: Option<JoinHandle<Vec<u8>>> = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_tail(err, ERROR_TAIL_BYTES as usize)));

        let status = match self.deadline {
            Some(deadline) => {
                let budget = (deadline - Local::now()).to_std().unwrap_or(Duration::ZERO);
                match tokio::time::timeout(budget, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(tool = %self.tool, %deadline, "Deadline reached, killing process group");
                        if let Some(pid) = child.id() {
                            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                                warn!(tool = %self.tool, "killpg failed: {}", e);
                            }
                        }
                        let _ = child.wait().await;
                        return Err(BackupError::DeadlineExceeded {
                            tool: self.tool.clone(),
                            deadline: deadline.format("%Y-%m-%d %H:%M:%S").to_string(),
                        });
                    }
                }
            }
            None => child.wait().await?,
        };

        if let Some(drain) = stdout_drain {
            let _ = drain.await;
        }
        let captured = match stderr_drain {
            Some(drain) => drain.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if status.success() {
            return Ok(());
        }

        let output = match &self.log_file {
            Some(path) => read_tail(path, ERROR_TAIL_BYTES),
            None => String::from_utf8_lossy(&captured).trim().to_string(),
        };
        error!(tool = %self.tool, %status, "External tool failed");
        Err(BackupError::ExternalTool {
            tool: self.tool.clone(),
            status: status.to_string(),
            output,
        })
    }

    /// Run and capture stdout. Meant for short version checks, not for capture tools.
    pub async fn output(&self) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        let out = cmd.output().await.map_err(|e| BackupError::ExternalTool {
            tool: self.tool.clone(),
            status: "spawn".to_string(),
            output: format!("{}: {}", self.program.display(), e),
        })?;
        if !out.status.success() {
            return Err(BackupError::ExternalTool {
                tool: self.tool.clone(),
                status: out.status.to_string(),
                output: format!(
                    "{}{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                ),
            });
        }
        // ldd prints its version banner on stderr on some distributions
        let mut text = String::from_utf8_lossy(&out.stdout).to_string();
        if text.trim().is_empty() {
            text = String::from_utf8_lossy(&out.stderr).to_string();
        }
        Ok(text)
    }
}

/// Locate a tool: explicit path first, then `<base_dir>/<name>`, then `$PATH`.
pub fn find_tool(name: &str, explicit: Option<&Path>, base_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(BackupError::validation(format!(
            "{} not found at {}",
            name,
            path.display()
        )));
    }
    if let Some(dir) = base_dir {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    which::which(name).map_err(|_| BackupError::validation(format!("{} not found in PATH", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_weekday_log_path() {
        // 2024-01-07 is a Sunday
        let now = Local.with_ymd_and_hms(2024, 1, 7, 10, 0, 0).unwrap();
        let path = weekday_log_path(Path::new("/logs"), "mydumper", 3306, now);
        assert_eq!(path, PathBuf::from("/logs/mydumper_3306_0.log"));

        let wed = Local.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
        let path = weekday_log_path(Path::new("/logs"), "xtrabackup", 20000, wed);
        assert_eq!(path, PathBuf::from("/logs/xtrabackup_20000_3.log"));
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(mask_password("--password=secret"), "--password=xxxx");
        assert_eq!(mask_password("-psecret"), "-pxxxx");
        assert_eq!(mask_password("pass:abc"), "pass:xxxx");
        assert_eq!(mask_password("--port=3306"), "--port=3306");
    }

    #[test]
    fn test_read_tail() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.log");
        let mut f = File::create(&path)?;
        f.write_all(b"0123456789")?;
        assert_eq!(read_tail(&path, 4), "6789");
        assert_eq!(read_tail(&path, 100), "0123456789");
        assert_eq!(read_tail(&dir.path().join("missing"), 4), "");
        Ok(())
    }

    #[test]
    fn test_open_rotated_log_appends_fresh_file() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sub").join("tool_3306_1.log");
        {
            let mut f = open_rotated_log(&path)?;
            f.write_all(b"first\n")?;
        }
        {
            let mut f = open_rotated_log(&path)?;
            f.write_all(b"second\n")?;
        }
        assert_eq!(std::fs::read_to_string(&path)?, "first\nsecond\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_failure_carries_log_tail() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("sh_1_0.log");
        let cmd = ExternalCommand::new("sh", "sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .log_to(&log);
        match cmd.run().await {
            Err(BackupError::ExternalTool { tool, output, .. }) => {
                assert_eq!(tool, "sh");
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_without_log_drains_chatty_output() {
        let cmd = ExternalCommand::new("sh", "sh")
            .args(["-c", "head -c 200000 /dev/zero; head -c 200000 /dev/zero >&2; exit 0"]);
        let result = tokio::time::timeout(Duration::from_secs(10), cmd.run()).await;
        assert!(matches!(result, Ok(Ok(()))), "{:?}", result);

        let cmd = ExternalCommand::new("sh", "sh").args([
            "-c",
            "head -c 200000 /dev/zero | tr '\\0' x >&2; echo boom >&2; exit 4",
        ]);
        match tokio::time::timeout(Duration::from_secs(10), cmd.run()).await {
            Ok(Err(BackupError::ExternalTool { output, .. })) => {
                assert!(output.ends_with("boom"), "{}", output);
                assert!(output.len() <= ERROR_TAIL_BYTES as usize);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_deadline_kills_process() {
        let dir = TempDir::new().unwrap();
        let cmd = ExternalCommand::new("sleep", "sleep")
            .arg("30")
            .log_to(dir.path().join("sleep.log"))
            .deadline(Some(Local::now() + chrono::Duration::milliseconds(200)));
        let started = std::time::Instant::now();
        let result = cmd.run().await;
        assert!(matches!(result, Err(BackupError::DeadlineExceeded { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

//! Local process inspection for reconciling `running` rows.

use crate::utils::errors::{BackupError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;

pub trait ProcessInspector: Send + Sync {
    /// Command line of `pid`, `None` if no such process exists.
    fn cmdline(&self, pid: i32) -> Option<String>;

    /// SIGKILL the process group led by `pid`.
    fn kill_group(&self, pid: i32) -> Result<()>;

    fn is_alive(&self, pid: i32) -> bool {
        self.cmdline(pid).is_some()
    }
}

/// Reads `/proc` and signals through nix.
#[derive(Debug, Clone)]
pub struct ProcInspector {
    proc_root: PathBuf,
}

impl Default for ProcInspector {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl ProcessInspector for ProcInspector {
    fn cmdline(&self, pid: i32) -> Option<String> {
        if pid <= 0 {
            return None;
        }
        match std::fs::read(self.proc_root.join(pid.to_string()).join("cmdline")) {
            Ok(raw) => Some(
                raw.split(|b| *b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            // hidepid mounts: fall back to signal 0
            Err(_) => kill(Pid::from_raw(pid), None).ok().map(|_| String::new()),
        }
    }

    fn kill_group(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(BackupError::validation(format!("refusing to signal pid {}", pid)));
        }
        killpg(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| BackupError::Process(format!("killpg {}: {}", pid, e)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cmdline_from_proc_layout() -> std::io::Result<()> {
        let root = TempDir::new()?;
        std::fs::create_dir_all(root.path().join("4242"))?;
        std::fs::write(
            root.path().join("4242/cmdline"),
            b"/usr/local/bin/dbbackup\0spiderbackup\0run\0--backup-id\0abc\0",
        )?;
        let inspector = ProcInspector {
            proc_root: root.path().to_path_buf(),
        };
        assert_eq!(
            inspector.cmdline(4242).as_deref(),
            Some("/usr/local/bin/dbbackup spiderbackup run --backup-id abc")
        );
        assert_eq!(inspector.cmdline(0), None);
        Ok(())
    }

    #[test]
    fn test_own_process_is_alive() {
        let me = std::process::id() as i32;
        assert!(ProcInspector::default().is_alive(me));
    }

    #[test]
    fn test_kill_group_rejects_non_positive_pid() {
        assert!(ProcInspector::default().kill_group(0).is_err());
    }
}

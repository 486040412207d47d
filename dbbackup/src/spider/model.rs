//! Rows of the cluster backup coordination table.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one shard's part of a cluster backup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Init,
    /// Same as `Init`, mirrored from the master-side task
    Replicated,
    Running,
    Success,
    Failed(String),
    /// Operator cancellation
    Quit(String),
    Unknown,
}

impl TaskStatus {
    /// Waiting to be claimed.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Init | TaskStatus::Replicated)
    }

    /// Still counts as outstanding work for a waiting scheduler.
    pub fn is_pending(&self) -> bool {
        self.is_runnable() || *self == TaskStatus::Running
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TaskStatus::Failed(reason.into())
    }

    pub fn quit(reason: impl Into<String>) -> Self {
        TaskStatus::Quit(reason.into())
    }
}

fn with_reason(f: &mut fmt::Formatter<'_>, word: &str, reason: &str) -> fmt::Result {
    if reason.is_empty() {
        f.write_str(word)
    } else {
        write!(f, "{}: {}", word, reason)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Init => f.write_str("init"),
            TaskStatus::Replicated => f.write_str("replicated"),
            TaskStatus::Running => f.write_str("running"),
            TaskStatus::Success => f.write_str("success"),
            TaskStatus::Failed(r) => with_reason(f, "failed", r),
            TaskStatus::Quit(r) => with_reason(f, "quit", r),
            TaskStatus::Unknown => f.write_str("unknown"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = Infallible;

    /// Anything unrecognised maps to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (word, reason) = match s.split_once(':') {
            Some((w, r)) => (w.trim(), r.trim()),
            None => (s, ""),
        };
        Ok(match word.to_ascii_lowercase().as_str() {
            "init" if reason.is_empty() => TaskStatus::Init,
            "replicated" if reason.is_empty() => TaskStatus::Replicated,
            "running" if reason.is_empty() => TaskStatus::Running,
            "success" if reason.is_empty() => TaskStatus::Success,
            "failed" => TaskStatus::Failed(reason.to_string()),
            "quit" => TaskStatus::Quit(reason.to_string()),
            _ => TaskStatus::Unknown,
        })
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(raw.parse().unwrap_or(TaskStatus::Unknown))
    }
}

/// Role of a server entry in the routing layer's `mysql.servers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Wrapper {
    #[serde(rename = "mysql")]
    Mysql,
    #[serde(rename = "mysql_slave")]
    MysqlSlave,
    #[serde(rename = "SPIDER")]
    Spider,
}

impl Wrapper {
    pub fn as_str(&self) -> &'static str {
        match self {
            Wrapper::Mysql => "mysql",
            Wrapper::MysqlSlave => "mysql_slave",
            Wrapper::Spider => "SPIDER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "mysql" => Some(Wrapper::Mysql),
            "mysql_slave" => Some(Wrapper::MysqlSlave),
            s if s.eq_ignore_ascii_case("spider") => Some(Wrapper::Spider),
            _ => None,
        }
    }

    /// Status a freshly scheduled row for this server starts in.
    pub fn initial_status(&self) -> TaskStatus {
        match self {
            Wrapper::MysqlSlave => TaskStatus::Replicated,
            _ => TaskStatus::Init,
        }
    }
}

impl fmt::Display for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a coordination row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub backup_id: String,
    pub host: String,
    pub port: u16,
    pub shard_value: i32,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}#{}", self.backup_id, self.host, self.port, self.shard_value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalBackupModel {
    pub backup_id: String,
    pub host: String,
    pub port: u16,
    pub shard_value: i32,
    pub server_name: String,
    pub wrapper: Wrapper,
    pub status: TaskStatus,
    /// Owning process, 0 before the row is claimed
    pub pid: i32,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl GlobalBackupModel {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            backup_id: self.backup_id.clone(),
            host: self.host.clone(),
            port: self.port,
            shard_value: self.shard_value,
        }
    }
}

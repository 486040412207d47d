use chrono::{DateTime, Local};

#[derive(thiserror::Error, Debug)]
pub enum RollbackError {
    /// Bad configuration, found before connecting.
    #[error("{0}")]
    Validation(String),

    /// The instance or its binlogs cannot be safely flashed back.
    #[error("precheck failed: {0}")]
    Precheck(String),

    #[error("no candidate binlog files cover {start} .. {stop}")]
    NoCandidateBinlogs {
        start: DateTime<Local>,
        stop: DateTime<Local>,
    },

    /// A step was run out of order.
    #[error("cannot {action} in state {state}")]
    State { action: &'static str, state: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Decoder and client failures, carrying the tool's output tail.
    #[error(transparent)]
    Backup(#[from] dbbackup::BackupError),
}

impl RollbackError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RollbackError::Validation(msg.into())
    }

    pub fn precheck(msg: impl Into<String>) -> Self {
        RollbackError::Precheck(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RollbackError>;

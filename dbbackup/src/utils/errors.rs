//! Error types for backup, restore and coordination.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Bad configuration, detected before the database or filesystem is touched.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An external tool exited non-zero. `output` carries the tail of its log.
    #[error("{tool} failed ({status}): {output}")]
    ExternalTool {
        tool: String,
        status: String,
        output: String,
    },

    #[error("{tool} killed at deadline {deadline}")]
    DeadlineExceeded { tool: String, deadline: String },

    /// Archive content does not match its manifest.
    #[error("Consistency check failed: {0}")]
    Consistency(String),

    /// A coordination or audit table is missing or has drifted, after one repair attempt.
    #[error("Schema drift on {table}: {message}")]
    SchemaDrift { table: String, message: String },

    #[error("Metadata parse error: {0}")]
    Metadata(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl BackupError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BackupError::Validation(msg.into())
    }

    /// True for MySQL "table doesn't exist" / "unknown column" errors.
    pub fn is_schema_drift(&self) -> bool {
        match self {
            BackupError::Database(e) => crate::utils::mysqlconn::is_schema_drift(e),
            BackupError::SchemaDrift { .. } => true,
            _ => false,
        }
    }
}

impl From<walkdir::Error> for BackupError {
    fn from(e: walkdir::Error) -> Self {
        BackupError::Io(e.into())
    }
}

impl From<nix::errno::Errno> for BackupError {
    fn from(e: nix::errno::Errno) -> Self {
        BackupError::Process(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

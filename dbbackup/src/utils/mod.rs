//! Utility modules shared across the backup engine.

pub mod cmd;
pub mod deadline;
pub mod errors;
pub mod glibc;
pub mod logger;
pub mod mysqlconn;
pub mod ratelimit;

pub use errors::{BackupError, Result};

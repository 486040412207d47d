//! Backup and restore engine for MySQL-compatible instances.
//!
//! Logical (mydumper/mysqldump) and physical (xtrabackup/myrocks) captures
//! are packaged into size-bounded tar parts described by a JSON `.index`
//! manifest. Sharded clusters coordinate per-shard backups through the
//! `spider` module.

pub mod config;
pub mod daemon;
pub mod dumper;
pub mod fs;
pub mod index;
pub mod loader;
pub mod migrate;
pub mod packager;
pub mod report;
pub mod spider;
pub mod utils;

pub use config::BackupConfig;
pub use index::IndexContent;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;

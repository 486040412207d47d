//! Point-in-time flashback: undo writes in a time window by decoding the
//! binlogs with inverted row events and replaying the result.

pub mod binlog;
pub mod config;
pub mod error;
pub mod filter;
pub mod flashback;
pub mod precheck;

pub use config::FlashbackConfig;
pub use error::{Result, RollbackError};
pub use flashback::{Flashback, Stage};

//! kwatch Daemon Library
//!
//! Configuration, event reporting and metrics around the kwatch dispatcher

pub mod config;
pub mod daemon;
pub mod metrics;
pub mod report;

pub use config::{ConfigManager, DaemonConfig};
pub use daemon::{merge_paths, require_paths, Daemon};
pub use report::{EventReport, OutputFormat};

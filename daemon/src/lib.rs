//! Process table snapshots with per-process memory tracking.

pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod monitor;
pub mod priority;
pub mod protocol;
pub mod session;
pub mod socket;

pub use error::{ErrorKind, ProcessError};
pub use monitor::{MonitorEvent, MonitorSettings, ProcessMonitor};

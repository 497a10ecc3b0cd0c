//! I/O helpers for engine commands.

pub mod config;
pub mod job_log;
pub mod job_store;
pub mod lock;
pub mod process;
pub mod transfer;
pub mod unknown_capture;

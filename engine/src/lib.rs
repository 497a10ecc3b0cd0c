//! Retrying transfer job engine.
//!
//! Runs object-storage transfer jobs (sync, copy, move) through an external
//! transfer tool and turns the tool's provider-specific failures into a stable
//! error taxonomy that drives retry and recovery. The architecture follows a
//! strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, backoff, state
//!   machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (lock file, job records, job logs,
//!   subprocess execution). Isolated behind small seams so tests can script
//!   them.
//!
//! Orchestration modules ([`runner`], [`retention`], [`serve`], [`status`])
//! coordinate core logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retention;
pub mod runner;
pub mod serve;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests. Randomness
//! (retry jitter) is injected by the caller.

pub mod backoff;
pub mod classifier;
pub mod retry_hint;
pub mod state;
pub mod types;

//! Deterministic TCP load generator.
//!
//! Opens N long-lived sessions, runs a binary login prelude on each, then
//! emits a cyclic main flow on timerfd-paced, minute-aligned schedules while
//! a single receiver demultiplexes and validates every response. The
//! protocol engine itself lives in the `wire` crate.
pub mod args;
pub mod cadence;
pub mod config;
pub mod logging;
pub mod receiver;
pub mod sched;
pub mod sender;
pub mod sock;

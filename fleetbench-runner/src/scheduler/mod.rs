//! Scheduler module
//!
//! Drives the claim loop and task lifecycle.

mod worker;

pub use worker::TaskWorker;

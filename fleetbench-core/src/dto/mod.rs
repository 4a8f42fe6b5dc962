//! Data Transfer Objects for the orchestrator HTTP API
//!
//! Request bodies accept the loose shapes runners and operators send and
//! are resolved into typed values once, at the API boundary.

pub mod run;
pub mod task;

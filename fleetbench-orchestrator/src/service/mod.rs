//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services run every state transition through the [`crate::repository::Store`]
//! and hand finished runs to the result collector.

pub mod claim;
pub mod collector;
pub mod error;
pub mod finalizer;
pub mod monitor;
pub mod run;
pub mod task;

pub use error::{EngineError, EngineResult};

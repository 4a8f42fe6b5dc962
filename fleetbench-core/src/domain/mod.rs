//! Core domain types
//!
//! A [`run::Run`] is one benchmark batch; it exclusively owns its
//! [`task::Task`]s, one per provider x instance type x replica.

pub mod run;
pub mod task;

/// Error returned when parsing a status or enum-like string fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

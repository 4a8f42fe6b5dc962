//! Service layer
//!
//! Benchmark execution, progress reporting and artifact packaging for a
//! claimed task. Execution sits behind a trait so the worker can be driven
//! by other benchmark implementations.

pub mod benchmark;
pub mod heartbeat;
pub mod packager;

// Re-export traits
pub use benchmark::BenchmarkService;

// Re-export implementations
pub use benchmark::ShellBenchmarkService;
pub use heartbeat::{Heartbeat, ProgressReporter};

//! Task domain types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseEnumError;

/// One unit of work: a single replica of a provider + instance type in a run
///
/// `runner_id`, `claimed_at` and `heartbeat_at` are set exactly when a
/// runner has claimed the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub run_id: i64,
    pub provider: Provider,
    pub instance_type: String,
    pub instance_type_alias: Option<String>,
    pub run_number: i32,
    pub status: TaskStatus,
    pub runner_id: Option<String>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub heartbeat_status: Option<HeartbeatPhase>,
    pub heartbeat_message: Option<String>,
    pub current_benchmark: Option<String>,
    pub progress_pct: Option<i32>,
    pub result_key: Option<String>,
    pub error_key: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Name used for this task's directory in the combined results archive
    pub fn instance_identifier(&self) -> &str {
        self.instance_type_alias
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .unwrap_or(&self.instance_type)
    }

    pub fn is_owned_by(&self, runner_id: &str) -> bool {
        self.runner_id.as_deref() == Some(runner_id)
    }
}

/// Task lifecycle status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses in which the task still needs work
    pub const INCOMPLETE: [TaskStatus; 3] =
        [TaskStatus::Pending, TaskStatus::Claimed, TaskStatus::Running];

    /// Statuses in which a runner owns the task
    pub const IN_PROGRESS: [TaskStatus; 2] = [TaskStatus::Claimed, TaskStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(ParseEnumError::new("task status", s)),
        }
    }
}

/// Phase reported by a runner in its heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatPhase {
    Boot,
    Provision,
    Running,
    Uploading,
    Finished,
    Error,
}

impl HeartbeatPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatPhase::Boot => "boot",
            HeartbeatPhase::Provision => "provision",
            HeartbeatPhase::Running => "running",
            HeartbeatPhase::Uploading => "uploading",
            HeartbeatPhase::Finished => "finished",
            HeartbeatPhase::Error => "error",
        }
    }
}

impl fmt::Display for HeartbeatPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeartbeatPhase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boot" => Ok(HeartbeatPhase::Boot),
            "provision" => Ok(HeartbeatPhase::Provision),
            "running" => Ok(HeartbeatPhase::Running),
            "uploading" => Ok(HeartbeatPhase::Uploading),
            "finished" => Ok(HeartbeatPhase::Finished),
            "error" => Ok(HeartbeatPhase::Error),
            _ => Err(ParseEnumError::new("heartbeat phase", s)),
        }
    }
}

/// Infrastructure provider an instance type belongs to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Local,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Local => "local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "local" => Ok(Provider::Local),
            _ => Err(ParseEnumError::new("provider", s)),
        }
    }
}

//! Run DTOs

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::run::Run;
use crate::domain::task::{Provider, Task, TaskStatus};

/// Request to create a run and its tasks
///
/// Each provider array holds either plain instance type strings or
/// `{instance_type, alias}` objects. The task count can be given as
/// `tasks_per_instance_type` or nested as `per_instance_type.tasks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRun {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_id: Option<String>,
    #[serde(default)]
    pub ruby_version: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub tasks_per_instance_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_instance_type: Option<PerInstanceType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aws: Vec<InstanceTypeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azure: Vec<InstanceTypeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local: Vec<InstanceTypeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerInstanceType {
    #[serde(default, deserialize_with = "deserialize_opt_count")]
    pub tasks: Option<i32>,
}

/// Instance type as supplied by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceTypeSpec {
    Plain(String),
    Detailed {
        instance_type: String,
        #[serde(default)]
        alias: Option<String>,
    },
}

/// Instance type resolved against its provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTypeRequest {
    pub provider: Provider,
    pub instance_type: String,
    pub alias: Option<String>,
}

impl CreateRun {
    /// Effective task count per instance type, top-level field first
    pub fn tasks_per_instance_type(&self) -> Option<i32> {
        self.tasks_per_instance_type
            .or_else(|| self.per_instance_type.as_ref().and_then(|p| p.tasks))
    }

    /// All requested instance types in provider order (aws, azure, local)
    ///
    /// A plain string uses the instance type itself as alias.
    pub fn instance_types(&self) -> Vec<InstanceTypeRequest> {
        let groups = [
            (Provider::Aws, &self.aws),
            (Provider::Azure, &self.azure),
            (Provider::Local, &self.local),
        ];

        groups
            .into_iter()
            .flat_map(|(provider, specs)| {
                specs.iter().map(move |spec| match spec {
                    InstanceTypeSpec::Plain(name) => InstanceTypeRequest {
                        provider,
                        instance_type: name.clone(),
                        alias: Some(name.clone()),
                    },
                    InstanceTypeSpec::Detailed {
                        instance_type,
                        alias,
                    } => InstanceTypeRequest {
                        provider,
                        instance_type: instance_type.clone(),
                        alias: alias.clone(),
                    },
                })
            })
            .collect()
    }
}

/// Response to a successful run creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreated {
    pub run: Run,
    pub tasks: Vec<Task>,
}

/// Current state of a run with task counts grouped by status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run: Run,
    pub tasks_by_status: BTreeMap<TaskStatus, i64>,
    pub total_tasks: i64,
}

impl RunStatusReport {
    pub fn new(run: Run, tasks_by_status: BTreeMap<TaskStatus, i64>) -> Self {
        let total_tasks = tasks_by_status.values().sum();
        Self {
            run,
            tasks_by_status,
            total_tasks,
        }
    }

    pub fn count(&self, status: TaskStatus) -> i64 {
        self.tasks_by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Response to a stop request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStopped {
    pub run: Run,
    pub cancelled_tasks: u64,
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(RawId::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Task counts arrive as numbers or as numeric strings from form-style clients
fn deserialize_opt_count<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawCount {
        Number(i32),
        Text(String),
    }

    match Option::<RawCount>::deserialize(deserializer)? {
        Some(RawCount::Number(n)) => Ok(Some(n)),
        Some(RawCount::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawCount::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid task count: {s:?}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mixed_instance_type_shapes() {
        let req: CreateRun = serde_json::from_value(json!({
            "ruby_version": "3.4.1",
            "tasks_per_instance_type": 2,
            "aws": ["c8g.medium", {"instance_type": "c7i.large", "alias": "intel"}],
            "local": [{"instance_type": "docker"}]
        }))
        .unwrap();

        let types = req.instance_types();
        assert_eq!(types.len(), 3);
        assert_eq!(
            types[0],
            InstanceTypeRequest {
                provider: Provider::Aws,
                instance_type: "c8g.medium".to_string(),
                alias: Some("c8g.medium".to_string()),
            }
        );
        assert_eq!(types[1].alias.as_deref(), Some("intel"));
        assert_eq!(types[2].provider, Provider::Local);
        assert_eq!(types[2].alias, None);
    }

    #[test]
    fn test_nested_task_count() {
        let req: CreateRun = serde_json::from_value(json!({
            "ruby_version": "3.4.1",
            "per_instance_type": {"tasks": 5},
            "azure": ["Standard_D2pls_v5"]
        }))
        .unwrap();
        assert_eq!(req.tasks_per_instance_type(), Some(5));

        let req: CreateRun = serde_json::from_value(json!({
            "tasks_per_instance_type": 1,
            "per_instance_type": {"tasks": 5}
        }))
        .unwrap();
        assert_eq!(req.tasks_per_instance_type(), Some(1));
    }

    #[test]
    fn test_task_count_accepts_numeric_strings() {
        let req: CreateRun =
            serde_json::from_value(json!({"tasks_per_instance_type": "2"})).unwrap();
        assert_eq!(req.tasks_per_instance_type(), Some(2));

        let req: CreateRun =
            serde_json::from_value(json!({"per_instance_type": {"tasks": " 3 "}})).unwrap();
        assert_eq!(req.tasks_per_instance_type(), Some(3));

        let bad = serde_json::from_value::<CreateRun>(json!({"tasks_per_instance_type": "two"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_run_id_accepts_numbers_and_ignores_blank() {
        let req: CreateRun = serde_json::from_value(json!({"run_id": 1736942400123_i64})).unwrap();
        assert_eq!(req.run_id.as_deref(), Some("1736942400123"));

        let req: CreateRun = serde_json::from_value(json!({"run_id": "  "})).unwrap();
        assert_eq!(req.run_id, None);

        let req: CreateRun = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.run_id, None);
        assert!(req.instance_types().is_empty());
    }
}

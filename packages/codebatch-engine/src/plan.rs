//! Plan and pipeline model
//!
//! A batch owns a `plan.json`: an ordered task array whose `deps` reference
//! only earlier entries, so topological order is validated by construction.
//! Pipelines are named bundles that expand to a plan template.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};
use crate::executors::registry;

pub const PLAN_SCHEMA_NAME: &str = "codebatch.plan";
pub const PLAN_SCHEMA_VERSION: u32 = 1;

/// Deterministic partitioning of a task's file set.
///
/// A file belongs to the shard named by the first `hex_prefix_len` hex chars
/// of `SHA-256(path_key)`; the default of 2 yields 256 shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStrategy {
    #[serde(default = "default_prefix_len")]
    pub hex_prefix_len: u8,
}

fn default_prefix_len() -> u8 {
    2
}

impl Default for ShardStrategy {
    fn default() -> Self {
        Self { hex_prefix_len: 2 }
    }
}

impl ShardStrategy {
    pub fn new(hex_prefix_len: u8) -> Result<Self> {
        if !(1..=2).contains(&hex_prefix_len) {
            return Err(EngineError::plan(format!(
                "hex_prefix_len must be 1 or 2, got {hex_prefix_len}"
            )));
        }
        Ok(Self { hex_prefix_len })
    }

    pub fn shard_count(&self) -> usize {
        16usize.pow(u32::from(self.hex_prefix_len))
    }

    /// Shard id owning a `path_key`
    pub fn shard_of(&self, path_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path_key.as_bytes());
        let digest = hasher.finalize();
        let hex = format!("{:02x}", digest[0]);
        hex[..usize::from(self.hex_prefix_len)].to_string()
    }

    /// All shard ids in ascending order
    pub fn all_shard_ids(&self) -> Vec<String> {
        let len = usize::from(self.hex_prefix_len);
        (0..self.shard_count())
            .map(|n| format!("{:0width$x}", n, width = len))
            .collect()
    }

    pub fn is_valid_shard_id(&self, shard_id: &str) -> bool {
        shard_id.len() == usize::from(self.hex_prefix_len)
            && shard_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, deps: &[&str]) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            deps: deps.iter().map(|d| (*d).to_string()).collect(),
            config: serde_json::Value::Null,
        }
    }
}

/// `plan.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub schema_name: String,
    pub schema_version: u32,
    pub pipeline: String,
    #[serde(default)]
    pub shard: ShardStrategy,
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn new(pipeline: impl Into<String>, shard: ShardStrategy, tasks: Vec<TaskSpec>) -> Self {
        Self {
            schema_name: PLAN_SCHEMA_NAME.to_string(),
            schema_version: PLAN_SCHEMA_VERSION,
            pipeline: pipeline.into(),
            shard,
            tasks,
        }
    }

    /// Materialize the plan template for a named pipeline.
    pub fn for_pipeline(name: &str, shard: ShardStrategy) -> Result<Self> {
        let tasks = match name {
            "full" => vec![
                TaskSpec::new("parse", "parse", &[]),
                TaskSpec::new("analyze", "analyze", &["parse"]),
                TaskSpec::new("symbols", "symbols", &["parse"]),
                TaskSpec::new("lint", "lint", &["parse"]),
            ],
            "parse" => vec![TaskSpec::new("parse", "parse", &[])],
            "lint" => vec![
                TaskSpec::new("parse", "parse", &[]),
                TaskSpec::new("lint", "lint", &["parse"]),
            ],
            _ => {
                return Err(EngineError::plan(format!("unknown pipeline: {name:?}")));
            }
        };
        let plan = Self::new(name, shard, tasks);
        plan.validate()?;
        Ok(plan)
    }

    /// Validate id uniqueness, backward-referencing deps, and registered
    /// executor types.
    pub fn validate(&self) -> Result<()> {
        let mut earlier: Vec<&str> = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(EngineError::plan("task with empty id"));
            }
            if earlier.contains(&task.id.as_str()) {
                return Err(EngineError::plan(format!("duplicate task id {:?}", task.id)));
            }
            for dep in &task.deps {
                if dep == &task.id {
                    return Err(EngineError::plan(format!(
                        "task {:?} depends on itself",
                        task.id
                    )));
                }
                if !earlier.contains(&dep.as_str()) {
                    return Err(EngineError::plan(format!(
                        "task {:?} references dep {:?} which is not an earlier task",
                        task.id, dep
                    )));
                }
            }
            if !registry::is_registered(&task.task_type) {
                return Err(EngineError::plan(format!(
                    "task {:?} has unregistered type {:?}",
                    task.id, task.task_type
                )));
            }
            earlier.push(&task.id);
        }
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Result<&TaskSpec> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }
}

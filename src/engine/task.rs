//! # Task Configuration Module
//!
//! Declarative task definitions: type, children, completion strategy,
//! collection expansion settings and transitions, plus the structural
//! validation every expanded child must pass.

use crate::engine::error::{Result, TaskflowError};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Input key carrying a container's strategy on its state
pub const PARALLEL_CONFIG_KEY: &str = "_parallel_config";

/// The kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Basic,
    Parallel,
    Collection,
    Composite,
    Router,
    Wait,
    Aggregate,
    Signal,
    Memory,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Basic => "basic",
            TaskType::Parallel => "parallel",
            TaskType::Collection => "collection",
            TaskType::Composite => "composite",
            TaskType::Router => "router",
            TaskType::Wait => "wait",
            TaskType::Aggregate => "aggregate",
            TaskType::Signal => "signal",
            TaskType::Memory => "memory",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion policy of a container task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    /// Succeeds when every child succeeds, fails if any fails
    #[default]
    WaitAll,
    /// Fails on the first failed child
    FailFast,
    /// Succeeds on the first successful child
    Race,
}

impl ParallelStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParallelStrategy::WaitAll => "wait_all",
            ParallelStrategy::FailFast => "fail_fast",
            ParallelStrategy::Race => "race",
        }
    }
}

impl fmt::Display for ParallelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParallelStrategy {
    type Err = TaskflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wait_all" => Ok(ParallelStrategy::WaitAll),
            "fail_fast" => Ok(ParallelStrategy::FailFast),
            "race" => Ok(ParallelStrategy::Race),
            other => Err(TaskflowError::ValidationFailed(format!(
                "invalid parallel strategy: {other}"
            ))),
        }
    }
}

/// Execution mode of collection children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    #[default]
    Parallel,
    Sequential,
}

impl CollectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMode::Parallel => "parallel",
            CollectionMode::Sequential => "sequential",
        }
    }
}

/// Settings that drive collection expansion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Literal array, JSONLogic object or template string producing the items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    /// Per-item predicate; falsy results skip the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CollectionMode>,
    #[serde(default)]
    pub batch: usize,
}

/// Success or error transition of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,
}

impl Transition {
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            next: Some(next.into()),
            with: None,
        }
    }

    pub fn with_input(mut self, with: Map<String, Value>) -> Self {
        self.with = Some(with);
        self
    }
}

/// Signal emitted by a signal task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Declarative definition of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    /// Working directory the task resolves relative resources against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskConfig>,
    /// Template instantiated once per collection item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Box<TaskConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ParallelStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(flatten)]
    pub collection: CollectionConfig,
    /// Output mapping applied once the task has produced output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

impl TaskConfig {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type,
            ..Default::default()
        }
    }

    /// Parse a task config from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(TaskflowError::from)
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskConfig>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn strategy(&self) -> ParallelStrategy {
        self.strategy.unwrap_or_default()
    }

    /// Zero means unlimited
    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(0)
    }

    pub fn mode(&self) -> CollectionMode {
        self.collection.mode.unwrap_or_default()
    }

    /// `_parallel_config` payload stored on a container's state input
    pub fn parallel_config_input(&self) -> Value {
        json!({
            "strategy": self.strategy().as_str(),
            "max_workers": self.max_workers(),
        })
    }

    /// Fill in a missing working directory on this task and its descendants
    pub fn propagate_cwd(&mut self, parent_cwd: Option<&str>) {
        if self.cwd.is_none() {
            self.cwd = parent_cwd.map(str::to_string);
        }
        let own = self.cwd.clone();
        for child in &mut self.tasks {
            child.propagate_cwd(own.as_deref());
        }
        if let Some(template) = self.task.as_deref_mut() {
            template.propagate_cwd(own.as_deref());
        }
    }

    /// Structural validation by task type
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(invalid("task ID is required"));
        }
        if self.cwd.as_deref().is_none_or(str::is_empty) {
            return Err(invalid(format!(
                "current working directory is required for {}",
                self.id
            )));
        }

        match self.task_type {
            TaskType::Basic => Ok(()),
            TaskType::Parallel => self.validate_parallel(),
            TaskType::Collection => self.validate_collection(),
            TaskType::Composite => self.validate_children(),
            TaskType::Aggregate => self.validate_aggregate(),
            TaskType::Router => self.validate_router(),
            TaskType::Signal => self.validate_signal(),
            TaskType::Wait => self.validate_wait(),
            TaskType::Memory => self.forbid_action(),
        }
    }

    fn validate_parallel(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(invalid(format!(
                "parallel task {} must have at least one sub-task",
                self.id
            )));
        }
        self.validate_children()
    }

    fn validate_children(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, child) in self.tasks.iter().enumerate() {
            if !seen.insert(child.id.as_str()) {
                return Err(invalid(format!(
                    "duplicate task ID '{}' in {} task {}",
                    child.id, self.task_type, self.id
                )));
            }
            child.validate().map_err(|e| {
                invalid(format!("invalid sub-task at index {index} of {}: {e}", self.id))
            })?;
        }
        Ok(())
    }

    fn validate_collection(&self) -> Result<()> {
        match &self.collection.items {
            None | Some(Value::Null) => {
                return Err(invalid(format!(
                    "collection task {} requires an items expression",
                    self.id
                )));
            }
            Some(Value::String(raw)) if raw.trim().is_empty() => {
                return Err(invalid(format!(
                    "collection task {} requires an items expression",
                    self.id
                )));
            }
            _ => {}
        }
        if self.task.is_none() && self.tasks.is_empty() {
            return Err(invalid(format!(
                "collection task {} requires a task template",
                self.id
            )));
        }
        Ok(())
    }

    fn validate_aggregate(&self) -> Result<()> {
        if self.outputs.as_ref().is_none_or(Map::is_empty) {
            return Err(invalid(format!("aggregate task {} requires outputs", self.id)));
        }
        if self.with.is_some() {
            return Err(invalid(format!(
                "aggregate task {} cannot have a with input",
                self.id
            )));
        }
        self.forbid_action()
    }

    fn validate_router(&self) -> Result<()> {
        if self.condition.as_deref().is_none_or(str::is_empty) {
            return Err(invalid(format!("router task {} requires a condition", self.id)));
        }
        if self.routes.as_ref().is_none_or(Map::is_empty) {
            return Err(invalid(format!("router task {} requires routes", self.id)));
        }
        self.forbid_action()
    }

    fn validate_signal(&self) -> Result<()> {
        if self.signal.as_ref().is_none_or(|s| s.id.is_empty()) {
            return Err(invalid(format!("signal task {} requires signal.id", self.id)));
        }
        self.forbid_action()
    }

    fn validate_wait(&self) -> Result<()> {
        if self.wait_for.as_deref().is_none_or(str::is_empty) {
            return Err(invalid(format!("wait task {} requires wait_for", self.id)));
        }
        self.forbid_action()
    }

    fn forbid_action(&self) -> Result<()> {
        if self.action.is_some() {
            return Err(invalid(format!(
                "{} task {} cannot have an action",
                self.task_type, self.id
            )));
        }
        Ok(())
    }
}

/// Find a task definition by ID in a task list
pub fn find_config<'a>(tasks: &'a [TaskConfig], id: &str) -> Option<&'a TaskConfig> {
    tasks.iter().find(|task| task.id == id)
}

/// Typed view of the `_parallel_config` entry on a container's input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParallelConfigInput {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl ParallelConfigInput {
    /// Parse the entry from a state input; accepts an object or a JSON string
    pub fn from_input(input: Option<&Map<String, Value>>) -> Option<Self> {
        let raw = input?.get(PARALLEL_CONFIG_KEY)?;
        let parsed = match raw {
            Value::String(encoded) => serde_json::from_str::<Self>(encoded),
            other => serde_json::from_value::<Self>(other.clone()),
        };
        match parsed {
            Ok(config) => Some(config),
            Err(e) => {
                debug!("Ignoring malformed {}: {}", PARALLEL_CONFIG_KEY, e);
                None
            }
        }
    }

    /// Strategy from a state input, defaulting to wait_all
    pub fn strategy_from_input(input: Option<&Map<String, Value>>) -> ParallelStrategy {
        let Some(raw) = Self::from_input(input).and_then(|config| config.strategy) else {
            return ParallelStrategy::default();
        };
        match raw.parse::<ParallelStrategy>() {
            Ok(strategy) => strategy,
            Err(e) => {
                debug!("Falling back to wait_all strategy: {}", e);
                ParallelStrategy::default()
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> TaskflowError {
    TaskflowError::ValidationFailed(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(id: &str) -> TaskConfig {
        TaskConfig::new(id, TaskType::Basic).with_cwd("/work")
    }

    #[test]
    fn test_parse_collection_config() {
        let config = TaskConfig::from_json(
            r#"{
                "id": "process-items",
                "type": "collection",
                "items": "{{ workflow.input.items }}",
                "filter": "{{ item != 'skip' }}",
                "item_var": "entry",
                "mode": "sequential",
                "batch": 2,
                "task": { "id": "process-{{ index }}", "type": "basic" },
                "outputs": { "results": "{{ children }}" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.task_type, TaskType::Collection);
        assert_eq!(config.mode(), CollectionMode::Sequential);
        assert_eq!(config.collection.batch, 2);
        assert_eq!(config.collection.item_var.as_deref(), Some("entry"));
        assert!(config.task.is_some());
        assert!(config.outputs.is_some());
    }

    #[test]
    fn test_validate_requires_cwd() {
        let err = TaskConfig::new("no-cwd", TaskType::Basic).validate().unwrap_err();
        assert!(
            err.to_string()
                .contains("current working directory is required for no-cwd")
        );
    }

    #[test]
    fn test_validate_parallel_rules() {
        let empty = TaskConfig::new("p", TaskType::Parallel).with_cwd("/work");
        assert!(empty.validate().is_err());

        let duplicate = TaskConfig::new("p", TaskType::Parallel)
            .with_cwd("/work")
            .with_tasks(vec![basic("a"), basic("a")]);
        assert!(duplicate.validate().unwrap_err().to_string().contains("duplicate"));

        let ok = TaskConfig::new("p", TaskType::Parallel)
            .with_cwd("/work")
            .with_tasks(vec![basic("a"), basic("b")]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_type_specific_rules() {
        let mut aggregate = TaskConfig::new("agg", TaskType::Aggregate).with_cwd("/work");
        assert!(aggregate.validate().is_err());
        aggregate.outputs = Some(serde_json::from_value(json!({"total": 1})).unwrap());
        assert!(aggregate.validate().is_ok());
        aggregate.action = Some("run".to_string());
        assert!(aggregate.validate().is_err());

        let mut wait = TaskConfig::new("wait", TaskType::Wait).with_cwd("/work");
        assert!(wait.validate().is_err());
        wait.wait_for = Some("approval".to_string());
        assert!(wait.validate().is_ok());

        let mut signal = TaskConfig::new("sig", TaskType::Signal).with_cwd("/work");
        signal.signal = Some(SignalConfig::default());
        assert!(signal.validate().is_err());

        let mut router = TaskConfig::new("route", TaskType::Router).with_cwd("/work");
        router.condition = Some("{{ input.kind }}".to_string());
        assert!(router.validate().is_err());
    }

    #[test]
    fn test_propagate_cwd_is_recursive_and_keeps_explicit_values() {
        let mut parent = TaskConfig::new("p", TaskType::Parallel)
            .with_cwd("/parent")
            .with_tasks(vec![
                TaskConfig::new("a", TaskType::Composite)
                    .with_tasks(vec![TaskConfig::new("a1", TaskType::Basic)]),
                TaskConfig::new("b", TaskType::Basic).with_cwd("/own"),
            ]);
        parent.propagate_cwd(None);

        assert_eq!(parent.tasks[0].cwd.as_deref(), Some("/parent"));
        assert_eq!(parent.tasks[0].tasks[0].cwd.as_deref(), Some("/parent"));
        assert_eq!(parent.tasks[1].cwd.as_deref(), Some("/own"));
    }

    #[test]
    fn test_parallel_config_input_parsing() {
        let object: Map<String, Value> =
            serde_json::from_value(json!({"_parallel_config": {"strategy": "race"}})).unwrap();
        assert_eq!(
            ParallelConfigInput::strategy_from_input(Some(&object)),
            ParallelStrategy::Race
        );

        let encoded: Map<String, Value> = serde_json::from_value(
            json!({"_parallel_config": "{\"strategy\":\"fail_fast\",\"max_workers\":3}"}),
        )
        .unwrap();
        let parsed = ParallelConfigInput::from_input(Some(&encoded)).unwrap();
        assert_eq!(parsed.max_workers, Some(3));
        assert_eq!(
            ParallelConfigInput::strategy_from_input(Some(&encoded)),
            ParallelStrategy::FailFast
        );

        let bogus: Map<String, Value> =
            serde_json::from_value(json!({"_parallel_config": {"strategy": "sometimes"}}))
                .unwrap();
        assert_eq!(
            ParallelConfigInput::strategy_from_input(Some(&bogus)),
            ParallelStrategy::WaitAll
        );
        assert_eq!(
            ParallelConfigInput::strategy_from_input(None),
            ParallelStrategy::WaitAll
        );
    }
}

use crate::engine::error::{Result, TaskflowError};
use crate::engine::state::{ExecId, StatusType, TaskState};
use crate::engine::task::{TaskConfig, find_config};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Static workflow definition: the task list and shared environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskConfig>) -> Self {
        Self {
            id: id.into(),
            tasks,
            ..Default::default()
        }
    }

    /// Parse a workflow from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(TaskflowError::from)
    }

    /// Route to the task named by the matching transition, if it exists
    pub fn determine_next_task(&self, task_config: &TaskConfig, success: bool) -> Option<TaskConfig> {
        let transition = if success {
            task_config.on_success.as_ref()
        } else {
            task_config.on_error.as_ref()
        };
        let next_id = transition?.next.as_deref().filter(|id| !id.is_empty())?;
        find_config(&self.tasks, next_id).cloned()
    }

    /// Task definitions keyed by ID
    pub fn task_configs(&self) -> HashMap<String, TaskConfig> {
        self.tasks
            .iter()
            .map(|task| (task.id.clone(), task.clone()))
            .collect()
    }
}

/// Runtime state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_exec_id: ExecId,
    #[serde(default)]
    pub status: StatusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    /// Task states of this execution keyed by task ID
    #[serde(default)]
    pub tasks: HashMap<String, TaskState>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, workflow_exec_id: ExecId) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_exec_id,
            status: StatusType::Running,
            input: None,
            output: None,
            tasks: HashMap::new(),
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = Some(input);
        self
    }
}

//! # Normalization Context Module
//!
//! Builds the variable maps templates are rendered against: workflow
//! state, sibling task states with their children, environment, the
//! current task's input and, for collection children, the item and index.

use crate::engine::state::{ExecId, TaskState};
use crate::engine::task::{CollectionConfig, TaskConfig};
use crate::engine::utils::{merge_into, object_or_null};
use crate::engine::workflow::{WorkflowConfig, WorkflowState};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

/// Nesting limit when expanding children of children
const MAX_CHILDREN_DEPTH: usize = 10;

/// Parent execution ID to the task IDs of its children
pub type ChildrenIndex = HashMap<ExecId, Vec<String>>;

/// Template variables for one normalization pass
#[derive(Debug, Clone, Default)]
pub struct NormalizationContext {
    pub variables: Map<String, Value>,
    pub children_index: ChildrenIndex,
}

impl NormalizationContext {
    /// Set or replace a variable
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn set_current_input(&mut self, input: Option<&Map<String, Value>>) {
        self.set("input", object_or_null(input));
    }

    /// Overlay task-level environment on the workflow environment
    pub fn merge_env(&mut self, env: Option<&Map<String, Value>>) {
        let mut merged = match self.variables.remove("env") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        merge_into(&mut merged, env);
        self.set("env", Value::Object(merged));
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.variables.clone())
    }
}

/// Assembles normalization contexts from workflow and task data
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder
    }

    /// Index child task IDs by their parent execution ID
    pub fn build_children_index(&self, workflow_state: &WorkflowState) -> ChildrenIndex {
        let mut index: ChildrenIndex = HashMap::new();
        for (task_id, state) in &workflow_state.tasks {
            if let Some(parent) = state.parent_state_id {
                index.entry(parent).or_default().push(task_id.clone());
            }
        }
        for children in index.values_mut() {
            children.sort();
        }
        index
    }

    /// Full context for normalizing a task's transitions or outputs
    pub fn build_context(
        &self,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
    ) -> NormalizationContext {
        let children_index = self.build_children_index(workflow_state);
        let task_configs = workflow_config.task_configs();

        let mut tasks = Map::new();
        for (task_id, state) in &workflow_state.tasks {
            tasks.insert(
                task_id.clone(),
                self.task_context(
                    task_id,
                    state,
                    workflow_state,
                    &children_index,
                    task_configs.get(task_id),
                    0,
                ),
            );
        }

        let mut ctx = NormalizationContext {
            variables: Map::new(),
            children_index,
        };
        ctx.set("workflow", workflow_value(workflow_state, workflow_config));
        ctx.set("tasks", Value::Object(tasks));
        ctx.set(
            "task",
            json!({
                "id": task_config.id,
                "type": task_config.task_type.as_str(),
                "with": object_or_null(task_config.with.as_ref()),
            }),
        );
        ctx.set_current_input(task_config.with.as_ref());
        ctx.merge_env(workflow_config.env.as_ref());
        ctx.merge_env(task_config.env.as_ref());
        ctx
    }

    /// Context a collection's items and filter are evaluated against
    pub fn build_collection_context(
        &self,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
    ) -> Value {
        let mut ctx = self.build_context(workflow_state, workflow_config, task_config);
        ctx.set(
            "collection",
            serde_json::to_value(&task_config.collection).unwrap_or(Value::Null),
        );
        ctx.to_value()
    }

    /// Per-item context exposing `item`, `index` and any custom names
    pub fn build_item_context(
        &self,
        base: &Value,
        collection: &CollectionConfig,
        item: &Value,
        index: usize,
    ) -> Value {
        let mut variables = match base {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        variables.insert("item".to_string(), item.clone());
        variables.insert("index".to_string(), json!(index));
        if let Some(name) = collection.item_var.as_deref().filter(|n| !n.is_empty()) {
            variables.insert(name.to_string(), item.clone());
        }
        if let Some(name) = collection.index_var.as_deref().filter(|n| !n.is_empty()) {
            variables.insert(name.to_string(), json!(index));
        }
        Value::Object(variables)
    }

    /// Children of a container state keyed by child task ID
    pub fn children_context(
        &self,
        parent: &TaskState,
        workflow_state: &WorkflowState,
        children_index: &ChildrenIndex,
    ) -> Value {
        self.children_value(parent, workflow_state, children_index, None, 0)
    }

    fn task_context(
        &self,
        task_id: &str,
        state: &TaskState,
        workflow_state: &WorkflowState,
        children_index: &ChildrenIndex,
        config: Option<&TaskConfig>,
        depth: usize,
    ) -> Value {
        let mut ctx = Map::new();
        ctx.insert("id".to_string(), json!(task_id));
        ctx.insert("input".to_string(), object_or_null(state.input.as_ref()));
        ctx.insert("output".to_string(), object_or_null(state.output.as_ref()));
        ctx.insert("status".to_string(), json!(state.status.as_str()));
        if let Some(error) = &state.error {
            ctx.insert(
                "error".to_string(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }
        if state.can_have_children() {
            ctx.insert(
                "children".to_string(),
                self.children_value(state, workflow_state, children_index, config, depth),
            );
        }
        if let Some(config) = config {
            ctx.insert("type".to_string(), json!(config.task_type.as_str()));
            ctx.insert("with".to_string(), object_or_null(config.with.as_ref()));
        }
        Value::Object(ctx)
    }

    fn children_value(
        &self,
        parent: &TaskState,
        workflow_state: &WorkflowState,
        children_index: &ChildrenIndex,
        parent_config: Option<&TaskConfig>,
        depth: usize,
    ) -> Value {
        let mut children = Map::new();
        if depth >= MAX_CHILDREN_DEPTH {
            return Value::Object(children);
        }
        let Some(child_ids) = children_index.get(&parent.task_exec_id) else {
            return Value::Object(children);
        };
        for child_id in child_ids {
            let Some(child) = workflow_state.tasks.get(child_id) else {
                continue;
            };
            let child_config = parent_config
                .and_then(|config| config.tasks.iter().find(|task| &task.id == child_id));
            children.insert(
                child_id.clone(),
                self.task_context(
                    child_id,
                    child,
                    workflow_state,
                    children_index,
                    child_config,
                    depth + 1,
                ),
            );
        }
        Value::Object(children)
    }
}

fn workflow_value(workflow_state: &WorkflowState, workflow_config: &WorkflowConfig) -> Value {
    json!({
        "id": workflow_config.id,
        "exec_id": workflow_state.workflow_exec_id.to_string(),
        "status": workflow_state.status.as_str(),
        "input": object_or_null(workflow_state.input.as_ref()),
        "output": object_or_null(workflow_state.output.as_ref()),
    })
}

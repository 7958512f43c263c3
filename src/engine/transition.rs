//! # Transition Module
//!
//! Template normalization of a finished task's success/error transitions
//! and of its output mapping.

use crate::engine::config_manager::check_cancelled;
use crate::engine::context::{ContextBuilder, NormalizationContext};
use crate::engine::error::{Result, ResultExt, TaskflowError};
use crate::engine::repository::{TaskRepository, WorkflowRepository};
use crate::engine::state::{ExecutionType, TaskState};
use crate::engine::task::{TaskConfig, Transition};
use crate::engine::template::TemplateEngine;
use crate::engine::workflow::{WorkflowConfig, WorkflowState};
use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const COLLECTION_ITEM_KEY: &str = "_collection_item";
const COLLECTION_INDEX_KEY: &str = "_collection_index";
const COLLECTION_ITEM_VAR_KEY: &str = "_collection_item_var";
const COLLECTION_INDEX_VAR_KEY: &str = "_collection_index_var";
const COLLECTION_PREFIX: &str = "_collection_";

/// Rendered success and error transitions of one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTransitions {
    pub on_success: Option<Transition>,
    pub on_error: Option<Transition>,
}

/// Renders transition `with` payloads against the workflow context
pub struct TransitionNormalizer {
    templates: Arc<dyn TemplateEngine>,
    context_builder: ContextBuilder,
}

impl TransitionNormalizer {
    pub fn new(templates: Arc<dyn TemplateEngine>) -> Self {
        Self {
            templates,
            context_builder: ContextBuilder::new(),
        }
    }

    /// Normalize both transitions of `task_config` for a finished state
    ///
    /// The task's own input is the `input` variable. The config is never
    /// mutated; rendered payloads are fresh copies.
    pub fn normalize(
        &self,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
        task_state: &TaskState,
    ) -> Result<NormalizedTransitions> {
        let mut ctx = self
            .context_builder
            .build_context(workflow_state, workflow_config, task_config);
        ctx.set_current_input(task_state.input.as_ref());
        let ctx = ctx.to_value();

        let on_success = self
            .normalize_transition(task_config.on_success.as_ref(), &ctx)
            .context("failed to normalize success transition")?;
        let on_error = self
            .normalize_transition(task_config.on_error.as_ref(), &ctx)
            .context("failed to normalize error transition")?;
        Ok(NormalizedTransitions {
            on_success,
            on_error,
        })
    }

    fn normalize_transition(
        &self,
        transition: Option<&Transition>,
        ctx: &Value,
    ) -> Result<Option<Transition>> {
        let Some(transition) = transition else {
            return Ok(None);
        };
        let mut normalized = transition.clone();
        if let Some(with) = &transition.with {
            normalized.with = Some(self.templates.render_map(with, ctx)?);
        }
        Ok(Some(normalized))
    }
}

/// Applies a task's output mapping to its produced output
pub struct OutputTransformer {
    templates: Arc<dyn TemplateEngine>,
    context_builder: ContextBuilder,
    workflows: Arc<dyn WorkflowRepository>,
    tasks: Arc<dyn TaskRepository>,
}

impl OutputTransformer {
    pub fn new(
        templates: Arc<dyn TemplateEngine>,
        workflows: Arc<dyn WorkflowRepository>,
        tasks: Arc<dyn TaskRepository>,
    ) -> Self {
        Self {
            templates,
            context_builder: ContextBuilder::new(),
            workflows,
            tasks,
        }
    }

    /// Replace the state's output with the rendered output mapping
    ///
    /// Does nothing when the config has no `outputs` or the state no output.
    pub async fn transform(
        &self,
        cancel: &CancellationToken,
        state: &mut TaskState,
        task_config: &TaskConfig,
        workflow_config: &WorkflowConfig,
    ) -> Result<()> {
        let Some(outputs) = task_config.outputs.as_ref() else {
            return Ok(());
        };
        if state.output.is_none() {
            return Ok(());
        }
        check_cancelled(cancel, "output transformation")?;

        let workflow_state = self
            .workflows
            .get_state(state.workflow_exec_id)
            .await
            .context("failed to get workflow state for output transformation")?;
        let mut ctx = self
            .context_builder
            .build_context(&workflow_state, workflow_config, task_config);
        self.apply_collection_context(state, &mut ctx).await;

        ctx.set(
            "output",
            state.output.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        if state.can_have_children() {
            let children =
                self.context_builder
                    .children_context(state, &workflow_state, &ctx.children_index);
            ctx.set("children", children);
        }

        let rendered = self
            .templates
            .render_map(outputs, &ctx.to_value())
            .map_err(|e| {
                TaskflowError::TransformationFailed(e.to_string())
                    .context("failed to apply output transformation")
            })?;
        debug!(
            "Transformed output of {} into {} keys",
            state.task_id,
            rendered.len()
        );
        state.output = Some(rendered);
        Ok(())
    }

    /// Restore item/index variables for a child of a collection
    async fn apply_collection_context(&self, state: &TaskState, ctx: &mut NormalizationContext) {
        let (Some(parent_id), Some(input)) = (state.parent_state_id, state.input.as_ref()) else {
            return;
        };
        match self.tasks.get_state(parent_id).await {
            Ok(parent) if parent.execution_type == ExecutionType::Collection => {}
            _ => return,
        }
        debug!("Restoring collection context for child {}", state.task_id);
        restore_collection_variables(input, ctx);
    }
}

fn restore_collection_variables(input: &Map<String, Value>, ctx: &mut NormalizationContext) {
    if let Some(item) = input.get(COLLECTION_ITEM_KEY) {
        ctx.set("item", item.clone());
        if let Some(name) = custom_name(input, COLLECTION_ITEM_VAR_KEY) {
            ctx.set(name, item.clone());
        }
    }
    if let Some(index) = input.get(COLLECTION_INDEX_KEY) {
        ctx.set("index", index.clone());
        if let Some(name) = custom_name(input, COLLECTION_INDEX_VAR_KEY) {
            ctx.set(name, index.clone());
        }
    }
    for (key, value) in input {
        if !key.starts_with(COLLECTION_PREFIX) {
            ctx.set(key.clone(), value.clone());
        }
    }
}

fn custom_name<'a>(input: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
}

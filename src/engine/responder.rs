//! # Task Responder Module
//!
//! Turns the raw outcome of a task execution into a persisted final state
//! and a transition decision.
//!
//! ## Entry points
//!
//! * [`TaskResponder::handle_main_task`]: top-level tasks; also refreshes a
//!   parallel parent on a best-effort basis
//! * [`TaskResponder::handle_subtask`]: children of a container; parent
//!   aggregation is left to the container's own completion
//! * [`TaskResponder::handle_collection`] / [`TaskResponder::handle_parallel`]:
//!   containers, whose output mapping is deferred until every child has
//!   produced its data
//!
//! Cancellation observed while saving or refreshing the parent is a soft
//! stop: the response carries the state computed so far instead of an error.

use crate::engine::config_manager::check_cancelled;
use crate::engine::error::{ErrorInfo, Result, ResultExt, TaskflowError};
use crate::engine::parent_status::{ParentStatusUpdater, UpdateParentStatusInput};
use crate::engine::repository::{TaskRepository, WorkflowRepository};
use crate::engine::state::{ExecutionType, StatusType, TaskState};
use crate::engine::task::{ParallelConfigInput, TaskConfig, TaskType, Transition};
use crate::engine::template::{ExpressionEngine, TemplateEngine};
use crate::engine::transition::{NormalizedTransitions, OutputTransformer, TransitionNormalizer};
use crate::engine::workflow::WorkflowConfig;
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error code recorded on a task whose execution failed
pub const EXECUTION_ERROR_CODE: &str = "execution_error";
/// Error code recorded on a container whose deferred output mapping failed
pub const TRANSFORMATION_ERROR_CODE: &str = "transformation_error";

/// Outcome of a top-level task execution
#[derive(Debug, Clone)]
pub struct MainTaskResponseInput {
    pub workflow_config: WorkflowConfig,
    pub task_state: TaskState,
    pub task_config: TaskConfig,
    pub execution_error: Option<TaskflowError>,
    /// Takes precedence over the workflow's own routing
    pub next_task_override: Option<TaskConfig>,
}

impl MainTaskResponseInput {
    pub fn new(workflow_config: WorkflowConfig, task_state: TaskState, task_config: TaskConfig) -> Self {
        Self {
            workflow_config,
            task_state,
            task_config,
            execution_error: None,
            next_task_override: None,
        }
    }

    pub fn with_error(mut self, error: TaskflowError) -> Self {
        self.execution_error = Some(error);
        self
    }

    pub fn with_next_task(mut self, next_task: TaskConfig) -> Self {
        self.next_task_override = Some(next_task);
        self
    }
}

/// Outcome of a child task execution
#[derive(Debug, Clone)]
pub struct SubtaskResponseInput {
    pub workflow_config: WorkflowConfig,
    pub task_state: TaskState,
    pub task_config: TaskConfig,
    pub execution_error: Option<TaskflowError>,
}

/// Outcome of a collection task once all its children finished
#[derive(Debug, Clone)]
pub struct CollectionResponseInput {
    pub main: MainTaskResponseInput,
    pub item_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MainTaskResponse {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_task: Option<TaskConfig>,
}

impl MainTaskResponse {
    fn state_only(state: TaskState) -> Self {
        Self {
            state,
            on_success: None,
            on_error: None,
            next_task: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskResponse {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    pub status: StatusType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub state: TaskState,
}

impl SubtaskResponse {
    fn from_state(task_id: &str, state: TaskState) -> Self {
        Self {
            task_id: task_id.to_string(),
            output: state.output.clone(),
            status: state.status,
            error: state.error.clone(),
            state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionResponse {
    #[serde(flatten)]
    pub main: MainTaskResponse,
    pub item_count: usize,
    pub skipped_count: usize,
}

pub struct TaskResponder {
    tasks: Arc<dyn TaskRepository>,
    workflows: Arc<dyn WorkflowRepository>,
    parent_updater: ParentStatusUpdater,
    normalizer: TransitionNormalizer,
    transformer: OutputTransformer,
}

impl TaskResponder {
    pub fn new(workflows: Arc<dyn WorkflowRepository>, tasks: Arc<dyn TaskRepository>) -> Self {
        Self::with_template_engine(workflows, tasks, Arc::new(ExpressionEngine::new()))
    }

    pub fn with_template_engine(
        workflows: Arc<dyn WorkflowRepository>,
        tasks: Arc<dyn TaskRepository>,
        templates: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            parent_updater: ParentStatusUpdater::new(Arc::clone(&tasks)),
            normalizer: TransitionNormalizer::new(Arc::clone(&templates)),
            transformer: OutputTransformer::new(
                templates,
                Arc::clone(&workflows),
                Arc::clone(&tasks),
            ),
            tasks,
            workflows,
        }
    }

    /// Finalize a top-level task
    ///
    /// # Arguments
    /// * `cancel` - Cancellation token of the calling unit of work
    /// * `input` - Execution outcome, state and config of the task
    ///
    /// # Returns
    /// * The persisted state, normalized transitions and the next task.
    ///   A failed task without an error transition yields `NoRecoveryPath`.
    pub async fn handle_main_task(
        &self,
        cancel: &CancellationToken,
        input: MainTaskResponseInput,
    ) -> Result<MainTaskResponse> {
        let MainTaskResponseInput {
            workflow_config,
            mut task_state,
            task_config,
            execution_error,
            next_task_override,
        } = input;

        let (success, execution_error) = self
            .process_execution_result(
                cancel,
                &mut task_state,
                &task_config,
                &workflow_config,
                execution_error,
                defers_output_transformation(&task_config),
            )
            .await;

        if cancel.is_cancelled() {
            debug!("Cancelled before saving {}", task_state.task_id);
            return Ok(MainTaskResponse::state_only(task_state));
        }
        if let Err(e) = self.tasks.upsert_state(&task_state).await {
            if cancel.is_cancelled() {
                return Ok(MainTaskResponse::state_only(task_state));
            }
            error!("Failed to save state of {}: {}", task_state.task_id, e);
            return Err(e.context("failed to update task state"));
        }

        if let Err(e) = self.update_parent_if_needed(cancel, &task_state).await {
            warn!(
                "Failed to update parent status for {}: {}",
                task_state.task_id, e
            );
        }
        if cancel.is_cancelled() {
            return Ok(MainTaskResponse::state_only(task_state));
        }

        let transitions = match self
            .normalize_transitions(&workflow_config, &task_config, &task_state)
            .await
        {
            Ok(transitions) => transitions,
            Err(_) if cancel.is_cancelled() => NormalizedTransitions::default(),
            Err(e) => return Err(e),
        };

        if !success
            && !cancel.is_cancelled()
            && transitions
                .on_error
                .as_ref()
                .and_then(|t| t.next.as_deref())
                .is_none()
        {
            return Err(TaskflowError::NoRecoveryPath(
                execution_error.map(|e| e.to_string()),
            ));
        }

        let next_task = next_task_override
            .or_else(|| workflow_config.determine_next_task(&task_config, success));
        Ok(MainTaskResponse {
            state: task_state,
            on_success: transitions.on_success,
            on_error: transitions.on_error,
            next_task,
        })
    }

    /// Finalize a child of a container task
    pub async fn handle_subtask(
        &self,
        cancel: &CancellationToken,
        input: SubtaskResponseInput,
    ) -> Result<SubtaskResponse> {
        let SubtaskResponseInput {
            workflow_config,
            mut task_state,
            task_config,
            execution_error,
        } = input;

        self.process_execution_result(
            cancel,
            &mut task_state,
            &task_config,
            &workflow_config,
            execution_error,
            false,
        )
        .await;

        if cancel.is_cancelled() {
            return Ok(SubtaskResponse::from_state(&task_config.id, task_state));
        }
        if let Err(e) = self.tasks.upsert_state(&task_state).await {
            if cancel.is_cancelled() {
                return Ok(SubtaskResponse::from_state(&task_config.id, task_state));
            }
            return Err(e.context("failed to update subtask state"));
        }
        Ok(SubtaskResponse::from_state(&task_config.id, task_state))
    }

    /// Finalize a collection task and apply its deferred output mapping
    pub async fn handle_collection(
        &self,
        cancel: &CancellationToken,
        input: CollectionResponseInput,
    ) -> Result<CollectionResponse> {
        let main = self.handle_container(cancel, input.main).await?;
        Ok(CollectionResponse {
            main,
            item_count: input.item_count,
            skipped_count: input.skipped_count,
        })
    }

    /// Finalize a parallel task and apply its deferred output mapping
    pub async fn handle_parallel(
        &self,
        cancel: &CancellationToken,
        input: MainTaskResponseInput,
    ) -> Result<MainTaskResponse> {
        self.handle_container(cancel, input).await
    }

    async fn handle_container(
        &self,
        cancel: &CancellationToken,
        input: MainTaskResponseInput,
    ) -> Result<MainTaskResponse> {
        let had_error = input.execution_error.is_some();
        let task_config = input.task_config.clone();
        let workflow_config = input.workflow_config.clone();

        let mut response = self.handle_main_task(cancel, input).await?;
        if had_error || response.state.status == StatusType::Failed {
            return Ok(response);
        }
        response.state = self
            .apply_deferred_transformation(cancel, &response.state, &task_config, &workflow_config)
            .await?;
        Ok(response)
    }

    /// Re-read the container under lock, mark it successful and transform its output
    ///
    /// A transformation failure is persisted as a failed state before the
    /// error is returned.
    async fn apply_deferred_transformation(
        &self,
        cancel: &CancellationToken,
        state: &TaskState,
        task_config: &TaskConfig,
        workflow_config: &WorkflowConfig,
    ) -> Result<TaskState> {
        check_cancelled(cancel, "deferred output transformation")?;
        let mut tx = self
            .tasks
            .begin()
            .await
            .context("failed to begin deferred transformation")?;
        let mut latest = tx
            .get_state_for_update(state.task_exec_id)
            .await
            .context("failed to get latest state for update")?;

        latest.update_status(StatusType::Success);
        latest.error = None;
        let transform_error = self
            .transformer
            .transform(cancel, &mut latest, task_config, workflow_config)
            .await
            .err();
        if let Some(e) = &transform_error {
            warn!(
                "Deferred output transformation of {} failed: {}",
                latest.task_id, e
            );
            latest.update_status(StatusType::Failed);
            latest.error = Some(ErrorInfo::from_error(TRANSFORMATION_ERROR_CODE, e));
        }

        tx.upsert_state(&latest)
            .await
            .context("failed to save transformed state")?;
        tx.commit()
            .await
            .context("failed to save transformed state")?;

        match transform_error {
            Some(e) => Err(e),
            None => Ok(latest),
        }
    }

    /// Decide success, mark the state and apply an immediate output mapping
    async fn process_execution_result(
        &self,
        cancel: &CancellationToken,
        state: &mut TaskState,
        task_config: &TaskConfig,
        workflow_config: &WorkflowConfig,
        mut execution_error: Option<TaskflowError>,
        defer_transformation: bool,
    ) -> (bool, Option<TaskflowError>) {
        let mut success = execution_error.is_none() && state.status != StatusType::Failed;

        if success && !defer_transformation {
            state.update_status(StatusType::Success);
            state.error = None;
            if let Err(e) = self
                .transformer
                .transform(cancel, state, task_config, workflow_config)
                .await
            {
                warn!("Output transformation of {} failed: {}", state.task_id, e);
                execution_error = Some(e);
                success = false;
            }
        }

        if !success {
            state.update_status(StatusType::Failed);
            set_error_state(state, execution_error.as_ref());
        }
        (success, execution_error)
    }

    async fn normalize_transitions(
        &self,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
        task_state: &TaskState,
    ) -> Result<NormalizedTransitions> {
        let workflow_state = self
            .workflows
            .get_state(task_state.workflow_exec_id)
            .await
            .context("failed to get workflow state")?;
        self.normalizer
            .normalize(&workflow_state, workflow_config, task_config, task_state)
    }

    /// Refresh a parallel parent after one of its children completed
    async fn update_parent_if_needed(
        &self,
        cancel: &CancellationToken,
        child: &TaskState,
    ) -> Result<()> {
        let Some(parent_id) = child.parent_state_id else {
            return Ok(());
        };
        check_cancelled(cancel, "update parent status")?;

        let mut tx = self.tasks.begin().await?;
        let parent = tx
            .get_state_for_update(parent_id)
            .await
            .with_context(|| format!("failed to get parent state {parent_id} for update"))?;
        if parent.execution_type != ExecutionType::Parallel {
            return Ok(());
        }

        let strategy = ParallelConfigInput::strategy_from_input(parent.input.as_ref());
        let update = UpdateParentStatusInput::new(parent_id, strategy)
            .recursive()
            .with_child(child.clone());
        self.parent_updater
            .update_parent_status_in_tx(cancel, tx.as_mut(), update)
            .await?;
        tx.commit().await
    }
}

fn defers_output_transformation(task_config: &TaskConfig) -> bool {
    matches!(
        task_config.task_type,
        TaskType::Collection | TaskType::Parallel
    )
}

fn set_error_state(state: &mut TaskState, execution_error: Option<&TaskflowError>) {
    state.error = Some(match execution_error {
        Some(e) => ErrorInfo::from_error(EXECUTION_ERROR_CODE, e),
        None if state.is_parallel_execution() => ErrorInfo::builder(
            EXECUTION_ERROR_CODE,
            "parent task execution failed due to child task failures",
        )
        .build(),
        None => ErrorInfo::builder(EXECUTION_ERROR_CODE, "task execution failed").build(),
    });
}

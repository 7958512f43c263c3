//! # Wait Task Module
//!
//! Status updates, signal validation and final responses for `wait`
//! tasks, which pause until an external signal arrives.

use crate::engine::config_manager::check_cancelled;
use crate::engine::error::{Result, ResultExt, TaskflowError};
use crate::engine::parent_status::{ParentStatusUpdater, UpdateParentStatusInput};
use crate::engine::repository::TaskRepository;
use crate::engine::responder::{MainTaskResponse, MainTaskResponseInput, TaskResponder};
use crate::engine::state::{ExecId, StatusType, TaskState};
use crate::engine::store::ConfigStore;
use crate::engine::task::{ParallelConfigInput, TaskConfig, TaskType};
use crate::engine::workflow::WorkflowConfig;
use log::{debug, info};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct WaitTaskManager {
    tasks: Arc<dyn TaskRepository>,
    configs: Arc<dyn ConfigStore>,
    responder: Arc<TaskResponder>,
    parent_updater: Arc<ParentStatusUpdater>,
}

impl WaitTaskManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        configs: Arc<dyn ConfigStore>,
        responder: Arc<TaskResponder>,
        parent_updater: Arc<ParentStatusUpdater>,
    ) -> Self {
        Self {
            tasks,
            configs,
            responder,
            parent_updater,
        }
    }

    /// Set a wait task's status and output, then refresh its parent
    pub async fn update_wait_task_status(
        &self,
        cancel: &CancellationToken,
        task_exec_id: ExecId,
        status: StatusType,
        output: Option<Map<String, Value>>,
    ) -> Result<TaskState> {
        check_cancelled(cancel, "update wait task status")?;
        let mut state = self
            .tasks
            .get_state(task_exec_id)
            .await
            .context("failed to get task state")?;
        state.update_status(status);
        state.output = output;
        self.tasks
            .upsert_state(&state)
            .await
            .context("failed to update task state")?;
        info!("Wait task {} is now {}", state.task_id, status);

        if let Some(parent_id) = state.parent_state_id {
            check_cancelled(cancel, "update wait task parent")?;
            let mut tx = self.tasks.begin().await?;
            let parent = tx
                .get_state_for_update(parent_id)
                .await
                .with_context(|| format!("failed to get parent state {parent_id}"))?;
            let strategy = ParallelConfigInput::strategy_from_input(parent.input.as_ref());
            let update = UpdateParentStatusInput::new(parent_id, strategy).with_child(state.clone());
            self.parent_updater
                .update_parent_status_in_tx(cancel, tx.as_mut(), update)
                .await
                .context("failed to update parent status")?;
            tx.commit().await?;
        }
        Ok(state)
    }

    /// Check that a task is a waiting `wait` task expecting `signal_name`
    pub async fn validate_wait_task_signal(
        &self,
        cancel: &CancellationToken,
        task_exec_id: ExecId,
        signal_name: &str,
    ) -> Result<()> {
        check_cancelled(cancel, "validate wait task signal")?;
        let state = self
            .tasks
            .get_state(task_exec_id)
            .await
            .context("failed to get task state")?;
        if !matches!(state.status, StatusType::Running | StatusType::Waiting) {
            return Err(TaskflowError::NotFound(format!(
                "task is not waiting for signals (status: {})",
                state.status
            )));
        }

        let config = self.load_config(task_exec_id).await?;
        if config.task_type != TaskType::Wait {
            return Err(TaskflowError::NotFound("task is not a wait task".to_string()));
        }
        let expected = config.wait_for.as_deref().unwrap_or_default();
        if expected != signal_name {
            return Err(TaskflowError::NotFound(format!(
                "task is waiting for signal '{expected}', not '{signal_name}'"
            )));
        }
        debug!("Signal '{}' accepted for {}", signal_name, task_exec_id);
        Ok(())
    }

    /// Finalize a wait task through the main task path
    pub async fn prepare_wait_task_response(
        &self,
        cancel: &CancellationToken,
        state: TaskState,
        workflow_config: WorkflowConfig,
    ) -> Result<MainTaskResponse> {
        check_cancelled(cancel, "prepare wait task response")?;
        let config = self.load_config(state.task_exec_id).await?;
        self.responder
            .handle_main_task(cancel, MainTaskResponseInput::new(workflow_config, state, config))
            .await
    }

    async fn load_config(&self, task_exec_id: ExecId) -> Result<TaskConfig> {
        self.configs
            .get(&task_exec_id.to_string())
            .await
            .context("failed to load task config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::repository::{MemoryTaskRepository, MemoryWorkflowRepository};
    use crate::engine::state::ExecutionType;
    use crate::engine::store::MemoryConfigStore;
    use crate::engine::task::Transition;
    use crate::engine::workflow::WorkflowState;
    use serde_json::json;

    struct Fixture {
        tasks: MemoryTaskRepository,
        workflows: MemoryWorkflowRepository,
        configs: Arc<MemoryConfigStore>,
        manager: WaitTaskManager,
    }

    fn fixture() -> Fixture {
        let tasks = MemoryTaskRepository::new();
        let workflows = MemoryWorkflowRepository::with_task_repository(tasks.clone());
        let configs = Arc::new(MemoryConfigStore::new());
        let responder = Arc::new(TaskResponder::new(
            Arc::new(workflows.clone()),
            Arc::new(tasks.clone()),
        ));
        let parent_updater = Arc::new(ParentStatusUpdater::new(Arc::new(tasks.clone())));
        let manager = WaitTaskManager::new(
            Arc::new(tasks.clone()),
            configs.clone(),
            responder,
            parent_updater,
        );
        Fixture {
            tasks,
            workflows,
            configs,
            manager,
        }
    }

    fn wait_config(signal: &str) -> TaskConfig {
        let mut config = TaskConfig::new("approval", TaskType::Wait).with_cwd("/work");
        config.wait_for = Some(signal.to_string());
        config
    }

    #[tokio::test]
    async fn test_validate_signal() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let state = TaskState::new("approval", "wf", ExecId::new()).with_status(StatusType::Waiting);
        let id = state.task_exec_id;
        fx.tasks.add_state(state);
        fx.configs
            .save(&id.to_string(), &wait_config("approval_signal"))
            .await
            .unwrap();

        fx.manager
            .validate_wait_task_signal(&cancel, id, "approval_signal")
            .await
            .unwrap();
        let err = fx
            .manager
            .validate_wait_task_signal(&cancel, id, "wrong_signal")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(
            err.to_string()
                .contains("task is waiting for signal 'approval_signal', not 'wrong_signal'")
        );
    }

    #[tokio::test]
    async fn test_reject_completed_and_non_wait_tasks() {
        let fx = fixture();
        let cancel = CancellationToken::new();

        let done = TaskState::new("approval", "wf", ExecId::new()).with_status(StatusType::Success);
        let done_id = done.task_exec_id;
        fx.tasks.add_state(done);
        let err = fx
            .manager
            .validate_wait_task_signal(&cancel, done_id, "any")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("task is not waiting for signals"));

        let basic = TaskState::new("step", "wf", ExecId::new()).with_status(StatusType::Running);
        let basic_id = basic.task_exec_id;
        fx.tasks.add_state(basic);
        fx.configs
            .save(
                &basic_id.to_string(),
                &TaskConfig::new("step", TaskType::Basic).with_cwd("/work"),
            )
            .await
            .unwrap();
        let err = fx
            .manager
            .validate_wait_task_signal(&cancel, basic_id, "any")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("task is not a wait task"));
    }

    #[tokio::test]
    async fn test_update_status_refreshes_parent() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let exec = ExecId::new();
        let mut parent_input = Map::new();
        parent_input.insert("_parallel_config".to_string(), json!({ "strategy": "race" }));
        let parent = TaskState::new("gate", "wf", exec)
            .with_execution_type(ExecutionType::Parallel)
            .with_status(StatusType::Running)
            .with_input(parent_input);
        let child = TaskState::new("approval", "wf", exec)
            .with_parent(parent.task_exec_id)
            .with_status(StatusType::Waiting);
        let other = TaskState::new("timer", "wf", exec)
            .with_parent(parent.task_exec_id)
            .with_status(StatusType::Running);
        let (parent_id, child_id) = (parent.task_exec_id, child.task_exec_id);
        fx.tasks.add_state(parent);
        fx.tasks.add_state(child);
        fx.tasks.add_state(other);

        let updated = fx
            .manager
            .update_wait_task_status(
                &cancel,
                child_id,
                StatusType::Success,
                Some(json!({ "approved": true }).as_object().cloned().unwrap_or_default()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, StatusType::Success);
        assert_eq!(
            fx.tasks.get_state(parent_id).await.unwrap().status,
            StatusType::Success
        );
    }

    #[tokio::test]
    async fn test_missing_state_is_reported() {
        let fx = fixture();
        let err = fx
            .manager
            .update_wait_task_status(&CancellationToken::new(), ExecId::new(), StatusType::Success, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to get task state"));
    }

    #[tokio::test]
    async fn test_prepare_response_completes_task() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let exec = ExecId::new();
        fx.workflows.add_state(WorkflowState::new("wf", exec));
        let state = TaskState::new("approval", "wf", exec).with_status(StatusType::Waiting);
        let mut config = wait_config("approval_signal");
        config.on_success = Some(Transition::to("ship"));
        fx.configs
            .save(&state.task_exec_id.to_string(), &config)
            .await
            .unwrap();

        let workflow = WorkflowConfig::new(
            "wf",
            vec![config, TaskConfig::new("ship", TaskType::Basic).with_cwd("/work")],
        );
        let response = fx
            .manager
            .prepare_wait_task_response(&cancel, state, workflow)
            .await
            .unwrap();
        assert_eq!(response.state.status, StatusType::Success);
        assert_eq!(response.next_task.unwrap().id, "ship");
    }
}

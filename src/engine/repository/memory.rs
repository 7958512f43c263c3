use super::{TaskRepository, TaskTransaction, WorkflowRepository};
use crate::engine::error::{Result, TaskflowError};
use crate::engine::state::{ExecId, ProgressInfo, TaskState};
use crate::engine::workflow::WorkflowState;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

type StateMap = Arc<RwLock<HashMap<ExecId, TaskState>>>;
type RowLocks = Arc<Mutex<HashMap<ExecId, Arc<tokio::sync::Mutex<()>>>>>;

fn poisoned(operation: &str, id: impl std::fmt::Display, e: impl std::fmt::Display) -> TaskflowError {
    TaskflowError::storage(operation, id.to_string(), e)
}

fn missing_state(id: ExecId) -> TaskflowError {
    TaskflowError::NotFound(format!("task state not found: {id}"))
}

/// In-process task repository with per-row async locks
///
/// A transaction locks each row it reads for update and holds the lock
/// until it commits or is dropped. Writes inside a transaction are
/// buffered and become visible to other readers only on commit.
#[derive(Clone, Default)]
pub struct MemoryTaskRepository {
    states: StateMap,
    row_locks: RowLocks,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state, replacing any previous version
    pub fn add_state(&self, state: TaskState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(state.task_exec_id, state);
        }
    }

    /// All states of one workflow execution
    pub fn states_for_workflow(&self, workflow_exec_id: ExecId) -> Result<Vec<TaskState>> {
        let states = self
            .states
            .read()
            .map_err(|e| poisoned("states_for_workflow", workflow_exec_id, e))?;
        Ok(states
            .values()
            .filter(|state| state.workflow_exec_id == workflow_exec_id)
            .cloned()
            .collect())
    }

    fn row_lock(&self, id: ExecId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|e| poisoned("lock_row", id, e))?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn get_state(&self, task_exec_id: ExecId) -> Result<TaskState> {
        let states = self
            .states
            .read()
            .map_err(|e| poisoned("get_state", task_exec_id, e))?;
        states
            .get(&task_exec_id)
            .cloned()
            .ok_or_else(|| missing_state(task_exec_id))
    }

    async fn upsert_state(&self, state: &TaskState) -> Result<()> {
        let mut states = self
            .states
            .write()
            .map_err(|e| poisoned("upsert_state", state.task_exec_id, e))?;
        states.insert(state.task_exec_id, state.clone());
        Ok(())
    }

    async fn list_children(&self, parent_id: ExecId) -> Result<Vec<TaskState>> {
        let states = self
            .states
            .read()
            .map_err(|e| poisoned("list_children", parent_id, e))?;
        let mut children: Vec<TaskState> = states
            .values()
            .filter(|state| state.parent_state_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>> {
        Ok(Box::new(MemoryTransaction {
            repo: self.clone(),
            held: HashMap::new(),
            pending: HashMap::new(),
        }))
    }
}

struct MemoryTransaction {
    repo: MemoryTaskRepository,
    held: HashMap<ExecId, OwnedMutexGuard<()>>,
    pending: HashMap<ExecId, TaskState>,
}

impl MemoryTransaction {
    fn release(&mut self) {
        let ids: Vec<ExecId> = self.held.keys().copied().collect();
        self.held.clear();
        if let Ok(mut locks) = self.repo.row_locks.lock() {
            for id in ids {
                // nobody else waits on this row
                if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                    locks.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl TaskTransaction for MemoryTransaction {
    async fn get_state_for_update(&mut self, task_exec_id: ExecId) -> Result<TaskState> {
        if !self.held.contains_key(&task_exec_id) {
            let lock = self.repo.row_lock(task_exec_id)?;
            let guard = lock.lock_owned().await;
            debug!("Locked task state {}", task_exec_id);
            self.held.insert(task_exec_id, guard);
        }
        if let Some(state) = self.pending.get(&task_exec_id) {
            return Ok(state.clone());
        }
        self.repo.get_state(task_exec_id).await
    }

    async fn upsert_state(&mut self, state: &TaskState) -> Result<()> {
        self.pending.insert(state.task_exec_id, state.clone());
        Ok(())
    }

    async fn get_progress_info(&mut self, parent_id: ExecId) -> Result<ProgressInfo> {
        let mut children: HashMap<ExecId, TaskState> = self
            .repo
            .list_children(parent_id)
            .await?
            .into_iter()
            .map(|child| (child.task_exec_id, child))
            .collect();
        for state in self.pending.values() {
            if state.parent_state_id == Some(parent_id) {
                children.insert(state.task_exec_id, state.clone());
            }
        }
        Ok(ProgressInfo::from_statuses(
            children.values().map(|child| child.status),
        ))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        {
            let mut states = self
                .repo
                .states
                .write()
                .map_err(|e| poisoned("commit", "transaction", e))?;
            for (id, state) in self.pending.drain() {
                states.insert(id, state);
            }
        }
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                "Rolling back transaction with {} buffered writes",
                self.pending.len()
            );
        }
        self.release();
    }
}

/// In-process workflow repository
///
/// When linked to a [`MemoryTaskRepository`], the returned workflow state
/// carries the current task states of that execution keyed by task ID.
#[derive(Clone, Default)]
pub struct MemoryWorkflowRepository {
    workflows: Arc<RwLock<HashMap<ExecId, WorkflowState>>>,
    tasks: Option<MemoryTaskRepository>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive `WorkflowState::tasks` from a task repository
    pub fn with_task_repository(tasks: MemoryTaskRepository) -> Self {
        Self {
            workflows: Arc::default(),
            tasks: Some(tasks),
        }
    }

    pub fn add_state(&self, state: WorkflowState) {
        if let Ok(mut workflows) = self.workflows.write() {
            workflows.insert(state.workflow_exec_id, state);
        }
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowRepository {
    async fn get_state(&self, workflow_exec_id: ExecId) -> Result<WorkflowState> {
        let mut state = {
            let workflows = self
                .workflows
                .read()
                .map_err(|e| poisoned("get_workflow_state", workflow_exec_id, e))?;
            workflows.get(&workflow_exec_id).cloned().ok_or_else(|| {
                TaskflowError::NotFound(format!("workflow state not found: {workflow_exec_id}"))
            })?
        };
        if let Some(tasks) = &self.tasks {
            for task_state in tasks.states_for_workflow(workflow_exec_id)? {
                state.tasks.insert(task_state.task_id.clone(), task_state);
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::StatusType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_transaction_buffers_writes_until_commit() {
        let repo = MemoryTaskRepository::new();
        let state = TaskState::new("task", "wf", ExecId::new());
        let id = state.task_exec_id;
        repo.add_state(state);

        let mut tx = repo.begin().await.unwrap();
        let mut locked = tx.get_state_for_update(id).await.unwrap();
        locked.update_status(StatusType::Running);
        tx.upsert_state(&locked).await.unwrap();

        assert_eq!(repo.get_state(id).await.unwrap().status, StatusType::Pending);
        assert_eq!(
            tx.get_state_for_update(id).await.unwrap().status,
            StatusType::Running
        );

        tx.commit().await.unwrap();
        assert_eq!(repo.get_state(id).await.unwrap().status, StatusType::Running);
    }

    #[tokio::test]
    async fn test_drop_rolls_back_and_releases_lock() {
        let repo = MemoryTaskRepository::new();
        let state = TaskState::new("task", "wf", ExecId::new());
        let id = state.task_exec_id;
        repo.add_state(state);

        {
            let mut tx = repo.begin().await.unwrap();
            let mut locked = tx.get_state_for_update(id).await.unwrap();
            locked.update_status(StatusType::Failed);
            tx.upsert_state(&locked).await.unwrap();
        }

        assert_eq!(repo.get_state(id).await.unwrap().status, StatusType::Pending);
        let mut tx = repo.begin().await.unwrap();
        let relocked = tokio::time::timeout(Duration::from_secs(1), tx.get_state_for_update(id)).await;
        assert!(relocked.is_ok());
    }

    #[tokio::test]
    async fn test_row_lock_serializes_transactions() {
        let repo = MemoryTaskRepository::new();
        let state = TaskState::new("task", "wf", ExecId::new());
        let id = state.task_exec_id;
        repo.add_state(state);

        let mut first = repo.begin().await.unwrap();
        first.get_state_for_update(id).await.unwrap();

        let contender = repo.clone();
        let waiter = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            let state = second.get_state_for_update(id).await.unwrap();
            second.commit().await.unwrap();
            state.status
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let mut updated = repo.get_state(id).await.unwrap();
        updated.update_status(StatusType::Success);
        first.upsert_state(&updated).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), StatusType::Success);
    }

    #[tokio::test]
    async fn test_progress_info_sees_pending_writes() {
        let repo = MemoryTaskRepository::new();
        let exec = ExecId::new();
        let parent = TaskState::new("parent", "wf", exec);
        let child = TaskState::new("child", "wf", exec)
            .with_parent(parent.task_exec_id)
            .with_status(StatusType::Running);
        let parent_id = parent.task_exec_id;
        repo.add_state(parent);
        repo.add_state(child.clone());

        let mut tx = repo.begin().await.unwrap();
        tx.upsert_state(&child.with_status(StatusType::Success))
            .await
            .unwrap();
        let info = tx.get_progress_info(parent_id).await.unwrap();
        assert_eq!(info.success_count, 1);
        assert_eq!(repo.get_progress_info(parent_id).await.unwrap().running_count, 1);
    }

    #[tokio::test]
    async fn test_workflow_repository_derives_tasks() {
        let tasks = MemoryTaskRepository::new();
        let exec = ExecId::new();
        tasks.add_state(TaskState::new("step-1", "wf", exec));
        tasks.add_state(TaskState::new("other", "wf", ExecId::new()));

        let workflows = MemoryWorkflowRepository::with_task_repository(tasks);
        workflows.add_state(WorkflowState::new("wf", exec));

        let state = workflows.get_state(exec).await.unwrap();
        assert!(state.tasks.contains_key("step-1"));
        assert!(!state.tasks.contains_key("other"));
        assert!(workflows.get_state(ExecId::new()).await.unwrap_err().is_not_found());
    }
}

//! # Repository Module
//!
//! Contracts for the task and workflow state stores the orchestration
//! services read and write. Parent status updates need a row-locked
//! read-modify-write, expressed as an explicit transaction: `begin`,
//! locked reads and buffered writes, then `commit`. Dropping a
//! transaction without committing rolls it back and releases its locks.

pub mod memory;

pub use memory::{MemoryTaskRepository, MemoryWorkflowRepository};

use crate::engine::error::Result;
use crate::engine::state::{ExecId, ProgressInfo, TaskState};
use crate::engine::workflow::WorkflowState;
use async_trait::async_trait;

/// Persistent store of task states
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Read a state outside any transaction
    async fn get_state(&self, task_exec_id: ExecId) -> Result<TaskState>;

    /// Insert or replace a state
    async fn upsert_state(&self, state: &TaskState) -> Result<()>;

    /// States whose parent is `parent_id`
    async fn list_children(&self, parent_id: ExecId) -> Result<Vec<TaskState>>;

    /// Aggregate the statuses of a parent's children
    async fn get_progress_info(&self, parent_id: ExecId) -> Result<ProgressInfo> {
        let children = self.list_children(parent_id).await?;
        Ok(ProgressInfo::from_statuses(
            children.iter().map(|child| child.status),
        ))
    }

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>>;
}

/// A unit of work holding row locks on the states it read for update
#[async_trait]
pub trait TaskTransaction: Send {
    /// Read a state and lock its row until commit or rollback
    async fn get_state_for_update(&mut self, task_exec_id: ExecId) -> Result<TaskState>;

    /// Buffer a write, applied on commit
    async fn upsert_state(&mut self, state: &TaskState) -> Result<()>;

    /// Progress of a parent's children as seen by this transaction
    async fn get_progress_info(&mut self, parent_id: ExecId) -> Result<ProgressInfo>;

    /// Apply buffered writes and release locks
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Store of workflow execution states
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_state(&self, workflow_exec_id: ExecId) -> Result<WorkflowState>;
}

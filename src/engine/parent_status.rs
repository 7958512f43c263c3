//! # Parent Status Module
//!
//! Recomputes a container task's status from its children and, when the
//! status changes, walks up the ancestor chain. All reads and writes of
//! one update happen inside a single repository transaction with the
//! parent rows locked for update.

use crate::engine::config_manager::check_cancelled;
use crate::engine::error::{ErrorInfo, Result, ResultExt, TaskflowError};
use crate::engine::repository::{TaskRepository, TaskTransaction};
use crate::engine::state::{ExecId, StatusType, TaskState};
use crate::engine::task::{ParallelConfigInput, ParallelStrategy};
use futures::future::BoxFuture;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default ceiling on ancestor levels visited by one update
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Error code recorded on a parent failed by its children
pub const CHILD_FAILURE_CODE: &str = "child_task_failure";

/// Request to refresh one parent's status
#[derive(Debug, Clone)]
pub struct UpdateParentStatusInput {
    pub parent_state_id: ExecId,
    pub strategy: ParallelStrategy,
    /// Continue with the grandparent when this parent's status changes
    pub recursive: bool,
    /// The child whose completion triggered the update, if known
    pub child_state: Option<TaskState>,
    /// State IDs already on the current ancestor path
    pub visited: HashSet<ExecId>,
    pub depth: usize,
}

impl UpdateParentStatusInput {
    pub fn new(parent_state_id: ExecId, strategy: ParallelStrategy) -> Self {
        Self {
            parent_state_id,
            strategy,
            recursive: false,
            child_state: None,
            visited: HashSet::new(),
            depth: 0,
        }
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn with_child(mut self, child_state: TaskState) -> Self {
        self.child_state = Some(child_state);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ParentStatusOptions {
    pub max_depth: usize,
}

impl Default for ParentStatusOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Whether a parent may move from `current` to `new`
///
/// Terminal statuses always win; a pending parent may start running or
/// waiting; nothing moves a parent backwards.
pub fn should_update_parent_status(current: StatusType, new: StatusType) -> bool {
    if current == new {
        return false;
    }
    if new.is_terminal() {
        return true;
    }
    matches!(
        (current, new),
        (StatusType::Pending, StatusType::Running) | (StatusType::Pending, StatusType::Waiting)
    )
}

pub struct ParentStatusUpdater {
    repository: Arc<dyn TaskRepository>,
    options: ParentStatusOptions,
}

impl ParentStatusUpdater {
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self::with_options(repository, ParentStatusOptions::default())
    }

    pub fn with_options(repository: Arc<dyn TaskRepository>, options: ParentStatusOptions) -> Self {
        Self {
            repository,
            options,
        }
    }

    /// Refresh a parent in its own transaction and commit
    ///
    /// # Returns
    /// * The parent state as written
    pub async fn update_parent_status(
        &self,
        cancel: &CancellationToken,
        input: UpdateParentStatusInput,
    ) -> Result<TaskState> {
        check_cancelled(cancel, "update parent status")?;
        let mut tx = self
            .repository
            .begin()
            .await
            .context("failed to begin parent status transaction")?;
        let parent = self
            .update_parent_status_in_tx(cancel, tx.as_mut(), input)
            .await?;
        tx.commit()
            .await
            .context("failed to commit parent status update")?;
        Ok(parent)
    }

    /// Refresh a parent inside a caller-owned transaction
    ///
    /// Progress info is rewritten on every call, so repeating an update
    /// with unchanged children leaves the status untouched.
    pub fn update_parent_status_in_tx<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        tx: &'a mut dyn TaskTransaction,
        input: UpdateParentStatusInput,
    ) -> BoxFuture<'a, Result<TaskState>> {
        Box::pin(async move {
            check_cancelled(cancel, "update parent status")?;
            let UpdateParentStatusInput {
                parent_state_id,
                strategy,
                recursive,
                child_state,
                mut visited,
                depth,
            } = input;

            if depth >= self.options.max_depth {
                return Err(TaskflowError::DepthExceeded {
                    depth,
                    max: self.options.max_depth,
                });
            }
            if !visited.insert(parent_state_id) {
                return Err(TaskflowError::Cycle(parent_state_id.to_string()));
            }

            let mut parent = tx
                .get_state_for_update(parent_state_id)
                .await
                .with_context(|| format!("failed to get parent state {parent_state_id}"))?;
            let progress = tx
                .get_progress_info(parent_state_id)
                .await
                .with_context(|| format!("failed to get progress info for {parent_state_id}"))?;

            let new_status = progress.calculate_overall_status(strategy);
            parent
                .output_mut()
                .insert("progress_info".to_string(), progress.to_output(strategy));

            let changed = should_update_parent_status(parent.status, new_status);
            if changed {
                info!(
                    "Parent {} ({}) status {} -> {} under {}",
                    parent.task_id, parent_state_id, parent.status, new_status, strategy
                );
                parent.status = new_status;
                if new_status == StatusType::Failed && progress.has_failures() {
                    let mut error = ErrorInfo::builder(
                        CHILD_FAILURE_CODE,
                        "parent task failed due to child task failures",
                    )
                    .detail("failed_count", progress.failed_count)
                    .detail("completed_count", progress.completed_count)
                    .detail("total_children", progress.total_children);
                    if let Some(child) = &child_state {
                        error = error
                            .detail("child_task_id", child.task_id.clone())
                            .detail("child_status", child.status.as_str());
                    }
                    parent.error = Some(error.build());
                }
            } else {
                debug!(
                    "Parent {} stays {} ({} of {} children completed)",
                    parent_state_id, parent.status, progress.completed_count, progress.total_children
                );
            }
            parent.touch();

            tx.upsert_state(&parent)
                .await
                .with_context(|| format!("failed to update parent state {parent_state_id}"))?;

            let grandparent_id = match parent.parent_state_id {
                Some(id) if recursive && changed => id,
                _ => return Ok(parent),
            };
            check_cancelled(cancel, "update grandparent status")?;
            let grandparent = tx
                .get_state_for_update(grandparent_id)
                .await
                .with_context(|| format!("failed to get grandparent state {grandparent_id}"))?;
            let next = UpdateParentStatusInput {
                parent_state_id: grandparent_id,
                strategy: ParallelConfigInput::strategy_from_input(grandparent.input.as_ref()),
                recursive: true,
                child_state: Some(parent.clone()),
                visited,
                depth: depth + 1,
            };
            self.update_parent_status_in_tx(cancel, tx, next).await?;
            Ok(parent)
        })
    }
}

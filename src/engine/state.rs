//! # Task State Module
//!
//! Mutable execution records for task invocations and the progress
//! information derived from a parent's children.

use crate::engine::error::{ErrorInfo, Result, TaskflowError};
use crate::engine::task::ParallelStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of one task or workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(Uuid);

impl ExecId {
    /// Generate a new time-ordered execution ID
    pub fn new() -> Self {
        ExecId(Uuid::now_v7())
    }

    /// Parse an ID, rejecting empty input
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(TaskflowError::InvalidArgument(
                "execution ID cannot be empty".to_string(),
            ));
        }
        Uuid::parse_str(raw)
            .map(ExecId)
            .map_err(|e| TaskflowError::InvalidArgument(format!("invalid execution ID '{raw}': {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecId {
    type Err = TaskflowError;

    fn from_str(s: &str) -> Result<Self> {
        ExecId::parse(s)
    }
}

/// Lifecycle status of a task or workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    #[default]
    Pending,
    Running,
    Waiting,
    Success,
    Failed,
}

impl StatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusType::Pending => "pending",
            StatusType::Running => "running",
            StatusType::Waiting => "waiting",
            StatusType::Success => "success",
            StatusType::Failed => "failed",
        }
    }

    /// Success and failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusType::Success | StatusType::Failed)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task executes its own work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    #[serde(alias = "none")]
    Basic,
    Parallel,
    Collection,
    Composite,
}

impl ExecutionType {
    /// Container execution types own child states
    pub fn can_have_children(&self) -> bool {
        !matches!(self, ExecutionType::Basic)
    }
}

/// Mutable execution record of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_exec_id: ExecId,
    pub task_id: String,
    pub workflow_id: String,
    pub workflow_exec_id: ExecId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_state_id: Option<ExecId>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub status: StatusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a pending state for a task dispatched in a workflow execution
    pub fn new(
        task_id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_exec_id: ExecId,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_exec_id: ExecId::new(),
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            workflow_exec_id,
            parent_state_id: None,
            execution_type: ExecutionType::Basic,
            status: StatusType::Pending,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach this state to a parent state
    pub fn with_parent(mut self, parent_state_id: ExecId) -> Self {
        self.parent_state_id = Some(parent_state_id);
        self
    }

    pub fn with_execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    pub fn with_status(mut self, status: StatusType) -> Self {
        self.status = status;
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the status and refresh the update timestamp
    pub fn update_status(&mut self, status: StatusType) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_parallel_execution(&self) -> bool {
        self.execution_type == ExecutionType::Parallel
    }

    pub fn can_have_children(&self) -> bool {
        self.execution_type.can_have_children()
    }

    /// Output map, created on first use
    pub fn output_mut(&mut self) -> &mut Map<String, Value> {
        self.output.get_or_insert_with(Map::new)
    }
}

/// Child progress of a parent task, derived from child statuses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub total_children: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub running_count: usize,
    pub waiting_count: usize,
    pub pending_count: usize,
    /// Children in a terminal status
    pub completed_count: usize,
    pub completion_rate: f64,
    pub failure_rate: f64,
}

impl ProgressInfo {
    /// Aggregate a multiset of child statuses
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StatusType>,
    {
        let mut info = ProgressInfo::default();
        for status in statuses {
            info.total_children += 1;
            match status {
                StatusType::Success => info.success_count += 1,
                StatusType::Failed => info.failed_count += 1,
                StatusType::Running => info.running_count += 1,
                StatusType::Waiting => info.waiting_count += 1,
                StatusType::Pending => info.pending_count += 1,
            }
        }
        info.completed_count = info.success_count + info.failed_count;
        // waiting children are still in flight
        info.running_count += info.waiting_count;
        if info.total_children > 0 {
            let total = info.total_children as f64;
            info.completion_rate = info.success_count as f64 / total;
            info.failure_rate = info.failed_count as f64 / total;
        }
        info
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }

    pub fn is_all_success(&self) -> bool {
        self.total_children > 0 && self.success_count == self.total_children
    }

    /// Parent status implied by the children under a completion strategy
    pub fn calculate_overall_status(&self, strategy: ParallelStrategy) -> StatusType {
        match strategy {
            // both fail on the first failed child at aggregation time
            ParallelStrategy::WaitAll | ParallelStrategy::FailFast => {
                if self.has_failures() {
                    StatusType::Failed
                } else {
                    self.in_flight_status()
                }
            }
            ParallelStrategy::Race => {
                if self.success_count > 0 {
                    StatusType::Success
                } else if self.total_children > 0 && self.failed_count == self.total_children {
                    StatusType::Failed
                } else if self.running_count > 0 {
                    StatusType::Running
                } else {
                    StatusType::Pending
                }
            }
        }
    }

    fn in_flight_status(&self) -> StatusType {
        if self.is_all_success() {
            StatusType::Success
        } else if self.running_count > 0 {
            StatusType::Running
        } else {
            StatusType::Pending
        }
    }

    /// The `progress_info` block written onto a parent's output
    pub fn to_output(&self, strategy: ParallelStrategy) -> Value {
        json!({
            "completion_rate": self.completion_rate,
            "failure_rate": self.failure_rate,
            "total_children": self.total_children,
            "completed_count": self.completed_count,
            "failed_count": self.failed_count,
            "running_count": self.running_count,
            "pending_count": self.pending_count,
            "strategy": strategy.as_str(),
            "last_updated": Utc::now().timestamp().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StatusType::*;

    fn status_for(strategy: ParallelStrategy, statuses: &[StatusType]) -> StatusType {
        ProgressInfo::from_statuses(statuses.iter().copied()).calculate_overall_status(strategy)
    }

    #[test]
    fn test_wait_all_aggregation() {
        assert_eq!(status_for(ParallelStrategy::WaitAll, &[Running, Success, Success]), Running);
        assert_eq!(status_for(ParallelStrategy::WaitAll, &[Success, Success, Success]), Success);
        assert_eq!(status_for(ParallelStrategy::WaitAll, &[Success, Failed, Running]), Failed);
        assert_eq!(status_for(ParallelStrategy::WaitAll, &[Pending, Pending]), Pending);
        assert_eq!(status_for(ParallelStrategy::WaitAll, &[]), Pending);
    }

    #[test]
    fn test_fail_fast_aggregation() {
        assert_eq!(status_for(ParallelStrategy::FailFast, &[Failed, Running, Success]), Failed);
        assert_eq!(status_for(ParallelStrategy::FailFast, &[Waiting, Success]), Running);
        assert_eq!(status_for(ParallelStrategy::FailFast, &[Success, Success]), Success);
    }

    #[test]
    fn test_race_aggregation() {
        assert_eq!(status_for(ParallelStrategy::Race, &[Success, Running, Running]), Success);
        assert_eq!(status_for(ParallelStrategy::Race, &[Failed, Running]), Running);
        assert_eq!(status_for(ParallelStrategy::Race, &[Failed, Failed]), Failed);
        assert_eq!(status_for(ParallelStrategy::Race, &[]), Pending);
    }

    #[test]
    fn test_progress_counts_and_rates() {
        let info = ProgressInfo::from_statuses([Success, Failed, Waiting, Pending]);
        assert_eq!(info.total_children, 4);
        assert_eq!(info.completed_count, 2);
        assert_eq!(info.running_count, 1);
        assert_eq!(info.pending_count, 1);
        assert!((info.completion_rate - 0.25).abs() < f64::EPSILON);
        assert!((info.failure_rate - 0.25).abs() < f64::EPSILON);

        let output = info.to_output(ParallelStrategy::FailFast);
        assert_eq!(output["strategy"], "fail_fast");
        assert_eq!(output["total_children"], 4);
        assert!(output["last_updated"].is_string());
    }

    #[test]
    fn test_exec_id_parsing() {
        let id = ExecId::new();
        assert_eq!(ExecId::parse(&id.to_string()).unwrap(), id);
        assert!(matches!(ExecId::parse(""), Err(TaskflowError::InvalidArgument(_))));
        assert!(ExecId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_execution_type_accepts_none_alias() {
        let parsed: ExecutionType = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, ExecutionType::Basic);
    }
}

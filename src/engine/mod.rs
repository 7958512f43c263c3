/*!
# Engine Module

The orchestration core: task and workflow models, config persistence,
child expansion for container tasks, parent status aggregation and the
responder that finalizes each task execution.
*/

pub mod config_manager;
pub mod context;
pub mod error;
pub mod parent_status;
pub mod repository;
pub mod responder;
pub mod state;
pub mod store;
pub mod task;
pub mod template;
pub mod transition;
pub mod utils;
pub mod wait_task;
pub mod workflow;

// Re-export key types for easier access
pub use config_manager::{
    CollectionMetadata, CollectionTaskMetadata, CompositeTaskMetadata, ConfigManager,
    ConfigManagerOptions, ParallelTaskMetadata,
};
pub use context::{ContextBuilder, NormalizationContext};
pub use parent_status::{
    ParentStatusOptions, ParentStatusUpdater, UpdateParentStatusInput, should_update_parent_status,
};
pub use repository::{
    MemoryTaskRepository, MemoryWorkflowRepository, TaskRepository, TaskTransaction,
    WorkflowRepository,
};
pub use responder::{
    CollectionResponse, CollectionResponseInput, MainTaskResponse, MainTaskResponseInput,
    SubtaskResponse, SubtaskResponseInput, TaskResponder,
};
pub use state::{ExecId, ExecutionType, ProgressInfo, StatusType, TaskState};
pub use store::{ConfigStore, MemoryConfigStore, StoreSettings, open_store};
pub use task::{
    CollectionConfig, CollectionMode, ParallelConfigInput, ParallelStrategy, TaskConfig, TaskType,
    Transition,
};
pub use template::{ExpressionEngine, TemplateEngine};
pub use transition::{NormalizedTransitions, OutputTransformer, TransitionNormalizer};
pub use wait_task::WaitTaskManager;
pub use workflow::{WorkflowConfig, WorkflowState};

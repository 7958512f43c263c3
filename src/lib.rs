/*!
# Taskflow-rs

The task orchestration core of a workflow engine: it persists task
configurations, expands container tasks (parallel, collection, composite)
into child configs, aggregates child outcomes into parent statuses and
turns each task's raw execution result into a persisted state plus a
transition decision.

## Overview

Scheduling and task execution live outside this crate. An external
scheduler calls into these services whenever a task is dispatched or
finishes; the services are safe to call concurrently, including for many
children of the same parent finishing at once.

## Key Components

* **ConfigStore**: namespaced persistence for task configs and metadata
  blobs, with in-memory, SQLite and Redis backends
* **ConfigManager**: validates and expands container tasks into children
* **ParentStatusUpdater**: recomputes a parent's status from its children
  under a row lock, optionally walking up the ancestor chain
* **TaskResponder**: finalizes main tasks, subtasks and containers
* **WaitTaskManager**: status updates and signal checks for `wait` tasks

## Usage Example

```rust,no_run
use std::sync::Arc;
use taskflow_rs::{
    ConfigManager, ConfigManagerOptions, ExecId, MemoryTaskRepository,
    MemoryWorkflowRepository, StoreSettings, TaskConfig, TaskType, open_store,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> taskflow_rs::Result<()> {
    let store = open_store(&StoreSettings::default()).await?;
    let manager = ConfigManager::new(
        store,
        ConfigManagerOptions {
            default_cwd: Some("/srv/workflows".to_string()),
        },
    );

    let parallel = TaskConfig::from_json(
        r#"{
            "id": "fetch_all",
            "type": "parallel",
            "strategy": "wait_all",
            "tasks": [
                { "id": "fetch_users", "type": "basic" },
                { "id": "fetch_orders", "type": "basic" }
            ]
        }"#,
    )?;

    let cancel = CancellationToken::new();
    let metadata = manager
        .prepare_parallel_configs(&cancel, ExecId::new(), &parallel)
        .await?;
    println!("prepared {} children", metadata.child_configs.len());

    // Repositories for states; swap in a database-backed implementation
    let tasks = MemoryTaskRepository::new();
    let _workflows = MemoryWorkflowRepository::with_task_repository(tasks.clone());
    Ok(())
}
```

## Error Handling

Every fallible operation returns [`Result`] with a [`TaskflowError`].
Errors are wrapped with the failing operation as they propagate, while
`is_not_found()` and `is_cancelled()` look through the wrapping:

```rust,no_run
use taskflow_rs::{ConfigStore, MemoryConfigStore};

#[tokio::main]
async fn main() {
    let store = MemoryConfigStore::new();
    match store.get("missing").await {
        Err(e) if e.is_not_found() => println!("no config yet"),
        Err(e) => println!("storage failure: {e}"),
        Ok(config) => println!("loaded {}", config.id),
    }
}
```
*/

pub mod engine;

// Re-export all public APIs for easier access
pub use engine::error::{ErrorInfo, Result, ResultExt, TaskflowError};
pub use engine::*;

//! # Config Manager Module
//!
//! Expands parallel, collection and composite task definitions into
//! validated child configs and persists the expansion as metadata keyed
//! by the parent's state ID, for the scheduler to materialize later.

use crate::engine::context::ContextBuilder;
use crate::engine::error::{Result, ResultExt, TaskflowError};
use crate::engine::state::ExecId;
use crate::engine::store::ConfigStore;
use crate::engine::task::{CollectionMode, ParallelStrategy, TaskConfig, TaskType};
use crate::engine::template::{ExpressionEngine, TemplateEngine};
use crate::engine::utils::{into_object, is_truthy, merge_into};
use crate::engine::workflow::{WorkflowConfig, WorkflowState};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Expanded children of a parallel task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelTaskMetadata {
    pub parent_state_id: ExecId,
    pub child_configs: Vec<TaskConfig>,
    pub strategy: ParallelStrategy,
    pub max_workers: usize,
}

/// Expanded children of a collection task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionTaskMetadata {
    pub parent_state_id: ExecId,
    pub child_configs: Vec<TaskConfig>,
    pub strategy: ParallelStrategy,
    pub max_workers: usize,
    pub item_count: usize,
    pub skipped_count: usize,
    pub mode: CollectionMode,
    pub batch_size: usize,
}

/// Children of a composite task, always run one at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTaskMetadata {
    pub parent_state_id: ExecId,
    pub child_configs: Vec<TaskConfig>,
    pub strategy: ParallelStrategy,
    pub max_workers: usize,
}

/// Summary of a collection expansion, recorded on the parent's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub item_count: usize,
    pub skipped_count: usize,
    pub mode: CollectionMode,
    pub batch_size: usize,
}

/// Construction options for [`ConfigManager`]
#[derive(Debug, Clone, Default)]
pub struct ConfigManagerOptions {
    /// Working directory for children that inherit none from their parent
    pub default_cwd: Option<String>,
}

pub struct ConfigManager {
    store: Arc<dyn ConfigStore>,
    templates: Arc<dyn TemplateEngine>,
    context_builder: ContextBuilder,
    options: ConfigManagerOptions,
}

impl ConfigManager {
    pub fn new(store: Arc<dyn ConfigStore>, options: ConfigManagerOptions) -> Self {
        Self::with_template_engine(store, Arc::new(ExpressionEngine::new()), options)
    }

    pub fn with_template_engine(
        store: Arc<dyn ConfigStore>,
        templates: Arc<dyn TemplateEngine>,
        options: ConfigManagerOptions,
    ) -> Self {
        Self {
            store,
            templates,
            context_builder: ContextBuilder::new(),
            options,
        }
    }

    /// Validate and persist the children of a parallel task
    ///
    /// # Arguments
    /// * `cancel` - Cancellation token of the calling unit of work
    /// * `parent_state_id` - State ID of the parallel task's execution
    /// * `task_config` - The parallel task definition
    pub async fn prepare_parallel_configs(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
        task_config: &TaskConfig,
    ) -> Result<ParallelTaskMetadata> {
        check_cancelled(cancel, "prepare parallel configs")?;
        require_type(task_config, TaskType::Parallel)?;
        if task_config.tasks.is_empty() {
            return Err(TaskflowError::ValidationFailed(
                "parallel task must have at least one child task".to_string(),
            ));
        }

        let child_configs = self.resolve_children(task_config, &task_config.tasks, "")?;
        let metadata = ParallelTaskMetadata {
            parent_state_id,
            child_configs,
            strategy: task_config.strategy(),
            max_workers: task_config.max_workers(),
        };
        self.save_metadata(cancel, &parallel_metadata_key(parent_state_id), &metadata)
            .await
            .with_context(|| format!("failed to save parallel metadata for parent {parent_state_id}"))?;

        debug!(
            "Prepared {} parallel children for parent {}",
            metadata.child_configs.len(),
            parent_state_id
        );
        Ok(metadata)
    }

    /// Expand, filter and persist the children of a collection task
    ///
    /// Output mappings on the template are carried through untouched; they
    /// run only after each child has executed.
    ///
    /// # Returns
    /// * `CollectionMetadata` - item/skip counts, mode and batch size
    pub async fn prepare_collection_configs(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
        task_config: &TaskConfig,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
    ) -> Result<CollectionMetadata> {
        check_cancelled(cancel, "prepare collection configs")?;
        require_type(task_config, TaskType::Collection)?;

        let template_context =
            self.context_builder
                .build_collection_context(workflow_state, workflow_config, task_config);
        let (items, skipped_count) = self
            .expand_items(task_config, &template_context)
            .with_context(|| {
                format!("failed to process collection items for parent {parent_state_id}")
            })?;

        let generated = self.build_child_configs(task_config, &items, &template_context)?;
        let child_configs = if generated.is_empty() {
            debug!(
                "Collection {} produced no children ({} skipped)",
                task_config.id, skipped_count
            );
            generated
        } else {
            self.resolve_children(task_config, &generated, "generated ")?
        };

        let item_count = child_configs.len();
        let metadata = CollectionTaskMetadata {
            parent_state_id,
            max_workers: collection_max_workers(task_config, item_count),
            child_configs,
            strategy: ParallelStrategy::WaitAll,
            item_count,
            skipped_count,
            mode: task_config.mode(),
            batch_size: task_config.collection.batch,
        };
        self.save_metadata(cancel, &collection_metadata_key(parent_state_id), &metadata)
            .await
            .with_context(|| {
                format!("failed to save collection metadata for parent {parent_state_id}")
            })?;

        info!(
            "Expanded collection {} into {} children ({} skipped)",
            task_config.id, item_count, skipped_count
        );
        Ok(CollectionMetadata {
            item_count,
            skipped_count,
            mode: metadata.mode,
            batch_size: metadata.batch_size,
        })
    }

    /// Validate and persist the children of a composite task
    ///
    /// An empty child list is valid and completes immediately.
    pub async fn prepare_composite_configs(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
        task_config: &TaskConfig,
    ) -> Result<CompositeTaskMetadata> {
        check_cancelled(cancel, "prepare composite configs")?;
        require_type(task_config, TaskType::Composite)?;

        let child_configs = if task_config.tasks.is_empty() {
            Vec::new()
        } else {
            self.resolve_children(task_config, &task_config.tasks, "")?
        };
        let metadata = CompositeTaskMetadata {
            parent_state_id,
            child_configs,
            strategy: ParallelStrategy::WaitAll,
            max_workers: 1,
        };
        self.save_metadata(cancel, &composite_metadata_key(parent_state_id), &metadata)
            .await
            .with_context(|| {
                format!("failed to store composite metadata for parent {parent_state_id}")
            })?;
        Ok(metadata)
    }

    pub async fn load_parallel_task_metadata(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
    ) -> Result<ParallelTaskMetadata> {
        self.load_metadata(cancel, &parallel_metadata_key(parent_state_id))
            .await
            .context("failed to get parallel task metadata")
    }

    pub async fn load_collection_task_metadata(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
    ) -> Result<CollectionTaskMetadata> {
        self.load_metadata(cancel, &collection_metadata_key(parent_state_id))
            .await
            .context("failed to get collection task metadata")
    }

    pub async fn load_composite_task_metadata(
        &self,
        cancel: &CancellationToken,
        parent_state_id: ExecId,
    ) -> Result<CompositeTaskMetadata> {
        self.load_metadata(cancel, &composite_metadata_key(parent_state_id))
            .await
            .context("failed to get composite task metadata")
    }

    /// Persist a task config keyed by its execution ID
    pub async fn save_task_config(
        &self,
        cancel: &CancellationToken,
        task_exec_id: ExecId,
        config: &TaskConfig,
    ) -> Result<()> {
        check_cancelled(cancel, "save task config")?;
        self.store
            .save(&task_exec_id.to_string(), config)
            .await
            .context("failed to save task config")
    }

    /// Load a task config by execution ID
    pub async fn load_task_config(
        &self,
        cancel: &CancellationToken,
        task_exec_id: ExecId,
    ) -> Result<TaskConfig> {
        check_cancelled(cancel, "load task config")?;
        self.store.get(&task_exec_id.to_string()).await
    }

    /// Remove a task config by execution ID
    pub async fn delete_task_config(
        &self,
        cancel: &CancellationToken,
        task_exec_id: ExecId,
    ) -> Result<()> {
        check_cancelled(cancel, "delete task config")?;
        self.store
            .delete(&task_exec_id.to_string())
            .await
            .context("failed to delete task config")
    }

    /// Propagate working directories and validate every child, reporting its index
    fn resolve_children(
        &self,
        parent: &TaskConfig,
        children: &[TaskConfig],
        label: &str,
    ) -> Result<Vec<TaskConfig>> {
        let mut resolved = Vec::with_capacity(children.len());
        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(children.len());
        for (index, child) in children.iter().enumerate() {
            if child.id.trim().is_empty() {
                return Err(TaskflowError::ValidationFailed(format!(
                    "{label}child config at index {index} missing required ID field"
                )));
            }
            if let Some(first) = seen.insert(child.id.as_str(), index) {
                return Err(TaskflowError::ValidationFailed(format!(
                    "{label}child config at index {index} duplicates ID '{}' from index {first}",
                    child.id
                )));
            }
            let mut child = child.clone();
            child.propagate_cwd(
                parent
                    .cwd
                    .as_deref()
                    .or(self.options.default_cwd.as_deref()),
            );
            child.validate().map_err(|e| {
                TaskflowError::ValidationFailed(format!(
                    "invalid {label}child config at index {index}: {e}"
                ))
            })?;
            resolved.push(child);
        }
        Ok(resolved)
    }

    /// Evaluate `items`, then keep the items passing `filter`
    fn expand_items(&self, task_config: &TaskConfig, context: &Value) -> Result<(Vec<Value>, usize)> {
        let expression = task_config
            .collection
            .items
            .as_ref()
            .ok_or_else(|| {
                TaskflowError::ValidationFailed(format!(
                    "collection task {} requires an items expression",
                    task_config.id
                ))
            })?;
        let items = match self.templates.evaluate(expression, context)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(TaskflowError::ValidationFailed(format!(
                    "collection items must evaluate to an array, got: {other}"
                )));
            }
        };

        let Some(filter) = task_config.collection.filter.as_ref() else {
            return Ok((items, 0));
        };
        let total = items.len();
        let mut kept = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let item_context = self.context_builder.build_item_context(
                context,
                &task_config.collection,
                &item,
                index,
            );
            let verdict = self
                .templates
                .evaluate(filter, &item_context)
                .with_context(|| format!("failed to evaluate filter for item {index}"))?;
            if is_truthy(&verdict) {
                kept.push(item);
            }
        }
        let skipped = total - kept.len();
        Ok((kept, skipped))
    }

    /// Instantiate the task template once per surviving item
    fn build_child_configs(
        &self,
        task_config: &TaskConfig,
        items: &[Value],
        context: &Value,
    ) -> Result<Vec<TaskConfig>> {
        let template = collection_template(task_config)?;
        let mut children = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let item_context = self.context_builder.build_item_context(
                context,
                &task_config.collection,
                item,
                index,
            );
            let child = self
                .build_child_config(task_config, &template, item, index, &item_context)
                .with_context(|| format!("failed to create child config for item {index}"))?;
            children.push(child);
        }
        Ok(children)
    }

    fn build_child_config(
        &self,
        parent: &TaskConfig,
        template: &TaskConfig,
        item: &Value,
        index: usize,
        item_context: &Value,
    ) -> Result<TaskConfig> {
        let mut child = template.clone();

        child.id = if template.id.is_empty() {
            format!("{}-{}", parent.id, index)
        } else {
            match self.templates.evaluate(&json!(template.id), item_context)? {
                Value::String(id) => id,
                Value::Null => {
                    return Err(TaskflowError::ValidationFailed(format!(
                        "child ID template '{}' rendered to null for item {index}",
                        template.id
                    )));
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(TaskflowError::ValidationFailed(format!(
                        "child ID template '{}' must render to a scalar for item {index}",
                        template.id
                    )));
                }
                other => other.to_string(),
            }
        };

        let mut with = Map::new();
        merge_into(&mut with, parent.with.as_ref());
        if let Some(template_with) = template.with.as_ref() {
            let rendered = self
                .templates
                .render_value(&Value::Object(template_with.clone()), item_context)
                .context("failed to process child config templates")?;
            let rendered = into_object(rendered).map_err(|kind| {
                TaskflowError::Template(format!(
                    "expected an object for the processed with field, got {kind}"
                ))
            })?;
            merge_into(&mut with, Some(&rendered));
        }
        with.insert("item".to_string(), item.clone());
        with.insert("index".to_string(), json!(index));
        if let Some(name) = parent.collection.item_var.as_deref().filter(|n| !n.is_empty()) {
            with.insert(name.to_string(), item.clone());
        }
        if let Some(name) = parent.collection.index_var.as_deref().filter(|n| !n.is_empty()) {
            with.insert(name.to_string(), json!(index));
        }
        with.insert("_collection_item".to_string(), item.clone());
        with.insert("_collection_index".to_string(), json!(index));
        if let Some(name) = &parent.collection.item_var {
            with.insert("_collection_item_var".to_string(), json!(name));
        }
        if let Some(name) = &parent.collection.index_var {
            with.insert("_collection_index_var".to_string(), json!(name));
        }
        child.with = Some(with);

        if child.env.is_none() {
            child.env = parent.env.clone();
        }
        Ok(child)
    }

    async fn save_metadata<T: Serialize>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        metadata: &T,
    ) -> Result<()> {
        check_cancelled(cancel, "save metadata")?;
        let bytes = serde_json::to_vec(metadata)?;
        self.store.save_metadata(key, &bytes).await
    }

    async fn load_metadata<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<T> {
        check_cancelled(cancel, "load metadata")?;
        let bytes = self.store.get_metadata(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn parallel_metadata_key(parent_state_id: ExecId) -> String {
    format!("parallel_metadata:{parent_state_id}")
}

pub fn collection_metadata_key(parent_state_id: ExecId) -> String {
    format!("collection_metadata:{parent_state_id}")
}

pub fn composite_metadata_key(parent_state_id: ExecId) -> String {
    format!("composite_metadata:{parent_state_id}")
}

/// Sequential collections run one child (or one batch) at a time; zero is unlimited
fn collection_max_workers(task_config: &TaskConfig, item_count: usize) -> usize {
    if item_count == 0 {
        return 1;
    }
    match task_config.mode() {
        CollectionMode::Sequential if task_config.collection.batch > 0 => {
            task_config.collection.batch
        }
        CollectionMode::Sequential => 1,
        CollectionMode::Parallel => 0,
    }
}

fn collection_template(task_config: &TaskConfig) -> Result<TaskConfig> {
    if let Some(template) = task_config.task.as_deref() {
        return Ok(template.clone());
    }
    task_config.tasks.first().cloned().ok_or_else(|| {
        TaskflowError::ValidationFailed(format!(
            "collection task {} requires a task template",
            task_config.id
        ))
    })
}

fn require_type(task_config: &TaskConfig, expected: TaskType) -> Result<()> {
    if task_config.task_type != expected {
        return Err(TaskflowError::InvalidArgument(format!(
            "task config must be {expected} type, got: {}",
            task_config.task_type
        )));
    }
    Ok(())
}

pub(crate) fn check_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TaskflowError::Cancelled(operation.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::MemoryConfigStore;

    fn manager() -> ConfigManager {
        ConfigManager::new(
            Arc::new(MemoryConfigStore::new()),
            ConfigManagerOptions {
                default_cwd: Some("/default".to_string()),
            },
        )
    }

    #[test]
    fn test_collection_max_workers() {
        let mut config = TaskConfig::new("c", TaskType::Collection);
        assert_eq!(collection_max_workers(&config, 3), 0);
        config.collection.mode = Some(CollectionMode::Sequential);
        assert_eq!(collection_max_workers(&config, 3), 1);
        config.collection.batch = 4;
        assert_eq!(collection_max_workers(&config, 3), 4);
        assert_eq!(collection_max_workers(&config, 0), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let cancel = CancellationToken::new();
        let err = manager()
            .prepare_parallel_configs(
                &cancel,
                ExecId::new(),
                &TaskConfig::new("x", TaskType::Basic),
            )
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("task config must be parallel type, got: basic")
        );
    }

    #[tokio::test]
    async fn test_children_fall_back_to_default_cwd() {
        let cancel = CancellationToken::new();
        let config = TaskConfig::new("p", TaskType::Parallel).with_tasks(vec![
            TaskConfig::new("a", TaskType::Basic),
            TaskConfig::new("b", TaskType::Basic),
        ]);
        let metadata = manager()
            .prepare_parallel_configs(&cancel, ExecId::new(), &config)
            .await
            .unwrap();
        assert!(
            metadata
                .child_configs
                .iter()
                .all(|child| child.cwd.as_deref() == Some("/default"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_child_ids_rejected() {
        let cancel = CancellationToken::new();
        let config = TaskConfig::new("p", TaskType::Parallel).with_tasks(vec![
            TaskConfig::new("a", TaskType::Basic),
            TaskConfig::new("b", TaskType::Basic),
            TaskConfig::new("a", TaskType::Basic),
        ]);
        let err = manager()
            .prepare_parallel_configs(&cancel, ExecId::new(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), TaskflowError::ValidationFailed(_)));
        assert!(
            err.to_string()
                .contains("child config at index 2 duplicates ID 'a' from index 0")
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager()
            .prepare_composite_configs(
                &cancel,
                ExecId::new(),
                &TaskConfig::new("c", TaskType::Composite),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}

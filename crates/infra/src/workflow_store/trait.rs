use std::sync::Arc;

use thiserror::Error;

use invflow_core::{ExpectedVersion, InstanceId, TaskId};
use invflow_workflow::InstanceAggregate;

use crate::error::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowStoreError {
    #[error("workflow instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("workflow task {0} not found")]
    TaskNotFound(TaskId),

    /// Another commit landed first.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("workflow store backend error: {0}")]
    Backend(String),
}

impl From<WorkflowStoreError> for EngineError {
    fn from(value: WorkflowStoreError) -> Self {
        match value {
            WorkflowStoreError::InstanceNotFound(_) | WorkflowStoreError::TaskNotFound(_) => {
                EngineError::NotFound(value.to_string())
            }
            WorkflowStoreError::Concurrency(msg) => EngineError::Busy(msg),
            WorkflowStoreError::Backend(msg) => EngineError::Store(msg),
        }
    }
}

/// Persistence boundary for workflow instances.
///
/// An instance is stored together with its tasks, assignee pools and action
/// log, so one `save` commits a whole transition atomically.
pub trait WorkflowStore: Send + Sync {
    fn load(&self, instance_id: InstanceId) -> Result<InstanceAggregate, WorkflowStoreError>;

    /// Owning instance of `task_id`.
    fn instance_for_task(&self, task_id: TaskId) -> Result<InstanceId, WorkflowStoreError>;

    /// Commit `aggregate` if the stored version matches `expected`
    /// (`Exact(0)` for a new instance). Returns the new version.
    fn save(
        &self,
        aggregate: &InstanceAggregate,
        expected: ExpectedVersion,
    ) -> Result<u64, WorkflowStoreError>;
}

impl<S> WorkflowStore for Arc<S>
where
    S: WorkflowStore + ?Sized,
{
    fn load(&self, instance_id: InstanceId) -> Result<InstanceAggregate, WorkflowStoreError> {
        (**self).load(instance_id)
    }

    fn instance_for_task(&self, task_id: TaskId) -> Result<InstanceId, WorkflowStoreError> {
        (**self).instance_for_task(task_id)
    }

    fn save(
        &self,
        aggregate: &InstanceAggregate,
        expected: ExpectedVersion,
    ) -> Result<u64, WorkflowStoreError> {
        (**self).save(aggregate, expected)
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use invflow_core::{AggregateRoot, ExpectedVersion, InstanceId, TaskId};
use invflow_workflow::InstanceAggregate;

use super::r#trait::{WorkflowStore, WorkflowStoreError};

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<InstanceId, InstanceAggregate>,
    task_index: HashMap<TaskId, InstanceId>,
}

/// In-memory workflow store.
///
/// Intended for tests/dev. Version checks happen under the write lock.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    tables: RwLock<Tables>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.instances.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn load(&self, instance_id: InstanceId) -> Result<InstanceAggregate, WorkflowStoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| WorkflowStoreError::Backend("lock poisoned".to_string()))?;
        tables
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(WorkflowStoreError::InstanceNotFound(instance_id))
    }

    fn instance_for_task(&self, task_id: TaskId) -> Result<InstanceId, WorkflowStoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| WorkflowStoreError::Backend("lock poisoned".to_string()))?;
        tables
            .task_index
            .get(&task_id)
            .copied()
            .ok_or(WorkflowStoreError::TaskNotFound(task_id))
    }

    fn save(
        &self,
        aggregate: &InstanceAggregate,
        expected: ExpectedVersion,
    ) -> Result<u64, WorkflowStoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| WorkflowStoreError::Backend("lock poisoned".to_string()))?;

        let instance_id = *aggregate.id();
        let current = tables.instances.get(&instance_id).map_or(0, |a| a.version);
        if !expected.matches(current) {
            return Err(WorkflowStoreError::Concurrency(format!(
                "instance {instance_id}: expected {expected:?}, found {current}"
            )));
        }

        let mut stored = aggregate.clone();
        stored.take_events();
        stored.version = current + 1;
        for task in &stored.tasks {
            tables.task_index.insert(task.id, instance_id);
        }
        tables.instances.insert(instance_id, stored);
        Ok(current + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use invflow_core::{TemplateId, UserId};
    use invflow_workflow::{AssignmentMode, RequestContext, StepType, WorkflowStep};
    use std::collections::{BTreeMap, BTreeSet};

    fn fresh() -> InstanceAggregate {
        let ctx = RequestContext {
            requestor: UserId::new(),
            department_id: None,
            warehouse_id: None,
        };
        InstanceAggregate::start(TemplateId::new(), "REQ-1", ctx, BTreeMap::new(), Utc::now())
    }

    #[test]
    fn save_bumps_version_and_indexes_tasks() {
        let store = InMemoryWorkflowStore::new();
        let mut agg = fresh();
        let step = WorkflowStep::new(agg.instance.template_id, 10, StepType::Approval, AssignmentMode::Req);
        let task_id = agg
            .open_task(&step, BTreeSet::from([agg.instance.initiator]), Utc::now())
            .unwrap();

        assert_eq!(store.save(&agg, ExpectedVersion::Exact(0)).unwrap(), 1);
        assert_eq!(store.instance_for_task(task_id).unwrap(), agg.instance_id());

        let loaded = store.load(agg.instance_id()).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.tasks.len(), 1);
    }

    #[test]
    fn stale_save_is_a_conflict() {
        let store = InMemoryWorkflowStore::new();
        let agg = fresh();
        store.save(&agg, ExpectedVersion::Exact(0)).unwrap();

        let err = store.save(&agg, ExpectedVersion::Exact(0)).unwrap_err();
        assert!(matches!(err, WorkflowStoreError::Concurrency(_)));
        assert_eq!(store.load(agg.instance_id()).unwrap().version, 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = InMemoryWorkflowStore::new();
        assert!(matches!(
            store.load(InstanceId::new()),
            Err(WorkflowStoreError::InstanceNotFound(_))
        ));
        assert!(matches!(
            store.instance_for_task(TaskId::new()),
            Err(WorkflowStoreError::TaskNotFound(_))
        ));
    }
}

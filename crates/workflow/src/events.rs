use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use invflow_core::{InstanceId, StepId, TaskId, TemplateId, UserId};
use invflow_events::Event;

use crate::instance::InstanceStatus;
use crate::task::{ActionKind, TaskStatus};

/// Event: InstanceStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStarted {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub business_entity_key: String,
    pub initiator: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TaskCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub step_id: StepId,
    pub status: TaskStatus,
    pub assignees: Vec<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TaskClaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClaimed {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TaskTransitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransitioned {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub action: ActionKind,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub user_id: UserId,
    pub system: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InstanceFinished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFinished {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    InstanceStarted(InstanceStarted),
    TaskCreated(TaskCreated),
    TaskClaimed(TaskClaimed),
    TaskTransitioned(TaskTransitioned),
    InstanceFinished(InstanceFinished),
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            WorkflowEvent::InstanceStarted(e) => e.instance_id,
            WorkflowEvent::TaskCreated(e) => e.instance_id,
            WorkflowEvent::TaskClaimed(e) => e.instance_id,
            WorkflowEvent::TaskTransitioned(e) => e.instance_id,
            WorkflowEvent::InstanceFinished(e) => e.instance_id,
        }
    }
}

impl Event for WorkflowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::InstanceStarted(_) => "workflow.instance.started",
            WorkflowEvent::TaskCreated(_) => "workflow.task.created",
            WorkflowEvent::TaskClaimed(_) => "workflow.task.claimed",
            WorkflowEvent::TaskTransitioned(_) => "workflow.task.transitioned",
            WorkflowEvent::InstanceFinished(_) => "workflow.instance.finished",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkflowEvent::InstanceStarted(e) => e.occurred_at,
            WorkflowEvent::TaskCreated(e) => e.occurred_at,
            WorkflowEvent::TaskClaimed(e) => e.occurred_at,
            WorkflowEvent::TaskTransitioned(e) => e.occurred_at,
            WorkflowEvent::InstanceFinished(e) => e.occurred_at,
        }
    }
}

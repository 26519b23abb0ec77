use thiserror::Error;

use invflow_core::{DomainError, InstanceId, StepId, TaskId, TemplateId, UserId};

use crate::instance::InstanceStatus;
use crate::task::{ActionKind, TaskStatus};
use crate::template::AssignmentMode;

/// Pure workflow failures. Infra maps these onto its public error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("workflow template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("step {0} not found")]
    StepNotFound(StepId),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("unknown action code '{0}'")]
    UnknownAction(String),

    #[error("action {action} is not allowed while the task is {status}")]
    InvalidTransition {
        status: TaskStatus,
        action: ActionKind,
    },

    #[error("instance {instance_id} is {status} and accepts no further actions")]
    InstanceClosed {
        instance_id: InstanceId,
        status: InstanceStatus,
    },

    #[error("step {step_id} does not allow send-back{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    SendBackNotAllowed {
        step_id: StepId,
        reason: Option<String>,
    },

    #[error("task {task_id} already claimed")]
    AlreadyClaimed {
        task_id: TaskId,
        claimed_by: Option<UserId>,
    },

    #[error("user {user_id} may not {action} task {task_id}")]
    NotEntitled {
        task_id: TaskId,
        user_id: UserId,
        action: ActionKind,
    },

    #[error("no eligible assignee for step {step_id} ({mode})")]
    NoEligibleAssignee { step_id: StepId, mode: AssignmentMode },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl WorkflowError {
    pub fn invalid_template(msg: impl Into<String>) -> Self {
        Self::InvalidTemplate(msg.into())
    }
}

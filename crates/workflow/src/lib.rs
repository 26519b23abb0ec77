//! Workflow domain (pure).
//!
//! Templates and their validation, the assignment resolver, the task
//! transition table and the instance aggregate that owns tasks, candidate
//! pools and the action log. Orchestration across stores, the ledger and
//! the authorization oracle lives in `invflow-infra`.

pub mod assignment;
pub mod error;
pub mod events;
pub mod instance;
pub mod task;
pub mod template;

pub use assignment::{DirectoryUser, RequestContext, resolve_assignees};
pub use error::WorkflowError;
pub use events::{
    InstanceFinished, InstanceStarted, TaskClaimed, TaskCreated, TaskTransitioned, WorkflowEvent,
};
pub use instance::{
    ActionInput, InstanceAggregate, InstanceStatus, ManualAssignment, WorkflowInstance,
};
pub use task::{
    ActionKind, AssigneeStatus, TaskAssignee, TaskStatus, WorkflowTask, WorkflowTaskAction,
    transition,
};
pub use template::{
    AssignmentMode, SendBackTarget, StepRule, StepType, TemplateStatus, WorkflowStep,
    WorkflowTemplate,
};

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use invflow_core::{InstanceId, StepId, TaskId, UserId};

use crate::error::WorkflowError;
use crate::template::WorkflowStep;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Available,
    Claimed,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Available,
        TaskStatus::Claimed,
        TaskStatus::Approved,
        TaskStatus::Rejected,
        TaskStatus::Cancelled,
        TaskStatus::Completed,
    ];

    /// APPROVED is not terminal: it waits for closure (possibly after a retried posting).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected | TaskStatus::Cancelled | TaskStatus::Completed
        )
    }

    pub fn code(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Available => "AVAILABLE",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Approved => "APPROVED",
            TaskStatus::Rejected => "REJECTED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Completed => "COMPLETED",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Everything an actor (or the engine) can do to a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Submit,
    Claim,
    Approve,
    Reject,
    SendBack,
    Cancel,
    Complete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Submit,
        ActionKind::Claim,
        ActionKind::Approve,
        ActionKind::Reject,
        ActionKind::SendBack,
        ActionKind::Cancel,
        ActionKind::Complete,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ActionKind::Submit => "SUBMIT",
            ActionKind::Claim => "CLAIM",
            ActionKind::Approve => "APPROVE",
            ActionKind::Reject => "REJECT",
            ActionKind::SendBack => "SEND_BACK",
            ActionKind::Cancel => "CANCEL",
            ActionKind::Complete => "COMPLETE",
        }
    }
}

impl core::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ActionKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|a| a.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| WorkflowError::UnknownAction(s.to_string()))
    }
}

/// The transition table. Anything not listed is an invalid transition.
pub fn transition(status: TaskStatus, action: ActionKind) -> Result<TaskStatus, WorkflowError> {
    use ActionKind as A;
    use TaskStatus as S;

    let next = match (status, action) {
        (S::Pending, A::Submit) => S::Available,
        // Resubmission of a START task reopened by a send-back.
        (S::Available, A::Submit) => S::Completed,
        (S::Pending, A::Complete) => S::Completed,
        (S::Available, A::Claim) => S::Claimed,
        (S::Available, A::Complete) => S::Completed,
        (S::Claimed, A::Approve) => S::Approved,
        (S::Claimed, A::Reject) => S::Rejected,
        (S::Claimed, A::SendBack) => S::Cancelled,
        (S::Approved, A::Complete) => S::Completed,
        (s, A::Cancel) if !s.is_terminal() => S::Cancelled,
        _ => return Err(WorkflowError::InvalidTransition { status, action }),
    };
    Ok(next)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssigneeStatus {
    Pending,
    Approved,
    Rejected,
    Removed,
    Delegated,
}

/// One member of a task's candidate pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignee {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub status: AssigneeStatus,
}

/// Append-only record of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTaskAction {
    pub task_id: TaskId,
    pub action: ActionKind,
    pub user_id: UserId,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
    pub payload: Option<JsonValue>,
    /// Recorded by the engine as a follow-up of `user_id`'s action.
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<UserId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Bumped on every transition of this task.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTask {
    /// A fresh task for `step`: PENDING for START/END, AVAILABLE otherwise.
    pub fn open(instance_id: InstanceId, step: &WorkflowStep, now: DateTime<Utc>) -> Self {
        let status = if step.step_type.is_automatic() {
            TaskStatus::Pending
        } else {
            TaskStatus::Available
        };
        Self {
            id: TaskId::new(),
            instance_id,
            step_id: step.id,
            status,
            created_at: now,
            due_at: step
                .rule
                .sla_minutes
                .map(|m| now + Duration::minutes(i64::from(m))),
            completed_at: None,
            claimed_by: None,
            claimed_at: None,
            notes: None,
            version: 0,
            updated_at: now,
        }
    }

    /// A send-back target: AVAILABLE whatever the step type.
    pub fn reopened(instance_id: InstanceId, step: &WorkflowStep, now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Available,
            ..Self::open(instance_id, step, now)
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.due_at.is_some_and(|due| due < now)
    }

    /// Move along the transition table. Returns the previous status.
    pub fn apply(
        &mut self,
        action: ActionKind,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, WorkflowError> {
        let previous = self.status;
        self.status = transition(previous, action)?;
        if let Some(n) = notes {
            self.notes = Some(n.to_string());
        }
        if self.status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.version += 1;
        self.updated_at = now;
        Ok(previous)
    }
}

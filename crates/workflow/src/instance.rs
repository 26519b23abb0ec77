use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use invflow_core::{AggregateRoot, DomainError, InstanceId, StepId, TaskId, TemplateId, UserId};

use crate::assignment::RequestContext;
use crate::error::WorkflowError;
use crate::events::{
    InstanceFinished, InstanceStarted, TaskClaimed, TaskCreated, TaskTransitioned, WorkflowEvent,
};
use crate::task::{
    ActionKind, AssigneeStatus, TaskAssignee, TaskStatus, WorkflowTask, WorkflowTaskAction,
};
use crate::template::WorkflowStep;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Suspended,
    Completed,
    Rejected,
    Cancelled,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Active | InstanceStatus::Suspended)
    }

    pub fn code(self) -> &'static str {
        match self {
            InstanceStatus::Active => "ACTIVE",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Rejected => "REJECTED",
            InstanceStatus::Cancelled => "CANCELLED",
            InstanceStatus::Terminated => "TERMINATED",
        }
    }
}

impl core::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Requester-chosen assignees for one step, used instead of the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAssignment {
    pub step_id: StepId,
    pub users: BTreeSet<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    /// Opaque reference to the inventory request.
    pub business_entity_key: String,
    pub initiator: UserId,
    pub context: RequestContext,
    pub status: InstanceStatus,
    /// `None` once terminal.
    pub current_step_id: Option<StepId>,
    pub manual_assignments: BTreeMap<StepId, BTreeSet<UserId>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Free-text and structured input attached to an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInput {
    pub notes: Option<String>,
    pub payload: Option<JsonValue>,
}

/// Aggregate root: an instance together with the tasks, pools and action log it owns.
///
/// Every method either applies fully or returns an error with `self`
/// unchanged; callers that chain several steps work on a clone and commit
/// the clone.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceAggregate {
    pub instance: WorkflowInstance,
    pub tasks: Vec<WorkflowTask>,
    pub assignees: Vec<TaskAssignee>,
    pub actions: Vec<WorkflowTaskAction>,
    /// Bumped by the store on every commit.
    pub version: u64,
    pending: Vec<WorkflowEvent>,
}

impl AggregateRoot for InstanceAggregate {
    type Id = InstanceId;

    fn id(&self) -> &Self::Id {
        &self.instance.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl InstanceAggregate {
    /// A new ACTIVE instance with no tasks yet.
    pub fn start(
        template_id: TemplateId,
        business_entity_key: impl Into<String>,
        context: RequestContext,
        manual_assignments: BTreeMap<StepId, BTreeSet<UserId>>,
        now: DateTime<Utc>,
    ) -> Self {
        let instance = WorkflowInstance {
            id: InstanceId::new(),
            template_id,
            business_entity_key: business_entity_key.into(),
            initiator: context.requestor,
            context,
            status: InstanceStatus::Active,
            current_step_id: None,
            manual_assignments,
            started_at: now,
            completed_at: None,
        };
        let started = WorkflowEvent::InstanceStarted(InstanceStarted {
            instance_id: instance.id,
            template_id,
            business_entity_key: instance.business_entity_key.clone(),
            initiator: instance.initiator,
            occurred_at: now,
        });
        Self {
            instance,
            tasks: Vec::new(),
            assignees: Vec::new(),
            actions: Vec::new(),
            version: 0,
            pending: vec![started],
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn ensure_active(&self) -> Result<(), WorkflowError> {
        if self.instance.status.is_terminal() {
            return Err(WorkflowError::InstanceClosed {
                instance_id: self.instance.id,
                status: self.instance.status,
            });
        }
        Ok(())
    }

    pub fn task(&self, task_id: TaskId) -> Result<&WorkflowTask, WorkflowError> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or(WorkflowError::TaskNotFound(task_id))
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut WorkflowTask, WorkflowError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(WorkflowError::TaskNotFound(task_id))
    }

    /// The single open task, if any.
    pub fn current_task(&self) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.is_open())
    }

    /// Users still in the unconsumed pool of `task_id`.
    pub fn candidates(&self, task_id: TaskId) -> BTreeSet<UserId> {
        self.assignees
            .iter()
            .filter(|a| a.task_id == task_id && a.status == AssigneeStatus::Pending)
            .map(|a| a.user_id)
            .collect()
    }

    pub fn actions_for(&self, task_id: TaskId) -> impl Iterator<Item = &WorkflowTaskAction> {
        self.actions.iter().filter(move |a| a.task_id == task_id)
    }

    /// Create the task for `step` with its candidate pool and make it current.
    pub fn open_task(
        &mut self,
        step: &WorkflowStep,
        pool: BTreeSet<UserId>,
        now: DateTime<Utc>,
    ) -> Result<TaskId, WorkflowError> {
        let task = WorkflowTask::open(self.instance.id, step, now);
        self.push_task(step, task, pool, now)
    }

    /// Like [`InstanceAggregate::open_task`], but the task starts AVAILABLE.
    pub fn reopen_task(
        &mut self,
        step: &WorkflowStep,
        pool: BTreeSet<UserId>,
        now: DateTime<Utc>,
    ) -> Result<TaskId, WorkflowError> {
        let task = WorkflowTask::reopened(self.instance.id, step, now);
        self.push_task(step, task, pool, now)
    }

    fn push_task(
        &mut self,
        step: &WorkflowStep,
        task: WorkflowTask,
        pool: BTreeSet<UserId>,
        now: DateTime<Utc>,
    ) -> Result<TaskId, WorkflowError> {
        self.ensure_active()?;
        if let Some(open) = self.current_task() {
            return Err(DomainError::invariant(format!(
                "instance {} already has open task {}",
                self.instance.id, open.id
            ))
            .into());
        }

        let task_id = task.id;
        self.assignees.extend(pool.iter().map(|user_id| TaskAssignee {
            task_id,
            user_id: *user_id,
            status: AssigneeStatus::Pending,
        }));
        self.pending.push(WorkflowEvent::TaskCreated(TaskCreated {
            instance_id: self.instance.id,
            task_id,
            step_id: step.id,
            status: task.status,
            assignees: pool.into_iter().collect(),
            occurred_at: now,
        }));
        self.tasks.push(task);
        self.instance.current_step_id = Some(step.id);
        Ok(task_id)
    }

    /// Check that `user` may perform `action` on `task_id` by themselves.
    ///
    /// CANCEL and CLAIM are decided elsewhere (oracle / pool membership).
    pub fn ensure_actor(
        &self,
        task_id: TaskId,
        action: ActionKind,
        user: UserId,
    ) -> Result<(), WorkflowError> {
        let task = self.task(task_id)?;
        let entitled = match action {
            ActionKind::Submit => user == self.instance.initiator,
            ActionKind::Approve | ActionKind::Reject | ActionKind::SendBack => {
                task.claimed_by == Some(user)
            }
            ActionKind::Complete => {
                task.status == TaskStatus::Approved && task.claimed_by == Some(user)
            }
            ActionKind::Claim | ActionKind::Cancel => true,
        };
        if entitled {
            Ok(())
        } else {
            Err(WorkflowError::NotEntitled {
                task_id,
                user_id: user,
                action,
            })
        }
    }

    /// AVAILABLE -> CLAIMED for a member of the pool. Consumes the pool.
    pub fn claim(
        &mut self,
        task_id: TaskId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        self.ensure_active()?;
        let task = self.task(task_id)?;
        match task.status {
            TaskStatus::Available => {}
            TaskStatus::Claimed => {
                return Err(WorkflowError::AlreadyClaimed {
                    task_id,
                    claimed_by: task.claimed_by,
                });
            }
            status => {
                return Err(WorkflowError::InvalidTransition {
                    status,
                    action: ActionKind::Claim,
                });
            }
        }
        if !self.candidates(task_id).contains(&user) {
            return Err(WorkflowError::NotEntitled {
                task_id,
                user_id: user,
                action: ActionKind::Claim,
            });
        }

        let task = self.task_mut(task_id)?;
        let from = task.apply(ActionKind::Claim, None, now)?;
        task.claimed_by = Some(user);
        task.claimed_at = Some(now);

        for a in self.assignees.iter_mut().filter(|a| a.task_id == task_id) {
            if a.user_id != user && a.status == AssigneeStatus::Pending {
                a.status = AssigneeStatus::Removed;
            }
        }
        self.record(task_id, ActionKind::Claim, from, user, ActionInput::default(), false, now);
        self.pending.push(WorkflowEvent::TaskClaimed(TaskClaimed {
            instance_id: self.instance.id,
            task_id,
            user_id: user,
            occurred_at: now,
        }));
        Ok(())
    }

    /// Apply `action` to `task_id` and record it. Returns the new task status.
    pub fn act(
        &mut self,
        task_id: TaskId,
        action: ActionKind,
        actor: UserId,
        input: ActionInput,
        system: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, WorkflowError> {
        self.ensure_active()?;
        if action == ActionKind::Claim {
            self.claim(task_id, actor, now)?;
            return Ok(TaskStatus::Claimed);
        }

        let task = self.task_mut(task_id)?;
        let from = task.apply(action, input.notes.as_deref(), now)?;
        let to = task.status;
        let claimant = task.claimed_by;

        let verdict = match action {
            ActionKind::Approve => Some(AssigneeStatus::Approved),
            ActionKind::Reject => Some(AssigneeStatus::Rejected),
            _ => None,
        };
        if let (Some(verdict), Some(claimant)) = (verdict, claimant) {
            for a in self
                .assignees
                .iter_mut()
                .filter(|a| a.task_id == task_id && a.user_id == claimant)
            {
                a.status = verdict;
            }
        }

        self.record(task_id, action, from, actor, input, system, now);
        Ok(to)
    }

    /// Close the instance with a terminal `status`, cancelling any open task.
    pub fn finish(
        &mut self,
        status: InstanceStatus,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        self.ensure_active()?;
        if !status.is_terminal() {
            return Err(DomainError::validation(format!("{status} is not a terminal status")).into());
        }

        let open: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.is_open())
            .map(|t| t.id)
            .collect();
        for task_id in open {
            self.act(task_id, ActionKind::Cancel, actor, ActionInput::default(), true, now)?;
        }

        self.instance.status = status;
        self.instance.current_step_id = None;
        self.instance.completed_at = Some(now);
        self.pending.push(WorkflowEvent::InstanceFinished(InstanceFinished {
            instance_id: self.instance.id,
            status,
            occurred_at: now,
        }));
        Ok(())
    }

    /// Events produced since the last call, in order.
    pub fn take_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.pending)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        task_id: TaskId,
        action: ActionKind,
        from: TaskStatus,
        user_id: UserId,
        input: ActionInput,
        system: bool,
        now: DateTime<Utc>,
    ) {
        let to = self
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .map_or(from, |t| t.status);
        self.actions.push(WorkflowTaskAction {
            task_id,
            action,
            user_id,
            at: now,
            notes: input.notes,
            payload: input.payload,
            system,
        });
        self.pending
            .push(WorkflowEvent::TaskTransitioned(TaskTransitioned {
                instance_id: self.instance.id,
                task_id,
                action,
                from,
                to,
                user_id,
                system,
                occurred_at: now,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{AssignmentMode, StepType};

    fn setup() -> (InstanceAggregate, WorkflowStep, UserId, UserId) {
        let requestor = UserId::new();
        let ctx = RequestContext {
            requestor,
            department_id: None,
            warehouse_id: None,
        };
        let agg = InstanceAggregate::start(TemplateId::new(), "REQ-1", ctx, BTreeMap::new(), Utc::now());
        let step = WorkflowStep::new(agg.instance.template_id, 20, StepType::Approval, AssignmentMode::Role);
        let a = UserId::new();
        let b = UserId::new();
        (agg, step, a, b)
    }

    #[test]
    fn claim_consumes_the_pool() {
        let (mut agg, step, a, b) = setup();
        let task_id = agg.open_task(&step, BTreeSet::from([a, b]), Utc::now()).unwrap();

        agg.claim(task_id, a, Utc::now()).unwrap();
        let task = agg.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by, Some(a));
        assert_eq!(agg.candidates(task_id), BTreeSet::from([a]));

        let err = agg.claim(task_id, b, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::AlreadyClaimed {
                task_id,
                claimed_by: Some(a)
            }
        );
    }

    #[test]
    fn outsiders_cannot_claim() {
        let (mut agg, step, a, _) = setup();
        let task_id = agg.open_task(&step, BTreeSet::from([a]), Utc::now()).unwrap();
        let before = agg.clone();
        let err = agg.claim(task_id, UserId::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::NotEntitled { action: ActionKind::Claim, .. }));
        assert_eq!(agg, before);
    }

    #[test]
    fn only_the_claimant_may_decide() {
        let (mut agg, step, a, b) = setup();
        let task_id = agg.open_task(&step, BTreeSet::from([a, b]), Utc::now()).unwrap();
        agg.claim(task_id, a, Utc::now()).unwrap();

        assert!(agg.ensure_actor(task_id, ActionKind::Approve, b).is_err());
        agg.ensure_actor(task_id, ActionKind::Approve, a).unwrap();

        let status = agg
            .act(task_id, ActionKind::Approve, a, ActionInput::default(), false, Utc::now())
            .unwrap();
        assert_eq!(status, TaskStatus::Approved);
        assert!(
            agg.assignees
                .iter()
                .any(|x| x.user_id == a && x.status == AssigneeStatus::Approved)
        );
        assert!(
            agg.assignees
                .iter()
                .any(|x| x.user_id == b && x.status == AssigneeStatus::Removed)
        );
    }

    #[test]
    fn one_open_task_at_a_time() {
        let (mut agg, step, a, _) = setup();
        agg.open_task(&step, BTreeSet::from([a]), Utc::now()).unwrap();
        assert!(matches!(
            agg.open_task(&step, BTreeSet::from([a]), Utc::now()),
            Err(WorkflowError::Domain(DomainError::InvariantViolation(_)))
        ));
    }

    #[test]
    fn finishing_cancels_open_tasks_and_freezes_the_instance() {
        let (mut agg, step, a, _) = setup();
        let task_id = agg.open_task(&step, BTreeSet::from([a]), Utc::now()).unwrap();
        agg.finish(InstanceStatus::Cancelled, a, Utc::now()).unwrap();

        assert_eq!(agg.status(), InstanceStatus::Cancelled);
        assert_eq!(agg.instance.current_step_id, None);
        assert_eq!(agg.task(task_id).unwrap().status, TaskStatus::Cancelled);
        assert!(agg.actions_for(task_id).any(|x| x.system));
        assert!(matches!(
            agg.claim(task_id, a, Utc::now()),
            Err(WorkflowError::InstanceClosed { .. })
        ));
    }

    #[test]
    fn events_are_drained_in_order() {
        let (mut agg, step, a, _) = setup();
        let task_id = agg.open_task(&step, BTreeSet::from([a]), Utc::now()).unwrap();
        agg.claim(task_id, a, Utc::now()).unwrap();

        let events = agg.take_events();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                WorkflowEvent::InstanceStarted(_) => "started",
                WorkflowEvent::TaskCreated(_) => "created",
                WorkflowEvent::TaskClaimed(_) => "claimed",
                WorkflowEvent::TaskTransitioned(_) => "transitioned",
                WorkflowEvent::InstanceFinished(_) => "finished",
            })
            .collect();
        assert_eq!(kinds, ["started", "created", "transitioned", "claimed"]);
        assert!(agg.take_events().is_empty());
    }
}

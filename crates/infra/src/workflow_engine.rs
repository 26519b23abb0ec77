//! Workflow Instance Orchestrator.
//!
//! Every mutation of an instance runs the same pipeline:
//!
//! ```text
//! Request
//!   ↓
//! 1. Idempotency gate (replay / in-flight / insert)
//!   ↓
//! 2. Per-instance lock (bounded wait -> Busy)
//!   ↓
//! 3. Load, apply to a working copy (state machine, assignment, authorization)
//!   ↓
//! 4. Ledger postings the step triggers (fulfillment, release)
//!   ↓
//! 5. Save with ExpectedVersion::Exact(loaded); retry on conflict
//!   ↓
//! 6. Publish workflow events, audit (best-effort)
//! ```
//!
//! ## Fulfillment
//!
//! Approving a FULFILLMENT step's task posts its movement before the
//! advancement commits. If the posting fails, only the approval is saved:
//! the task stays APPROVED, the instance stays ACTIVE at that step, and the
//! caller gets the retryable `FulfillmentFailed`. The claimant retries with
//! COMPLETE. Postings are keyed by task id, so a retry never posts twice.
//!
//! ## Send-back
//!
//! SEND_BACK (or REJECT on a step with a send-back target) cancels the task
//! and opens a new AVAILABLE task at the target step with a freshly resolved
//! pool. A START task reopened this way is closed by the initiator's SUBMIT.
//!
//! ## Next assignee
//!
//! When the step an action advances to allows requester selection, the
//! acting user names its assignee unless one was picked at start. The pick
//! must be in the step's resolved pool and pass the authorization oracle.
//!
//! ## Termination
//!
//! REJECT (on a step without send-back) and CANCEL close the instance. The
//! release movement returned by the hooks is posted first; if it fails the
//! termination is not committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::instrument;

use invflow_auth::{Authorizer, Permission, require};
use invflow_core::{ExpectedVersion, InstanceId, StepId, TaskId, TemplateId, UserId, WarehouseId};
use invflow_events::{EventBus, EventEnvelope};
use invflow_workflow::{
    ActionInput, ActionKind, InstanceAggregate, InstanceStatus, ManualAssignment, RequestContext,
    StepType, TaskStatus, WorkflowError, WorkflowEvent, WorkflowStep, WorkflowTask,
    WorkflowTemplate, resolve_assignees, transition,
};

use crate::audit::{self, AuditEntry, AuditSink};
use crate::call::CallOptions;
use crate::config::EngineConfig;
use crate::directory::UserDirectory;
use crate::error::{EngineError, trace_failure};
use crate::fulfillment::FulfillmentHooks;
use crate::idempotency::IdempotencyGate;
use crate::locks::KeyedLocks;
use crate::posting_engine::PostingEngine;
use crate::template_registry::TemplateRegistry;
use crate::workflow_store::{WorkflowStore, WorkflowStoreError};

pub const START_ROUTE: &str = "workflow.start";
pub const PROCESS_ACTION_ROUTE: &str = "workflow.process_action";
pub const CLAIM_ROUTE: &str = "workflow.claim_task";
pub const CANCEL_ROUTE: &str = "workflow.cancel_instance";

const INSTANCE_AGGREGATE: &str = "workflow.instance";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWorkflow {
    pub template_id: TemplateId,
    pub business_entity_key: String,
    pub initiator: UserId,
    pub warehouse_id: Option<WarehouseId>,
    /// Overrides the resolver for the named steps.
    pub manual_assignments: Vec<ManualAssignment>,
}

impl StartWorkflow {
    pub fn new(template_id: TemplateId, business_entity_key: impl Into<String>, initiator: UserId) -> Self {
        Self {
            template_id,
            business_entity_key: business_entity_key.into(),
            initiator,
            warehouse_id: None,
            manual_assignments: Vec::new(),
        }
    }

    pub fn in_warehouse(mut self, warehouse_id: WarehouseId) -> Self {
        self.warehouse_id = Some(warehouse_id);
        self
    }

    pub fn assign(mut self, assignment: ManualAssignment) -> Self {
        self.manual_assignments.push(assignment);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessAction {
    pub task_id: TaskId,
    pub action: ActionKind,
    pub user_id: UserId,
    pub notes: Option<String>,
    pub payload: Option<JsonValue>,
    /// Assignee picked for the step this action advances to.
    pub next_assignee: Option<UserId>,
}

impl ProcessAction {
    pub fn new(task_id: TaskId, action: ActionKind, user_id: UserId) -> Self {
        Self {
            task_id,
            action,
            user_id,
            notes: None,
            payload: None,
            next_assignee: None,
        }
    }

    /// Build from a wire action code such as `"SEND_BACK"`.
    pub fn parse(task_id: TaskId, action_code: &str, user_id: UserId) -> Result<Self, EngineError> {
        Ok(Self::new(task_id, action_code.parse()?, user_id))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_next_assignee(mut self, user: UserId) -> Self {
        self.next_assignee = Some(user);
        self
    }
}

/// State after a committed action; also the replayed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    pub instance_status: InstanceStatus,
    /// The open task after the action, if the instance is still running.
    pub current_task_id: Option<TaskId>,
}

#[derive(Debug, Clone)]
struct Command {
    action: ActionKind,
    user: UserId,
    input: ActionInput,
    next_assignee: Option<UserId>,
}

#[derive(Debug, Copy, Clone)]
enum Target {
    Task(TaskId),
    CurrentOf(InstanceId),
}

/// An APPROVE or COMPLETE that closes a task.
struct Closing {
    task_id: TaskId,
    user: UserId,
    payload: Option<JsonValue>,
    next_assignee: Option<UserId>,
    system: bool,
}

/// What to do with the working copy after a mutation ran.
enum Settled {
    Done,
    /// Commit the working copy, then report the error.
    Failed(EngineError),
}

pub struct WorkflowEngine<B> {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<dyn TemplateRegistry>,
    directory: Arc<dyn UserDirectory>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    hooks: Arc<dyn FulfillmentHooks>,
    postings: Arc<PostingEngine<B>>,
    gate: Arc<IdempotencyGate>,
    bus: B,
    locks: KeyedLocks<InstanceId>,
    commit_retries: u32,
}

/// Collaborators of a [`WorkflowEngine`].
pub struct WorkflowDeps<B> {
    pub store: Arc<dyn WorkflowStore>,
    pub registry: Arc<dyn TemplateRegistry>,
    pub directory: Arc<dyn UserDirectory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<dyn AuditSink>,
    pub hooks: Arc<dyn FulfillmentHooks>,
    pub postings: Arc<PostingEngine<B>>,
    pub gate: Arc<IdempotencyGate>,
    pub bus: B,
}

impl<B> WorkflowEngine<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(deps: WorkflowDeps<B>, config: &EngineConfig) -> Self {
        Self {
            store: deps.store,
            registry: deps.registry,
            directory: deps.directory,
            authorizer: deps.authorizer,
            audit: deps.audit,
            hooks: deps.hooks,
            postings: deps.postings,
            gate: deps.gate,
            bus: deps.bus,
            locks: KeyedLocks::new(config.lock_timeout),
            commit_retries: config.commit_retries,
        }
    }

    /// Create an ACTIVE instance at the template's first step with that
    /// step's task. Returns the instance id.
    #[instrument(
        skip(self, request, opts),
        fields(
            template_id = %request.template_id,
            initiator = %request.initiator,
            business_entity_key = %request.business_entity_key
        )
    )]
    pub async fn start_workflow(
        &self,
        request: StartWorkflow,
        opts: CallOptions,
    ) -> Result<InstanceId, EngineError> {
        let initiator = request.initiator;
        let result = self
            .gate
            .run(opts.key(), initiator, START_ROUTE, opts.deadline, || async move {
                self.start_unchecked(request)
            })
            .await;
        trace_failure(START_ROUTE, &result);
        result
    }

    /// AVAILABLE -> CLAIMED for a member of the task's pool. Of concurrent
    /// claims exactly one succeeds; the others get `AlreadyClaimed`.
    #[instrument(skip(self, opts), fields(task_id = %task_id, user_id = %user))]
    pub async fn claim_task(
        &self,
        task_id: TaskId,
        user: UserId,
        opts: CallOptions,
    ) -> Result<ActionOutcome, EngineError> {
        let command = Command {
            action: ActionKind::Claim,
            user,
            input: ActionInput::default(),
            next_assignee: None,
        };
        let result = self
            .gate
            .run(opts.key(), user, CLAIM_ROUTE, opts.deadline, || {
                self.execute(Target::Task(task_id), command)
            })
            .await;
        trace_failure(CLAIM_ROUTE, &result);
        result
    }

    /// Apply an action to a task and advance or close the instance.
    #[instrument(
        skip(self, request, opts),
        fields(task_id = %request.task_id, action = %request.action, user_id = %request.user_id)
    )]
    pub async fn process_action(
        &self,
        request: ProcessAction,
        opts: CallOptions,
    ) -> Result<ActionOutcome, EngineError> {
        let user = request.user_id;
        let target = Target::Task(request.task_id);
        let command = Command {
            action: request.action,
            user,
            input: ActionInput {
                notes: request.notes,
                payload: request.payload,
            },
            next_assignee: request.next_assignee,
        };
        let result = self
            .gate
            .run(opts.key(), user, PROCESS_ACTION_ROUTE, opts.deadline, || {
                self.execute(target, command)
            })
            .await;
        trace_failure(PROCESS_ACTION_ROUTE, &result);
        result
    }

    /// CANCEL the instance's open task, which cancels the instance.
    #[instrument(skip(self, notes, opts), fields(instance_id = %instance_id, user_id = %user))]
    pub async fn cancel_instance(
        &self,
        instance_id: InstanceId,
        user: UserId,
        notes: Option<String>,
        opts: CallOptions,
    ) -> Result<ActionOutcome, EngineError> {
        let command = Command {
            action: ActionKind::Cancel,
            user,
            input: ActionInput {
                notes,
                payload: None,
            },
            next_assignee: None,
        };
        let result = self
            .gate
            .run(opts.key(), user, CANCEL_ROUTE, opts.deadline, || {
                self.execute(Target::CurrentOf(instance_id), command)
            })
            .await;
        trace_failure(CANCEL_ROUTE, &result);
        result
    }

    pub fn instance(&self, instance_id: InstanceId) -> Result<InstanceAggregate, EngineError> {
        Ok(self.store.load(instance_id)?)
    }

    pub fn task(&self, task_id: TaskId) -> Result<WorkflowTask, EngineError> {
        let instance_id = self.store.instance_for_task(task_id)?;
        Ok(self.store.load(instance_id)?.task(task_id)?.clone())
    }

    fn start_unchecked(&self, request: StartWorkflow) -> Result<InstanceId, EngineError> {
        let now = Utc::now();
        let template = self.registry.get_template(request.template_id)?;
        if !template.can_start() {
            return Err(EngineError::validation(format!(
                "template '{}' is not active and published",
                template.code
            )));
        }
        let first = template
            .first_step()
            .ok_or_else(|| WorkflowError::invalid_template("template has no steps"))?;

        let manual = self.validate_manual_assignments(&template, request.manual_assignments)?;
        let context = RequestContext {
            requestor: request.initiator,
            department_id: self.directory.primary_department(request.initiator)?,
            warehouse_id: request.warehouse_id,
        };

        let mut working = InstanceAggregate::start(
            template.id,
            request.business_entity_key,
            context,
            manual,
            now,
        );
        self.open_step(&mut working, first, request.initiator, now)?;

        let instance_id = working.instance_id();
        let events = working.take_events();
        let version = self.store.save(&working, ExpectedVersion::Exact(0))?;
        working.version = version;
        self.after_commit(None, &working, events, request.initiator, "workflow.instance.start");

        tracing::info!(%instance_id, template = %template.code, "workflow started");
        Ok(instance_id)
    }

    fn validate_manual_assignments(
        &self,
        template: &WorkflowTemplate,
        assignments: Vec<ManualAssignment>,
    ) -> Result<BTreeMap<StepId, BTreeSet<UserId>>, EngineError> {
        let mut manual: BTreeMap<_, BTreeSet<UserId>> = BTreeMap::new();
        for assignment in assignments {
            let step = template.step(assignment.step_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "step {} does not belong to template '{}'",
                    assignment.step_id, template.code
                ))
            })?;
            if !step.rule.allow_requester_select {
                return Err(EngineError::validation(format!(
                    "step {} does not allow requester-selected assignees",
                    step.id
                )));
            }
            if assignment.users.is_empty() {
                return Err(EngineError::validation(format!(
                    "manual assignment for step {} names no users",
                    step.id
                )));
            }
            for user in &assignment.users {
                require(&*self.authorizer, *user, &Permission::WORKFLOW_TASK_ACTION, None, None)?;
            }
            manual.entry(step.id).or_default().extend(assignment.users);
        }
        Ok(manual)
    }

    async fn execute(&self, target: Target, command: Command) -> Result<ActionOutcome, EngineError> {
        let instance_id = match target {
            Target::Task(task_id) => self.store.instance_for_task(task_id)?,
            Target::CurrentOf(instance_id) => instance_id,
        };
        let _instance = self.locks.acquire(&instance_id).await?;

        let mut attempt = 0;
        loop {
            let before = self.store.load(instance_id)?;
            let expected = ExpectedVersion::Exact(before.version);
            let mut working = before.clone();

            let task_id = match target {
                Target::Task(task_id) => task_id,
                Target::CurrentOf(_) => {
                    working.ensure_active()?;
                    working
                        .current_task()
                        .map(|t| t.id)
                        .ok_or_else(|| EngineError::InvalidTransition("instance has no open task".into()))?
                }
            };
            let settled = self.apply(&mut working, task_id, command.clone()).await?;

            let events = working.take_events();
            match self.store.save(&working, expected) {
                Ok(version) => working.version = version,
                Err(WorkflowStoreError::Concurrency(msg)) if attempt < self.commit_retries => {
                    attempt += 1;
                    tracing::debug!(%instance_id, attempt, %msg, "instance commit conflict; retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let audit_action = format!("workflow.task.{}", command.action.code().to_ascii_lowercase());
            self.after_commit(Some(&before), &working, events, command.user, &audit_action);

            return match settled {
                Settled::Done => outcome(&working, task_id),
                Settled::Failed(err) => Err(err),
            };
        }
    }

    async fn apply(
        &self,
        working: &mut InstanceAggregate,
        task_id: TaskId,
        command: Command,
    ) -> Result<Settled, EngineError> {
        let now = Utc::now();
        let Command {
            action,
            user,
            input,
            next_assignee,
        } = command;

        working.ensure_active()?;
        let task = working.task(task_id)?.clone();
        let template = self.registry.get_template(working.instance.template_id)?;
        let step = template
            .step(task.step_id)
            .ok_or(WorkflowError::StepNotFound(task.step_id))?;

        match action {
            ActionKind::Claim => {
                working.claim(task_id, user, now)?;
                tracing::info!(%task_id, %user, "task claimed");
                Ok(Settled::Done)
            }
            ActionKind::Cancel => {
                transition(task.status, action)?;
                self.authorize_cancel(working, &template, &task, user)?;
                working.act(task_id, ActionKind::Cancel, user, input, false, now)?;
                self.terminate(working, InstanceStatus::Cancelled, user, now).await?;
                Ok(Settled::Done)
            }
            ActionKind::Submit => {
                if step.step_type != StepType::Start {
                    return Err(EngineError::InvalidTransition(format!(
                        "SUBMIT applies to START tasks, task {task_id} is at a {:?} step",
                        step.step_type
                    )));
                }
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                // A fresh START task goes PENDING -> AVAILABLE and is then closed
                // by the engine; one reopened by a send-back closes directly.
                if working.act(task_id, ActionKind::Submit, user, input, false, now)? == TaskStatus::Available {
                    working.act(task_id, ActionKind::Complete, user, ActionInput::default(), true, now)?;
                }
                self.advance(working, &template, step, user, next_assignee, now)?;
                Ok(Settled::Done)
            }
            ActionKind::Approve => {
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                let payload = input.payload.clone();
                working.act(task_id, ActionKind::Approve, user, input, false, now)?;
                let close = Closing {
                    task_id,
                    user,
                    payload,
                    next_assignee,
                    system: true,
                };
                self.close_and_advance(working, &template, step, close, now).await
            }
            ActionKind::Complete => {
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                let payload = input.payload.clone().or_else(|| approval_payload(working, task_id));
                let close = Closing {
                    task_id,
                    user,
                    payload,
                    next_assignee,
                    system: false,
                };
                self.close_and_advance(working, &template, step, close, now).await
            }
            ActionKind::Reject if step.permits_send_back() => {
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                self.send_back(working, &template, step, task_id, user, input, now)?;
                Ok(Settled::Done)
            }
            ActionKind::Reject => {
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                working.act(task_id, ActionKind::Reject, user, input, false, now)?;
                self.terminate(working, InstanceStatus::Rejected, user, now).await?;
                Ok(Settled::Done)
            }
            ActionKind::SendBack => {
                transition(task.status, action)?;
                working.ensure_actor(task_id, action, user)?;
                self.send_back(working, &template, step, task_id, user, input, now)?;
                Ok(Settled::Done)
            }
        }
    }

    fn authorize_cancel(
        &self,
        working: &InstanceAggregate,
        template: &WorkflowTemplate,
        task: &WorkflowTask,
        user: UserId,
    ) -> Result<(), EngineError> {
        let initiator_at_first_step =
            user == working.instance.initiator && template.is_first_step(task.step_id);
        if initiator_at_first_step {
            return Ok(());
        }
        require(
            &*self.authorizer,
            user,
            &Permission::WORKFLOW_INSTANCE_CANCEL,
            None,
            Some(*working.instance.id.as_uuid()),
        )?;
        Ok(())
    }

    /// Close an APPROVED task and advance. For a FULFILLMENT step the
    /// posting must succeed first; otherwise only the approval is kept.
    async fn close_and_advance(
        &self,
        working: &mut InstanceAggregate,
        template: &WorkflowTemplate,
        step: &WorkflowStep,
        close: Closing,
        now: DateTime<Utc>,
    ) -> Result<Settled, EngineError> {
        let Closing {
            task_id,
            user,
            payload,
            next_assignee,
            system,
        } = close;
        let approved = working.clone();

        working.act(task_id, ActionKind::Complete, user, ActionInput::default(), system, now)?;
        self.advance(working, template, step, user, next_assignee, now)?;

        if step.step_type == StepType::Fulfillment {
            if let Err(source) = self.fulfill(&approved, task_id, payload.as_ref()).await {
                tracing::warn!(%task_id, error = %source, "fulfillment posting failed; task stays approved");
                *working = approved;
                return Ok(Settled::Failed(EngineError::FulfillmentFailed {
                    task_id,
                    source: Box::new(source),
                }));
            }
        }
        Ok(Settled::Done)
    }

    async fn fulfill(
        &self,
        approved: &InstanceAggregate,
        task_id: TaskId,
        payload: Option<&JsonValue>,
    ) -> Result<(), EngineError> {
        let Some(movement) = self.hooks.on_fulfillment_approved(&approved.instance, payload)? else {
            return Ok(());
        };
        let movement_id = self
            .postings
            .post_for_workflow(movement, &format!("fulfill:{task_id}"))
            .await?;
        tracing::info!(%task_id, %movement_id, "fulfillment posted");
        Ok(())
    }

    /// Open the step after `from`, or complete the instance at the end.
    fn advance(
        &self,
        working: &mut InstanceAggregate,
        template: &WorkflowTemplate,
        from: &WorkflowStep,
        actor: UserId,
        next_assignee: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match template.next_step(from.id)? {
            Some(next) => {
                self.select_next_assignee(working, next, next_assignee)?;
                self.open_step(working, next, actor, now)
            }
            None if next_assignee.is_some() => Err(EngineError::validation(format!(
                "step {} is the last step; there is no next assignee to select",
                from.id
            ))),
            None => {
                working.finish(InstanceStatus::Completed, actor, now)?;
                Ok(())
            }
        }
    }

    /// Record the acting user's pick for `next`. Required when the step
    /// allows requester selection and nothing was picked earlier; refused
    /// when it does not.
    fn select_next_assignee(
        &self,
        working: &mut InstanceAggregate,
        next: &WorkflowStep,
        chosen: Option<UserId>,
    ) -> Result<(), EngineError> {
        if !next.rule.allow_requester_select {
            return match chosen {
                Some(_) => Err(EngineError::validation(format!(
                    "step {} does not allow selecting its assignee",
                    next.id
                ))),
                None => Ok(()),
            };
        }
        let Some(user) = chosen else {
            if working.instance.manual_assignments.contains_key(&next.id) {
                return Ok(());
            }
            return Err(EngineError::validation(format!(
                "step {} requires a selected next assignee",
                next.id
            )));
        };

        let users = self.directory.users()?;
        let eligible = resolve_assignees(next, &working.instance.context, &users)
            .is_ok_and(|pool| pool.contains(&user));
        if !eligible {
            return Err(EngineError::validation(format!(
                "user {user} is not eligible for step {}",
                next.id
            )));
        }
        require(&*self.authorizer, user, &Permission::WORKFLOW_TASK_ACTION, None, None)?;

        working
            .instance
            .manual_assignments
            .insert(next.id, BTreeSet::from([user]));
        tracing::debug!(step_id = %next.id, %user, "next assignee selected");
        Ok(())
    }

    /// Create the task for `step`. END steps close immediately and complete
    /// the instance.
    fn open_step(
        &self,
        working: &mut InstanceAggregate,
        step: &WorkflowStep,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if step.step_type == StepType::End {
            let task_id = working.open_task(step, BTreeSet::new(), now)?;
            working.act(task_id, ActionKind::Complete, actor, ActionInput::default(), true, now)?;
            working.finish(InstanceStatus::Completed, actor, now)?;
            return Ok(());
        }

        let pool = self.pool_for(working, step)?;
        let task_id = working.open_task(step, pool, now)?;
        tracing::debug!(%task_id, step_id = %step.id, step_type = ?step.step_type, "task opened");
        Ok(())
    }

    fn pool_for(&self, working: &InstanceAggregate, step: &WorkflowStep) -> Result<BTreeSet<UserId>, EngineError> {
        match working.instance.manual_assignments.get(&step.id) {
            Some(users) => Ok(users.clone()),
            None => {
                let users = self.directory.users()?;
                Ok(resolve_assignees(step, &working.instance.context, &users)?)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_back(
        &self,
        working: &mut InstanceAggregate,
        template: &WorkflowTemplate,
        step: &WorkflowStep,
        task_id: TaskId,
        user: UserId,
        input: ActionInput,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let target = template.send_back_target(step.id)?;
        working.act(task_id, ActionKind::SendBack, user, input, false, now)?;
        let pool = self.pool_for(working, target)?;
        let reopened = working.reopen_task(target, pool, now)?;
        tracing::info!(%task_id, %reopened, target_step = %target.id, "task sent back");
        Ok(())
    }

    async fn terminate(
        &self,
        working: &mut InstanceAggregate,
        status: InstanceStatus,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if let Some(release) = self.hooks.on_instance_terminated(&working.instance)? {
            let key = format!("release:{}", working.instance.id);
            self.postings.post_for_workflow(release, &key).await?;
        }
        working.finish(status, actor, now)?;
        tracing::info!(instance_id = %working.instance.id, %status, "workflow terminated");
        Ok(())
    }

    fn after_commit(
        &self,
        before: Option<&InstanceAggregate>,
        after: &InstanceAggregate,
        events: Vec<WorkflowEvent>,
        actor: UserId,
        action: &str,
    ) {
        let aggregate_id = *after.instance.id.as_uuid();
        for event in &events {
            match EventEnvelope::from_event(aggregate_id, INSTANCE_AGGREGATE, after.version, event) {
                Ok(envelope) => {
                    if let Err(e) = self.bus.publish(envelope) {
                        tracing::warn!(%aggregate_id, error = ?e, "failed to publish workflow event");
                    }
                }
                Err(e) => tracing::warn!(%aggregate_id, error = %e, "failed to encode workflow event"),
            }
        }

        audit::record(
            &*self.audit,
            AuditEntry {
                user_id: actor,
                action: action.to_string(),
                entity_id: aggregate_id,
                old_value: before.map(snapshot),
                new_value: Some(snapshot(after)),
                at: Utc::now(),
            },
        );
    }
}

fn outcome(working: &InstanceAggregate, task_id: TaskId) -> Result<ActionOutcome, EngineError> {
    Ok(ActionOutcome {
        instance_id: working.instance_id(),
        task_id,
        task_status: working.task(task_id)?.status,
        instance_status: working.status(),
        current_task_id: working.current_task().map(|t| t.id),
    })
}

/// Payload of the APPROVE that a retried COMPLETE closes.
fn approval_payload(working: &InstanceAggregate, task_id: TaskId) -> Option<JsonValue> {
    working
        .actions_for(task_id)
        .filter(|a| a.action == ActionKind::Approve)
        .last()
        .and_then(|a| a.payload.clone())
}

fn snapshot(agg: &InstanceAggregate) -> JsonValue {
    json!({
        "status": agg.instance.status,
        "current_step_id": agg.instance.current_step_id,
        "tasks": agg
            .tasks
            .iter()
            .map(|t| json!({ "id": t.id, "status": t.status, "claimed_by": t.claimed_by }))
            .collect::<Vec<_>>(),
    })
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use invflow_auth::Role;
use invflow_core::{DepartmentId, StepId, TemplateId};

use crate::error::WorkflowError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Start,
    Review,
    Approval,
    Fulfillment,
    End,
}

impl StepType {
    /// START and END tasks are processed by the engine, not claimed by people.
    pub fn is_automatic(self) -> bool {
        matches!(self, StepType::Start | StepType::End)
    }
}

/// Policy that picks the candidate pool for a step's task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentMode {
    Role,
    Dept,
    ReqDept,
    Req,
    ReqRole,
    RoleDept,
    ReqRoleDept,
}

impl AssignmentMode {
    pub fn code(self) -> &'static str {
        match self {
            AssignmentMode::Role => "ROLE",
            AssignmentMode::Dept => "DEPT",
            AssignmentMode::ReqDept => "REQ_DEPT",
            AssignmentMode::Req => "REQ",
            AssignmentMode::ReqRole => "REQ_ROLE",
            AssignmentMode::RoleDept => "ROLE_DEPT",
            AssignmentMode::ReqRoleDept => "REQ_ROLE_DEPT",
        }
    }
}

impl core::fmt::Display for AssignmentMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Which earlier step a send-back reopens.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendBackTarget {
    /// The immediately preceding step by `sequence_no`.
    Previous,
    /// A specific earlier step of the same template.
    Step(StepId),
}

/// Per-step configuration beyond the assignment mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRule {
    pub role: Option<Role>,
    pub department_id: Option<DepartmentId>,
    /// Manual assignments at start may target this step.
    pub allow_requester_select: bool,
    /// `None` means the step cannot send back.
    pub send_back: Option<SendBackTarget>,
    pub sla_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub template_id: TemplateId,
    pub sequence_no: u32,
    pub step_type: StepType,
    pub assignment_mode: AssignmentMode,
    pub rule: StepRule,
}

impl WorkflowStep {
    pub fn new(
        template_id: TemplateId,
        sequence_no: u32,
        step_type: StepType,
        assignment_mode: AssignmentMode,
    ) -> Self {
        Self {
            id: StepId::new(),
            template_id,
            sequence_no,
            step_type,
            assignment_mode,
            rule: StepRule::default(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.rule.role = Some(role);
        self
    }

    pub fn with_department(mut self, department_id: DepartmentId) -> Self {
        self.rule.department_id = Some(department_id);
        self
    }

    pub fn allowing_requester_select(mut self) -> Self {
        self.rule.allow_requester_select = true;
        self
    }

    pub fn with_send_back(mut self, target: SendBackTarget) -> Self {
        self.rule.send_back = Some(target);
        self
    }

    pub fn with_sla_minutes(mut self, minutes: u32) -> Self {
        self.rule.sla_minutes = Some(minutes);
        self
    }

    pub fn permits_send_back(&self) -> bool {
        self.rule.send_back.is_some()
    }
}

/// A workflow definition: ordered steps plus lifecycle status.
///
/// Immutable once registered. Instances hold an `Arc` to the version they
/// started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub code: String,
    pub name: String,
    pub status: TemplateStatus,
    pub is_active: bool,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowTemplate {
    /// A new, active DRAFT template without steps.
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: TemplateId::new(),
            code: code.into(),
            name: name.into(),
            status: TemplateStatus::Draft,
            is_active: true,
            steps: Vec::new(),
        }
    }

    pub fn published(mut self) -> Self {
        self.status = TemplateStatus::Published;
        self
    }

    /// Append a step with the next sequence number (10, 20, ...).
    pub fn push_step(
        &mut self,
        step_type: StepType,
        assignment_mode: AssignmentMode,
        configure: impl FnOnce(WorkflowStep) -> WorkflowStep,
    ) -> StepId {
        let sequence_no = self.steps.last().map_or(10, |s| s.sequence_no + 10);
        let step = configure(WorkflowStep::new(self.id, sequence_no, step_type, assignment_mode));
        let id = step.id;
        self.steps.push(step);
        id
    }

    pub fn can_start(&self) -> bool {
        self.is_active && self.status == TemplateStatus::Published && !self.steps.is_empty()
    }

    /// Sort steps by `sequence_no` and check structural rules.
    pub fn normalize(&mut self) -> Result<(), WorkflowError> {
        self.steps.sort_by_key(|s| s.sequence_no);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.code.trim().is_empty() {
            return Err(WorkflowError::invalid_template("code cannot be empty"));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::invalid_template(format!(
                "template '{}' has no steps",
                self.code
            )));
        }

        let mut ids = BTreeSet::new();
        for pair in self.steps.windows(2) {
            if pair[0].sequence_no >= pair[1].sequence_no {
                return Err(WorkflowError::invalid_template(format!(
                    "sequence_no {} is duplicated or out of order",
                    pair[1].sequence_no
                )));
            }
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.template_id != self.id {
                return Err(WorkflowError::invalid_template(format!(
                    "step {} belongs to template {}",
                    step.id, step.template_id
                )));
            }
            if !ids.insert(step.id) {
                return Err(WorkflowError::invalid_template(format!(
                    "step id {} is duplicated",
                    step.id
                )));
            }
            if let Some(SendBackTarget::Step(target)) = step.rule.send_back {
                let earlier = self.steps[..idx].iter().any(|s| s.id == target);
                if !earlier {
                    return Err(WorkflowError::invalid_template(format!(
                        "step {} sends back to {target}, which is not an earlier step",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }

    pub fn step(&self, id: StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_first_step(&self, id: StepId) -> bool {
        self.first_step().is_some_and(|s| s.id == id)
    }

    /// The step following `id` by sequence, `None` at the end of the template.
    pub fn next_step(&self, id: StepId) -> Result<Option<&WorkflowStep>, WorkflowError> {
        let pos = self.position(id)?;
        Ok(self.steps.get(pos + 1))
    }

    /// The step a send-back from `id` reopens.
    pub fn send_back_target(&self, id: StepId) -> Result<&WorkflowStep, WorkflowError> {
        let pos = self.position(id)?;
        let step = &self.steps[pos];
        match step.rule.send_back {
            None => Err(WorkflowError::SendBackNotAllowed {
                step_id: id,
                reason: None,
            }),
            Some(_) if pos == 0 => Err(WorkflowError::SendBackNotAllowed {
                step_id: id,
                reason: Some("it is the first step".into()),
            }),
            Some(SendBackTarget::Previous) => Ok(&self.steps[pos - 1]),
            Some(SendBackTarget::Step(target)) => self.steps[..pos]
                .iter()
                .find(|s| s.id == target)
                .ok_or(WorkflowError::StepNotFound(target)),
        }
    }

    fn position(&self, id: StepId) -> Result<usize, WorkflowError> {
        self.steps
            .iter()
            .position(|s| s.id == id)
            .ok_or(WorkflowError::StepNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step() -> (WorkflowTemplate, StepId, StepId, StepId) {
        let mut t = WorkflowTemplate::new("REQ", "Inventory request").published();
        let start = t.push_step(StepType::Start, AssignmentMode::Req, |s| s);
        let review = t.push_step(StepType::Review, AssignmentMode::ReqDept, |s| s);
        let approve = t.push_step(StepType::Approval, AssignmentMode::Role, |s| {
            s.with_role(Role::new("approver"))
                .with_send_back(SendBackTarget::Previous)
        });
        (t, start, review, approve)
    }

    #[test]
    fn steps_are_ordered_and_navigable() {
        let (mut t, start, review, approve) = three_step();
        t.steps.reverse();
        t.normalize().unwrap();

        assert_eq!(t.first_step().map(|s| s.id), Some(start));
        assert_eq!(t.next_step(start).unwrap().map(|s| s.id), Some(review));
        assert!(t.next_step(approve).unwrap().is_none());
        assert!(t.can_start());
    }

    #[test]
    fn duplicate_sequence_numbers_are_rejected() {
        let (mut t, ..) = three_step();
        t.steps[1].sequence_no = t.steps[0].sequence_no;
        assert!(matches!(t.normalize(), Err(WorkflowError::InvalidTemplate(_))));
    }

    #[test]
    fn send_back_targets_resolve_to_earlier_steps() {
        let (mut t, start, review, approve) = three_step();
        assert_eq!(t.send_back_target(approve).unwrap().id, review);
        assert!(matches!(
            t.send_back_target(review),
            Err(WorkflowError::SendBackNotAllowed { .. })
        ));

        t.steps[2].rule.send_back = Some(SendBackTarget::Step(start));
        assert_eq!(t.send_back_target(approve).unwrap().id, start);

        t.steps[0].rule.send_back = Some(SendBackTarget::Previous);
        assert!(matches!(
            t.send_back_target(start),
            Err(WorkflowError::SendBackNotAllowed { reason: Some(_), .. })
        ));
    }

    #[test]
    fn forward_send_back_targets_fail_validation() {
        let (mut t, _, review, _) = three_step();
        t.steps[0].rule.send_back = Some(SendBackTarget::Step(review));
        assert!(t.validate().is_err());
    }

    #[test]
    fn drafts_and_inactive_templates_cannot_start() {
        let (mut t, ..) = three_step();
        t.status = TemplateStatus::Draft;
        assert!(!t.can_start());
        t.status = TemplateStatus::Published;
        t.is_active = false;
        assert!(!t.can_start());
    }
}

//! Assignment resolution: step policy + request context -> candidate pool.
//!
//! Pure function over a snapshot of the user directory, so every mode can be
//! tested without persistence.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use invflow_auth::Role;
use invflow_core::{DepartmentId, UserId, WarehouseId};

use crate::error::WorkflowError;
use crate::template::{AssignmentMode, WorkflowStep};

/// Business context a workflow instance was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub requestor: UserId,
    pub department_id: Option<DepartmentId>,
    pub warehouse_id: Option<WarehouseId>,
}

/// Directory view of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub active: bool,
    pub roles: BTreeSet<Role>,
    pub departments: BTreeSet<DepartmentId>,
    pub primary_department: Option<DepartmentId>,
}

impl DirectoryUser {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            active: true,
            roles: BTreeSet::new(),
            departments: BTreeSet::new(),
            primary_department: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    /// Adds a department membership; the first one becomes primary.
    pub fn in_department(mut self, department_id: DepartmentId) -> Self {
        self.departments.insert(department_id);
        self.primary_department.get_or_insert(department_id);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    fn holds(&self, role: Option<&Role>) -> bool {
        role.is_some_and(|r| self.roles.contains(r))
    }

    fn belongs_to(&self, department_id: Option<DepartmentId>) -> bool {
        department_id.is_some_and(|d| self.departments.contains(&d))
    }
}

/// Resolve the candidate pool for `step`.
///
/// A mode that needs a role or department which is not configured (or a
/// requestor without department) matches nobody.
pub fn resolve_assignees(
    step: &WorkflowStep,
    ctx: &RequestContext,
    users: &[DirectoryUser],
) -> Result<BTreeSet<UserId>, WorkflowError> {
    let role = step.rule.role.as_ref();
    let step_dept = step.rule.department_id;
    let req_dept = ctx.department_id;

    let resolved: BTreeSet<UserId> = match step.assignment_mode {
        AssignmentMode::Req => BTreeSet::from([ctx.requestor]),
        mode => users
            .iter()
            .filter(|u| u.active)
            .filter(|u| match mode {
                AssignmentMode::Role => u.holds(role),
                AssignmentMode::Dept => u.belongs_to(step_dept),
                AssignmentMode::ReqDept => u.belongs_to(req_dept),
                AssignmentMode::ReqRole | AssignmentMode::ReqRoleDept => {
                    u.holds(role) && u.belongs_to(req_dept)
                }
                AssignmentMode::RoleDept => u.holds(role) && u.belongs_to(step_dept),
                AssignmentMode::Req => false,
            })
            .map(|u| u.id)
            .collect(),
    };

    if resolved.is_empty() {
        return Err(WorkflowError::NoEligibleAssignee {
            step_id: step.id,
            mode: step.assignment_mode,
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::StepType;
    use invflow_core::TemplateId;

    struct Fixture {
        users: Vec<DirectoryUser>,
        ctx: RequestContext,
        stores: DepartmentId,
        clerk_sales: UserId,
        manager_sales: UserId,
        manager_stores: UserId,
        retired_manager: UserId,
    }

    fn fixture() -> Fixture {
        let sales = DepartmentId::new();
        let stores = DepartmentId::new();
        let manager = Role::new("manager");

        let requestor = UserId::new();
        let clerk_sales = UserId::new();
        let manager_sales = UserId::new();
        let manager_stores = UserId::new();
        let retired_manager = UserId::new();

        let users = vec![
            DirectoryUser::new(requestor).in_department(sales),
            DirectoryUser::new(clerk_sales).in_department(sales),
            DirectoryUser::new(manager_sales)
                .with_role(manager.clone())
                .in_department(sales),
            DirectoryUser::new(manager_stores)
                .with_role(manager.clone())
                .in_department(stores),
            DirectoryUser::new(retired_manager)
                .with_role(manager)
                .in_department(sales)
                .inactive(),
        ];

        Fixture {
            users,
            ctx: RequestContext {
                requestor,
                department_id: Some(sales),
                warehouse_id: Some(WarehouseId::new()),
            },
            stores,
            clerk_sales,
            manager_sales,
            manager_stores,
            retired_manager,
        }
    }

    fn step(mode: AssignmentMode) -> WorkflowStep {
        WorkflowStep::new(TemplateId::new(), 10, StepType::Approval, mode)
    }

    #[test]
    fn role_mode_takes_active_holders_anywhere() {
        let f = fixture();
        let s = step(AssignmentMode::Role).with_role(Role::new("manager"));
        let got = resolve_assignees(&s, &f.ctx, &f.users).unwrap();
        assert_eq!(got, BTreeSet::from([f.manager_sales, f.manager_stores]));
        assert!(!got.contains(&f.retired_manager));
    }

    #[test]
    fn department_modes() {
        let f = fixture();
        let dept = step(AssignmentMode::Dept).with_department(f.stores);
        assert_eq!(
            resolve_assignees(&dept, &f.ctx, &f.users).unwrap(),
            BTreeSet::from([f.manager_stores])
        );

        let req_dept = resolve_assignees(&step(AssignmentMode::ReqDept), &f.ctx, &f.users).unwrap();
        assert_eq!(
            req_dept,
            BTreeSet::from([f.ctx.requestor, f.clerk_sales, f.manager_sales])
        );
    }

    #[test]
    fn requestor_mode_is_the_requestor_alone() {
        let f = fixture();
        let got = resolve_assignees(&step(AssignmentMode::Req), &f.ctx, &f.users).unwrap();
        assert_eq!(got, BTreeSet::from([f.ctx.requestor]));
    }

    #[test]
    fn role_and_department_intersections() {
        let f = fixture();
        let manager = Role::new("manager");

        for mode in [AssignmentMode::ReqRole, AssignmentMode::ReqRoleDept] {
            let s = step(mode).with_role(manager.clone());
            assert_eq!(
                resolve_assignees(&s, &f.ctx, &f.users).unwrap(),
                BTreeSet::from([f.manager_sales])
            );
        }

        let s = step(AssignmentMode::RoleDept)
            .with_role(manager)
            .with_department(f.stores);
        assert_eq!(
            resolve_assignees(&s, &f.ctx, &f.users).unwrap(),
            BTreeSet::from([f.manager_stores])
        );
    }

    #[test]
    fn empty_pool_is_an_error() {
        let f = fixture();
        let no_role = step(AssignmentMode::Role);
        assert!(matches!(
            resolve_assignees(&no_role, &f.ctx, &f.users),
            Err(WorkflowError::NoEligibleAssignee { mode: AssignmentMode::Role, .. })
        ));

        let mut ctx = f.ctx.clone();
        ctx.department_id = None;
        assert!(resolve_assignees(&step(AssignmentMode::ReqDept), &ctx, &f.users).is_err());

        let other = step(AssignmentMode::Dept).with_department(DepartmentId::new());
        assert!(resolve_assignees(&other, &f.ctx, &f.users).is_err());
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use invflow_core::{DepartmentId, UserId, WarehouseId};

use crate::Permission;

/// Breadth of a grant. Ordered by precedence: `Own < Dept < Warehouse < Global`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessScope {
    Own,
    Dept,
    Warehouse,
    Global,
}

/// Row filter a caller should apply for a permission.
///
/// `allowed_ids` is `None` when the scope is not bound to specific entities
/// (GLOBAL, or OWN where the caller filters by its own user id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub scope: AccessScope,
    pub allowed_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorization oracle consulted by the engines.
///
/// Implementations may be backed by a database or a remote policy service;
/// callers treat the answer as final and never cache it across operations.
pub trait Authorizer: Send + Sync {
    /// Does `user` hold `permission`, at least at `scope`, for `entity_id`?
    fn has_permission(
        &self,
        user: UserId,
        permission: &Permission,
        scope: Option<AccessScope>,
        entity_id: Option<Uuid>,
    ) -> bool;

    /// The broadest filter `user` may apply when listing under `permission`.
    fn scope_filter(&self, user: UserId, permission: &Permission) -> Option<ScopeFilter>;
}

impl<A> Authorizer for std::sync::Arc<A>
where
    A: Authorizer + ?Sized,
{
    fn has_permission(
        &self,
        user: UserId,
        permission: &Permission,
        scope: Option<AccessScope>,
        entity_id: Option<Uuid>,
    ) -> bool {
        (**self).has_permission(user, permission, scope, entity_id)
    }

    fn scope_filter(&self, user: UserId, permission: &Permission) -> Option<ScopeFilter> {
        (**self).scope_filter(user, permission)
    }
}

/// Turn a negative oracle answer into an error.
pub fn require(
    authorizer: &dyn Authorizer,
    user: UserId,
    permission: &Permission,
    scope: Option<AccessScope>,
    entity_id: Option<Uuid>,
) -> Result<(), AuthzError> {
    if authorizer.has_permission(user, permission, scope, entity_id) {
        Ok(())
    } else {
        tracing::debug!(%user, permission = %permission, ?scope, "authorization denied");
        Err(AuthzError::Forbidden(permission.as_str().to_string()))
    }
}

/// One permission granted to a user, optionally bound to a department or warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub permission: Permission,
    pub scope: AccessScope,
    pub department_id: Option<DepartmentId>,
    pub warehouse_id: Option<WarehouseId>,
}

impl Grant {
    pub fn global(permission: Permission) -> Self {
        Self {
            permission,
            scope: AccessScope::Global,
            department_id: None,
            warehouse_id: None,
        }
    }

    pub fn warehouse(permission: Permission, warehouse_id: WarehouseId) -> Self {
        Self {
            permission,
            scope: AccessScope::Warehouse,
            department_id: None,
            warehouse_id: Some(warehouse_id),
        }
    }

    pub fn department(permission: Permission, department_id: DepartmentId) -> Self {
        Self {
            permission,
            scope: AccessScope::Dept,
            department_id: Some(department_id),
            warehouse_id: None,
        }
    }

    pub fn own(permission: Permission) -> Self {
        Self {
            permission,
            scope: AccessScope::Own,
            department_id: None,
            warehouse_id: None,
        }
    }

    fn bound_id(&self) -> Option<Uuid> {
        self.warehouse_id
            .map(Uuid::from)
            .or(self.department_id.map(Uuid::from))
    }

    fn covers(&self, required: &Permission, scope: Option<AccessScope>, entity_id: Option<Uuid>) -> bool {
        if !self.permission.grants(required) {
            return false;
        }
        if let Some(min) = scope {
            if self.scope < min {
                return false;
            }
        }
        if self.scope == AccessScope::Global {
            return true;
        }
        match (entity_id, self.bound_id()) {
            (Some(entity), Some(bound)) => entity == bound,
            _ => true,
        }
    }
}

/// Static, in-memory policy: a table of grants per user.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    grants: RwLock<HashMap<UserId, Vec<Grant>>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: UserId, grant: Grant) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry(user).or_default().push(grant);
        }
    }

    /// Builder-style variant of [`StaticAuthorizer::grant`].
    pub fn with_grant(self, user: UserId, grant: Grant) -> Self {
        self.grant(user, grant);
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn has_permission(
        &self,
        user: UserId,
        permission: &Permission,
        scope: Option<AccessScope>,
        entity_id: Option<Uuid>,
    ) -> bool {
        let Ok(grants) = self.grants.read() else {
            return false;
        };
        grants
            .get(&user)
            .is_some_and(|gs| gs.iter().any(|g| g.covers(permission, scope, entity_id)))
    }

    fn scope_filter(&self, user: UserId, permission: &Permission) -> Option<ScopeFilter> {
        let grants = self.grants.read().ok()?;
        let matching: Vec<&Grant> = grants
            .get(&user)?
            .iter()
            .filter(|g| g.permission.grants(permission))
            .collect();

        let scope = matching.iter().map(|g| g.scope).max()?;
        let allowed_ids = match scope {
            AccessScope::Global | AccessScope::Own => None,
            AccessScope::Dept | AccessScope::Warehouse => Some(
                matching
                    .iter()
                    .filter(|g| g.scope == scope)
                    .filter_map(|g| g.bound_id())
                    .collect(),
            ),
        };

        Some(ScopeFilter { scope, allowed_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_grant_covers_every_entity_and_scope() {
        let user = UserId::new();
        let authz = StaticAuthorizer::new().with_grant(user, Grant::global(Permission::STOCK_POST));

        assert!(authz.has_permission(
            user,
            &Permission::STOCK_POST,
            Some(AccessScope::Warehouse),
            Some(Uuid::now_v7())
        ));
        assert!(!authz.has_permission(user, &Permission::STOCK_ADJUST, None, None));
    }

    #[test]
    fn warehouse_grant_is_bound_to_its_warehouse() {
        let user = UserId::new();
        let w1 = WarehouseId::new();
        let w2 = WarehouseId::new();
        let authz = StaticAuthorizer::new().with_grant(user, Grant::warehouse(Permission::STOCK_POST, w1));

        assert!(authz.has_permission(user, &Permission::STOCK_POST, None, Some(w1.into())));
        assert!(!authz.has_permission(user, &Permission::STOCK_POST, None, Some(w2.into())));
        assert!(!authz.has_permission(
            user,
            &Permission::STOCK_POST,
            Some(AccessScope::Global),
            Some(w1.into())
        ));
    }

    #[test]
    fn wildcard_grants_anything() {
        let user = UserId::new();
        let authz = StaticAuthorizer::new().with_grant(user, Grant::global(Permission::WILDCARD));
        assert!(authz.has_permission(user, &Permission::WORKFLOW_INSTANCE_CANCEL, None, None));
    }

    #[test]
    fn scope_filter_reports_broadest_scope_and_bound_ids() {
        let user = UserId::new();
        let w1 = WarehouseId::new();
        let w2 = WarehouseId::new();
        let authz = StaticAuthorizer::new()
            .with_grant(user, Grant::own(Permission::STOCK_POST))
            .with_grant(user, Grant::warehouse(Permission::STOCK_POST, w1))
            .with_grant(user, Grant::warehouse(Permission::STOCK_POST, w2));

        let filter = authz.scope_filter(user, &Permission::STOCK_POST).unwrap();
        assert_eq!(filter.scope, AccessScope::Warehouse);
        let ids = filter.allowed_ids.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&w1.into()) && ids.contains(&w2.into()));

        assert!(authz.scope_filter(user, &Permission::STOCK_ADJUST).is_none());
    }

    #[test]
    fn require_maps_denial_to_forbidden() {
        let authz = StaticAuthorizer::new();
        let err = require(&authz, UserId::new(), &Permission::STOCK_ADJUST, None, None).unwrap_err();
        assert_eq!(err, AuthzError::Forbidden("stock.adjust".to_string()));
    }
}

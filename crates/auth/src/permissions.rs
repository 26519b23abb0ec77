use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque strings (e.g. "stock.post"). The wildcard `"*"`
/// grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    /// Act on a workflow task (claim, approve, reject, send back).
    pub const WORKFLOW_TASK_ACTION: Permission = Permission(Cow::Borrowed("workflow.task.action"));
    /// Cancel a workflow instance that is past its first step.
    pub const WORKFLOW_INSTANCE_CANCEL: Permission =
        Permission(Cow::Borrowed("workflow.instance.cancel"));
    /// Post any stock movement for a warehouse.
    pub const STOCK_POST: Permission = Permission(Cow::Borrowed("stock.post"));
    /// Post privileged ADJUSTMENT_IN / ADJUSTMENT_OUT movements.
    pub const STOCK_ADJUST: Permission = Permission(Cow::Borrowed("stock.adjust"));
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }

    /// Whether holding `self` satisfies a request for `required`.
    pub fn grants(&self, required: &Permission) -> bool {
        self.is_wildcard() || self == required
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

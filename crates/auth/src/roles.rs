use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Name of a role such as `storekeeper`.
///
/// Steps with ROLE-based assignment modes match it against the roles the
/// user directory lists for each user. Matching is exact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_as_their_name() {
        let role = Role::new("storekeeper");
        assert_eq!(serde_json::to_value(&role).unwrap(), serde_json::json!("storekeeper"));
        assert_ne!(role, Role::new("Storekeeper"));
    }
}

//! User directory collaborator: who is active, which roles and departments they hold.

use std::collections::BTreeMap;
use std::sync::RwLock;

use invflow_core::{DepartmentId, UserId};
use invflow_workflow::DirectoryUser;

use crate::error::EngineError;

pub trait UserDirectory: Send + Sync {
    fn user(&self, id: UserId) -> Result<Option<DirectoryUser>, EngineError>;

    /// Snapshot used for assignment resolution.
    fn users(&self) -> Result<Vec<DirectoryUser>, EngineError>;

    fn primary_department(&self, id: UserId) -> Result<Option<DepartmentId>, EngineError> {
        Ok(self.user(id)?.and_then(|u| u.primary_department))
    }
}

/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<BTreeMap<UserId, DirectoryUser>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, user: DirectoryUser) -> Result<(), EngineError> {
        self.users
            .write()
            .map_err(|_| EngineError::store("directory lock poisoned"))?
            .insert(user.id, user);
        Ok(())
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn user(&self, id: UserId) -> Result<Option<DirectoryUser>, EngineError> {
        let users = self
            .users
            .read()
            .map_err(|_| EngineError::store("directory lock poisoned"))?;
        Ok(users.get(&id).cloned())
    }

    fn users(&self) -> Result<Vec<DirectoryUser>, EngineError> {
        let users = self
            .users
            .read()
            .map_err(|_| EngineError::store("directory lock poisoned"))?;
        Ok(users.values().cloned().collect())
    }
}

//! Per-call options accepted by every mutating engine operation.

use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Client token; duplicates with the same user and route run once.
    pub idempotency_key: Option<String>,
    /// Give up (before commit) after this long.
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

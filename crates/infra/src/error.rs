//! Public error taxonomy of the engines.

use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use invflow_auth::AuthzError;
use invflow_core::{DomainError, ProductId, StepId, TaskId, UserId};
use invflow_inventory::StockError;
use invflow_workflow::WorkflowError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown template, task, instance or movement target.
    #[error("not found: {0}")]
    NotFound(String),

    /// Action illegal for the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Denied by the authorization oracle or by task ownership rules.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Lost a claim race. Expected under contention.
    #[error("task {task_id} already claimed")]
    AlreadyClaimed {
        task_id: TaskId,
        claimed_by: Option<UserId>,
    },

    #[error("no eligible assignee for step {step_id}")]
    NoEligibleAssignee { step_id: StepId },

    #[error("{message}")]
    InsufficientStock {
        line: usize,
        product_id: ProductId,
        message: String,
    },

    /// A request with the same idempotency key is still in flight.
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Lock wait or commit retries exhausted.
    #[error("busy: {0}")]
    Busy(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("deadline of {0:?} exceeded before commit")]
    DeadlineExceeded(Duration),

    /// The fulfillment posting failed; the task stays APPROVED and COMPLETE may be retried.
    #[error("fulfillment posting for task {task_id} failed: {source}")]
    FulfillmentFailed {
        task_id: TaskId,
        source: Box<EngineError>,
    },

    /// A failure stored by an earlier execution with the same idempotency key.
    #[error("replayed failure ({code}): {message}")]
    Replayed {
        status_code: u16,
        code: String,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable snake_case code for callers.
    pub fn code(&self) -> &str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyClaimed { .. } => "already_claimed",
            EngineError::NoEligibleAssignee { .. } => "no_eligible_assignee",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::IdempotencyConflict(_) => "idempotency_conflict",
            EngineError::Busy(_) => "busy",
            EngineError::Validation(_) => "validation_error",
            EngineError::DeadlineExceeded(_) => "deadline_exceeded",
            EngineError::FulfillmentFailed { .. } => "fulfillment_failed",
            EngineError::Replayed { code, .. } => code,
            EngineError::Store(_) => "store_error",
        }
    }

    /// HTTP-style status the outer layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::InvalidTransition(_) => 409,
            EngineError::Forbidden(_) => 403,
            EngineError::AlreadyClaimed { .. } => 409,
            EngineError::NoEligibleAssignee { .. } => 422,
            EngineError::InsufficientStock { .. } => 422,
            EngineError::IdempotencyConflict(_) => 409,
            EngineError::Busy(_) => 503,
            EngineError::Validation(_) => 400,
            EngineError::DeadlineExceeded(_) => 504,
            EngineError::FulfillmentFailed { .. } => 503,
            EngineError::Replayed { status_code, .. } => *status_code,
            EngineError::Store(_) => 500,
        }
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyClaimed { .. }
                | EngineError::Busy(_)
                | EngineError::DeadlineExceeded(_)
                | EngineError::IdempotencyConflict(_)
                | EngineError::FulfillmentFailed { .. }
        )
    }

    /// Outcomes of contention and replays; not faults.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyClaimed { .. }
                | EngineError::IdempotencyConflict(_)
                | EngineError::Replayed { .. }
        )
    }

    /// Body stored for a failed idempotent execution.
    pub fn to_body(&self) -> JsonValue {
        json!({ "code": self.code(), "message": self.to_string() })
    }

    /// Rebuild the stored failure for a replay.
    pub fn from_stored(status_code: u16, body: &JsonValue) -> Self {
        let field = |name: &str| {
            body.get(name)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        EngineError::Replayed {
            status_code,
            code: field("code"),
            message: field("message"),
        }
    }
}

/// Log a failed engine call at a level matching its kind.
pub(crate) fn trace_failure<T>(operation: &str, result: &Result<T, EngineError>) {
    let Err(err) = result else {
        return;
    };
    if err.is_expected() {
        tracing::debug!(operation, code = err.code(), error = %err, "operation not applied");
    } else if matches!(err, EngineError::Store(_)) {
        tracing::error!(operation, code = err.code(), error = %err, "operation failed");
    } else {
        tracing::warn!(operation, code = err.code(), error = %err, "operation rejected");
    }
}

impl From<WorkflowError> for EngineError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::TemplateNotFound(_)
            | WorkflowError::TaskNotFound(_)
            | WorkflowError::StepNotFound(_) => EngineError::NotFound(value.to_string()),
            WorkflowError::InvalidTemplate(_) | WorkflowError::UnknownAction(_) => {
                EngineError::Validation(value.to_string())
            }
            WorkflowError::InvalidTransition { .. }
            | WorkflowError::InstanceClosed { .. }
            | WorkflowError::SendBackNotAllowed { .. } => {
                EngineError::InvalidTransition(value.to_string())
            }
            WorkflowError::AlreadyClaimed {
                task_id,
                claimed_by,
            } => EngineError::AlreadyClaimed {
                task_id,
                claimed_by,
            },
            WorkflowError::NotEntitled { .. } => EngineError::Forbidden(value.to_string()),
            WorkflowError::NoEligibleAssignee { step_id, .. } => {
                EngineError::NoEligibleAssignee { step_id }
            }
            WorkflowError::Domain(e) => e.into(),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                EngineError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => {
                EngineError::Store(format!("invariant violated: {msg}"))
            }
            DomainError::Conflict(msg) => EngineError::Busy(msg),
        }
    }
}

impl From<StockError> for EngineError {
    fn from(value: StockError) -> Self {
        match &value {
            StockError::InsufficientStock {
                line, product_id, ..
            } => EngineError::InsufficientStock {
                line: *line,
                product_id: *product_id,
                message: value.to_string(),
            },
            StockError::UnknownMovementType(_) | StockError::Invalid { .. } => {
                EngineError::Validation(value.to_string())
            }
        }
    }
}

impl From<AuthzError> for EngineError {
    fn from(value: AuthzError) -> Self {
        match value {
            AuthzError::Forbidden(permission) => {
                EngineError::Forbidden(format!("missing permission '{permission}'"))
            }
        }
    }
}

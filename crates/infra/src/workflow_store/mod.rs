//! Workflow instance persistence.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryWorkflowStore;
pub use r#trait::{WorkflowStore, WorkflowStoreError};

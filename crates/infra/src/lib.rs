//! Infrastructure layer: stores, idempotency, the posting engine and the
//! workflow orchestrator, plus configuration and service wiring.

pub mod audit;
pub mod call;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod fulfillment;
pub mod idempotency;
pub mod locks;
pub mod posting_engine;
pub mod services;
pub mod stock_ledger;
pub mod template_registry;
pub mod workflow_engine;
pub mod workflow_store;


pub use call::CallOptions;
pub use config::EngineConfig;
pub use error::EngineError;
pub use idempotency::{IdempotencyGate, with_deadline};
pub use posting_engine::{PostingEngine, TransferPosted};
pub use services::{Collaborators, Services};
pub use workflow_engine::{ActionOutcome, ProcessAction, StartWorkflow, WorkflowDeps, WorkflowEngine};

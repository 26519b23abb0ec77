//! Ledger postings the workflow triggers.
//!
//! The workflow engine does not know what a business request consumes; the
//! hooks translate an instance into the movement to post.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use invflow_inventory::PostMovement;
use invflow_workflow::WorkflowInstance;

use crate::error::EngineError;

pub trait FulfillmentHooks: Send + Sync {
    /// Movement to post when a FULFILLMENT step's task is approved, if any.
    /// `payload` is the approving action's payload.
    fn on_fulfillment_approved(
        &self,
        instance: &WorkflowInstance,
        payload: Option<&JsonValue>,
    ) -> Result<Option<PostMovement>, EngineError>;

    /// Movement to post before the instance is rejected or cancelled,
    /// typically a RELEASE of what was reserved for it.
    fn on_instance_terminated(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Option<PostMovement>, EngineError>;
}

/// Hooks that never post.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFulfillment;

impl FulfillmentHooks for NoFulfillment {
    fn on_fulfillment_approved(
        &self,
        _instance: &WorkflowInstance,
        _payload: Option<&JsonValue>,
    ) -> Result<Option<PostMovement>, EngineError> {
        Ok(None)
    }

    fn on_instance_terminated(
        &self,
        _instance: &WorkflowInstance,
    ) -> Result<Option<PostMovement>, EngineError> {
        Ok(None)
    }
}

#[derive(Debug, Default, Clone)]
struct Plan {
    fulfill: Option<PostMovement>,
    release: Option<PostMovement>,
}

/// Movements registered per business entity key. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFulfillmentHooks {
    plans: RwLock<HashMap<String, Plan>>,
}

impl InMemoryFulfillmentHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fulfill(&self, business_entity_key: impl Into<String>, movement: PostMovement) {
        if let Ok(mut plans) = self.plans.write() {
            plans.entry(business_entity_key.into()).or_default().fulfill = Some(movement);
        }
    }

    pub fn on_release(&self, business_entity_key: impl Into<String>, movement: PostMovement) {
        if let Ok(mut plans) = self.plans.write() {
            plans.entry(business_entity_key.into()).or_default().release = Some(movement);
        }
    }

    fn plan(&self, key: &str) -> Result<Plan, EngineError> {
        let plans = self
            .plans
            .read()
            .map_err(|_| EngineError::store("fulfillment plans lock poisoned"))?;
        Ok(plans.get(key).cloned().unwrap_or_default())
    }
}

impl FulfillmentHooks for InMemoryFulfillmentHooks {
    fn on_fulfillment_approved(
        &self,
        instance: &WorkflowInstance,
        _payload: Option<&JsonValue>,
    ) -> Result<Option<PostMovement>, EngineError> {
        Ok(self.plan(&instance.business_entity_key)?.fulfill)
    }

    fn on_instance_terminated(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Option<PostMovement>, EngineError> {
        Ok(self.plan(&instance.business_entity_key)?.release)
    }
}

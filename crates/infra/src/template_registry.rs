//! Template registry: read-only lookup of published workflow definitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use invflow_core::TemplateId;
use invflow_workflow::{WorkflowError, WorkflowTemplate};

pub trait TemplateRegistry: Send + Sync {
    /// The template with its steps sorted by `sequence_no`.
    fn get_template(&self, id: TemplateId) -> Result<Arc<WorkflowTemplate>, WorkflowError>;
}

/// Intended for tests/dev. Templates are validated on registration and never change afterwards.
#[derive(Debug, Default)]
pub struct InMemoryTemplateRegistry {
    templates: RwLock<HashMap<TemplateId, Arc<WorkflowTemplate>>>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut template: WorkflowTemplate) -> Result<Arc<WorkflowTemplate>, WorkflowError> {
        template.normalize()?;

        let mut templates = self
            .templates
            .write()
            .map_err(|_| WorkflowError::invalid_template("registry lock poisoned"))?;
        if templates.contains_key(&template.id) {
            return Err(WorkflowError::invalid_template(format!(
                "template {} is already registered and immutable",
                template.id
            )));
        }
        let template = Arc::new(template);
        templates.insert(template.id, template.clone());
        tracing::debug!(template_id = %template.id, code = %template.code, "template registered");
        Ok(template)
    }
}

impl TemplateRegistry for InMemoryTemplateRegistry {
    fn get_template(&self, id: TemplateId) -> Result<Arc<WorkflowTemplate>, WorkflowError> {
        let templates = self
            .templates
            .read()
            .map_err(|_| WorkflowError::invalid_template("registry lock poisoned"))?;
        templates
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::TemplateNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invflow_workflow::{AssignmentMode, StepType};

    #[test]
    fn registered_templates_are_sorted_and_immutable() {
        let registry = InMemoryTemplateRegistry::new();
        let mut t = WorkflowTemplate::new("REQ", "Request").published();
        t.push_step(StepType::Start, AssignmentMode::Req, |s| s);
        t.push_step(StepType::End, AssignmentMode::Req, |s| s);
        t.steps.reverse();

        let stored = registry.register(t.clone()).unwrap();
        assert_eq!(stored.steps[0].step_type, StepType::Start);
        assert!(registry.register(t.clone()).is_err());
        assert_eq!(registry.get_template(t.id).unwrap().id, t.id);
    }

    #[test]
    fn unknown_template_is_not_found() {
        let registry = InMemoryTemplateRegistry::new();
        let id = TemplateId::new();
        assert_eq!(
            registry.get_template(id).unwrap_err(),
            WorkflowError::TemplateNotFound(id)
        );
    }

    #[test]
    fn templates_without_steps_are_refused() {
        let registry = InMemoryTemplateRegistry::new();
        assert!(registry.register(WorkflowTemplate::new("EMPTY", "Empty")).is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use task_core::Result;
use task_types::AutomationPlan;

/// Outcome of a delegated automation run. Feeds back into the state machine
/// via `StepCompleted` or `ClarificationRaised` — handlers never touch step
/// status directly (spec.md §4.8).
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Completed { actual_minutes: Option<u32> },
    NeedsClarification { field: String, question: String },
}

/// A registered integration that can execute a DIGITAL step's automation
/// plan.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, plan: &AutomationPlan) -> Result<HandlerOutcome>;
}

/// `handler_key -> Handler`, registered once at startup and treated as
/// immutable thereafter (spec.md §5).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn register(mut self, handler_key: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(handler_key.into(), handler);
        self
    }

    pub fn get(&self, handler_key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler_key).cloned()
    }
}

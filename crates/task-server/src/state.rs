use std::sync::Arc;

use task_core::{ConfigStore, EventBus};
use task_decompose::Decomposer;
use task_llm::LlmClient;
use task_runtime::MicroStepRuntime;
use task_store::Store;

use crate::capture::CapturePipeline;

/// Shared state handed to every axum handler, cloned per request (spec.md §6).
/// Cheap to clone because everything expensive is already behind an `Arc`
/// or its own internal handle.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub events: EventBus,
    pub runtime: Arc<MicroStepRuntime>,
    pub capture: Arc<CapturePipeline>,
    pub config: ConfigStore,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        runtime: Arc<MicroStepRuntime>,
        decomposer: Arc<Decomposer>,
        llm: Arc<LlmClient>,
        config: ConfigStore,
        default_deadline_ms: u64,
    ) -> Self {
        let capture = Arc::new(CapturePipeline::new(
            store.clone(),
            events.clone(),
            decomposer,
            llm,
            default_deadline_ms,
        ));
        Self {
            store,
            events,
            runtime,
            capture,
            config,
        }
    }
}

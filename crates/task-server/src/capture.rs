use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use task_classify::Classifier;
use task_core::{Error, EventBus, Result};
use task_decompose::Decomposer;
use task_llm::{ChatMessage, CompletionRequest, LlmClient};
use task_store::Store;
use task_types::{Event, EventPayload, MicroStep, Priority, Scope, Task, TaskStatus};
use task_wire::CaptureMode;

const ANALYZE_DEADLINE: Duration = Duration::from_millis(1000);
const DECOMPOSE_DEADLINE: Duration = Duration::from_secs(2);
const PERSIST_DEADLINE: Duration = Duration::from_millis(500);

/// Result of one `CapturePipeline::capture` call (spec.md §4.7).
pub struct CaptureResult {
    pub task: Task,
    pub steps: Vec<MicroStep>,
    pub persisted: bool,
    pub latency_ms: u64,
}

/// Entry point of the control plane: analyzes raw text, builds a draft Task,
/// drives the Decomposer, persists atomically, and emits `TaskCaptured`
/// (spec.md §4.7). Each stage below is its own internal step with its own
/// deadline, matching the table in spec.md §4.7.
///
/// Captures made with `mode == CLARIFY` and open clarifications are held in
/// `pending` rather than written to the Store — `task-types` carries no
/// draft/pending-clarification status variants, so "not yet persisted" is
/// represented by "not yet in the Store" rather than by a row's status
/// column (see DESIGN.md).
pub struct CapturePipeline {
    store: Arc<Store>,
    events: EventBus,
    decomposer: Arc<Decomposer>,
    llm: Arc<LlmClient>,
    default_deadline: Duration,
    pending: Mutex<HashMap<Uuid, (Task, Vec<MicroStep>)>>,
}

impl CapturePipeline {
    /// `default_deadline_ms` comes from `runtime.default_deadline_ms`
    /// (spec.md §4.7: a `Capture` call with no caller-supplied deadline
    /// defaults to 5s) and bounds the whole pipeline below, not just its
    /// individual stages.
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        decomposer: Arc<Decomposer>,
        llm: Arc<LlmClient>,
        default_deadline_ms: u64,
    ) -> Self {
        Self {
            store,
            events,
            decomposer,
            llm,
            default_deadline: Duration::from_millis(default_deadline_ms),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn capture(
        &self,
        user_id: &str,
        raw_text: &str,
        mode: CaptureMode,
    ) -> Result<CaptureResult> {
        match tokio::time::timeout(
            self.default_deadline,
            self.capture_inner(user_id, raw_text, mode),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "capture exceeded its {:?} deadline",
                self.default_deadline
            ))),
        }
    }

    async fn capture_inner(
        &self,
        user_id: &str,
        raw_text: &str,
        mode: CaptureMode,
    ) -> Result<CaptureResult> {
        let started = Instant::now();

        let analysis = analyze_text(&self.llm, raw_text).await;

        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: analysis.title,
            description: raw_text.to_string(),
            status: TaskStatus::Todo,
            priority: analysis.priority,
            scope: Scope::from_estimated_minutes(analysis.estimated_hours * 60.0),
            estimated_hours: analysis.estimated_hours,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        // SplitProxy absorbs every LLM error internally (spec.md §4.4); the
        // Decomposer call itself is not expected to fail except on a bug, so
        // the 2s deadline here is a defense-in-depth backstop, not a path
        // the design expects to hit.
        let steps = match tokio::time::timeout(DECOMPOSE_DEADLINE, self.decomposer.decompose(&task)).await {
            Ok(Ok(steps)) => steps,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(task_id = %task.task_id, "decomposition exceeded its deadline, degrading to a single step");
                vec![fallback_single_step(&task)]
            }
        };

        let clarifications_len = steps
            .iter()
            .map(|s| s.clarification_needs.len())
            .sum::<usize>();

        let should_persist = clarifications_len == 0 || matches!(mode, CaptureMode::Auto | CaptureMode::Manual);

        let persisted = if should_persist {
            let idempotency_key = task.task_id.to_string();
            match tokio::time::timeout(
                PERSIST_DEADLINE,
                self.store
                    .upsert_task_with_steps(&task, &steps, Some(&idempotency_key)),
            )
            .await
            {
                Ok(Ok(())) => true,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::Timeout("persist stage exceeded 500ms".to_string())),
            }
        } else {
            self.pending
                .lock()
                .await
                .insert(task.task_id, (task.clone(), steps.clone()));
            false
        };

        // TaskCaptured is emitted strictly after commit (spec.md §4.7 "Event
        // ordering"); best-effort only, per the stage table.
        if persisted {
            let event = Event::new(
                user_id.to_string(),
                Some(task.task_id),
                None,
                EventPayload::TaskCaptured {
                    title: task.title.clone(),
                    total_steps: steps.len() as u32,
                },
            );
            match self.store.append_event(&event).await {
                Ok(_) => self.events.publish(event),
                Err(err) => warn!(task_id = %task.task_id, error = %err, "failed to record TaskCaptured"),
            }
        }

        Ok(CaptureResult {
            task,
            steps,
            persisted,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Answers one clarification need raised during a capture still held in
    /// `pending` (spec.md §4.7 scenario D's follow-up: "the subsequent
    /// Resolve call completes persistence"). Once every need on every step
    /// is answered and nothing reclassifies back to UNKNOWN, the Task and
    /// all its MicroSteps are persisted in one transaction and removed from
    /// `pending`. Returns the task, current steps, and whether persistence
    /// just completed.
    pub async fn resolve_clarification(
        &self,
        task_id: Uuid,
        step_id: Uuid,
        field: &str,
        answer: &str,
    ) -> Result<(Task, Vec<MicroStep>, bool)> {
        let (task, mut steps) = self
            .pending
            .lock()
            .await
            .remove(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id} has no pending clarification")))?;

        let classifier = Classifier::new();
        let step = steps
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| Error::NotFound(format!("step {step_id} not found on this task")))?;

        let Some(need) = step.clarification_needs.iter_mut().find(|n| n.field == field) else {
            return Err(Error::Validation(format!(
                "step {step_id} has no open clarification for field `{field}`"
            )));
        };
        need.answered_with = Some(answer.to_string());

        let answered_context: String = step
            .clarification_needs
            .iter()
            .filter_map(|n| n.answered_with.as_deref())
            .collect::<Vec<_>>()
            .join(" ");
        let synthetic_description = format!("{} {}", step.description, answered_context);
        let mut synthetic = step.clone();
        synthetic.description = synthetic_description;

        let reclassified = classifier.classify(&synthetic);
        step.leaf_type = reclassified.leaf_type;
        step.automation_plan = reclassified.automation_plan;
        if reclassified.leaf_type != task_types::LeafType::Unknown {
            step.clarification_needs
                .iter_mut()
                .for_each(|n| n.required = false);
        }
        let step_number = step.step_number;

        let fully_resolved = steps
            .iter()
            .all(|s| s.leaf_type != task_types::LeafType::Unknown);

        if fully_resolved {
            let idempotency_key = task.task_id.to_string();
            self.store
                .upsert_task_with_steps(&task, &steps, Some(&idempotency_key))
                .await?;
            let captured = Event::new(
                task.user_id.clone(),
                Some(task.task_id),
                None,
                EventPayload::TaskCaptured {
                    title: task.title.clone(),
                    total_steps: steps.len() as u32,
                },
            );
            self.store.append_event(&captured).await?;
            self.events.publish(captured);
        } else {
            self.pending
                .lock()
                .await
                .insert(task_id, (task.clone(), steps.clone()));
        }

        let resolved_event = Event::new(
            task.user_id.clone(),
            Some(task.task_id),
            Some(step_id),
            EventPayload::ClarificationResolved {
                step_number,
                field: field.to_string(),
            },
        );
        if self.store.append_event(&resolved_event).await.is_ok() {
            self.events.publish(resolved_event);
        }

        Ok((task, steps, fully_resolved))
    }
}

struct TextAnalysis {
    title: String,
    priority: Priority,
    estimated_hours: f64,
}

#[derive(Debug, Deserialize)]
struct AnalysisDraft {
    title: String,
    #[serde(default)]
    priority: Option<Priority>,
    estimated_hours: f64,
}

/// Analyzes raw captured text into a title/priority/estimate, trying the LLM
/// first and falling back to the deterministic heuristic on any error
/// (spec.md §4.7's "Analyze text" stage; Open Question 2 in spec.md §9 says
/// `estimated_hours` must come from a scoped estimate, not a flat default).
async fn analyze_text(llm: &LlmClient, raw_text: &str) -> TextAnalysis {
    let request = CompletionRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: format!(
                "Read this task capture and respond with ONLY a JSON object \
                 {{\"title\": string (<=60 chars), \"priority\": \"low\"|\"medium\"|\"high\"|\"urgent\", \
                 \"estimated_hours\": number}}.\nCapture: {raw_text}"
            ),
        }],
        schema: json!({"required": ["title", "estimated_hours"]}),
        max_tokens: 128,
        temperature: 0.2,
        deadline: ANALYZE_DEADLINE,
    };

    match tokio::time::timeout(ANALYZE_DEADLINE, llm.complete(request)).await {
        Ok(Ok(value)) => match serde_json::from_value::<AnalysisDraft>(value) {
            Ok(draft) if !draft.title.trim().is_empty() && draft.estimated_hours > 0.0 => {
                TextAnalysis {
                    title: truncate_title(&draft.title),
                    priority: draft.priority.unwrap_or(Priority::Medium),
                    estimated_hours: draft.estimated_hours.clamp(0.01, 100.0),
                }
            }
            _ => heuristic_analyze(raw_text),
        },
        _ => heuristic_analyze(raw_text),
    }
}

const HOUR_KEYWORDS: &[(&[&str], f64)] = &[
    (&["reply", "quick", "text", "call "], 0.05),
    (&["email", "send", "message"], 0.1),
    (&["buy", "pick up", "order"], 0.15),
    (&["clean", "organize", "tidy"], 0.5),
    (&["write", "draft", "report"], 1.5),
    (&["research", "compare", "plan "], 2.0),
    (&["project", "launch", "redesign", "build"], 8.0),
];

/// Deterministic, network-free fallback used whenever the LLM path is
/// unavailable, times out, or returns something unusable. Mirrors the
/// keyword-table shape `task-heuristics::HeuristicSplitter` uses, per Open
/// Question 2's resolution in SPEC_FULL.md.
fn heuristic_analyze(raw_text: &str) -> TextAnalysis {
    let lower = raw_text.to_lowercase();
    let estimated_hours = HOUR_KEYWORDS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(_, hours)| *hours)
        .unwrap_or(0.5);

    let priority = if lower.contains("urgent") || lower.contains("asap") {
        Priority::Urgent
    } else if lower.contains("important") {
        Priority::High
    } else {
        Priority::Medium
    };

    TextAnalysis {
        title: truncate_title(raw_text),
        priority,
        estimated_hours,
    }
}

fn truncate_title(text: &str) -> String {
    let trimmed = text.trim();
    let first_line = trimmed.lines().next().unwrap_or(trimmed);
    let mut title: String = first_line.chars().take(80).collect();
    if first_line.chars().count() > 80 {
        title.push('…');
    }
    if title.is_empty() {
        title = "Untitled task".to_string();
    }
    title
}

fn fallback_single_step(task: &Task) -> MicroStep {
    task_heuristics::HeuristicSplitter::new()
        .split(task)
        .into_iter()
        .next()
        .unwrap_or_else(|| MicroStep {
            step_id: Uuid::new_v4(),
            parent_task_id: task.task_id,
            step_number: 1,
            description: task.description.clone(),
            short_label: None,
            icon: None,
            estimated_minutes: 5,
            delegation_mode: task_types::DelegationMode::Do,
            leaf_type: task_types::LeafType::Human,
            status: task_types::StepStatus::Todo,
            automation_plan: None,
            clarification_needs: Vec::new(),
            tags: Vec::new(),
            actual_minutes: None,
            parent_step_id: None,
            level: 0,
            is_leaf: true,
            decomposition_state: task_types::DecompositionState::Leaf,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_core::ConfigStore;
    use task_heuristics::HeuristicSplitter;
    use task_llm::ProviderRegistry;
    use task_split::SplitProxy;

    async fn pipeline() -> CapturePipeline {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let events = EventBus::new();
        let llm = Arc::new(LlmClient::new(ProviderRegistry::new(None, None), 4));
        let split_proxy = SplitProxy::new(
            LlmClient::new(ProviderRegistry::new(None, None), 4),
            HeuristicSplitter::new(),
        );
        let decomposer = Arc::new(Decomposer::new(split_proxy, Classifier::new()));
        CapturePipeline::new(store, events, decomposer, llm, 5000)
    }

    #[tokio::test]
    async fn simple_capture_with_no_llm_persists_and_has_valid_steps() {
        let _ = ConfigStore::load(None).await;
        let pipeline = pipeline().await;
        let result = pipeline
            .capture("u1", "reply to alice", CaptureMode::Auto)
            .await
            .unwrap();
        assert!(result.persisted);
        assert!(!result.steps.is_empty());
        for step in &result.steps {
            assert!(step.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn clarify_mode_with_unresolved_needs_does_not_persist() {
        let pipeline = pipeline().await;
        let result = pipeline
            .capture("u1", "send email about refund", CaptureMode::Clarify)
            .await
            .unwrap();
        let has_unknown = result.steps.iter().any(|s| s.leaf_type == task_types::LeafType::Unknown);
        if has_unknown {
            assert!(!result.persisted);
        }
    }
}

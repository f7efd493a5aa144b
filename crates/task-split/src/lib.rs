use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use task_core::{Result, SplitScope};
use task_heuristics::HeuristicSplitter;
use task_llm::{ChatMessage, CompletionRequest, LlmClient};
use task_types::{
    DecompositionState, DelegationMode, LeafType, MicroStep, Scope, StepStatus, Task,
    HUMAN_MAX_MINUTES, HUMAN_MIN_MINUTES,
};

const LLM_SPLIT_DEADLINE: Duration = Duration::from_secs(2);
const LLM_SPLIT_MAX_TOKENS: u32 = 512;
const LLM_SPLIT_TEMPERATURE: f32 = 0.3;
const DEFAULT_TARGET_MINUTES: u32 = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitOptions {
    /// Forces a MULTI/PROJECT-style split even for a SIMPLE-scope task.
    pub force_split: bool,
}

#[derive(Debug, Deserialize)]
struct StepDraft {
    description: String,
    #[serde(default)]
    short_label: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    estimated_minutes: u32,
    #[serde(default = "default_delegation_mode")]
    delegation_mode: DelegationMode,
}

fn default_delegation_mode() -> DelegationMode {
    DelegationMode::Do
}

/// Composes `LlmClient` and `HeuristicSplitter` so the caller always gets a
/// batch of MicroSteps that already satisfies every MicroStep invariant
/// (spec.md §4.4).
pub struct SplitProxy {
    llm: LlmClient,
    heuristics: HeuristicSplitter,
    target_minutes: u32,
    force_split_scope: SplitScope,
}

impl SplitProxy {
    pub fn new(llm: LlmClient, heuristics: HeuristicSplitter) -> Self {
        Self::with_config(llm, heuristics, DEFAULT_TARGET_MINUTES, SplitScope::Multi)
    }

    /// `target_minutes` is `split.target_minutes` and `force_split_scope` is
    /// `split.force_split_scope` from `ConfigStore` (spec.md §4.4): the former
    /// sizes `postprocess`'s oversized-draft chunking, the latter decides how
    /// eagerly a non-SIMPLE task is auto-split without the caller asking for it.
    pub fn with_config(
        llm: LlmClient,
        heuristics: HeuristicSplitter,
        target_minutes: u32,
        force_split_scope: SplitScope,
    ) -> Self {
        Self {
            llm,
            heuristics,
            target_minutes: target_minutes.max(1),
            force_split_scope,
        }
    }

    pub async fn split(&self, task: &Task, opts: SplitOptions) -> Result<Vec<MicroStep>> {
        let scope = Scope::from_estimated_minutes(task.estimated_hours * 60.0);

        let auto_split = match self.force_split_scope {
            // Multi: any non-SIMPLE task is split automatically.
            SplitScope::Multi => scope != Scope::Simple,
            // Project: only a PROJECT-scope task auto-splits; MULTI needs an
            // explicit caller request.
            SplitScope::Project => scope == Scope::Project,
        };

        if !auto_split && !opts.force_split {
            return Ok(vec![single_step_from_task(task)]);
        }

        let drafts = match self.try_llm_split(task).await {
            Some(drafts) => drafts,
            None => heuristic_drafts(&self.heuristics, task),
        };

        match postprocess(task.task_id, drafts, self.target_minutes) {
            Some(steps) => Ok(steps),
            None => {
                warn!(task_id = %task.task_id, "LLM split produced too few valid steps, falling back to heuristics");
                let fallback = heuristic_drafts(&self.heuristics, task);
                Ok(postprocess(task.task_id, fallback, self.target_minutes)
                    .expect("heuristic splitter always yields >= 2 valid steps"))
            }
        }
    }

    async fn try_llm_split(&self, task: &Task) -> Option<Vec<StepDraft>> {
        let prompt = build_prompt(task);
        let schema = json!({
            "required": ["description", "estimated_minutes"]
        });
        let request = CompletionRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            schema,
            max_tokens: LLM_SPLIT_MAX_TOKENS,
            temperature: LLM_SPLIT_TEMPERATURE,
            deadline: LLM_SPLIT_DEADLINE,
        };

        match self.llm.complete(request).await {
            Ok(value) => match serde_json::from_value::<Vec<StepDraft>>(value) {
                Ok(drafts) => Some(drafts),
                Err(err) => {
                    warn!(task_id = %task.task_id, error = %err, "LLM split reply failed to parse");
                    None
                }
            },
            Err(err) => {
                warn!(task_id = %task.task_id, error = %err, "LLM split call failed");
                None
            }
        }
    }
}

fn build_prompt(task: &Task) -> String {
    format!(
        "Split the following task into 3 to 6 concrete next actions. \
         Respond with ONLY a JSON array of objects shaped like \
         {{\"description\": string, \"short_label\": string, \"icon\": string, \
         \"estimated_minutes\": number, \"delegation_mode\": \"do\"|\"do_with_me\"|\"delegate\"}}.\n\
         Title: {}\nDescription: {}",
        task.title, task.description
    )
}

fn heuristic_drafts(splitter: &HeuristicSplitter, task: &Task) -> Vec<StepDraft> {
    splitter
        .split(task)
        .into_iter()
        .map(|step| StepDraft {
            description: step.description,
            short_label: step.short_label,
            icon: step.icon,
            estimated_minutes: step.estimated_minutes,
            delegation_mode: step.delegation_mode,
        })
        .collect()
}

fn single_step_from_task(task: &Task) -> MicroStep {
    let minutes = (task.estimated_hours * 60.0).round() as u32;
    let minutes = minutes.clamp(HUMAN_MIN_MINUTES, HUMAN_MAX_MINUTES);
    let now = Utc::now();
    MicroStep {
        step_id: Uuid::new_v4(),
        parent_task_id: task.task_id,
        step_number: 1,
        description: task.description.clone(),
        short_label: Some(task.title.clone()),
        icon: None,
        estimated_minutes: minutes,
        delegation_mode: DelegationMode::Do,
        leaf_type: LeafType::Human,
        status: StepStatus::Todo,
        automation_plan: None,
        clarification_needs: Vec::new(),
        tags: Vec::new(),
        actual_minutes: None,
        parent_step_id: None,
        level: 0,
        is_leaf: true,
        decomposition_state: DecompositionState::Leaf,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

/// Clamps/splits oversized steps, drops empty descriptions, renumbers
/// contiguously, and moves the globally shortest step to the front (spec.md
/// §4.4 points 5-6). `target_minutes` (`split.target_minutes`) sizes each
/// resulting part; `HUMAN_MIN_MINUTES`/`HUMAN_MAX_MINUTES` still bound every
/// part regardless of the target. Returns `None` if fewer than 2 valid steps
/// remain.
fn postprocess(task_id: Uuid, drafts: Vec<StepDraft>, target_minutes: u32) -> Option<Vec<MicroStep>> {
    let mut expanded: Vec<StepDraft> = Vec::new();
    for draft in drafts {
        if draft.description.trim().is_empty() {
            continue;
        }
        if draft.estimated_minutes > HUMAN_MAX_MINUTES {
            let parts = ((draft.estimated_minutes as f64) / (target_minutes as f64)).ceil() as u32;
            let parts = parts.max(1);
            let per_part = ((draft.estimated_minutes as f64) / (parts as f64)).ceil() as u32;
            let per_part = per_part.clamp(HUMAN_MIN_MINUTES, HUMAN_MAX_MINUTES);
            for part in 1..=parts {
                expanded.push(StepDraft {
                    description: if parts > 1 {
                        format!("{} (part {part}/{parts})", draft.description)
                    } else {
                        draft.description.clone()
                    },
                    short_label: draft.short_label.clone(),
                    icon: draft.icon.clone(),
                    estimated_minutes: per_part,
                    delegation_mode: draft.delegation_mode,
                });
            }
        } else {
            let minutes = draft.estimated_minutes.clamp(HUMAN_MIN_MINUTES, HUMAN_MAX_MINUTES);
            expanded.push(StepDraft {
                estimated_minutes: minutes,
                ..draft
            });
        }
    }

    if expanded.len() < 2 {
        return None;
    }

    let shortest_idx = expanded
        .iter()
        .enumerate()
        .min_by_key(|(idx, draft)| (draft.estimated_minutes, *idx))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let shortest = expanded.remove(shortest_idx);
    expanded.insert(0, shortest);

    let now = Utc::now();
    Some(
        expanded
            .into_iter()
            .enumerate()
            .map(|(idx, draft)| MicroStep {
                step_id: Uuid::new_v4(),
                parent_task_id: task_id,
                step_number: idx as u32 + 1,
                description: draft.description,
                short_label: draft.short_label,
                icon: draft.icon,
                estimated_minutes: draft.estimated_minutes,
                delegation_mode: draft.delegation_mode,
                leaf_type: LeafType::Human,
                status: StepStatus::Todo,
                automation_plan: None,
                clarification_needs: Vec::new(),
                tags: Vec::new(),
                actual_minutes: None,
                parent_step_id: None,
                level: 0,
                is_leaf: true,
                decomposition_state: DecompositionState::Leaf,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect(),
    )
}

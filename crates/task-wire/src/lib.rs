//! Wire-format DTOs for the `/capture`, `/steps/*`, `/tasks/*/progress`, and
//! `/events` surfaces (spec.md §6), kept distinct from the internal domain
//! types in `task-types` so the HTTP schema can evolve independently of
//! persistence/runtime representations.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use task_core::Error;
use task_types::{
    DelegationMode, Event, EventPayload, LeafType, MicroStep, Priority, Scope, Task,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Auto,
    Manual,
    Clarify,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default = "default_mode")]
    pub mode: CaptureMode,
    #[serde(default)]
    pub voice_input: bool,
}

fn default_mode() -> CaptureMode {
    CaptureMode::Auto
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDto {
    pub task_id: Uuid,
    pub title: String,
    pub priority: Priority,
    pub scope: Scope,
    pub estimated_hours: f64,
    pub tags: Vec<String>,
}

impl TaskDto {
    pub fn from_domain(task: &Task, steps: &[MicroStep]) -> Self {
        let tags: BTreeSet<String> = steps.iter().flat_map(|s| s.tags.iter().cloned()).collect();
        Self {
            task_id: task.task_id,
            title: task.title.clone(),
            priority: task.priority,
            scope: task.scope,
            estimated_hours: task.estimated_hours,
            tags: tags.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MicroStepDto {
    pub step_id: Uuid,
    pub step_number: u32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub estimated_minutes: u32,
    pub delegation_mode: DelegationMode,
    pub leaf_type: LeafType,
    pub tags: Vec<String>,
    pub is_leaf: bool,
    pub level: u32,
}

impl From<&MicroStep> for MicroStepDto {
    fn from(step: &MicroStep) -> Self {
        Self {
            step_id: step.step_id,
            step_number: step.step_number,
            description: step.description.clone(),
            short_label: step.short_label.clone(),
            icon: step.icon.clone(),
            estimated_minutes: step.estimated_minutes,
            delegation_mode: step.delegation_mode,
            leaf_type: step.leaf_type,
            tags: step.tags.clone(),
            is_leaf: step.is_leaf,
            level: step.level,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClarificationDto {
    pub step_id: Uuid,
    pub field: String,
    pub question: String,
    pub required: bool,
}

impl ClarificationDto {
    pub fn from_step(step: &MicroStep) -> Vec<Self> {
        step.clarification_needs
            .iter()
            .map(|need| ClarificationDto {
                step_id: step.step_id,
                field: need.field.clone(),
                question: need.question.clone(),
                required: need.required,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Breakdown {
    pub total_steps: u32,
    pub digital_count: u32,
    pub human_count: u32,
    pub total_minutes: u32,
}

impl Breakdown {
    pub fn from_steps(steps: &[MicroStep]) -> Self {
        Self {
            total_steps: steps.len() as u32,
            digital_count: steps.iter().filter(|s| s.leaf_type == LeafType::Digital).count() as u32,
            human_count: steps.iter().filter(|s| s.leaf_type == LeafType::Human).count() as u32,
            total_minutes: steps.iter().map(|s| s.estimated_minutes).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResponse {
    pub task: TaskDto,
    pub micro_steps: Vec<MicroStepDto>,
    pub clarifications: Vec<ClarificationDto>,
    pub breakdown: Breakdown,
    pub persisted: bool,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompleteStepRequest {
    #[serde(default)]
    pub actual_minutes: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CancelStepRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveClarificationRequest {
    pub step_id: Uuid,
    pub field: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDto {
    pub event_id: Uuid,
    pub event_type: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
}

impl From<&Event> for EventDto {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            user_id: event.user_id.clone(),
            task_id: event.task_id,
            step_id: event.step_id,
            payload: event.payload.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartStepResponse {
    pub step: MicroStepDto,
    pub emitted_events: Vec<EventDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteStepResponse {
    pub step: MicroStepDto,
    pub xp_awarded: u32,
    pub streak: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelStepResponse {
    pub step: MicroStepDto,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressDto {
    pub total: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub percent: f64,
    pub minutes_est: u32,
    pub minutes_actual: u32,
}

/// `{code, message, retryable}` — the JSON error envelope spec.md §7
/// requires for every surfaced error. Deliberately not a blanket
/// `impl Serialize for Error`: the domain error carries more than a display
/// string needs to reach the wire (see DESIGN.md).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

/// Validates the request-level invariants `task-wire` itself is responsible
/// for (field limits, non-empty text) before anything touches the pipeline.
pub fn validate_capture_request(request: &CaptureRequest) -> Result<(), Error> {
    let trimmed = request.text.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("text must not be empty".to_string()));
    }
    if trimmed.chars().count() > 4000 {
        return Err(Error::Validation(
            "text must be at most 4000 characters".to_string(),
        ));
    }
    if request.user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must not be empty".to_string()));
    }
    Ok(())
}

/// Whether `persisted = false` is a legal response shape for this request
/// (spec.md §6: "persisted = false is allowed only when mode == CLARIFY and
/// clarifications is non-empty").
pub fn persisted_false_is_legal(mode: CaptureMode, clarifications_len: usize) -> bool {
    mode == CaptureMode::Clarify && clarifications_len > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_capture_request_rejects_empty_text() {
        let req = CaptureRequest {
            user_id: "u1".to_string(),
            text: "   ".to_string(),
            mode: CaptureMode::Auto,
            voice_input: false,
        };
        assert!(validate_capture_request(&req).is_err());
    }

    #[test]
    fn persisted_false_only_legal_for_clarify_with_clarifications() {
        assert!(!persisted_false_is_legal(CaptureMode::Auto, 1));
        assert!(!persisted_false_is_legal(CaptureMode::Clarify, 0));
        assert!(persisted_false_is_legal(CaptureMode::Clarify, 1));
    }
}

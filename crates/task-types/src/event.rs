use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable, append-only domain event (spec.md §3).
///
/// `payload` carries the type-specific fields; `event_type` is implied by
/// the payload's serde tag but kept as its own column so Store queries can
/// filter without deserializing the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TaskCaptured {
        title: String,
        total_steps: u32,
    },
    StepStarted {
        step_number: u32,
    },
    StepCompleted {
        step_number: u32,
        actual_minutes: u32,
    },
    StepCancelled {
        step_number: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ClarificationRaised {
        step_number: u32,
        field: String,
    },
    ClarificationResolved {
        step_number: u32,
        field: String,
    },
    XpAwarded {
        step_number: u32,
        amount: u32,
    },
    StreakUpdated {
        streak_days: u32,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::TaskCaptured { .. } => "TaskCaptured",
            EventPayload::StepStarted { .. } => "StepStarted",
            EventPayload::StepCompleted { .. } => "StepCompleted",
            EventPayload::StepCancelled { .. } => "StepCancelled",
            EventPayload::ClarificationRaised { .. } => "ClarificationRaised",
            EventPayload::ClarificationResolved { .. } => "ClarificationResolved",
            EventPayload::XpAwarded { .. } => "XPAwarded",
            EventPayload::StreakUpdated { .. } => "StreakUpdated",
        }
    }
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        task_id: Option<Uuid>,
        step_id: Option<Uuid>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type().to_string(),
            user_id: user_id.into(),
            task_id,
            step_id,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use task_types::{AutomationPlan, ClarificationNeed, LeafType, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub percent: f64,
    pub total_minutes_est: u32,
    pub total_minutes_actual: u32,
}

/// Partial update applied to a `MicroStep` by `Store::update_step`.
///
/// `None` leaves the field untouched. The Store enforces the state machine
/// and the completion-monotonicity invariant (spec.md §8 property 4)
/// regardless of what the caller asks for.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub leaf_type: Option<LeafType>,
    pub automation_plan: Option<Option<AutomationPlan>>,
    pub clarification_needs: Option<Vec<ClarificationNeed>>,
    pub actual_minutes: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

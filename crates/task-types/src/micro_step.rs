use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use serde_json::Value;
use uuid::Uuid;

pub const MAX_STEP_DESCRIPTION_LEN: usize = 500;
pub const MAX_CLARIFICATION_QUESTION_LEN: usize = 200;

pub const HUMAN_MIN_MINUTES: u32 = 2;
pub const HUMAN_MAX_MINUTES: u32 = 5;
pub const DIGITAL_MIN_MINUTES: u32 = 1;
pub const DIGITAL_MAX_MINUTES: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Todo,
    InProgress,
    Completed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    Do,
    DoWithMe,
    Delegate,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafType {
    Digital,
    Human,
    Unknown,
}

/// Mirrors the `decomposition_state` column in the persisted schema (§6):
/// whether a step is still awaiting further decomposition, has been
/// expanded into children, or is a terminal leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionState {
    #[default]
    Pending,
    Decomposed,
    Leaf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationNeed {
    pub field: String,
    pub question: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_with: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationPlan {
    pub handler_key: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub confirmation_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroStep {
    pub step_id: Uuid,
    pub parent_task_id: Uuid,
    pub step_number: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub estimated_minutes: u32,
    pub delegation_mode: DelegationMode,
    pub leaf_type: LeafType,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_plan: Option<AutomationPlan>,
    #[serde(default)]
    pub clarification_needs: Vec<ClarificationNeed>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<Uuid>,
    #[serde(default)]
    pub level: u32,
    #[serde(default = "default_true")]
    pub is_leaf: bool,
    #[serde(default)]
    pub decomposition_state: DecompositionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl MicroStep {
    /// Allowed `estimated_minutes` range for this step's leaf type (§3, §9 point 3).
    pub fn minute_bounds(&self) -> (u32, u32) {
        match self.leaf_type {
            LeafType::Human => (HUMAN_MIN_MINUTES, HUMAN_MAX_MINUTES),
            LeafType::Digital | LeafType::Unknown => (DIGITAL_MIN_MINUTES, DIGITAL_MAX_MINUTES),
        }
    }

    /// Checks the structural invariants spec.md §3 places on a MicroStep.
    pub fn validate(&self) -> Result<(), String> {
        let desc_len = self.description.chars().count();
        if desc_len == 0 || desc_len > MAX_STEP_DESCRIPTION_LEN {
            return Err(format!(
                "description must be 1..={} chars, got {}",
                MAX_STEP_DESCRIPTION_LEN, desc_len
            ));
        }
        if self.leaf_type == LeafType::Human {
            if !(HUMAN_MIN_MINUTES..=HUMAN_MAX_MINUTES).contains(&self.estimated_minutes) {
                return Err(format!(
                    "HUMAN leaf estimated_minutes must be in [{}, {}], got {}",
                    HUMAN_MIN_MINUTES, HUMAN_MAX_MINUTES, self.estimated_minutes
                ));
            }
        } else if !(DIGITAL_MIN_MINUTES..=DIGITAL_MAX_MINUTES).contains(&self.estimated_minutes) {
            return Err(format!(
                "estimated_minutes must be in [{}, {}], got {}",
                DIGITAL_MIN_MINUTES, DIGITAL_MAX_MINUTES, self.estimated_minutes
            ));
        }
        if self.leaf_type == LeafType::Unknown && self.clarification_needs.is_empty() {
            return Err("UNKNOWN leaf must carry >= 1 clarification need".into());
        }
        for need in &self.clarification_needs {
            if need.question.chars().count() > MAX_CLARIFICATION_QUESTION_LEN {
                return Err(format!(
                    "clarification question must be <= {} chars",
                    MAX_CLARIFICATION_QUESTION_LEN
                ));
            }
        }
        if self.status == StepStatus::Completed {
            if self.completed_at.is_none() {
                return Err("status = COMPLETED requires completed_at".into());
            }
            match self.actual_minutes {
                Some(actual) if actual as i64 >= 0 => {}
                _ => return Err("status = COMPLETED requires actual_minutes >= 0".into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_step() -> MicroStep {
        MicroStep {
            step_id: Uuid::new_v4(),
            parent_task_id: Uuid::new_v4(),
            step_number: 1,
            description: "Reply to alice".into(),
            short_label: Some("Reply".into()),
            icon: Some("✉️".into()),
            estimated_minutes: 3,
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
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn human_leaf_minutes_out_of_range_rejected() {
        let mut step = base_step();
        step.estimated_minutes = 10;
        assert!(step.validate().is_err());
    }

    #[test]
    fn human_leaf_minutes_in_range_ok() {
        let step = base_step();
        assert!(step.validate().is_ok());
    }

    #[test]
    fn unknown_leaf_without_clarification_rejected() {
        let mut step = base_step();
        step.leaf_type = LeafType::Unknown;
        assert!(step.validate().is_err());
    }

    #[test]
    fn completed_without_completed_at_rejected() {
        let mut step = base_step();
        step.status = StepStatus::Completed;
        assert!(step.validate().is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Coarse size class derived from `estimated_hours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Simple,
    Multi,
    Project,
}

impl Scope {
    /// `< 10min → SIMPLE`, `10-60min → MULTI`, `> 60min → PROJECT`.
    pub fn from_estimated_minutes(minutes: f64) -> Self {
        if minutes < 10.0 {
            Scope::Simple
        } else if minutes <= 60.0 {
            Scope::Multi
        } else {
            Scope::Project
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub scope: Scope,
    pub estimated_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Checks the structural invariants spec.md §3 places on a Task,
    /// independent of any particular persistence layer.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.is_empty() || self.title.chars().count() > MAX_TITLE_LEN {
            return Err(format!(
                "title must be 1..={} chars, got {}",
                MAX_TITLE_LEN,
                self.title.chars().count()
            ));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description must be <= {} chars, got {}",
                MAX_DESCRIPTION_LEN,
                self.description.chars().count()
            ));
        }
        if !(0.0..=100.0).contains(&self.estimated_hours) {
            return Err(format!(
                "estimated_hours must be in [0.0, 100.0], got {}",
                self.estimated_hours
            ));
        }
        if self.scope != Scope::Simple && self.estimated_hours <= 0.0 {
            return Err("estimated_hours must be strictly positive for non-SIMPLE scopes".into());
        }
        match (self.status, self.completed_at) {
            (TaskStatus::Completed, None) => {
                return Err("completed_at must be set when status = COMPLETED".into())
            }
            (status, Some(_)) if status != TaskStatus::Completed => {
                return Err("completed_at must only be set when status = COMPLETED".into())
            }
            _ => {}
        }
        if let Some(completed_at) = self.completed_at {
            if completed_at < self.created_at {
                return Err("completed_at must be >= created_at".into());
            }
        }
        Ok(())
    }
}

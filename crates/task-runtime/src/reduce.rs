use chrono::{DateTime, Utc};

use task_core::{Error, Result};
use task_store::StepPatch;
use task_types::{AutomationPlan, EventPayload, LeafType, MicroStep, StepStatus};

/// The three operations a caller can request on a `MicroStep` (spec.md §4.8).
#[derive(Debug, Clone)]
pub enum StepAction {
    Start,
    Complete { actual_minutes: Option<u32> },
    Cancel { reason: Option<String> },
}

/// A side effect the runtime must carry out after the pure transition above
/// has been validated, but which does not itself belong in the Store write.
#[derive(Debug, Clone)]
pub enum StepCommand {
    Emit(EventPayload),
    Dispatch(AutomationPlan),
}

/// What the runtime should persist for a given transition. `Complete` is its
/// own variant (rather than a `StepPatch`) because completing a step also
/// awards XP/streak in the same Store transaction (spec.md §4.8).
#[derive(Debug, Clone)]
pub enum StepTransition {
    Start(StepPatch),
    Complete { actual_minutes: u32, xp_amount: u32 },
    /// `CompleteStep` replayed against a step that is already `Completed`
    /// (spec.md §8 property 8): no Store write, no re-emitted event.
    AlreadyComplete,
    Cancel(StepPatch),
}

/// Pure reducer: given a step's current persisted state and a requested
/// action, decides whether the transition is legal and what to do about it.
/// `reduce(state, action) -> (transition, commands)`, a single-entity
/// state machine.
pub fn reduce(
    step: &MicroStep,
    action: StepAction,
    now: DateTime<Utc>,
) -> Result<(StepTransition, Vec<StepCommand>)> {
    match action {
        StepAction::Start => {
            if step.status != StepStatus::Todo {
                return Err(Error::ConflictState(format!(
                    "step {} cannot start from {:?}",
                    step.step_id, step.status
                )));
            }
            let patch = StepPatch {
                status: Some(StepStatus::InProgress),
                started_at: Some(now),
                ..Default::default()
            };
            let mut commands = vec![StepCommand::Emit(EventPayload::StepStarted {
                step_number: step.step_number,
            })];
            if step.leaf_type == LeafType::Digital {
                if let Some(plan) = &step.automation_plan {
                    commands.push(StepCommand::Dispatch(plan.clone()));
                }
            }
            Ok((StepTransition::Start(patch), commands))
        }
        StepAction::Complete { actual_minutes } => {
            if step.status == StepStatus::Completed {
                // Replaying CompleteStep against an already-terminal step is
                // not an error (spec.md §8 property 8): the caller gets the
                // same outcome back, but nothing is re-persisted or re-emitted.
                return Ok((StepTransition::AlreadyComplete, Vec::new()));
            }
            if step.status.is_terminal() {
                return Err(Error::ConflictState(format!(
                    "step {} cannot be completed from {:?}",
                    step.step_id, step.status
                )));
            }
            let actual = actual_minutes.unwrap_or_else(|| compute_actual_minutes(step, now));
            let base = 10 + step.estimated_minutes.clamp(2, 15);
            let bonus = if actual <= step.estimated_minutes { 5 } else { 0 };
            let commands = vec![StepCommand::Emit(EventPayload::StepCompleted {
                step_number: step.step_number,
                actual_minutes: actual,
            })];
            Ok((
                StepTransition::Complete {
                    actual_minutes: actual,
                    xp_amount: base + bonus,
                },
                commands,
            ))
        }
        StepAction::Cancel { reason } => {
            if step.status.is_terminal() {
                return Err(Error::ConflictState(format!(
                    "step {} is already {:?}",
                    step.step_id, step.status
                )));
            }
            let patch = StepPatch {
                status: Some(StepStatus::Cancelled),
                completed_at: Some(now),
                ..Default::default()
            };
            let commands = vec![StepCommand::Emit(EventPayload::StepCancelled {
                step_number: step.step_number,
                reason,
            })];
            Ok((StepTransition::Cancel(patch), commands))
        }
    }
}

fn compute_actual_minutes(step: &MicroStep, now: DateTime<Utc>) -> u32 {
    match step.started_at {
        Some(started) => (now - started).num_minutes().max(0) as u32,
        None => step.estimated_minutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_types::{DecompositionState, DelegationMode};
    use uuid::Uuid;

    fn step(status: StepStatus, estimated_minutes: u32) -> MicroStep {
        let now = Utc::now();
        MicroStep {
            step_id: Uuid::new_v4(),
            parent_task_id: Uuid::new_v4(),
            step_number: 1,
            description: "Do a thing".to_string(),
            short_label: None,
            icon: None,
            estimated_minutes,
            delegation_mode: DelegationMode::Do,
            leaf_type: LeafType::Human,
            status,
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

    #[test]
    fn start_from_todo_emits_step_started() {
        let s = step(StepStatus::Todo, 4);
        let (transition, commands) = reduce(&s, StepAction::Start, Utc::now()).unwrap();
        assert!(matches!(transition, StepTransition::Start(_)));
        assert!(matches!(commands[0], StepCommand::Emit(EventPayload::StepStarted { .. })));
    }

    #[test]
    fn start_from_in_progress_is_a_conflict() {
        let s = step(StepStatus::InProgress, 4);
        let err = reduce(&s, StepAction::Start, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "conflict_state");
    }

    #[test]
    fn completing_under_estimate_awards_the_bonus() {
        let s = step(StepStatus::InProgress, 5);
        let (transition, _) = reduce(
            &s,
            StepAction::Complete {
                actual_minutes: Some(3),
            },
            Utc::now(),
        )
        .unwrap();
        match transition {
            StepTransition::Complete { xp_amount, actual_minutes } => {
                assert_eq!(actual_minutes, 3);
                assert_eq!(xp_amount, 10 + 5 + 5);
            }
            _ => panic!("expected Complete transition"),
        }
    }

    #[test]
    fn completing_over_estimate_drops_the_bonus() {
        let s = step(StepStatus::Todo, 5);
        let (transition, _) = reduce(
            &s,
            StepAction::Complete {
                actual_minutes: Some(9),
            },
            Utc::now(),
        )
        .unwrap();
        match transition {
            StepTransition::Complete { xp_amount, .. } => assert_eq!(xp_amount, 10 + 5),
            _ => panic!("expected Complete transition"),
        }
    }

    #[test]
    fn completing_a_cancelled_step_is_a_conflict() {
        let s = step(StepStatus::Cancelled, 4);
        let err = reduce(
            &s,
            StepAction::Complete { actual_minutes: None },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "conflict_state");
    }

    #[test]
    fn completing_an_already_completed_step_is_idempotent() {
        let s = step(StepStatus::Completed, 4);
        let (transition, commands) = reduce(
            &s,
            StepAction::Complete { actual_minutes: None },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(transition, StepTransition::AlreadyComplete));
        assert!(commands.is_empty());
    }

    #[test]
    fn cancel_from_todo_succeeds_and_emits_cancelled() {
        let s = step(StepStatus::Todo, 4);
        let (transition, commands) = reduce(
            &s,
            StepAction::Cancel {
                reason: Some("no longer needed".to_string()),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(transition, StepTransition::Cancel(_)));
        assert!(matches!(commands[0], StepCommand::Emit(EventPayload::StepCancelled { .. })));
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use task_core::{EventBus, Result};
use task_store::Store;
use task_types::{AutomationPlan, Event, EventPayload, LeafType, MicroStep, Task};

use crate::handler::HandlerRegistry;
use crate::reduce::{reduce, StepAction, StepCommand, StepTransition};

/// How often the reconciler scans for stuck DIGITAL steps.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
/// How long a DIGITAL step may sit IN_PROGRESS before the reconciler
/// re-enqueues its automation plan (spec.md §4.8 "a step left IN_PROGRESS
/// after a full dispatch queue or failed handler is retried by a periodic
/// reconciler").
const STALE_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// An automation plan waiting for a worker. Queued on a bounded channel so a
/// full queue degrades predictably instead of growing without bound (spec.md
/// §5 "handler worker pool has a bounded queue").
struct DispatchJob {
    step_id: Uuid,
    step_number: u32,
    user_id: String,
    task_id: Uuid,
    plan: AutomationPlan,
}

/// State-machine transitions, XP/streak awards, and delegation dispatch for
/// MicroSteps (spec.md §4.8): a bounded `mpsc` queue feeding a pool of
/// detached `tokio::spawn` workers, one per job.
pub struct MicroStepRuntime {
    store: Arc<Store>,
    events: EventBus,
    handlers: Arc<HandlerRegistry>,
    dispatch_tx: mpsc::Sender<DispatchJob>,
}

impl MicroStepRuntime {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        handlers: HandlerRegistry,
        handler_queue: usize,
    ) -> Self {
        let handlers = Arc::new(handlers);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(handler_queue.max(1));
        tokio::spawn(run_dispatch_loop(
            dispatch_rx,
            store.clone(),
            events.clone(),
            handlers.clone(),
        ));
        tokio::spawn(run_reconciler_loop(store.clone(), dispatch_tx.clone()));
        Self {
            store,
            events,
            handlers,
            dispatch_tx,
        }
    }

    /// TODO -> IN_PROGRESS; dispatches to a handler if the step is DIGITAL.
    pub async fn start_step(&self, step_id: Uuid) -> Result<MicroStep> {
        let current = self.store.get_step(step_id).await?;
        let now = Utc::now();
        let (transition, commands) = reduce(&current, StepAction::Start, now)?;
        let patch = match transition {
            StepTransition::Start(patch) => patch,
            _ => unreachable!("Start action always yields a Start transition"),
        };
        let updated = self.store.update_step(step_id, patch).await?;
        let task = self.store.get_task(current.parent_task_id).await?;
        self.apply_commands(&task, &updated, commands).await;
        Ok(updated)
    }

    /// IN_PROGRESS (or TODO) -> COMPLETED; awards XP and streak in the same
    /// Store transaction. Returns the updated step plus the user's new XP
    /// total and streak length.
    pub async fn complete_step(
        &self,
        step_id: Uuid,
        actual_minutes: Option<u32>,
    ) -> Result<(MicroStep, u32, u32)> {
        let current = self.store.get_step(step_id).await?;
        let now = Utc::now();
        let (transition, commands) =
            reduce(&current, StepAction::Complete { actual_minutes }, now)?;
        let (actual, xp_amount) = match transition {
            StepTransition::Complete {
                actual_minutes,
                xp_amount,
            } => (actual_minutes, xp_amount),
            StepTransition::AlreadyComplete => {
                // Replayed completion (spec.md §8 property 8): report the
                // step and the user's current totals, nothing re-persisted.
                let task = self.store.get_task(current.parent_task_id).await?;
                let (xp_total, streak_days) = self.store.get_user_stats(&task.user_id).await?;
                return Ok((current, xp_total, streak_days));
            }
            _ => unreachable!("Complete action never yields a Start/Cancel transition"),
        };

        let outcome = self
            .store
            .complete_step(step_id, actual, now, xp_amount)
            .await?;
        let task = self.store.get_task(current.parent_task_id).await?;

        self.apply_commands(&task, &outcome.step, commands).await;
        self.emit(
            &task,
            &outcome.step,
            EventPayload::XpAwarded {
                step_number: outcome.step.step_number,
                amount: xp_amount,
            },
        )
        .await;
        if outcome.streak_changed {
            self.emit(
                &task,
                &outcome.step,
                EventPayload::StreakUpdated {
                    streak_days: outcome.streak_days,
                },
            )
            .await;
        }

        Ok((outcome.step, outcome.xp_total, outcome.streak_days))
    }

    /// Any non-terminal state -> CANCELLED. Never awards XP.
    pub async fn cancel_step(&self, step_id: Uuid, reason: Option<String>) -> Result<MicroStep> {
        let current = self.store.get_step(step_id).await?;
        let now = Utc::now();
        let (transition, commands) = reduce(&current, StepAction::Cancel { reason }, now)?;
        let patch = match transition {
            StepTransition::Cancel(patch) => patch,
            _ => unreachable!("Cancel action always yields a Cancel transition"),
        };
        let updated = self.store.update_step(step_id, patch).await?;
        let task = self.store.get_task(current.parent_task_id).await?;
        self.apply_commands(&task, &updated, commands).await;
        Ok(updated)
    }

    async fn apply_commands(&self, task: &Task, step: &MicroStep, commands: Vec<StepCommand>) {
        for command in commands {
            match command {
                StepCommand::Emit(payload) => self.emit(task, step, payload).await,
                StepCommand::Dispatch(plan) => self.enqueue_dispatch(task, step, plan).await,
            }
        }
    }

    async fn emit(&self, task: &Task, step: &MicroStep, payload: EventPayload) {
        let event = Event::new(
            task.user_id.clone(),
            Some(task.task_id),
            Some(step.step_id),
            payload,
        );
        match self.store.append_event(&event).await {
            Ok(_) => self.events.publish(event),
            Err(err) => warn!(step_id = %step.step_id, error = %err, "failed to append event"),
        }
    }

    /// Enqueues the automation plan and returns immediately; the runtime
    /// never blocks the caller on a handler (spec.md §4.8 Delegation dispatch).
    async fn enqueue_dispatch(&self, task: &Task, step: &MicroStep, plan: AutomationPlan) {
        let job = DispatchJob {
            step_id: step.step_id,
            step_number: step.step_number,
            user_id: task.user_id.clone(),
            task_id: task.task_id,
            plan,
        };
        if self.dispatch_tx.try_send(job).is_err() {
            warn!(
                step_id = %step.step_id,
                "delegation worker queue full, step stays IN_PROGRESS for the periodic reconciler"
            );
        }
    }
}

async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<DispatchJob>,
    store: Arc<Store>,
    events: EventBus,
    handlers: Arc<HandlerRegistry>,
) {
    while let Some(job) = rx.recv().await {
        let store = store.clone();
        let events = events.clone();
        let handlers = handlers.clone();
        tokio::spawn(async move {
            run_dispatch_job(job, store, events, handlers).await;
        });
    }
}

/// Periodically re-enqueues DIGITAL steps that have sat IN_PROGRESS past
/// `STALE_GRACE_PERIOD` — the counterpart to the warnings logged when a
/// dispatch queue is full or a handler fails (spec.md §4.8 Failure model).
/// Re-enqueuing a step whose handler completes it in the meantime is safe:
/// `Store::complete_step`/`reduce` both treat a second completion as an
/// idempotent replay rather than a double-award.
async fn run_reconciler_loop(store: Arc<Store>, dispatch_tx: mpsc::Sender<DispatchJob>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(STALE_GRACE_PERIOD).expect("grace period fits in i64");
        let stale = match store.list_stale_digital_steps(cutoff).await {
            Ok(steps) => steps,
            Err(err) => {
                warn!(error = %err, "reconciler failed to query stale steps");
                continue;
            }
        };
        for step in stale {
            let Some(plan) = step.automation_plan.clone() else {
                continue;
            };
            if step.leaf_type != LeafType::Digital {
                continue;
            }
            let task = match store.get_task(step.parent_task_id).await {
                Ok(task) => task,
                Err(err) => {
                    warn!(step_id = %step.step_id, error = %err, "reconciler could not load parent task");
                    continue;
                }
            };
            let job = DispatchJob {
                step_id: step.step_id,
                step_number: step.step_number,
                user_id: task.user_id,
                task_id: task.task_id,
                plan,
            };
            if dispatch_tx.try_send(job).is_err() {
                warn!(step_id = %step.step_id, "reconciler could not re-enqueue stuck step, queue still full");
            }
        }
    }
}

/// Executes one automation plan and feeds the result back through the state
/// machine. A handler error never reverts the IN_PROGRESS transition; it is
/// logged and left for the reconciler (spec.md §4.8 Failure model).
async fn run_dispatch_job(
    job: DispatchJob,
    store: Arc<Store>,
    events: EventBus,
    handlers: Arc<HandlerRegistry>,
) {
    let Some(handler) = handlers.get(&job.plan.handler_key) else {
        warn!(handler_key = %job.plan.handler_key, "no handler registered for automation plan");
        return;
    };

    match handler.execute(&job.plan).await {
        Ok(crate::handler::HandlerOutcome::Completed { actual_minutes }) => {
            let now = Utc::now();
            match reduce_for_step(&store, job.step_id, actual_minutes, now).await {
                Ok(Some((actual, xp_amount))) => {
                    match store.complete_step(job.step_id, actual, now, xp_amount).await {
                        Ok(outcome) => {
                            publish_completion(&store, &events, &job, &outcome, xp_amount).await;
                        }
                        Err(err) => warn!(
                            step_id = %job.step_id, error = %err,
                            "handler succeeded but completion could not be persisted"
                        ),
                    }
                }
                Ok(None) => {
                    // Already completed via another path; nothing left to do.
                }
                Err(err) => warn!(
                    step_id = %job.step_id, error = %err,
                    "handler succeeded but step was no longer completable"
                ),
            }
        }
        Ok(crate::handler::HandlerOutcome::NeedsClarification { field, question }) => {
            warn!(
                step_id = %job.step_id, field = %field,
                "handler requested clarification: {question}"
            );
            let event = Event::new(
                job.user_id.clone(),
                Some(job.task_id),
                Some(job.step_id),
                EventPayload::ClarificationRaised {
                    step_number: job.step_number,
                    field,
                },
            );
            if store.append_event(&event).await.is_ok() {
                events.publish(event);
            }
        }
        Err(err) => {
            warn!(
                step_id = %job.step_id, handler_key = %job.plan.handler_key, error = %err,
                "delegation handler failed, step remains IN_PROGRESS"
            );
        }
    }
}

/// `None` means the step was already `Completed` by the time the handler's
/// result arrived (e.g. the user completed it manually while it ran) — the
/// caller should skip persisting and emitting a second time.
async fn reduce_for_step(
    store: &Store,
    step_id: Uuid,
    actual_minutes: Option<u32>,
    now: chrono::DateTime<Utc>,
) -> Result<Option<(u32, u32)>> {
    let current = store.get_step(step_id).await?;
    let (transition, _) = reduce(&current, StepAction::Complete { actual_minutes }, now)?;
    match transition {
        StepTransition::Complete {
            actual_minutes,
            xp_amount,
        } => Ok(Some((actual_minutes, xp_amount))),
        StepTransition::AlreadyComplete => Ok(None),
        _ => unreachable!("Complete action never yields a Start/Cancel transition"),
    }
}

async fn publish_completion(
    store: &Store,
    events: &EventBus,
    job: &DispatchJob,
    outcome: &task_store::CompletionOutcome,
    xp_amount: u32,
) {
    let completed = Event::new(
        job.user_id.clone(),
        Some(job.task_id),
        Some(job.step_id),
        EventPayload::StepCompleted {
            step_number: job.step_number,
            actual_minutes: outcome.step.actual_minutes.unwrap_or(0),
        },
    );
    if store.append_event(&completed).await.is_ok() {
        events.publish(completed);
    }
    let xp_event = Event::new(
        job.user_id.clone(),
        Some(job.task_id),
        Some(job.step_id),
        EventPayload::XpAwarded {
            step_number: job.step_number,
            amount: xp_amount,
        },
    );
    if store.append_event(&xp_event).await.is_ok() {
        events.publish(xp_event);
    }
    if outcome.streak_changed {
        let streak_event = Event::new(
            job.user_id.clone(),
            Some(job.task_id),
            Some(job.step_id),
            EventPayload::StreakUpdated {
                streak_days: outcome.streak_days,
            },
        );
        if store.append_event(&streak_event).await.is_ok() {
            events.publish(streak_event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use async_trait::async_trait;
    use task_core::Error;
    use task_types::{
        AutomationPlan, DecompositionState, DelegationMode, LeafType, Priority, Scope, StepStatus,
        TaskStatus,
    };

    fn task(user_id: &str) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: "Email the landlord".to_string(),
            description: "About the heater".to_string(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            scope: Scope::Simple,
            estimated_hours: 0.05,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn human_step(task_id: Uuid) -> MicroStep {
        let now = Utc::now();
        MicroStep {
            step_id: Uuid::new_v4(),
            parent_task_id: task_id,
            step_number: 1,
            description: "Reply to the email".to_string(),
            short_label: None,
            icon: None,
            estimated_minutes: 4,
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

    fn digital_step(task_id: Uuid) -> MicroStep {
        let mut step = human_step(task_id);
        step.leaf_type = LeafType::Digital;
        step.automation_plan = Some(AutomationPlan {
            handler_key: "send_email".to_string(),
            arguments: serde_json::Map::new(),
            confirmation_required: true,
        });
        step
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl Handler for AlwaysSucceeds {
        async fn execute(&self, _plan: &AutomationPlan) -> Result<crate::handler::HandlerOutcome> {
            Ok(crate::handler::HandlerOutcome::Completed {
                actual_minutes: Some(1),
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn execute(&self, _plan: &AutomationPlan) -> Result<crate::handler::HandlerOutcome> {
            Err(Error::Unavailable("handler down".to_string()))
        }
    }

    async fn runtime_with(handlers: HandlerRegistry) -> (Arc<Store>, MicroStepRuntime) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let runtime = MicroStepRuntime::new(store.clone(), EventBus::new(), handlers, 8);
        (store, runtime)
    }

    #[tokio::test]
    async fn start_step_transitions_to_in_progress_and_records_started_at() {
        let (store, runtime) = runtime_with(HandlerRegistry::new()).await;
        let task = task("alice");
        let step = human_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();

        let updated = runtime.start_step(step.step_id).await.unwrap();
        assert_eq!(updated.status, StepStatus::InProgress);
        assert!(updated.started_at.is_some());
    }

    #[tokio::test]
    async fn complete_step_awards_xp_and_promotes_the_parent_task() {
        let (store, runtime) = runtime_with(HandlerRegistry::new()).await;
        let task = task("bob");
        let step = human_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();
        runtime.start_step(step.step_id).await.unwrap();

        let (updated, xp_total, streak_days) =
            runtime.complete_step(step.step_id, Some(2)).await.unwrap();
        assert_eq!(updated.status, StepStatus::Completed);
        assert_eq!(xp_total, 10 + 4 + 5);
        assert_eq!(streak_days, 1);

        let fetched_task = store.get_task(task.task_id).await.unwrap();
        assert_eq!(fetched_task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn completing_an_already_completed_step_is_idempotent() {
        let (store, runtime) = runtime_with(HandlerRegistry::new()).await;
        let task = task("fay");
        let step = human_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();
        runtime.start_step(step.step_id).await.unwrap();
        let (_, first_xp, first_streak) =
            runtime.complete_step(step.step_id, Some(2)).await.unwrap();

        let (updated, second_xp, second_streak) =
            runtime.complete_step(step.step_id, Some(9)).await.unwrap();
        assert_eq!(updated.status, StepStatus::Completed);
        assert_eq!(second_xp, first_xp);
        assert_eq!(second_streak, first_streak);
    }

    #[tokio::test]
    async fn cancel_step_does_not_award_xp() {
        let (store, runtime) = runtime_with(HandlerRegistry::new()).await;
        let task = task("carol");
        let step = human_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();

        let updated = runtime
            .cancel_step(step.step_id, Some("changed my mind".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn starting_a_digital_step_dispatches_and_eventually_completes() {
        let handlers = HandlerRegistry::new().register("send_email", Arc::new(AlwaysSucceeds));
        let (store, runtime) = runtime_with(handlers).await;
        let task = task("dana");
        let step = digital_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();

        runtime.start_step(step.step_id).await.unwrap();

        let mut completed = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            if store.get_step(step.step_id).await.unwrap().status == StepStatus::Completed {
                completed = true;
                break;
            }
        }
        assert!(completed, "digital step should complete via the worker pool");
    }

    #[tokio::test]
    async fn a_failing_handler_leaves_the_step_in_progress() {
        let handlers = HandlerRegistry::new().register("send_email", Arc::new(AlwaysFails));
        let (store, runtime) = runtime_with(handlers).await;
        let task = task("erin");
        let step = digital_step(task.task_id);
        store
            .upsert_task_with_steps(&task, &[step.clone()], None)
            .await
            .unwrap();

        runtime.start_step(step.step_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let fetched = store.get_step(step.step_id).await.unwrap();
        assert_eq!(fetched.status, StepStatus::InProgress);
    }
}

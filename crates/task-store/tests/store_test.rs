use chrono::Utc;
use task_store::{Store, StepPatch};
use task_types::{
    DecompositionState, DelegationMode, Event, EventPayload, LeafType, MicroStep, Priority, Scope,
    StepStatus, Task, TaskStatus,
};
use uuid::Uuid;

fn sample_task(user_id: &str) -> Task {
    let now = Utc::now();
    Task {
        task_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        title: "Plan birthday party".to_string(),
        description: "Get everything sorted for Saturday".to_string(),
        status: TaskStatus::Todo,
        priority: Priority::Medium,
        scope: Scope::Multi,
        estimated_hours: 1.5,
        parent_task_id: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn sample_step(task_id: Uuid, step_number: u32) -> MicroStep {
    MicroStep {
        step_id: Uuid::new_v4(),
        parent_task_id: task_id,
        step_number,
        description: format!("Step {step_number}"),
        short_label: None,
        icon: None,
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

#[tokio::test]
async fn create_and_fetch_task_round_trips() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("alice");
    let task_id = store.create_task(&task).await.unwrap();

    let fetched = store.get_task(task_id).await.unwrap();
    assert_eq!(fetched.title, task.title);
    assert_eq!(fetched.user_id, "alice");
}

#[tokio::test]
async fn create_task_twice_conflicts() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("alice");
    store.create_task(&task).await.unwrap();
    let err = store.create_task(&task).await.unwrap_err();
    assert_eq!(err.code(), "conflict_state");
}

#[tokio::test]
async fn upsert_task_with_steps_persists_both() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("bob");
    let steps = vec![
        sample_step(task.task_id, 1),
        sample_step(task.task_id, 2),
        sample_step(task.task_id, 3),
    ];

    store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap();

    let listed = store.list_micro_steps(task.task_id).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].step_number, 1);
    assert_eq!(listed[2].step_number, 3);
}

#[tokio::test]
async fn upsert_rejects_non_contiguous_step_numbers() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("bob");
    let steps = vec![sample_step(task.task_id, 1), sample_step(task.task_id, 3)];

    let err = store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn upsert_is_idempotent_under_matching_key() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("carol");
    let steps = vec![sample_step(task.task_id, 1)];

    store
        .upsert_task_with_steps(&task, &steps, Some("req-1"))
        .await
        .unwrap();
    store
        .upsert_task_with_steps(&task, &steps, Some("req-1"))
        .await
        .unwrap();

    let listed = store.list_micro_steps(task.task_id).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn update_step_enforces_legal_transitions() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("dana");
    let step = sample_step(task.task_id, 1);
    store
        .upsert_task_with_steps(&task, &[step.clone()], None)
        .await
        .unwrap();

    let completed = store
        .update_step(
            step.step_id,
            StepPatch {
                status: Some(StepStatus::Completed),
                actual_minutes: Some(4),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, StepStatus::Completed);

    let err = store
        .update_step(
            step.step_id,
            StepPatch {
                status: Some(StepStatus::InProgress),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict_state");
}

#[tokio::test]
async fn completing_all_steps_promotes_parent_task() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("erin");
    let steps = vec![sample_step(task.task_id, 1), sample_step(task.task_id, 2)];
    store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap();

    for step in &steps {
        store
            .update_step(
                step.step_id,
                StepPatch {
                    status: Some(StepStatus::Completed),
                    actual_minutes: Some(3),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let fetched = store.get_task(task.task_id).await.unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert!(fetched.completed_at.is_some());
}

#[tokio::test]
async fn delete_task_cancels_open_steps_and_emits_events() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("finn");
    let steps = vec![sample_step(task.task_id, 1), sample_step(task.task_id, 2)];
    store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap();

    let events = store.delete_task(task.task_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0].payload, EventPayload::StepCancelled { .. }));

    let err = store.get_task(task.task_id).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn events_are_listed_in_order_since_a_cursor() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("gary");
    let e1 = Event::new(
        "gary",
        Some(task.task_id),
        None,
        EventPayload::TaskCaptured {
            title: task.title.clone(),
            total_steps: 2,
        },
    );
    let e2 = Event::new(
        "gary",
        Some(task.task_id),
        None,
        EventPayload::StepStarted { step_number: 1 },
    );
    store.append_event(&e1).await.unwrap();
    store.append_event(&e2).await.unwrap();

    let since_first = store
        .list_events_since("gary", Some(e1.event_id))
        .await
        .unwrap();
    assert_eq!(since_first.len(), 1);
    assert_eq!(since_first[0].event_id, e2.event_id);

    let all = store.list_events_since("gary", None).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn progress_reflects_completed_and_in_progress_counts() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("hana");
    let steps = vec![
        sample_step(task.task_id, 1),
        sample_step(task.task_id, 2),
        sample_step(task.task_id, 3),
    ];
    store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap();

    store
        .update_step(
            steps[0].step_id,
            StepPatch {
                status: Some(StepStatus::Completed),
                actual_minutes: Some(3),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .update_step(
            steps[1].step_id,
            StepPatch {
                status: Some(StepStatus::InProgress),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let progress = store.get_progress(task.task_id).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.in_progress, 1);
}

#[tokio::test]
async fn complete_step_awards_xp_and_starts_a_streak() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("ivan");
    let step = sample_step(task.task_id, 1);
    store
        .upsert_task_with_steps(&task, &[step.clone()], None)
        .await
        .unwrap();

    let outcome = store
        .complete_step(step.step_id, 3, Utc::now(), 18)
        .await
        .unwrap();
    assert_eq!(outcome.step.status, StepStatus::Completed);
    assert_eq!(outcome.xp_total, 18);
    assert_eq!(outcome.streak_days, 1);
    assert!(outcome.streak_changed);
}

#[tokio::test]
async fn second_completion_same_day_does_not_bump_streak() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("jane");
    let steps = vec![sample_step(task.task_id, 1), sample_step(task.task_id, 2)];
    store
        .upsert_task_with_steps(&task, &steps, None)
        .await
        .unwrap();

    let now = Utc::now();
    let first = store
        .complete_step(steps[0].step_id, 3, now, 18)
        .await
        .unwrap();
    let second = store
        .complete_step(steps[1].step_id, 3, now, 18)
        .await
        .unwrap();

    assert_eq!(first.streak_days, 1);
    assert_eq!(second.streak_days, 1);
    assert!(!second.streak_changed);
    assert_eq!(second.xp_total, 36);
}

#[tokio::test]
async fn completing_an_already_completed_step_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("kara");
    let step = sample_step(task.task_id, 1);
    store
        .upsert_task_with_steps(&task, &[step.clone()], None)
        .await
        .unwrap();
    let first = store
        .complete_step(step.step_id, 3, Utc::now(), 18)
        .await
        .unwrap();

    let second = store
        .complete_step(step.step_id, 7, Utc::now(), 99)
        .await
        .unwrap();

    assert_eq!(second.step.status, StepStatus::Completed);
    assert_eq!(second.step.actual_minutes, first.step.actual_minutes);
    assert_eq!(second.xp_total, first.xp_total);
    assert_eq!(second.streak_days, first.streak_days);
    assert!(!second.streak_changed);
}

#[tokio::test]
async fn complete_step_rejects_a_cancelled_step() {
    let store = Store::open_in_memory().await.unwrap();
    let task = sample_task("lena");
    let step = sample_step(task.task_id, 1);
    store
        .upsert_task_with_steps(&task, &[step.clone()], None)
        .await
        .unwrap();
    store
        .update_step(
            step.step_id,
            StepPatch {
                status: Some(StepStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store
        .complete_step(step.step_id, 3, Utc::now(), 18)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict_state");
}

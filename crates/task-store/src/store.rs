use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use task_core::{retry_with_backoff, Error, Result};
use task_types::{
    AutomationPlan, ClarificationNeed, DecompositionState, DelegationMode, Event, EventPayload,
    LeafType, MicroStep, Priority, Scope, StepStatus, Task, TaskStatus,
};

use crate::progress::{Progress, StepPatch};
use crate::schema::init_schema;
use crate::stats::CompletionOutcome;

/// Transactional persistence for Tasks, MicroSteps, and Events (spec.md §4.1).
///
/// Backed by `rusqlite` in WAL mode. A single `Mutex`
/// serializes writes per process; callers see independent async operations
/// because the mutex is never held across an `.await` other than the query
/// itself (spec.md §5: "wrapper coalesces writes ... callers see per-user
/// throughput, not global" — here, since SQLite itself only allows one
/// writer at a time, true per-user parallelism would require sharding; this
/// single-file Store accepts process-wide write serialization as the
/// documented simplification, noted in DESIGN.md).
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let path = db_path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(path)?;
            conn.busy_timeout(Duration::from_secs(10))?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute("PRAGMA synchronous = NORMAL", [])?;
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::internal(format!("db open task join error: {e}")))?
        .map_err(|e| Error::internal(format!("db open error: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::internal(format!("in-memory db open error: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(|e| Error::internal(e.to_string()))?;
        init_schema(&conn).map_err(|e| Error::internal(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create_task(&self, task: &Task) -> Result<Uuid> {
        task.validate().map_err(Error::Validation)?;
        let task = task.clone();
        let task_id = task.task_id;
        self.run(move |conn| create_task_sync(conn, &task)).await?;
        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.run(move |conn| get_task_sync(conn, task_id)).await
    }

    pub async fn list_micro_steps(&self, task_id: Uuid) -> Result<Vec<MicroStep>> {
        self.run(move |conn| list_micro_steps_sync(conn, task_id))
            .await
    }

    /// Atomically persists a Task and its MicroSteps. Re-entrant only if
    /// `idempotency_key` matches a prior call for the same task (spec.md §4.1).
    pub async fn upsert_task_with_steps(
        &self,
        task: &Task,
        steps: &[MicroStep],
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        task.validate().map_err(Error::Validation)?;
        for step in steps {
            step.validate().map_err(Error::Validation)?;
        }
        validate_contiguous_step_numbers(steps)?;

        let task = task.clone();
        let steps = steps.to_vec();
        let idempotency_key = idempotency_key.map(|s| s.to_string());
        self.run(move |conn| {
            upsert_task_with_steps_sync(conn, &task, &steps, idempotency_key.as_deref())
        })
        .await
    }

    pub async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> Result<MicroStep> {
        self.run(move |conn| update_step_sync(conn, step_id, &patch))
            .await
    }

    pub async fn get_step(&self, step_id: Uuid) -> Result<MicroStep> {
        self.run(move |conn| get_step_sync(conn, step_id)).await
    }

    /// Transitions a step to COMPLETED, promotes the parent Task if it is now
    /// fully terminal, and awards XP/streak — all in one transaction (spec.md
    /// §4.8). `xp_amount` is the pre-computed award; the Store only owns the
    /// durable bookkeeping, not the XP formula.
    pub async fn complete_step(
        &self,
        step_id: Uuid,
        actual_minutes: u32,
        now: DateTime<Utc>,
        xp_amount: u32,
    ) -> Result<CompletionOutcome> {
        self.run(move |conn| complete_step_sync(conn, step_id, actual_minutes, now, xp_amount))
            .await
    }

    pub async fn append_event(&self, event: &Event) -> Result<Uuid> {
        let event = event.clone();
        self.run(move |conn| append_event_sync(conn, &event))
            .await
            .map(|_| event.event_id)
    }

    pub async fn list_events_since(
        &self,
        user_id: &str,
        since_event_id: Option<Uuid>,
    ) -> Result<Vec<Event>> {
        let user_id = user_id.to_string();
        self.run(move |conn| list_events_since_sync(conn, &user_id, since_event_id))
            .await
    }

    pub async fn get_progress(&self, task_id: Uuid) -> Result<Progress> {
        self.run(move |conn| get_progress_sync(conn, task_id))
            .await
    }

    /// Current `(xp_total, streak_days)` for a user, `(0, 0)` if they have no
    /// `user_stats` row yet. Used to report totals on an idempotent
    /// `CompleteStep` replay without re-running the award logic.
    pub async fn get_user_stats(&self, user_id: &str) -> Result<(u32, u32)> {
        let user_id = user_id.to_string();
        self.run(move |conn| get_user_stats_sync(conn, &user_id))
            .await
    }

    /// DIGITAL steps stuck `InProgress` since before `older_than`, for the
    /// runtime's periodic reconciler.
    pub async fn list_stale_digital_steps(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<MicroStep>> {
        self.run(move |conn| list_stale_digital_steps_sync(conn, older_than))
            .await
    }

    /// Cascades to MicroSteps and emits `StepCancelled` for each non-terminal
    /// step (spec.md §4.1 invariant 2). Returns the events appended so the
    /// caller can fan them out via the EventBus.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<Vec<Event>> {
        self.run(move |conn| delete_task_sync(conn, task_id)).await
    }

    /// Transient `DatabaseBusy`/`DatabaseLocked` failures are retried here
    /// with jittered backoff (spec.md §4.1 "Failure model": max 3 attempts);
    /// everything else (constraint violations, not-found) returns on the
    /// first attempt since `Error::retryable()` is false for them.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        retry_with_backoff(3, Duration::from_secs(1), || async {
            let guard = self.conn.lock().await;
            // The blocking body runs inline while holding the async mutex
            // rather than via spawn_blocking: MicroStep/Task payloads are
            // small and queries are local-disk SQLite, so the block is
            // brief enough not to starve the runtime.
            let result = f(&*guard);
            drop(guard);
            result.map_err(map_sqlite_error)
        })
        .await
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound(err.to_string()),
        rusqlite::Error::SqliteFailure(sqlite_err, _) => {
            use rusqlite::ErrorCode;
            match sqlite_err.code {
                ErrorCode::ConstraintViolation => Error::ConflictState(err.to_string()),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Error::Unavailable(err.to_string())
                }
                _ => Error::internal(err.to_string()),
            }
        }
        _ => Error::internal(err.to_string()),
    }
}

fn validate_contiguous_step_numbers(steps: &[MicroStep]) -> Result<()> {
    let mut numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
    numbers.sort_unstable();
    for (idx, number) in numbers.iter().enumerate() {
        if *number != (idx as u32) + 1 {
            return Err(Error::Validation(format!(
                "step_number sequence must be contiguous 1..N, got {:?}",
                numbers
            )));
        }
    }
    Ok(())
}

fn create_task_sync(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT task_id FROM tasks WHERE task_id = ?1",
            params![task.task_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some(format!("task {} already exists", task.task_id)),
        ));
    }
    insert_task(conn, task)
}

fn insert_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tasks (task_id, user_id, title, description, status, priority, scope,
            estimated_hours, parent_task_id, created_at, updated_at, completed_at, archived)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
        params![
            task.task_id.to_string(),
            task.user_id,
            task.title,
            task.description,
            status_to_str(task.status),
            priority_to_str(task.priority),
            scope_to_str(task.scope),
            task.estimated_hours,
            task.parent_task_id.map(|id| id.to_string()),
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.completed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn get_task_sync(conn: &Connection, task_id: Uuid) -> rusqlite::Result<Task> {
    conn.query_row(
        "SELECT task_id, user_id, title, description, status, priority, scope,
            estimated_hours, parent_task_id, created_at, updated_at, completed_at
         FROM tasks WHERE task_id = ?1",
        params![task_id.to_string()],
        row_to_task,
    )
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: parse_uuid(row.get::<_, String>(0)?),
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: status_from_str(&row.get::<_, String>(4)?),
        priority: priority_from_str(&row.get::<_, String>(5)?),
        scope: scope_from_str(&row.get::<_, String>(6)?),
        estimated_hours: row.get(7)?,
        parent_task_id: row
            .get::<_, Option<String>>(8)?
            .map(parse_uuid),
        created_at: parse_dt(row.get::<_, String>(9)?),
        updated_at: parse_dt(row.get::<_, String>(10)?),
        completed_at: row.get::<_, Option<String>>(11)?.map(parse_dt),
    })
}

const STEP_COLUMNS: &str = "step_id, parent_task_id, step_number, description, short_label, icon,
    estimated_minutes, delegation_mode, leaf_type, status, automation_plan, clarification_needs,
    tags, actual_minutes, parent_step_id, level, is_leaf, decomposition_state, created_at,
    started_at, completed_at";

fn row_to_step(row: &Row) -> rusqlite::Result<MicroStep> {
    let automation_plan: Option<String> = row.get(10)?;
    let clarification_needs: String = row.get(11)?;
    let tags: String = row.get(12)?;
    Ok(MicroStep {
        step_id: parse_uuid(row.get::<_, String>(0)?),
        parent_task_id: parse_uuid(row.get::<_, String>(1)?),
        step_number: row.get::<_, i64>(2)? as u32,
        description: row.get(3)?,
        short_label: row.get(4)?,
        icon: row.get(5)?,
        estimated_minutes: row.get::<_, i64>(6)? as u32,
        delegation_mode: delegation_mode_from_str(&row.get::<_, String>(7)?),
        leaf_type: leaf_type_from_str(&row.get::<_, String>(8)?),
        status: step_status_from_str(&row.get::<_, String>(9)?),
        automation_plan: automation_plan
            .map(|raw| serde_json::from_str::<AutomationPlan>(&raw))
            .transpose()
            .map_err(json_err)?,
        clarification_needs: serde_json::from_str::<Vec<ClarificationNeed>>(&clarification_needs)
            .map_err(json_err)?,
        tags: serde_json::from_str::<Vec<String>>(&tags).map_err(json_err)?,
        actual_minutes: row.get::<_, Option<i64>>(13)?.map(|v| v as u32),
        parent_step_id: row.get::<_, Option<String>>(14)?.map(parse_uuid),
        level: row.get::<_, i64>(15)? as u32,
        is_leaf: row.get::<_, i64>(16)? != 0,
        decomposition_state: decomposition_state_from_str(&row.get::<_, String>(17)?),
        created_at: parse_dt(row.get::<_, String>(18)?),
        started_at: row.get::<_, Option<String>>(19)?.map(parse_dt),
        completed_at: row.get::<_, Option<String>>(20)?.map(parse_dt),
    })
}

fn insert_step(conn: &Connection, step: &MicroStep) -> rusqlite::Result<()> {
    let automation_plan_json = step
        .automation_plan
        .as_ref()
        .map(|plan| serde_json::to_string(plan))
        .transpose()
        .map_err(json_err)?;
    let clarification_json =
        serde_json::to_string(&step.clarification_needs).map_err(json_err)?;
    let tags_json = serde_json::to_string(&step.tags).map_err(json_err)?;

    conn.execute(
        "INSERT INTO micro_steps (step_id, parent_task_id, step_number, description, short_label,
            icon, estimated_minutes, delegation_mode, leaf_type, status, automation_plan,
            clarification_needs, tags, actual_minutes, parent_step_id, level, is_leaf,
            decomposition_state, created_at, started_at, completed_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
        params![
            step.step_id.to_string(),
            step.parent_task_id.to_string(),
            step.step_number,
            step.description,
            step.short_label,
            step.icon,
            step.estimated_minutes,
            delegation_mode_to_str(step.delegation_mode),
            leaf_type_to_str(step.leaf_type),
            step_status_to_str(step.status),
            automation_plan_json,
            clarification_json,
            tags_json,
            step.actual_minutes,
            step.parent_step_id.map(|id| id.to_string()),
            step.level,
            step.is_leaf as i64,
            decomposition_state_to_str(step.decomposition_state),
            step.created_at.to_rfc3339(),
            step.started_at.map(|dt| dt.to_rfc3339()),
            step.completed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn list_micro_steps_sync(conn: &Connection, task_id: Uuid) -> rusqlite::Result<Vec<MicroStep>> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM micro_steps WHERE parent_task_id = ?1 ORDER BY step_number ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![task_id.to_string()], row_to_step)?;
    rows.collect()
}

fn upsert_task_with_steps_sync(
    conn: &Connection,
    task: &Task,
    steps: &[MicroStep],
    idempotency_key: Option<&str>,
) -> rusqlite::Result<()> {
    if let Some(key) = idempotency_key {
        let existing_task_id: Option<String> = conn
            .query_row(
                "SELECT task_id FROM idempotency_keys WHERE idempotency_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_task_id) = existing_task_id {
            if existing_task_id == task.task_id.to_string() {
                return Ok(());
            }
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                Some(format!(
                    "idempotency_key {} already bound to a different task",
                    key
                )),
            ));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let task_exists: Option<String> = tx
        .query_row(
            "SELECT task_id FROM tasks WHERE task_id = ?1",
            params![task.task_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if task_exists.is_some() {
        tx.execute(
            "UPDATE tasks SET title=?2, description=?3, status=?4, priority=?5, scope=?6,
                estimated_hours=?7, updated_at=?8, completed_at=?9 WHERE task_id=?1",
            params![
                task.task_id.to_string(),
                task.title,
                task.description,
                status_to_str(task.status),
                priority_to_str(task.priority),
                scope_to_str(task.scope),
                task.estimated_hours,
                task.updated_at.to_rfc3339(),
                task.completed_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
    } else {
        insert_task(&tx, task)?;
    }

    for step in steps {
        let step_exists: Option<String> = tx
            .query_row(
                "SELECT step_id FROM micro_steps WHERE step_id = ?1",
                params![step.step_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if step_exists.is_some() {
            tx.execute("DELETE FROM micro_steps WHERE step_id = ?1", params![step.step_id.to_string()])?;
        }
        insert_step(&tx, step)?;
    }

    if let Some(key) = idempotency_key {
        tx.execute(
            "INSERT INTO idempotency_keys (idempotency_key, task_id, created_at) VALUES (?1, ?2, ?3)",
            params![key, task.task_id.to_string(), Utc::now().to_rfc3339()],
        )?;
    }

    tx.commit()
}

fn update_step_sync(
    conn: &Connection,
    step_id: Uuid,
    patch: &StepPatch,
) -> rusqlite::Result<MicroStep> {
    let tx = conn.unchecked_transaction()?;
    let sql = format!("SELECT {STEP_COLUMNS} FROM micro_steps WHERE step_id = ?1");
    let current = tx.query_row(&sql, params![step_id.to_string()], row_to_step)?;

    if current.status.is_terminal() {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some(format!(
                "step {} is in terminal state {:?} and is immutable",
                step_id, current.status
            )),
        ));
    }

    if let Some(next_status) = patch.status {
        if !is_legal_transition(current.status, next_status) {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                Some(format!(
                    "illegal transition {:?} -> {:?} for step {}",
                    current.status, next_status, step_id
                )),
            ));
        }
    }

    let mut updated = current.clone();
    if let Some(status) = patch.status {
        updated.status = status;
    }
    if let Some(leaf_type) = patch.leaf_type {
        updated.leaf_type = leaf_type;
    }
    if let Some(plan) = patch.automation_plan.clone() {
        updated.automation_plan = plan;
    }
    if let Some(needs) = patch.clarification_needs.clone() {
        updated.clarification_needs = needs;
    }
    if let Some(actual) = patch.actual_minutes {
        updated.actual_minutes = Some(actual);
    }
    if let Some(started_at) = patch.started_at {
        updated.started_at = Some(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        updated.completed_at = Some(completed_at);
    }

    if updated.status == StepStatus::Completed
        && (updated.completed_at.is_none() || updated.actual_minutes.is_none())
    {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("COMPLETED requires completed_at and actual_minutes".to_string()),
        ));
    }

    let automation_plan_json = updated
        .automation_plan
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(json_err)?;
    let clarification_json =
        serde_json::to_string(&updated.clarification_needs).map_err(json_err)?;

    tx.execute(
        "UPDATE micro_steps SET status=?2, leaf_type=?3, automation_plan=?4,
            clarification_needs=?5, actual_minutes=?6, started_at=?7, completed_at=?8
         WHERE step_id=?1",
        params![
            step_id.to_string(),
            step_status_to_str(updated.status),
            leaf_type_to_str(updated.leaf_type),
            automation_plan_json,
            clarification_json,
            updated.actual_minutes,
            updated.started_at.map(|dt| dt.to_rfc3339()),
            updated.completed_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;

    maybe_promote_parent_task(&tx, updated.parent_task_id)?;

    tx.commit()?;
    Ok(updated)
}

fn get_step_sync(conn: &Connection, step_id: Uuid) -> rusqlite::Result<MicroStep> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM micro_steps WHERE step_id = ?1");
    conn.query_row(&sql, params![step_id.to_string()], row_to_step)
}

fn get_user_stats_sync(conn: &Connection, user_id: &str) -> rusqlite::Result<(u32, u32)> {
    let existing: Option<(i64, i64)> = conn
        .query_row(
            "SELECT xp_total, streak_days FROM user_stats WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(existing
        .map(|(xp, streak)| (xp as u32, streak as u32))
        .unwrap_or((0, 0)))
}

fn complete_step_sync(
    conn: &Connection,
    step_id: Uuid,
    actual_minutes: u32,
    now: DateTime<Utc>,
    xp_amount: u32,
) -> rusqlite::Result<CompletionOutcome> {
    let tx = conn.unchecked_transaction()?;
    let current = get_step_sync(&tx, step_id)?;

    if current.status == StepStatus::Completed {
        // Idempotent replay (spec.md §8 property 8): a second completion of
        // an already-completed step returns the existing step and the
        // user's current totals instead of erroring or re-awarding XP.
        let task = get_task_sync(&tx, current.parent_task_id)?;
        let (xp_total, streak_days) = get_user_stats_sync(&tx, &task.user_id)?;
        tx.commit()?;
        return Ok(CompletionOutcome {
            step: current,
            xp_total,
            streak_days,
            streak_changed: false,
        });
    }
    if current.status.is_terminal() {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some(format!(
                "step {} is in terminal state {:?} and cannot be completed",
                step_id, current.status
            )),
        ));
    }
    if !is_legal_transition(current.status, StepStatus::Completed) {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some(format!(
                "illegal transition {:?} -> Completed for step {}",
                current.status, step_id
            )),
        ));
    }

    tx.execute(
        "UPDATE micro_steps SET status=?2, actual_minutes=?3, completed_at=?4 WHERE step_id=?1",
        params![
            step_id.to_string(),
            step_status_to_str(StepStatus::Completed),
            actual_minutes,
            now.to_rfc3339(),
        ],
    )?;

    maybe_promote_parent_task(&tx, current.parent_task_id)?;

    let task = get_task_sync(&tx, current.parent_task_id)?;
    let today = now.date_naive();
    let today_str = today.format("%Y-%m-%d").to_string();

    let existing: Option<(i64, i64, Option<String>)> = tx
        .query_row(
            "SELECT xp_total, streak_days, last_active_date FROM user_stats WHERE user_id = ?1",
            params![task.user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (prev_xp, prev_streak, prev_date) = existing.unwrap_or((0i64, 0i64, None));

    let (new_streak, streak_changed) = match prev_date.as_deref() {
        None => (1i64, true),
        Some(d) if d == today_str => (prev_streak, false),
        Some(d) => {
            let was_yesterday = NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map(|prev| prev + chrono::Duration::days(1) == today)
                .unwrap_or(false);
            if was_yesterday {
                (prev_streak + 1, true)
            } else {
                (1, true)
            }
        }
    };
    let new_xp = prev_xp + xp_amount as i64;

    tx.execute(
        "INSERT INTO user_stats (user_id, xp_total, streak_days, last_active_date)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET xp_total=?2, streak_days=?3, last_active_date=?4",
        params![task.user_id, new_xp, new_streak, today_str],
    )?;

    tx.commit()?;

    let updated = MicroStep {
        status: StepStatus::Completed,
        actual_minutes: Some(actual_minutes),
        completed_at: Some(now),
        ..current
    };
    Ok(CompletionOutcome {
        step: updated,
        xp_total: new_xp as u32,
        streak_days: new_streak as u32,
        streak_changed,
    })
}

fn is_legal_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Todo, InProgress) | (Todo, Completed) | (Todo, Cancelled)
            | (InProgress, Completed) | (InProgress, Cancelled)
    )
}

/// Promotes the parent Task to COMPLETED iff all its MicroSteps are terminal
/// with at least one COMPLETED (spec.md §8 property 5). Runs inside the same
/// transaction as the step update so progress queries never observe an
/// inconsistent count (spec.md §5).
fn maybe_promote_parent_task(tx: &rusqlite::Transaction, task_id: Uuid) -> rusqlite::Result<()> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM micro_steps WHERE parent_task_id = ?1");
    let mut stmt = tx.prepare(&sql)?;
    let steps: Vec<MicroStep> = stmt
        .query_map(params![task_id.to_string()], row_to_step)?
        .collect::<rusqlite::Result<_>>()?;
    if steps.is_empty() {
        return Ok(());
    }
    let all_terminal = steps.iter().all(|s| s.status.is_terminal());
    let any_completed = steps.iter().any(|s| s.status == StepStatus::Completed);
    if all_terminal && any_completed {
        tx.execute(
            "UPDATE tasks SET status=?2, completed_at=?3, updated_at=?3 WHERE task_id=?1 AND status != 'completed'",
            params![
                task_id.to_string(),
                status_to_str(TaskStatus::Completed),
                Utc::now().to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

/// DIGITAL steps stuck `InProgress` since before `older_than`, for the
/// runtime's periodic reconciler (spec.md §4.8 "a step left IN_PROGRESS
/// after a full dispatch queue or failed handler is retried by a periodic
/// reconciler").
fn list_stale_digital_steps_sync(
    conn: &Connection,
    older_than: DateTime<Utc>,
) -> rusqlite::Result<Vec<MicroStep>> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM micro_steps
         WHERE status = 'in_progress' AND leaf_type = 'digital'
           AND started_at IS NOT NULL AND started_at < ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(params![older_than.to_rfc3339()], row_to_step)?
        .collect()
}

fn append_event_sync(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    let payload_json = serde_json::to_string(&event.payload).map_err(json_err)?;
    conn.execute(
        "INSERT INTO events (event_id, user_id, task_id, step_id, event_type, payload, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id.to_string(),
            event.user_id,
            event.task_id.map(|id| id.to_string()),
            event.step_id.map(|id| id.to_string()),
            event.event_type,
            payload_json,
            event.occurred_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let payload: String = row.get(5)?;
    Ok(Event {
        event_id: parse_uuid(row.get::<_, String>(0)?),
        user_id: row.get(1)?,
        task_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        step_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
        event_type: row.get(4)?,
        payload: serde_json::from_str::<EventPayload>(&payload).map_err(json_err)?,
        occurred_at: parse_dt(row.get::<_, String>(6)?),
    })
}

fn list_events_since_sync(
    conn: &Connection,
    user_id: &str,
    since_event_id: Option<Uuid>,
) -> rusqlite::Result<Vec<Event>> {
    let since_seq: i64 = match since_event_id {
        Some(id) => conn
            .query_row(
                "SELECT seq FROM events WHERE event_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0),
        None => 0,
    };
    let mut stmt = conn.prepare(
        "SELECT event_id, user_id, task_id, step_id, event_type, payload, occurred_at
         FROM events WHERE user_id = ?1 AND seq > ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![user_id, since_seq], row_to_event)?;
    rows.collect()
}

fn get_progress_sync(conn: &Connection, task_id: Uuid) -> rusqlite::Result<Progress> {
    let steps = list_micro_steps_sync(conn, task_id)?;
    let total = steps.len() as u32;
    let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count() as u32;
    let in_progress = steps
        .iter()
        .filter(|s| s.status == StepStatus::InProgress)
        .count() as u32;
    let percent = if total == 0 {
        0.0
    } else {
        (completed as f64 / total as f64) * 100.0
    };
    let total_minutes_est: u32 = steps.iter().map(|s| s.estimated_minutes).sum();
    let total_minutes_actual: u32 = steps.iter().filter_map(|s| s.actual_minutes).sum();
    Ok(Progress {
        total,
        completed,
        in_progress,
        percent,
        total_minutes_est,
        total_minutes_actual,
    })
}

fn delete_task_sync(conn: &Connection, task_id: Uuid) -> rusqlite::Result<Vec<Event>> {
    let tx = conn.unchecked_transaction()?;
    let steps = list_micro_steps_sync(&tx, task_id)?;
    let now = Utc::now();
    let mut cancelled_events = Vec::new();
    for step in steps.iter().filter(|s| !s.status.is_terminal()) {
        tx.execute(
            "UPDATE micro_steps SET status=?2, completed_at=?3 WHERE step_id=?1",
            params![
                step.step_id.to_string(),
                step_status_to_str(StepStatus::Cancelled),
                now.to_rfc3339(),
            ],
        )?;
        let task = get_task_sync(&tx, task_id)?;
        let event = Event::new(
            task.user_id.clone(),
            Some(task_id),
            Some(step.step_id),
            EventPayload::StepCancelled {
                step_number: step.step_number,
                reason: Some("task_deleted".to_string()),
            },
        );
        append_event_sync(&tx, &event)?;
        cancelled_events.push(event);
    }
    tx.execute("DELETE FROM micro_steps WHERE parent_task_id = ?1", params![task_id.to_string()])?;
    tx.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id.to_string()])?;
    tx.commit()?;
    Ok(cancelled_events)
}

fn json_err(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}

fn parse_uuid(raw: String) -> Uuid {
    Uuid::from_str(&raw).unwrap_or_default()
}

fn parse_dt(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(raw: &str) -> TaskStatus {
    match raw {
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Todo,
    }
}

fn step_status_to_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Todo => "todo",
        StepStatus::InProgress => "in_progress",
        StepStatus::Completed => "completed",
        StepStatus::Cancelled => "cancelled",
    }
}

fn step_status_from_str(raw: &str) -> StepStatus {
    match raw {
        "in_progress" => StepStatus::InProgress,
        "completed" => StepStatus::Completed,
        "cancelled" => StepStatus::Cancelled,
        _ => StepStatus::Todo,
    }
}

fn priority_to_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn priority_from_str(raw: &str) -> Priority {
    match raw {
        "low" => Priority::Low,
        "high" => Priority::High,
        "urgent" => Priority::Urgent,
        _ => Priority::Medium,
    }
}

fn scope_to_str(scope: Scope) -> &'static str {
    match scope {
        Scope::Simple => "simple",
        Scope::Multi => "multi",
        Scope::Project => "project",
    }
}

fn scope_from_str(raw: &str) -> Scope {
    match raw {
        "multi" => Scope::Multi,
        "project" => Scope::Project,
        _ => Scope::Simple,
    }
}

fn delegation_mode_to_str(mode: DelegationMode) -> &'static str {
    match mode {
        DelegationMode::Do => "do",
        DelegationMode::DoWithMe => "do_with_me",
        DelegationMode::Delegate => "delegate",
        DelegationMode::Delete => "delete",
    }
}

fn delegation_mode_from_str(raw: &str) -> DelegationMode {
    match raw {
        "do_with_me" => DelegationMode::DoWithMe,
        "delegate" => DelegationMode::Delegate,
        "delete" => DelegationMode::Delete,
        _ => DelegationMode::Do,
    }
}

fn leaf_type_to_str(leaf_type: LeafType) -> &'static str {
    match leaf_type {
        LeafType::Digital => "digital",
        LeafType::Human => "human",
        LeafType::Unknown => "unknown",
    }
}

fn leaf_type_from_str(raw: &str) -> LeafType {
    match raw {
        "digital" => LeafType::Digital,
        "unknown" => LeafType::Unknown,
        _ => LeafType::Human,
    }
}

fn decomposition_state_to_str(state: DecompositionState) -> &'static str {
    match state {
        DecompositionState::Pending => "pending",
        DecompositionState::Decomposed => "decomposed",
        DecompositionState::Leaf => "leaf",
    }
}

fn decomposition_state_from_str(raw: &str) -> DecompositionState {
    match raw {
        "decomposed" => DecompositionState::Decomposed,
        "leaf" => DecompositionState::Leaf,
        _ => DecompositionState::Pending,
    }
}

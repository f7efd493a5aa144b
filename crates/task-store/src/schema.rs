use rusqlite::Connection;

/// Creates the schema if absent. Idempotent: safe to call on every open.
///
/// The `estimated_minutes` CHECK is stricter than the engine-agnostic hint in
/// spec.md §6 ("CHECK between 2 and 15") — it enforces the actual
/// per-leaf-type bound from §3/§9 point 3 (HUMAN: 2-5, DIGITAL/UNKNOWN: 1-15)
/// directly in SQL, so a client bypassing application validation still can't
/// persist an out-of-bounds row.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL,
            priority TEXT NOT NULL,
            scope TEXT NOT NULL,
            estimated_hours REAL NOT NULL,
            parent_task_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            archived INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (parent_task_id) REFERENCES tasks (task_id)
        );

        CREATE TABLE IF NOT EXISTS micro_steps (
            step_id TEXT PRIMARY KEY,
            parent_task_id TEXT NOT NULL,
            step_number INTEGER NOT NULL,
            description TEXT NOT NULL,
            short_label TEXT,
            icon TEXT,
            estimated_minutes INTEGER NOT NULL,
            delegation_mode TEXT NOT NULL,
            leaf_type TEXT NOT NULL,
            status TEXT NOT NULL,
            automation_plan TEXT,
            clarification_needs TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            actual_minutes INTEGER,
            parent_step_id TEXT,
            level INTEGER NOT NULL DEFAULT 0,
            is_leaf INTEGER NOT NULL DEFAULT 1,
            decomposition_state TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            FOREIGN KEY (parent_task_id) REFERENCES tasks (task_id) ON DELETE CASCADE,
            FOREIGN KEY (parent_step_id) REFERENCES micro_steps (step_id),
            UNIQUE (parent_task_id, step_number),
            CHECK (
                (leaf_type = 'human' AND estimated_minutes BETWEEN 2 AND 5)
                OR (leaf_type != 'human' AND estimated_minutes BETWEEN 1 AND 15)
            )
        );

        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            task_id TEXT,
            step_id TEXT,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            occurred_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            idempotency_key TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_stats (
            user_id TEXT PRIMARY KEY,
            xp_total INTEGER NOT NULL DEFAULT 0,
            streak_days INTEGER NOT NULL DEFAULT 0,
            last_active_date TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_user_status ON tasks (user_id, status);
        CREATE INDEX IF NOT EXISTS idx_steps_parent_number ON micro_steps (parent_task_id, step_number);
        CREATE INDEX IF NOT EXISTS idx_events_user_occurred ON events (user_id, occurred_at);
        ",
    )
}

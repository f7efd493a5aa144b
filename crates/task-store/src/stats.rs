use task_types::MicroStep;

/// Result of atomically completing a step together with its XP/streak award
/// (spec.md §4.8 "Streak updates happen in the same transaction as the
/// completion").
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub step: MicroStep,
    pub xp_total: u32,
    pub streak_days: u32,
    /// True only on the first completion of a user's calendar day in UTC —
    /// callers use this to decide whether to emit `StreakUpdated`.
    pub streak_changed: bool,
}

use chrono::Utc;
use futures::future::join_all;
use tracing::warn;
use uuid::Uuid;

use task_classify::Classifier;
use task_core::Result;
use task_split::{SplitOptions, SplitProxy};
use task_types::{
    DecompositionState, DelegationMode, LeafType, MicroStep, Priority, Scope, StepStatus, Task,
    TaskStatus, MAX_TREE_DEPTH,
};

const TAG_KEYWORDS: &[(&str, &str)] = &[
    ("email", "📧"),
    ("call", "📞"),
    ("write", "✍️"),
    ("research", "🔎"),
    ("buy", "🛒"),
    ("shop", "🛒"),
    ("clean", "🧹"),
    ("meeting", "📅"),
    ("read", "📖"),
];

/// Recursively splits and classifies a Task into a flat, ordered sequence
/// of MicroSteps (spec.md §4.6).
pub struct Decomposer {
    split_proxy: SplitProxy,
    classifier: Classifier,
}

impl Decomposer {
    pub fn new(split_proxy: SplitProxy, classifier: Classifier) -> Self {
        Self {
            split_proxy,
            classifier,
        }
    }

    pub async fn decompose(&self, task: &Task) -> Result<Vec<MicroStep>> {
        self.decompose_at_depth(task.clone(), 0).await
    }

    fn decompose_at_depth(
        &self,
        task: Task,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<MicroStep>>> + Send + '_>>
    {
        Box::pin(async move {
            if depth > MAX_TREE_DEPTH {
                warn!(task_id = %task.task_id, depth, "decomposition tree depth bound hit, truncating to a single leaf step");
                return Ok(vec![task_as_leaf_step(&task, depth)]);
            }

            // PROJECT-scope tasks are bisected into task-level chunks, each
            // scored by its own estimated_hours, and recursed into until a
            // chunk's own scope drops to MULTI/SIMPLE or the depth bound is
            // hit (spec.md §4.6 point 4). The trigger has to stay on an
            // hours-scale Task estimate: a MicroStep coming out of SplitProxy
            // is always clamped to at most 15 minutes, so it can never
            // itself classify as PROJECT scope.
            if task.scope == Scope::Project && depth + 1 <= MAX_TREE_DEPTH {
                let mut flattened = Vec::new();
                for chunk in project_chunks(&task) {
                    let children = self.decompose_at_depth(chunk, depth + 1).await?;
                    flattened.extend(children);
                }
                for (idx, step) in flattened.iter_mut().enumerate() {
                    step.step_number = idx as u32 + 1;
                }
                return Ok(flattened);
            }

            if task.scope == Scope::Simple {
                return Ok(vec![task_as_leaf_step(&task, depth)]);
            }

            let steps = self
                .split_proxy
                .split(&task, SplitOptions::default())
                .await?;

            let classified = join_all(
                steps
                    .into_iter()
                    .map(|step| {
                        let classifier = self.classifier.clone();
                        async move { classifier.classify(&step) }
                    }),
            )
            .await;

            let mut flattened = classified;
            for (idx, step) in flattened.iter_mut().enumerate() {
                step.step_number = idx as u32 + 1;
                step.tags = tags_for(&step.description);
                step.level = depth;
            }

            Ok(flattened)
        })
    }
}

const PROJECT_CHUNK_COUNT: u32 = 3;

/// Splits a PROJECT-scope task into smaller task-level chunks so
/// `decompose_at_depth` can keep bisecting by hours until a chunk's own
/// scope drops to MULTI/SIMPLE (spec.md §4.6 point 4).
fn project_chunks(task: &Task) -> Vec<Task> {
    let chunk_hours = (task.estimated_hours / PROJECT_CHUNK_COUNT as f64).max(0.05);
    let now = Utc::now();
    (1..=PROJECT_CHUNK_COUNT)
        .map(|n| Task {
            task_id: Uuid::new_v4(),
            user_id: task.user_id.clone(),
            title: format!("{} (part {n}/{PROJECT_CHUNK_COUNT})", task.title),
            description: task.description.clone(),
            status: TaskStatus::Todo,
            priority: task.priority,
            scope: Scope::from_estimated_minutes(chunk_hours * 60.0),
            estimated_hours: chunk_hours,
            parent_task_id: Some(task.task_id),
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
        .collect()
}

fn task_as_leaf_step(task: &Task, depth: u32) -> MicroStep {
    let now = Utc::now();
    let minutes = ((task.estimated_hours * 60.0).round() as u32).clamp(1, 15);
    MicroStep {
        step_id: Uuid::new_v4(),
        parent_task_id: task.task_id,
        step_number: 1,
        description: task.description.clone(),
        short_label: Some(task.title.clone()),
        icon: None,
        estimated_minutes: minutes,
        delegation_mode: DelegationMode::Do,
        leaf_type: LeafType::Human,
        status: StepStatus::Todo,
        automation_plan: None,
        clarification_needs: Vec::new(),
        tags: tags_for(&task.description),
        actual_minutes: None,
        parent_step_id: None,
        level: depth,
        is_leaf: true,
        decomposition_state: DecompositionState::Leaf,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

fn tags_for(description: &str) -> Vec<String> {
    let lower = description.to_lowercase();
    TAG_KEYWORDS
        .iter()
        .filter(|(keyword, _)| lower.contains(keyword))
        .map(|(_, tag)| tag.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_heuristics::HeuristicSplitter;
    use task_llm::{LlmClient, ProviderRegistry};

    fn task(title: &str, hours: f64) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            title: title.to_string(),
            description: title.to_string(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            scope: Scope::from_estimated_minutes(hours * 60.0),
            estimated_hours: hours,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn decomposer() -> Decomposer {
        let llm = LlmClient::new(ProviderRegistry::new(None, None), 4);
        let split_proxy = SplitProxy::new(llm, HeuristicSplitter::new());
        Decomposer::new(split_proxy, Classifier::new())
    }

    #[tokio::test]
    async fn simple_scope_task_becomes_a_single_leaf_step() {
        let decomposer = decomposer();
        let steps = decomposer.decompose(&task("Reply to Sam", 0.05)).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_leaf);
    }

    #[tokio::test]
    async fn multi_scope_task_splits_into_several_ordered_steps() {
        let decomposer = decomposer();
        let steps = decomposer.decompose(&task("Research the new vendor", 0.5)).await.unwrap();
        assert!(steps.len() >= 2);
        for (idx, step) in steps.iter().enumerate() {
            assert_eq!(step.step_number, idx as u32 + 1);
            assert!(step.validate().is_ok());
        }
        assert!(steps.iter().any(|s| s.tags.contains(&"🔎".to_string())));
    }

    #[tokio::test]
    async fn project_scope_task_recurses_through_chunks_before_splitting() {
        let decomposer = decomposer();
        let steps = decomposer
            .decompose(&task("Launch the new product line", 5.0))
            .await
            .unwrap();
        assert!(
            steps.len() > 6,
            "a PROJECT-scope task should recurse into several chunks before leaf steps, got {}",
            steps.len()
        );
        for (idx, step) in steps.iter().enumerate() {
            assert_eq!(step.step_number, idx as u32 + 1);
            assert!(step.validate().is_ok());
        }
    }
}

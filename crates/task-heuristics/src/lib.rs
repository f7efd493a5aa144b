use std::collections::HashMap;

use chrono::Utc;
use task_types::{DecompositionState, DelegationMode, LeafType, MicroStep, StepStatus, Task};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StepTemplate {
    description: &'static str,
    short_label: &'static str,
    icon: &'static str,
    estimated_minutes: u32,
}

/// Deterministic, network-free splitter used whenever the LLM path is
/// unavailable or returns something unusable (spec.md §4.3).
///
/// Templates are a static table built once at construction.
#[derive(Clone)]
pub struct HeuristicSplitter {
    templates: HashMap<&'static str, Vec<StepTemplate>>,
}

impl Default for HeuristicSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicSplitter {
    pub fn new() -> Self {
        let mut templates: HashMap<&'static str, Vec<StepTemplate>> = HashMap::new();

        templates.insert(
            "email",
            vec![
                tmpl("Gather the recipient's context and any prior thread", "Gather context", "📥", 3),
                tmpl("Draft the email body", "Draft", "✍️", 5),
                tmpl("Review tone and attachments", "Review", "🔍", 3),
                tmpl("Send the email", "Send", "📤", 2),
            ],
        );
        templates.insert(
            "research",
            vec![
                tmpl("Gather existing notes and sources on the topic", "Gather sources", "📚", 4),
                tmpl("Skim the top sources for relevance", "Skim", "👀", 5),
                tmpl("Take structured notes", "Take notes", "📝", 5),
                tmpl("Summarize findings", "Summarize", "🧾", 4),
            ],
        );
        templates.insert(
            "write",
            vec![
                tmpl("Gather reference material and an outline", "Gather & outline", "🗂️", 4),
                tmpl("Write a rough first draft", "Draft", "✍️", 5),
                tmpl("Edit for clarity and structure", "Edit", "🔧", 5),
                tmpl("Proofread the final version", "Proofread", "🔍", 3),
            ],
        );
        templates.insert(
            "plan",
            vec![
                tmpl("Gather constraints and must-haves", "Gather constraints", "🗂️", 3),
                tmpl("List the major milestones", "List milestones", "🧭", 5),
                tmpl("Sequence the milestones into a timeline", "Sequence", "📅", 5),
                tmpl("Share the plan for feedback", "Share", "📣", 2),
            ],
        );
        templates.insert(
            "meeting",
            vec![
                tmpl("Gather the agenda items and invitees", "Gather agenda", "🗂️", 3),
                tmpl("Send the calendar invite", "Send invite", "📅", 2),
                tmpl("Prepare talking points", "Prep talking points", "📝", 5),
                tmpl("Follow up with notes after the meeting", "Follow up", "📤", 4),
            ],
        );

        Self { templates }
    }

    /// Emits 3-6 steps from the best-matching template, falling back to a
    /// generic template when no keyword matches (spec.md §4.3 step 1-4).
    pub fn split(&self, task: &Task) -> Vec<MicroStep> {
        let haystack = format!("{} {}", task.title, task.description).to_lowercase();
        // Checked in a fixed priority order so a title matching more than one
        // keyword still splits deterministically (spec.md §4.3: "Deterministic
        // for a given input") rather than depending on HashMap iteration order.
        let template = KEYWORD_PRIORITY
            .iter()
            .find(|keyword| haystack.contains(**keyword))
            .and_then(|keyword| self.templates.get(keyword))
            .map(|steps| steps.as_slice())
            .unwrap_or(&GENERIC_TEMPLATE);

        template
            .iter()
            .enumerate()
            .map(|(idx, step)| build_step(task.task_id, idx as u32 + 1, step))
            .collect()
    }
}

const fn tmpl(
    description: &'static str,
    short_label: &'static str,
    icon: &'static str,
    estimated_minutes: u32,
) -> StepTemplate {
    StepTemplate {
        description,
        short_label,
        icon,
        estimated_minutes,
    }
}

const KEYWORD_PRIORITY: [&str; 5] = ["email", "research", "write", "plan", "meeting"];

static GENERIC_TEMPLATE: [StepTemplate; 3] = [
    StepTemplate {
        description: "Gather everything needed to begin",
        short_label: "Gather",
        icon: "🗂️",
        estimated_minutes: 3,
    },
    StepTemplate {
        description: "Do the main piece of work",
        short_label: "Do it",
        icon: "⚙️",
        estimated_minutes: 5,
    },
    StepTemplate {
        description: "Double-check the result and close it out",
        short_label: "Wrap up",
        icon: "✅",
        estimated_minutes: 3,
    },
];

fn build_step(task_id: Uuid, step_number: u32, template: &StepTemplate) -> MicroStep {
    let now = Utc::now();
    MicroStep {
        step_id: Uuid::new_v4(),
        parent_task_id: task_id,
        step_number,
        description: template.description.to_string(),
        short_label: Some(template.short_label.to_string()),
        icon: Some(template.icon.to_string()),
        estimated_minutes: template.estimated_minutes,
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

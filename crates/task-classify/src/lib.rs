use serde_json::{Map, Value};

use task_types::{AutomationPlan, ClarificationNeed, LeafType, MicroStep};

/// A registered integration the runtime can dispatch a DIGITAL step to.
///
/// A small static table built once, matched by keyword rather than
/// free-form NLP.
struct HandlerSpec {
    handler_key: &'static str,
    keywords: &'static [&'static str],
    required_args: &'static [&'static str],
}

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec {
        handler_key: "send_email",
        keywords: &["email", "reply to", "send a message"],
        required_args: &["recipient"],
    },
    HandlerSpec {
        handler_key: "schedule_event",
        keywords: &["schedule", "calendar", "book a", "meeting invite"],
        required_args: &["when"],
    },
    HandlerSpec {
        handler_key: "search_web",
        keywords: &["search for", "look up", "research"],
        required_args: &["query"],
    },
    HandlerSpec {
        handler_key: "create_reminder",
        keywords: &["remind", "reminder"],
        required_args: &["when"],
    },
];

/// Annotates a MicroStep with `leaf_type`, `automation_plan`, and
/// `clarification_needs` per spec.md §4.5.
#[derive(Clone, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, step: &MicroStep) -> MicroStep {
        let haystack = step.description.to_lowercase();

        let matches: Vec<(&HandlerSpec, Map<String, Value>, Vec<&'static str>)> = HANDLERS
            .iter()
            .filter(|handler| handler.keywords.iter().any(|kw| haystack.contains(kw)))
            .map(|handler| {
                let mut args = Map::new();
                let mut missing = Vec::new();
                for arg_name in handler.required_args {
                    match extract_argument(&step.description, arg_name) {
                        Some(value) => {
                            args.insert((*arg_name).to_string(), Value::String(value));
                        }
                        None => missing.push(*arg_name),
                    }
                }
                (handler, args, missing)
            })
            .collect();

        if matches.is_empty() {
            return with_leaf_type(step, LeafType::Human, None, Vec::new());
        }

        // Tie-break: most satisfied required args wins; ties resolved by the
        // handler's fixed position in the static table (spec.md §4.5) — the
        // first strictly-better candidate wins, so earlier entries keep
        // priority on an exact tie.
        let mut best_idx = 0;
        for (idx, (_, args, _)) in matches.iter().enumerate() {
            if args.len() > matches[best_idx].1.len() {
                best_idx = idx;
            }
        }
        let (handler, args, missing) = &matches[best_idx];

        if missing.is_empty() {
            let plan = AutomationPlan {
                handler_key: handler.handler_key.to_string(),
                arguments: args.clone(),
                confirmation_required: true,
            };
            with_leaf_type(step, LeafType::Digital, Some(plan), Vec::new())
        } else {
            let needs = missing
                .iter()
                .map(|arg| ClarificationNeed {
                    field: (*arg).to_string(),
                    question: format!("What is the {arg} for this step?"),
                    required: true,
                    answered_with: None,
                })
                .collect();
            with_leaf_type(step, LeafType::Unknown, None, needs)
        }
    }
}

fn with_leaf_type(
    step: &MicroStep,
    leaf_type: LeafType,
    automation_plan: Option<AutomationPlan>,
    clarification_needs: Vec<ClarificationNeed>,
) -> MicroStep {
    let mut next = step.clone();
    next.leaf_type = leaf_type;
    next.automation_plan = automation_plan;
    next.clarification_needs = clarification_needs;
    next
}

/// Pulls a plausible value for `arg_name` out of free text. Deliberately
/// simple pattern matching rather than NLP — good enough to decide DIGITAL
/// vs UNKNOWN, not meant to be a real argument parser.
fn extract_argument(description: &str, arg_name: &str) -> Option<String> {
    match arg_name {
        "recipient" => description
            .split_whitespace()
            .find(|token| token.contains('@') && token.contains('.'))
            .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.').to_string()),
        "when" => {
            let lower = description.to_lowercase();
            const MARKERS: &[&str] = &["today", "tomorrow", "tonight", "am", "pm", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"];
            MARKERS
                .iter()
                .find(|marker| lower.contains(**marker))
                .map(|marker| marker.to_string())
        }
        "query" => {
            let lower = description.to_lowercase();
            for marker in ["search for", "look up", "research"] {
                if let Some(pos) = lower.find(marker) {
                    let rest = description[pos + marker.len()..].trim();
                    if !rest.is_empty() {
                        return Some(rest.to_string());
                    }
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use task_types::{DecompositionState, DelegationMode, StepStatus};
    use uuid::Uuid;

    fn step(description: &str) -> MicroStep {
        let now = Utc::now();
        MicroStep {
            step_id: Uuid::new_v4(),
            parent_task_id: Uuid::new_v4(),
            step_number: 1,
            description: description.to_string(),
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
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn matched_handler_with_all_args_present_is_digital() {
        let classifier = Classifier::new();
        let result = classifier.classify(&step("Email alice@example.com about the lease"));
        assert_eq!(result.leaf_type, LeafType::Digital);
        assert!(result.automation_plan.is_some());
        assert_eq!(result.automation_plan.unwrap().handler_key, "send_email");
    }

    #[test]
    fn matched_handler_with_missing_arg_is_unknown_with_clarification() {
        let classifier = Classifier::new();
        let result = classifier.classify(&step("Email the landlord about the lease"));
        assert_eq!(result.leaf_type, LeafType::Unknown);
        assert_eq!(result.clarification_needs.len(), 1);
        assert_eq!(result.clarification_needs[0].field, "recipient");
    }

    #[test]
    fn unmatched_description_is_human() {
        let classifier = Classifier::new();
        let result = classifier.classify(&step("Fold the laundry"));
        assert_eq!(result.leaf_type, LeafType::Human);
        assert!(result.automation_plan.is_none());
    }
}

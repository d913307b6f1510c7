//! Subgoal planner: split an instruction into ordered subgoals

use regex::Regex;
use std::sync::OnceLock;

use crate::goal_stack::SubgoalSpec;
use crate::intent::{extract_file_references, ComplexityTier, IntentClassification};

const MIN_SUBGOAL_CHARS: usize = 3;

fn list_item_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*•])\s+(.+?)\s*$").ok())
        .as_ref()
}

fn sequencing_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:,?\s*\b(?:and then|then|after that|afterwards|finally)\b\s*,?|;)").ok()
    })
    .as_ref()
}

fn spec_for(text: &str) -> SubgoalSpec {
    let text = text.trim().trim_end_matches('.').trim();
    SubgoalSpec::new(text).with_context(extract_file_references(text))
}

/// Ordered subgoals for `instruction`; empty when it should stay a single goal
pub fn plan_subgoals(instruction: &str, intent: &IntentClassification) -> Vec<SubgoalSpec> {
    if let Some(re) = list_item_regex() {
        let items: Vec<SubgoalSpec> = re
            .captures_iter(instruction)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|s| s.len() >= MIN_SUBGOAL_CHARS)
            .map(spec_for)
            .collect();
        if items.len() >= 2 {
            return items;
        }
    }

    if let Some(re) = sequencing_regex() {
        let parts: Vec<SubgoalSpec> = re
            .split(instruction)
            .map(str::trim)
            .filter(|s| s.len() >= MIN_SUBGOAL_CHARS)
            .map(spec_for)
            .collect();
        if parts.len() >= 2 {
            return parts;
        }
    }

    if intent.complexity == ComplexityTier::Complex {
        let files = extract_file_references(instruction);
        return vec![
            SubgoalSpec::new(format!("Explore the relevant code for: {instruction}"))
                .with_context(files.clone()),
            SubgoalSpec::new(format!("Implement: {instruction}")).with_context(files.clone()),
            SubgoalSpec::new(format!("Verify the changes for: {instruction}")).with_context(files),
        ];
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentClassifier;

    fn plan(text: &str) -> Vec<SubgoalSpec> {
        let intent = IntentClassifier::new().classify(text);
        plan_subgoals(text, &intent)
    }

    #[test]
    fn test_numbered_list() {
        let goals = plan("Do these:\n1. read src/lib.rs\n2. add a test to tests/it.rs\n3) run cargo");
        let names: Vec<&str> = goals.iter().map(|g| g.description.as_str()).collect();
        assert_eq!(names, vec!["read src/lib.rs", "add a test to tests/it.rs", "run cargo"]);
        assert_eq!(goals[0].context, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn test_sequencing_markers() {
        let goals = plan("update the version in Cargo.toml, then rebuild the docs; finally tag it");
        assert_eq!(goals.len(), 3);
        assert_eq!(goals[0].description, "update the version in Cargo.toml");
        assert_eq!(goals[0].context, vec!["Cargo.toml".to_string()]);
        assert_eq!(goals[2].description, "tag it");
    }

    #[test]
    fn test_complex_scaffold() {
        let goals = plan("refactor the storage layer");
        assert_eq!(goals.len(), 3);
        assert!(goals[0].description.starts_with("Explore"));
        assert!(goals[2].description.starts_with("Verify"));
    }

    #[test]
    fn test_simple_stays_single() {
        assert!(plan("fix the typo in config.json").is_empty());
    }
}

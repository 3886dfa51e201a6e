//! Workflow definition loading and normalization.
//!
//! Definitions are immutable YAML templates. `load_definition` parses and
//! validates one; `normalize_workflow_type` is the single normalization
//! point for user-supplied workflow-type labels — every other component
//! consumes the normalized form.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Error;

pub const WORKFLOW_LABEL_PREFIX: &str = "workflow:";
pub const DEFAULT_WORKFLOW_TYPE: &str = "shortened";

/// Agent capability descriptor embedded in step definitions and snapshotted
/// into workflow steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_agent_timeout")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_agent_max_retries")]
    pub default_max_retries: u32,
}

fn default_agent_timeout() -> u64 {
    3600
}

fn default_agent_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// One conditional branch of a router step. A branch whose target is a
/// prior `step_num` must be marked `loop: true`; the loop counter output
/// bounds how many times it may be taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterBranch {
    pub predicate: String,
    pub next_step_num: u32,
    #[serde(default, rename = "loop")]
    pub is_loop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterSpec {
    #[serde(default)]
    pub branches: Vec<RouterBranch>,
    /// Taken when no predicate is satisfied. Required.
    pub default: u32,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
}

fn default_max_loops() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_num: u32,
    pub name: String,
    /// Absent only on router steps.
    #[serde(default)]
    pub agent: Option<AgentSpec>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub initial_delay_seconds: Option<f64>,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub router: Option<RouterSpec>,
}

impl StepDefinition {
    pub fn is_router(&self) -> bool {
        self.router.is_some()
    }
}

/// Immutable workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub workflow_type: String,
    pub steps: Vec<StepDefinition>,
}

/// Parse and validate a workflow definition file.
pub fn load_definition<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read workflow definition: {:?}", path.as_ref()))?;
    parse_definition(&content)
}

pub fn parse_definition(content: &str) -> Result<WorkflowDefinition> {
    let mut definition: WorkflowDefinition =
        serde_yaml::from_str(content).context("Failed to parse workflow definition YAML")?;
    definition.workflow_type =
        normalize_workflow_type(&definition.workflow_type, DEFAULT_WORKFLOW_TYPE);
    validate_definition(&definition)?;
    Ok(definition)
}

fn validate_definition(definition: &WorkflowDefinition) -> Result<()> {
    if definition.name.is_empty() {
        return Err(Error::InvalidDefinition("workflow name cannot be empty".to_string()).into());
    }
    if !definition.steps.iter().any(|s| !s.is_router()) {
        return Err(Error::InvalidDefinition(
            "definition must contain at least one non-router step".to_string(),
        )
        .into());
    }

    let step_nums: Vec<u32> = definition.steps.iter().map(|s| s.step_num).collect();
    for step in &definition.steps {
        if step_nums.iter().filter(|n| **n == step.step_num).count() > 1 {
            return Err(Error::InvalidDefinition(format!(
                "duplicate step_num {} ({})",
                step.step_num, step.name
            ))
            .into());
        }

        match (&step.agent, &step.router) {
            (Some(agent), None) => {
                if agent.name.trim().is_empty() {
                    return Err(Error::InvalidDefinition(format!(
                        "step {} ({}) has an empty agent name",
                        step.step_num, step.name
                    ))
                    .into());
                }
            }
            (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(Error::InvalidDefinition(format!(
                    "step {} ({}) declares both an agent and a router",
                    step.step_num, step.name
                ))
                .into());
            }
            (None, None) => {
                return Err(Error::InvalidDefinition(format!(
                    "step {} ({}) has neither an agent nor a router",
                    step.step_num, step.name
                ))
                .into());
            }
        }

        if let Some(router) = &step.router {
            if !step_nums.contains(&router.default) {
                return Err(Error::InvalidDefinition(format!(
                    "step {} ({}) router default targets missing step {}",
                    step.step_num, step.name, router.default
                ))
                .into());
            }
            for branch in &router.branches {
                if !step_nums.contains(&branch.next_step_num) {
                    return Err(Error::InvalidDefinition(format!(
                        "step {} ({}) router branch targets missing step {}",
                        step.step_num, step.name, branch.next_step_num
                    ))
                    .into());
                }
                if branch.next_step_num <= step.step_num && !branch.is_loop {
                    return Err(Error::InvalidDefinition(format!(
                        "step {} ({}) router back-edge to step {} is not marked as a loop",
                        step.step_num, step.name, branch.next_step_num
                    ))
                    .into());
                }
            }
        }
    }

    Ok(())
}

/// Map a user-supplied workflow-type label to the canonical set.
///
/// Whitespace is trimmed, underscores become hyphens, and case is lowered
/// before lookup. Unknown values return `default`. Idempotent: a canonical
/// value always maps to itself.
pub fn normalize_workflow_type(raw: &str, default: &str) -> String {
    let key = raw.trim().to_lowercase().replace('_', "-");
    match key.as_str() {
        "full" | "shortened" | "fast-track" => key,
        "tier-1-simple" => "fast-track".to_string(),
        "tier-2-standard" => "shortened".to_string(),
        "tier-3-complex" | "tier-4-critical" => "full".to_string(),
        "new-feature" => "full".to_string(),
        "bug-fix" => "shortened".to_string(),
        "hotfix" => "fast-track".to_string(),
        _ => default.to_string(),
    }
}

/// Extract the workflow type from remote issue labels. The first label
/// carrying the prefix wins; its value goes through normalization.
pub fn workflow_type_from_labels(labels: &[String], prefix: &str, default: &str) -> String {
    labels
        .iter()
        .find_map(|label| label.strip_prefix(prefix))
        .map(|raw| normalize_workflow_type(raw, default))
        .unwrap_or_else(|| default.to_string())
}

static CAMEL_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-z0-9])([A-Z])").expect("camel boundary regex is valid")
});
static HYPHEN_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("hyphen regex is valid"));

/// Normalize an agent name for comparison: CamelCase to kebab-case,
/// underscores and spaces to hyphens, repeated hyphens collapsed,
/// lowercased. `"ProductDesigner"` and `"product_designer"` both become
/// `"product-designer"`.
pub fn normalize_agent_key(agent_name: &str) -> String {
    let kebab = CAMEL_BOUNDARY.replace_all(agent_name.trim(), "$1-$2");
    let kebab = kebab.replace(['_', ' '], "-");
    HYPHEN_RUNS.replace_all(&kebab, "-").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_DEFINITION: &str = r#"
name: full-delivery
workflow_type: full
steps:
  - step_num: 1
    name: triage
    agent:
      name: triage
      display_name: Triage
  - step_num: 2
    name: develop
    agent:
      name: developer
      display_name: Developer
      default_max_retries: 3
  - step_num: 3
    name: review-gate
    router:
      branches:
        - predicate: "review_verdict == changes_requested"
          next_step_num: 2
          loop: true
      default: 4
  - step_num: 4
    name: review
    agent:
      name: reviewer
"#;

    #[test]
    fn parses_valid_definition() {
        let definition = parse_definition(VALID_DEFINITION).unwrap();
        assert_eq!(definition.name, "full-delivery");
        assert_eq!(definition.workflow_type, "full");
        assert_eq!(definition.steps.len(), 4);
        assert!(definition.steps[2].is_router());
        assert_eq!(definition.steps[2].router.as_ref().unwrap().default, 4);
    }

    #[test]
    fn rejects_missing_router_default_target() {
        let content = r#"
name: broken
workflow_type: full
steps:
  - step_num: 1
    name: triage
    agent:
      name: triage
  - step_num: 2
    name: gate
    router:
      branches: []
      default: 9
"#;
        let err = parse_definition(content).unwrap_err();
        assert!(err.to_string().contains("missing step 9"));
    }

    #[test]
    fn rejects_empty_agent_name() {
        let content = r#"
name: broken
workflow_type: full
steps:
  - step_num: 1
    name: triage
    agent:
      name: ""
"#;
        let err = parse_definition(content).unwrap_err();
        assert!(err.to_string().contains("empty agent name"));
    }

    #[test]
    fn rejects_unmarked_back_edge() {
        let content = r#"
name: broken
workflow_type: full
steps:
  - step_num: 1
    name: develop
    agent:
      name: developer
  - step_num: 2
    name: gate
    router:
      branches:
        - predicate: "verdict == rework"
          next_step_num: 1
      default: 3
  - step_num: 3
    name: review
    agent:
      name: reviewer
"#;
        let err = parse_definition(content).unwrap_err();
        assert!(err.to_string().contains("not marked as a loop"));
    }

    #[test]
    fn rejects_router_only_definition() {
        let content = r#"
name: broken
workflow_type: full
steps:
  - step_num: 1
    name: gate
    router:
      branches: []
      default: 1
"#;
        let err = parse_definition(content).unwrap_err();
        assert!(err.to_string().contains("non-router"));
    }

    #[test]
    fn normalize_known_types() {
        for (raw, expected) in [
            ("full", "full"),
            ("shortened", "shortened"),
            ("fast-track", "fast-track"),
            ("tier-1-simple", "fast-track"),
            ("tier-2-standard", "shortened"),
            ("tier-3-complex", "full"),
            ("tier-4-critical", "full"),
            ("fast_track", "fast-track"),
            ("new_feature", "full"),
            ("bug_fix", "shortened"),
            ("hotfix", "fast-track"),
            (" Full ", "full"),
        ] {
            assert_eq!(normalize_workflow_type(raw, DEFAULT_WORKFLOW_TYPE), expected);
        }
    }

    #[test]
    fn normalize_unknown_returns_default() {
        assert_eq!(normalize_workflow_type("unknown", "shortened"), "shortened");
        assert_eq!(normalize_workflow_type("unknown", "full"), "full");
        assert_eq!(normalize_workflow_type("", "shortened"), "shortened");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["tier-2-standard", "Full", "hotfix", "garbage"] {
            let once = normalize_workflow_type(raw, DEFAULT_WORKFLOW_TYPE);
            let twice = normalize_workflow_type(&once, DEFAULT_WORKFLOW_TYPE);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn label_extraction_first_match_wins() {
        let labels = vec![
            "bug".to_string(),
            "workflow:full".to_string(),
            "workflow:shortened".to_string(),
        ];
        assert_eq!(
            workflow_type_from_labels(&labels, WORKFLOW_LABEL_PREFIX, DEFAULT_WORKFLOW_TYPE),
            "full"
        );
    }

    #[test]
    fn label_extraction_falls_back_to_default() {
        let labels = vec!["bug".to_string(), "priority:high".to_string()];
        assert_eq!(
            workflow_type_from_labels(&labels, WORKFLOW_LABEL_PREFIX, "fast-track"),
            "fast-track"
        );
    }

    #[test]
    fn agent_key_normalization() {
        assert_eq!(normalize_agent_key("ProductDesigner"), "product-designer");
        assert_eq!(normalize_agent_key("qa_guard"), "qa-guard");
        assert_eq!(normalize_agent_key("Atlas"), "atlas");
        assert_eq!(normalize_agent_key("code  reviewer"), "code-reviewer");
    }
}

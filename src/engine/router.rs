//! Router predicate evaluation.
//!
//! Predicates are compared against the merged outputs of the workflow so
//! far. The grammar is a single `<key> <op> <value>` comparison or a
//! `&&`/`||` combination of them; a bare key tests for a truthy output.
//! Evaluation is synchronous; a router never becomes `RUNNING`.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;

use crate::definition::RouterSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDecision {
    pub next_step_num: u32,
    /// True when the selected branch is a marked back-edge.
    pub is_loop: bool,
}

/// Select the next step: predicates are evaluated in declared order, the
/// first satisfied one wins, otherwise the default branch. Loop branches
/// that already ran `max_loops` times are passed over.
pub fn select_branch(
    router: &RouterSpec,
    outputs: &HashMap<String, Value>,
    loop_count: u32,
) -> RouterDecision {
    for branch in &router.branches {
        if branch.is_loop && loop_count >= router.max_loops {
            tracing::warn!(
                "Router loop branch to step {} exhausted after {} iterations; falling through",
                branch.next_step_num,
                loop_count
            );
            continue;
        }
        match evaluate(&branch.predicate, outputs) {
            Ok(true) => {
                return RouterDecision {
                    next_step_num: branch.next_step_num,
                    is_loop: branch.is_loop,
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    "Router predicate {:?} failed to evaluate: {e}; treating as unsatisfied",
                    branch.predicate
                );
            }
        }
    }
    RouterDecision {
        next_step_num: router.default,
        is_loop: false,
    }
}

/// Evaluate one predicate against the outputs map.
pub fn evaluate(predicate: &str, outputs: &HashMap<String, Value>) -> Result<bool> {
    let trimmed = predicate.trim();
    if trimmed.contains("&&") {
        for part in trimmed.split("&&") {
            if !evaluate(part, outputs)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if trimmed.contains("||") {
        for part in trimmed.split("||") {
            if evaluate(part, outputs)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.as_slice() {
        [key] => Ok(outputs.get(*key).map(is_truthy).unwrap_or(false)),
        [key, op, rest @ ..] => {
            let left = outputs.get(*key).map(value_text).unwrap_or_default();
            let right = rest.join(" ");
            compare(&left, op, &right)
        }
        _ => anyhow::bail!("empty predicate"),
    }
}

fn compare(left: &str, operator: &str, right: &str) -> Result<bool> {
    match operator {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        ">" | "<" | ">=" | "<=" => {
            if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
                Ok(match operator {
                    ">" => l > r,
                    "<" => l < r,
                    ">=" => l >= r,
                    _ => l <= r,
                })
            } else {
                Ok(match operator {
                    ">" => left > right,
                    "<" => left < right,
                    ">=" => left >= right,
                    _ => left <= right,
                })
            }
        }
        _ => anyhow::bail!("unsupported operator: {operator}"),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

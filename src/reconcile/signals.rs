//! Structured completion signal parsing.
//!
//! Agents announce step completion by posting a comment whose header line
//! reads `## <verb> Complete — <agent_type>` and whose body carries
//! `Ready for **@<NextAgent>**`. Additional `key: value` lines become
//! structured outputs. The platform-assigned comment id is the dedup key;
//! comments that do not parse are ignored.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::runtime::Comment;

static HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^##\s+.*?Complete\s*[—–-]+\s*([A-Za-z0-9 _-]+?)\s*$")
        .expect("completion header regex is valid")
});
static READY_FOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Ready for \*\*@([A-Za-z0-9_-]+)\*\*").expect("ready-for regex is valid")
});
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([A-Za-z][A-Za-z0-9 _]*?):\s+(.+?)\s*$")
        .expect("key-value regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSignal {
    pub completed_agent: String,
    pub next_agent: String,
    pub comment_id: String,
    pub created_at: DateTime<Utc>,
    pub structured_outputs: HashMap<String, String>,
}

/// Parse one comment into a completion signal; `None` when the header is
/// missing.
pub fn parse_completion_signal(comment: &Comment) -> Option<CompletionSignal> {
    let completed_agent = HEADER
        .captures(&comment.body)
        .map(|c| c[1].trim().to_string())?;
    if completed_agent.is_empty() {
        return None;
    }

    let next_agent = READY_FOR
        .captures(&comment.body)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    let mut structured_outputs = HashMap::new();
    for captures in KEY_VALUE.captures_iter(&comment.body) {
        let key = captures[1].trim().to_lowercase().replace(' ', "_");
        structured_outputs.insert(key, captures[2].trim().to_string());
    }

    Some(CompletionSignal {
        completed_agent,
        next_agent,
        comment_id: comment.id.clone(),
        created_at: comment.created_at,
        structured_outputs,
    })
}

/// Extract all signals from a comment stream in chronological order.
pub fn extract_completion_signals(comments: &[Comment]) -> Vec<CompletionSignal> {
    let mut signals: Vec<CompletionSignal> =
        comments.iter().filter_map(parse_completion_signal).collect();
    signals.sort_by_key(|s| s.created_at);
    signals
}

//! Task assignment parsing for orchestrator responses.
//!
//! An orchestrator delegates by writing blocks of the form:
//!
//! ```text
//! @worker:frontend
//! Build the settings page.
//! @end
//! ```
//!
//! Names are resolved against the group's workers: exact match first, then
//! case-insensitive, then case-insensitive substring in either direction.
//! Blocks naming nobody we know are dropped.

use regex::Regex;
use std::sync::LazyLock;

static ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)@worker:(\S+)(.*?)@end").unwrap());

/// One delegated task, addressed to a known worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub worker: String,
    pub task: String,
}

/// Map a name written by the orchestrator onto one of `workers`.
pub fn resolve_worker_name(name: &str, workers: &[String]) -> Option<String> {
    let name = name.trim().trim_end_matches([':', ',', '.']);
    if name.is_empty() {
        return None;
    }

    if let Some(exact) = workers.iter().find(|w| w.as_str() == name) {
        return Some(exact.clone());
    }

    let lowered = name.to_lowercase();
    if let Some(found) = workers.iter().find(|w| w.to_lowercase() == lowered) {
        return Some(found.clone());
    }

    workers
        .iter()
        .find(|w| {
            let candidate = w.to_lowercase();
            candidate.contains(&lowered) || lowered.contains(&candidate)
        })
        .cloned()
}

/// Extract every resolvable assignment from `text`, in document order.
pub fn parse_task_assignments(text: &str, workers: &[String]) -> Vec<TaskAssignment> {
    ASSIGNMENT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let worker = resolve_worker_name(&caps[1], workers)?;
            Some(TaskAssignment {
                worker,
                task: caps[2].trim().to_string(),
            })
        })
        .collect()
}

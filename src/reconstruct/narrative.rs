//! Raw stdout log -> attributed timeline entries.
//!
//! Every pass recomputes the whole sequence from the full log text; nothing is
//! merged incrementally. [`TimelineCache`] only skips the work when the input
//! is byte-for-byte unchanged.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// Lines announcing a runner lifecycle transition.
const LIFECYCLE_MARKERS: &[&str] = &[
    "Main process starting",
    "Initializing Environment",
    "Starting execution",
];

/// Lines reporting a failure worth flagging in the timeline.
const ERROR_MARKERS: &[&str] = &["Get screenshot failed", "[CRITICAL ERROR]", "Error:"];

const PLAN_PREFIX: &str = "Plan:";
const WARNING_GLYPH: &str = "⚠️";

pub const SYSTEM_AGENT: &str = "System";
pub const PLANNER_AGENT: &str = "Planner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// The originating task goal.
    User,
    /// Lifecycle or error notice from the runner itself.
    SystemAction,
    /// A step the agents are about to take.
    NarrativeAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub id: String,
    pub kind: EntryKind,
    pub content: String,
    pub agent: Option<String>,
}

/// Rebuild the full timeline from `log`. When `initial_goal` is given it
/// becomes a leading `User` entry.
pub fn reconstruct_timeline(log: &str, initial_goal: Option<&str>) -> Vec<TimelineEntry> {
    let mut entries = Vec::new();

    if let Some(goal) = initial_goal.map(str::trim).filter(|g| !g.is_empty()) {
        entries.push(TimelineEntry {
            id: "goal".to_string(),
            kind: EntryKind::User,
            content: goal.to_string(),
            agent: None,
        });
    }

    for (line_no, line) in log.lines().enumerate() {
        if LIFECYCLE_MARKERS.iter().any(|m| line.contains(m)) {
            entries.push(TimelineEntry {
                id: format!("L{line_no}-system"),
                kind: EntryKind::SystemAction,
                content: line.trim().to_string(),
                agent: Some(SYSTEM_AGENT.to_string()),
            });
        }

        if ERROR_MARKERS.iter().any(|m| line.contains(m)) {
            entries.push(TimelineEntry {
                id: format!("L{line_no}-error"),
                kind: EntryKind::SystemAction,
                content: format!("{WARNING_GLYPH} {}", line.trim()),
                agent: Some(SYSTEM_AGENT.to_string()),
            });
        }

        if let Some(step) = first_plan_step(line) {
            entries.push(TimelineEntry {
                id: format!("L{line_no}-plan"),
                kind: EntryKind::NarrativeAction,
                content: step.to_string(),
                agent: Some(PLANNER_AGENT.to_string()),
            });
        }
    }

    entries
}

/// The first enumerated sub-step of a `Plan:` line: text after `1.` up to the
/// next `2.`, or to end of line.
pub fn first_plan_step(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(PLAN_PREFIX)?;
    let start = rest.find("1.")? + 2;
    let tail = &rest[start..];
    let end = tail.find("2.").unwrap_or(tail.len());
    let step = tail[..end].trim();
    (!step.is_empty()).then_some(step)
}

/// Memoizes the last reconstruction by a hash of its inputs.
#[derive(Debug, Default)]
pub struct TimelineCache {
    fingerprint: Option<u64>,
    entries: Vec<TimelineEntry>,
}

impl TimelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the timeline for `log`, re-parsing only when the input changed.
    pub fn get(&mut self, log: &str, initial_goal: Option<&str>) -> &[TimelineEntry] {
        let mut hasher = DefaultHasher::new();
        log.hash(&mut hasher);
        initial_goal.hash(&mut hasher);
        let fingerprint = hasher.finish();

        if self.fingerprint != Some(fingerprint) {
            self.entries = reconstruct_timeline(log, initial_goal);
            self.fingerprint = Some(fingerprint);
        }
        &self.entries
    }
}

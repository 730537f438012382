use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action_log::{date_key, day_key};

/// A child task of an item. For recurring parents a subtask is usually
/// bound to one occurrence via `occurrence_date`; an unbound, undone
/// subtask is carried-forward work awaiting triage. `done_at` is
/// authoritative only for non-recurring parents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subtask {
    pub id: String,
    pub item_id: String,
    pub parent_subtask_id: Option<String>,
    pub title: String,
    pub order_index: i64,
    pub priority: Option<i64>,
    pub occurrence_date: Option<NaiveDate>,
    pub done_at: Option<NaiveDateTime>,
}

impl Subtask {
    pub fn new(
        id: impl Into<String>,
        item_id: impl Into<String>,
        title: impl Into<String>,
        order_index: i64,
    ) -> Self {
        Self {
            id: id.into(),
            item_id: item_id.into(),
            parent_subtask_id: None,
            title: title.into(),
            order_index,
            priority: None,
            occurrence_date: None,
            done_at: None,
        }
    }

    pub fn under(mut self, parent_subtask_id: impl Into<String>) -> Self {
        self.parent_subtask_id = Some(parent_subtask_id.into());
        self
    }

    pub fn for_occurrence(mut self, occurrence_date: NaiveDate) -> Self {
        self.occurrence_date = Some(occurrence_date);
        self
    }

    pub fn prioritized(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_subtask_id.is_none()
    }
}

/// Per-occurrence completion entry for a subtask of a recurring item. A
/// logged `completed: false` is distinct from no entry at all: both read as
/// incomplete today, but a toggle-off is recorded rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtaskCompletion {
    pub subtask_id: String,
    pub occurrence_key: String,
    pub completed: bool,
    pub recorded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionLog {
    entries: Vec<SubtaskCompletion>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[SubtaskCompletion] {
        &self.entries
    }

    pub fn record(
        &mut self,
        subtask_id: impl Into<String>,
        occurrence_at: NaiveDateTime,
        completed: bool,
        recorded_at: NaiveDateTime,
    ) {
        self.entries.push(SubtaskCompletion {
            subtask_id: subtask_id.into(),
            occurrence_key: date_key(occurrence_at),
            completed,
            recorded_at,
        });
    }

    pub fn latest_for(&self, subtask_id: &str, key: &str) -> Option<&SubtaskCompletion> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.subtask_id == subtask_id && entry.occurrence_key == key)
    }

    /// Appends another log's entries, preserving their order.
    pub fn merge(&mut self, other: CompletionLog) {
        self.entries.extend(other.entries);
    }

    /// Checks the boolean, not mere presence.
    pub fn is_completed(&self, subtask_id: &str, key: &str) -> bool {
        self.latest_for(subtask_id, key)
            .map(|entry| entry.completed)
            .unwrap_or(false)
    }
}

/// Whether a subtask counts as done when viewing one occurrence of its
/// parent. Non-recurring parents fall back to the subtask's own `done_at`.
pub fn is_completed_for(
    subtask: &Subtask,
    occurrence_at: NaiveDateTime,
    parent_recurring: bool,
    completions: &CompletionLog,
) -> bool {
    if !parent_recurring {
        return subtask.done_at.is_some();
    }
    completions.is_completed(&subtask.id, &date_key(occurrence_at))
}

/// Subtasks from past occurrences still awaiting completion, surfaced while
/// viewing `viewed`. Only meaningful when looking at today or the future;
/// browsing a past occurrence never raises the bucket.
pub fn overdue_subtasks<'a>(
    subtasks: &'a [Subtask],
    viewed: NaiveDate,
    today: NaiveDate,
    completions: &CompletionLog,
) -> Vec<&'a Subtask> {
    if viewed < today {
        return Vec::new();
    }
    subtasks
        .iter()
        .filter(|subtask| {
            let Some(bound) = subtask.occurrence_date else {
                return false;
            };
            bound < viewed && bound < today && !completions.is_completed(&subtask.id, &day_key(bound))
        })
        .collect()
}

/// Subtasks of a recurring parent never bound to any occurrence and never
/// finished: a separate triage bucket, distinct from overdue.
pub fn carried_forward(subtasks: &[Subtask]) -> Vec<&Subtask> {
    subtasks
        .iter()
        .filter(|subtask| subtask.occurrence_date.is_none() && subtask.done_at.is_none())
        .collect()
}

/// True when every top-level subtask bound to the given occurrence is
/// completed and at least one exists. This is only a signal; whether to
/// record the parent item's completion is the caller's decision.
pub fn all_top_level_done(
    subtasks: &[Subtask],
    occurrence_at: NaiveDateTime,
    completions: &CompletionLog,
) -> bool {
    let key = date_key(occurrence_at);
    let mut seen = false;
    for subtask in subtasks {
        if !subtask.is_top_level() || subtask.occurrence_date != Some(occurrence_at.date()) {
            continue;
        }
        seen = true;
        if !completions.is_completed(&subtask.id, &key) {
            return false;
        }
    }
    seen
}

/// Display order: prioritized subtasks first (lower number wins), then the
/// sibling `order_index`, then id for stability.
pub fn display_order(a: &Subtask, b: &Subtask) -> Ordering {
    match (a.priority, b.priority) {
        (Some(left), Some(right)) => left
            .cmp(&right)
            .then_with(|| a.order_index.cmp(&b.order_index))
            .then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a
            .order_index
            .cmp(&b.order_index)
            .then_with(|| a.id.cmp(&b.id)),
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubtaskTreeError {
    #[error("subtask `{child}` references unknown parent `{parent}`")]
    UnknownParent { child: String, parent: String },
    #[error("subtask hierarchy contains a cycle through `{id}`")]
    CycleDetected { id: String },
}

/// The parent/child hierarchy of one item's subtasks. Cycles violate the
/// tree invariant and are rejected at build time.
#[derive(Debug, Default)]
pub struct SubtaskTree {
    graph: Graph<Subtask, ()>,
    index_by_id: HashMap<String, NodeIndex>,
}

impl SubtaskTree {
    pub fn roots(&self) -> Vec<&Subtask> {
        let mut roots: Vec<&Subtask> = self
            .graph
            .node_indices()
            .filter(|index| {
                self.graph
                    .neighbors_directed(*index, petgraph::Incoming)
                    .next()
                    .is_none()
            })
            .map(|index| &self.graph[index])
            .collect();
        roots.sort_by(|a, b| display_order(a, b));
        roots
    }

    pub fn children_of(&self, subtask_id: &str) -> Vec<&Subtask> {
        let Some(&index) = self.index_by_id.get(subtask_id) else {
            return Vec::new();
        };
        let mut children: Vec<&Subtask> = self
            .graph
            .neighbors_directed(index, petgraph::Outgoing)
            .map(|child| &self.graph[child])
            .collect();
        children.sort_by(|a, b| display_order(a, b));
        children
    }

    pub fn contains(&self, subtask_id: &str) -> bool {
        self.index_by_id.contains_key(subtask_id)
    }
}

pub fn build_subtask_tree(subtasks: &[Subtask]) -> Result<SubtaskTree, SubtaskTreeError> {
    let mut tree = SubtaskTree::default();

    for subtask in subtasks {
        let index = tree.graph.add_node(subtask.clone());
        tree.index_by_id.insert(subtask.id.clone(), index);
    }

    for subtask in subtasks {
        let Some(parent_id) = &subtask.parent_subtask_id else {
            continue;
        };
        let Some(&parent_index) = tree.index_by_id.get(parent_id) else {
            return Err(SubtaskTreeError::UnknownParent {
                child: subtask.id.clone(),
                parent: parent_id.clone(),
            });
        };
        let child_index = tree.index_by_id[&subtask.id];
        tree.graph.add_edge(parent_index, child_index, ());
    }

    toposort(&tree.graph, None).map_err(|cycle| SubtaskTreeError::CycleDetected {
        id: tree.graph[cycle.node_id()].id.clone(),
    })?;

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn non_recurring_parent_uses_done_at() {
        let mut subtask = Subtask::new("s-1", "item-1", "Buy bags", 0);
        let completions = CompletionLog::new();
        assert!(!is_completed_for(&subtask, at(2024, 1, 1, 9), false, &completions));
        subtask.done_at = Some(at(2024, 1, 1, 10));
        assert!(is_completed_for(&subtask, at(2024, 1, 1, 9), false, &completions));
    }

    #[test]
    fn recurring_parent_checks_the_log_boolean() {
        let subtask = Subtask::new("s-1", "item-1", "Buy bags", 0).for_occurrence(day(2024, 1, 15));
        let mut completions = CompletionLog::new();
        assert!(!is_completed_for(&subtask, at(2024, 1, 15, 9), true, &completions));

        completions.record("s-1", at(2024, 1, 15, 9), true, at(2024, 1, 15, 10));
        assert!(is_completed_for(&subtask, at(2024, 1, 15, 9), true, &completions));

        // A toggle-off is logged, not deleted, and still reads incomplete.
        completions.record("s-1", at(2024, 1, 15, 9), false, at(2024, 1, 15, 11));
        assert!(!is_completed_for(&subtask, at(2024, 1, 15, 9), true, &completions));
        assert_eq!(completions.entries().len(), 2);
    }

    #[test]
    fn overdue_appears_only_from_later_viewpoints() {
        let subtask = Subtask::new("s-1", "item-1", "Wipe shelves", 0).for_occurrence(day(2024, 1, 1));
        let subtasks = vec![subtask];
        let completions = CompletionLog::new();
        let today = day(2024, 1, 15);

        let from_jan15 = overdue_subtasks(&subtasks, day(2024, 1, 15), today, &completions);
        assert_eq!(from_jan15.len(), 1);

        // Browsing the Jan 1 occurrence itself: a normal subtask, not overdue.
        let from_jan1 = overdue_subtasks(&subtasks, day(2024, 1, 1), today, &completions);
        assert!(from_jan1.is_empty());
    }

    #[test]
    fn completed_past_subtasks_are_not_overdue() {
        let subtask = Subtask::new("s-1", "item-1", "Wipe shelves", 0).for_occurrence(day(2024, 1, 1));
        let subtasks = vec![subtask];
        let mut completions = CompletionLog::new();
        completions.record("s-1", at(2024, 1, 1, 9), true, at(2024, 1, 1, 10));

        let overdue = overdue_subtasks(&subtasks, day(2024, 1, 15), day(2024, 1, 15), &completions);
        assert!(overdue.is_empty());
    }

    #[test]
    fn unbound_undone_subtasks_are_carried_forward() {
        let bound = Subtask::new("s-1", "item-1", "Wipe shelves", 0).for_occurrence(day(2024, 1, 1));
        let mut finished = Subtask::new("s-2", "item-1", "Order filters", 1);
        finished.done_at = Some(at(2024, 1, 2, 9));
        let orphaned = Subtask::new("s-3", "item-1", "Fix hinge", 2);

        let subtasks = vec![bound, finished, orphaned];
        let carried = carried_forward(&subtasks);
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].id, "s-3");
    }

    #[test]
    fn all_top_level_done_ignores_nested_subtasks() {
        let occurrence = at(2024, 1, 15, 9);
        let top_a = Subtask::new("s-1", "item-1", "Vacuum", 0).for_occurrence(day(2024, 1, 15));
        let top_b = Subtask::new("s-2", "item-1", "Mop", 1).for_occurrence(day(2024, 1, 15));
        let nested = Subtask::new("s-3", "item-1", "Mop corners", 0)
            .under("s-2")
            .for_occurrence(day(2024, 1, 15));
        let subtasks = vec![top_a, top_b, nested];

        let mut completions = CompletionLog::new();
        completions.record("s-1", occurrence, true, at(2024, 1, 15, 10));
        assert!(!all_top_level_done(&subtasks, occurrence, &completions));

        completions.record("s-2", occurrence, true, at(2024, 1, 15, 11));
        assert!(
            all_top_level_done(&subtasks, occurrence, &completions),
            "nested incompleteness must not block the signal"
        );
    }

    #[test]
    fn no_bound_subtasks_means_no_signal() {
        let completions = CompletionLog::new();
        assert!(!all_top_level_done(&[], at(2024, 1, 15, 9), &completions));
    }

    #[test]
    fn priority_overrides_sibling_order() {
        let plain = Subtask::new("s-1", "item-1", "First by order", 0);
        let urgent = Subtask::new("s-2", "item-1", "Urgent", 5).prioritized(1);
        let mut subtasks = vec![plain, urgent];
        subtasks.sort_by(|a, b| display_order(a, b));
        assert_eq!(subtasks[0].id, "s-2");
    }

    #[test]
    fn tree_orders_children_for_display() {
        let root = Subtask::new("s-1", "item-1", "Clean kitchen", 0);
        let second = Subtask::new("s-2", "item-1", "Counters", 1).under("s-1");
        let first = Subtask::new("s-3", "item-1", "Dishes", 0).under("s-1");
        let tree = build_subtask_tree(&[root, second, first]).unwrap();

        assert_eq!(tree.roots().len(), 1);
        let children: Vec<&str> = tree
            .children_of("s-1")
            .iter()
            .map(|subtask| subtask.id.as_str())
            .collect();
        assert_eq!(children, vec!["s-3", "s-2"]);
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let orphan = Subtask::new("s-1", "item-1", "Dangling", 0).under("missing");
        let err = build_subtask_tree(&[orphan]).unwrap_err();
        assert!(matches!(err, SubtaskTreeError::UnknownParent { .. }));
    }

    #[test]
    fn cycles_are_rejected() {
        let a = Subtask::new("s-1", "item-1", "A", 0).under("s-2");
        let b = Subtask::new("s-2", "item-1", "B", 1).under("s-1");
        let err = build_subtask_tree(&[a, b]).unwrap_err();
        assert!(matches!(err, SubtaskTreeError::CycleDetected { .. }));
    }
}

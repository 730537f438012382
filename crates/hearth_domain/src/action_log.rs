use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalizes a wall-clock timestamp to the calendar-date key used by both
/// logs. Keys are derived from the local date component, never from a UTC
/// truncation, so an occurrence just after local midnight keys to its own
/// day. The same helper runs on write and read paths.
pub fn date_key(at: NaiveDateTime) -> String {
    day_key(at.date())
}

pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Completed,
    Postponed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostponeKind {
    Tomorrow,
    NextOccurrence,
    Custom,
}

/// One immutable log entry: a user action against a single occurrence slot.
/// `occurrence_key` always names the originally scheduled date, even after
/// the slot has been postponed elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OccurrenceAction {
    pub id: u64,
    pub item_id: String,
    pub occurrence_key: String,
    pub kind: ActionKind,
    pub reason: Option<String>,
    pub new_date: Option<NaiveDateTime>,
    pub postpone_kind: Option<PostponeKind>,
    pub recorded_at: NaiveDateTime,
}

/// Payload for a not-yet-recorded action; the log assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
    pub item_id: String,
    pub occurrence_at: NaiveDateTime,
    pub kind: ActionKind,
    pub reason: Option<String>,
    pub new_date: Option<NaiveDateTime>,
    pub postpone_kind: Option<PostponeKind>,
    pub recorded_at: NaiveDateTime,
}

impl NewAction {
    pub fn completed(
        item_id: impl Into<String>,
        occurrence_at: NaiveDateTime,
        recorded_at: NaiveDateTime,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            occurrence_at,
            kind: ActionKind::Completed,
            reason: None,
            new_date: None,
            postpone_kind: None,
            recorded_at,
        }
    }

    pub fn cancelled(
        item_id: impl Into<String>,
        occurrence_at: NaiveDateTime,
        recorded_at: NaiveDateTime,
    ) -> Self {
        Self {
            kind: ActionKind::Cancelled,
            ..Self::completed(item_id, occurrence_at, recorded_at)
        }
    }

    pub fn postponed(
        item_id: impl Into<String>,
        occurrence_at: NaiveDateTime,
        new_date: NaiveDateTime,
        postpone_kind: PostponeKind,
        recorded_at: NaiveDateTime,
    ) -> Self {
        Self {
            kind: ActionKind::Postponed,
            new_date: Some(new_date),
            postpone_kind: Some(postpone_kind),
            ..Self::completed(item_id, occurrence_at, recorded_at)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionLogError {
    #[error("no action with id {id}")]
    NotFound { id: u64 },
    #[error("postponed action for `{item_id}` on {key} has no target date")]
    MissingPostponeTarget { item_id: String, key: String },
}

/// Append-only record of occurrence actions. Entries are never mutated;
/// `undo` physically removes one entry, so resolution only ever sees the
/// surviving latest write per `(item_id, occurrence_key)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionLog {
    entries: Vec<OccurrenceAction>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[OccurrenceAction] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, action: NewAction) -> Result<u64, ActionLogError> {
        let key = date_key(action.occurrence_at);
        if action.kind == ActionKind::Postponed && action.new_date.is_none() {
            return Err(ActionLogError::MissingPostponeTarget {
                item_id: action.item_id,
                key,
            });
        }
        let id = self.next_id();
        self.entries.push(OccurrenceAction {
            id,
            item_id: action.item_id,
            occurrence_key: key,
            kind: action.kind,
            reason: action.reason,
            new_date: action.new_date,
            postpone_kind: action.postpone_kind,
            recorded_at: action.recorded_at,
        });
        Ok(id)
    }

    /// Inserts an already-shaped entry verbatim, keeping its id. Used by the
    /// optimistic overlay, which reserves its own id range.
    pub fn apply(&mut self, action: OccurrenceAction) {
        self.entries.push(action);
    }

    /// Latest entry matching the key and kind, if any survives.
    pub fn find(&self, item_id: &str, key: &str, kind: ActionKind) -> Option<&OccurrenceAction> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.item_id == item_id && entry.occurrence_key == key && entry.kind == kind)
    }

    /// Last write wins: the newest surviving entry for the slot governs its
    /// resolved status.
    pub fn latest_for(&self, item_id: &str, key: &str) -> Option<&OccurrenceAction> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.item_id == item_id && entry.occurrence_key == key)
    }

    /// The governing entry per occurrence key for one item, keyed in date
    /// order for stable traversal.
    pub fn latest_by_key(&self, item_id: &str) -> BTreeMap<&str, &OccurrenceAction> {
        let mut latest: BTreeMap<&str, &OccurrenceAction> = BTreeMap::new();
        for entry in &self.entries {
            if entry.item_id == item_id {
                latest.insert(entry.occurrence_key.as_str(), entry);
            }
        }
        latest
    }

    pub fn references_item(&self, item_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.item_id == item_id)
    }

    /// Removes exactly one entry. An unknown id leaves the log untouched.
    pub fn undo(&mut self, id: u64) -> Result<OccurrenceAction, ActionLogError> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(ActionLogError::NotFound { id })?;
        Ok(self.entries.remove(position))
    }

    /// Appends another log's entries, preserving their order and ids.
    pub fn merge(&mut self, other: ActionLog) {
        self.entries.extend(other.entries);
    }

    fn next_id(&self) -> u64 {
        self.entries.iter().map(|entry| entry.id).max().unwrap_or(0) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn date_key_uses_local_calendar_date() {
        // One minute into the local day must key to that day even though
        // the same instant truncated in UTC could fall on the previous one.
        assert_eq!(date_key(at(2024, 1, 15, 0, 1)), "2024-01-15");
        assert_eq!(date_key(at(2024, 1, 15, 23, 59)), "2024-01-15");
        assert_eq!(
            parse_date_key("2024-01-15"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn record_and_find_use_the_same_key() {
        let mut log = ActionLog::new();
        log.record(NewAction::completed("item-1", at(2024, 1, 15, 0, 1), at(2024, 1, 15, 8, 0)))
            .unwrap();
        assert!(log.find("item-1", "2024-01-15", ActionKind::Completed).is_some());
        assert!(log.find("item-1", "2024-01-14", ActionKind::Completed).is_none());
    }

    #[test]
    fn postponed_without_target_is_rejected() {
        let mut log = ActionLog::new();
        let mut action = NewAction::completed("item-1", at(2024, 1, 15, 9, 0), at(2024, 1, 15, 9, 0));
        action.kind = ActionKind::Postponed;
        let err = log.record(action).unwrap_err();
        assert!(matches!(err, ActionLogError::MissingPostponeTarget { .. }));
        assert!(log.is_empty());
    }

    #[test]
    fn latest_entry_governs() {
        let mut log = ActionLog::new();
        let slot = at(2024, 1, 15, 9, 0);
        log.record(NewAction::completed("item-1", slot, at(2024, 1, 15, 9, 0)))
            .unwrap();
        log.record(NewAction::cancelled("item-1", slot, at(2024, 1, 15, 10, 0)))
            .unwrap();
        let latest = log.latest_for("item-1", "2024-01-15").unwrap();
        assert_eq!(latest.kind, ActionKind::Cancelled);
    }

    #[test]
    fn undo_removes_exactly_one_entry() {
        let mut log = ActionLog::new();
        let slot = at(2024, 1, 15, 9, 0);
        let first = log
            .record(NewAction::completed("item-1", slot, at(2024, 1, 15, 9, 0)))
            .unwrap();
        let second = log
            .record(NewAction::completed("item-2", slot, at(2024, 1, 15, 9, 5)))
            .unwrap();
        let removed = log.undo(first).unwrap();
        assert_eq!(removed.item_id, "item-1");
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].id, second);
    }

    #[test]
    fn undo_of_unknown_id_is_a_clean_not_found() {
        let mut log = ActionLog::new();
        log.record(NewAction::completed("item-1", at(2024, 1, 15, 9, 0), at(2024, 1, 15, 9, 0)))
            .unwrap();
        let err = log.undo(999).unwrap_err();
        assert_eq!(err, ActionLogError::NotFound { id: 999 });
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn ids_restart_from_the_surviving_maximum() {
        let mut log = ActionLog::new();
        let slot = at(2024, 1, 15, 9, 0);
        let first = log
            .record(NewAction::completed("item-1", slot, at(2024, 1, 15, 9, 0)))
            .unwrap();
        log.undo(first).unwrap();
        let second = log
            .record(NewAction::completed("item-1", slot, at(2024, 1, 15, 9, 1)))
            .unwrap();
        assert_eq!(second, 1);
    }
}

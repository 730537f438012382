use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

use crate::recurrence::RecurrenceRule;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Event,
    Reminder,
    Task,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Archived,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("item `{0}` has no anchor date for its kind")]
    MissingAnchor(String),
    #[error("item `{0}` populates both start and due anchors")]
    ConflictingAnchors(String),
    #[error("item `{0}` carries an end time but is not an event")]
    EndTimeOnNonEvent(String),
}

/// A household task, event or reminder. Events anchor on `start_at`,
/// reminders and tasks on `due_at`; exactly one of the two is populated.
/// Items referenced by occurrence actions are never hard-deleted, only
/// archived via `archived_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub start_at: Option<NaiveDateTime>,
    pub due_at: Option<NaiveDateTime>,
    pub end_at: Option<NaiveDateTime>,
    pub status: ItemStatus,
    pub recurrence: Option<RecurrenceRule>,
    pub archived_at: Option<NaiveDateTime>,
}

impl Item {
    pub fn event(id: impl Into<String>, title: impl Into<String>, start_at: NaiveDateTime) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Event,
            title: title.into(),
            start_at: Some(start_at),
            due_at: None,
            end_at: None,
            status: ItemStatus::Pending,
            recurrence: None,
            archived_at: None,
        }
    }

    pub fn reminder(id: impl Into<String>, title: impl Into<String>, due_at: NaiveDateTime) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Reminder,
            title: title.into(),
            start_at: None,
            due_at: Some(due_at),
            end_at: None,
            status: ItemStatus::Pending,
            recurrence: None,
            archived_at: None,
        }
    }

    pub fn task(id: impl Into<String>, title: impl Into<String>, due_at: NaiveDateTime) -> Self {
        Self {
            kind: ItemKind::Task,
            ..Self::reminder(id, title, due_at)
        }
    }

    pub fn recurring(mut self, rule: RecurrenceRule) -> Self {
        self.recurrence = Some(rule);
        self
    }

    /// The single date the item is scheduled around, per its kind.
    pub fn anchor(&self) -> Option<NaiveDateTime> {
        match self.kind {
            ItemKind::Event => self.start_at,
            ItemKind::Reminder | ItemKind::Task => self.due_at,
        }
    }

    pub fn validate(&self) -> Result<(), ItemError> {
        match self.kind {
            ItemKind::Event => {
                if self.start_at.is_none() {
                    return Err(ItemError::MissingAnchor(self.id.clone()));
                }
                if self.due_at.is_some() {
                    return Err(ItemError::ConflictingAnchors(self.id.clone()));
                }
            }
            ItemKind::Reminder | ItemKind::Task => {
                if self.due_at.is_none() {
                    return Err(ItemError::MissingAnchor(self.id.clone()));
                }
                if self.start_at.is_some() {
                    return Err(ItemError::ConflictingAnchors(self.id.clone()));
                }
                if self.end_at.is_some() {
                    return Err(ItemError::EndTimeOnNonEvent(self.id.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some() || self.status == ItemStatus::Archived
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.title == other.title
            && self.start_at == other.start_at
            && self.due_at == other.due_at
            && self.end_at == other.end_at
            && self.status == other.status
            && self.recurrence == other.recurrence
            && self.archived_at == other.archived_at
    }
}

impl Eq for Item {}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        self.anchor()
            .cmp(&other.anchor())
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.title.cmp(&other.title))
            .then_with(|| self.id.cmp(&other.id))
    }
}

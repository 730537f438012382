//! Optimistic write reconciliation for the occurrence engine.
//!
//! Consumers may show a locally predicted action before storage confirms
//! the write. The queue here holds those predictions and overlays them on
//! the last confirmed logs; a prediction is dropped on confirmation (the
//! confirmed log now carries it) or on rejection (the overlay falls back to
//! the confirmed state). Confirmed logs are never mutated in place.

use std::collections::VecDeque;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_domain::action_log::{date_key, ActionKind, ActionLog, OccurrenceAction, PostponeKind};
use hearth_domain::subtask::CompletionLog;

/// Predicted entries carry ids from this range so they can never collide
/// with an id the storage layer hands out.
pub const PENDING_ID_BASE: u64 = 1 << 48;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PendingPayload {
    RecordAction {
        item_id: String,
        occurrence_at: NaiveDateTime,
        kind: ActionKind,
        reason: Option<String>,
        new_date: Option<NaiveDateTime>,
        postpone_kind: Option<PostponeKind>,
    },
    RecordCompletion {
        subtask_id: String,
        occurrence_at: NaiveDateTime,
        completed: bool,
    },
    UndoAction {
        action_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingWrite {
    pub local_id: u64,
    pub predicted_at: NaiveDateTime,
    pub payload: PendingPayload,
}

/// Outcome of draining the queue through the storage layer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub confirmed: Vec<u64>,
    pub rejected: Vec<(u64, String)>,
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    pending: VecDeque<PendingWrite>,
    issued: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingWrite> {
        self.pending.iter()
    }

    pub fn enqueue(&mut self, payload: PendingPayload, predicted_at: NaiveDateTime) -> u64 {
        self.issued += 1;
        let local_id = PENDING_ID_BASE + self.issued;
        self.pending.push_back(PendingWrite {
            local_id,
            predicted_at,
            payload,
        });
        local_id
    }

    /// The confirmed action log with every pending prediction applied, as a
    /// fresh copy. Either all pending entries are visible or (after a
    /// rejection) none of the rejected ones are; there is no partial state.
    pub fn overlay(&self, confirmed: &ActionLog) -> ActionLog {
        let mut log = confirmed.clone();
        for write in &self.pending {
            match &write.payload {
                PendingPayload::RecordAction {
                    item_id,
                    occurrence_at,
                    kind,
                    reason,
                    new_date,
                    postpone_kind,
                } => {
                    log.apply(OccurrenceAction {
                        id: write.local_id,
                        item_id: item_id.clone(),
                        occurrence_key: date_key(*occurrence_at),
                        kind: *kind,
                        reason: reason.clone(),
                        new_date: *new_date,
                        postpone_kind: *postpone_kind,
                        recorded_at: write.predicted_at,
                    });
                }
                PendingPayload::UndoAction { action_id } => {
                    if log.undo(*action_id).is_err() {
                        tracing::warn!(action_id, "pending undo targets a missing action");
                    }
                }
                PendingPayload::RecordCompletion { .. } => {}
            }
        }
        log
    }

    /// Completion-log counterpart of [`overlay`](Self::overlay).
    pub fn overlay_completions(&self, confirmed: &CompletionLog) -> CompletionLog {
        let mut log = confirmed.clone();
        for write in &self.pending {
            if let PendingPayload::RecordCompletion {
                subtask_id,
                occurrence_at,
                completed,
            } = &write.payload
            {
                log.record(subtask_id, *occurrence_at, *completed, write.predicted_at);
            }
        }
        log
    }

    /// Storage acknowledged the write; the confirmed log carries it now.
    pub fn confirm(&mut self, local_id: u64) -> Option<PendingWrite> {
        self.take(local_id)
    }

    /// Storage failed the write; the prediction is discarded and the next
    /// overlay equals the last confirmed state.
    pub fn reject(&mut self, local_id: u64) -> Option<PendingWrite> {
        let write = self.take(local_id);
        if let Some(write) = &write {
            tracing::warn!(local_id = write.local_id, "rolling back rejected write");
        }
        write
    }

    /// Drains the queue front to back through the storage layer, confirming
    /// each accepted write and rolling back each failed one independently.
    #[instrument(skip(self, apply))]
    pub fn flush(&mut self, mut apply: impl FnMut(&PendingPayload) -> Result<()>) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(write) = self.pending.pop_front() {
            match apply(&write.payload) {
                Ok(()) => report.confirmed.push(write.local_id),
                Err(error) => {
                    tracing::warn!(local_id = write.local_id, %error, "write rejected by storage");
                    report.rejected.push((write.local_id, error.to_string()));
                }
            }
        }
        report
    }

    fn take(&mut self, local_id: u64) -> Option<PendingWrite> {
        let position = self
            .pending
            .iter()
            .position(|write| write.local_id == local_id)?;
        self.pending.remove(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use hearth_domain::action_log::NewAction;
    use hearth_domain::item::Item;
    use hearth_domain::recurrence::RecurrenceRule;
    use hearth_domain::resolver;

    fn at(y: i32, m: u32, d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn weekly_item() -> Item {
        Item::task("plants", "Water plants", at(2024, 1, 1, 9)).recurring(RecurrenceRule::new(
            "FREQ=WEEKLY",
            at(2024, 1, 1, 9),
        ))
    }

    fn predicted_completion(queue: &mut PendingQueue) -> u64 {
        queue.enqueue(
            PendingPayload::RecordAction {
                item_id: "plants".into(),
                occurrence_at: at(2024, 1, 8, 9),
                kind: ActionKind::Completed,
                reason: None,
                new_date: None,
                postpone_kind: None,
            },
            at(2024, 1, 8, 9),
        )
    }

    #[test]
    fn pending_writes_are_visible_through_the_overlay() {
        let item = weekly_item();
        let confirmed = ActionLog::new();
        let mut queue = PendingQueue::new();
        predicted_completion(&mut queue);

        let overlaid = queue.overlay(&confirmed);
        let occurrences =
            resolver::resolve(&item, at(2024, 1, 1, 0), at(2024, 1, 14, 23), &overlaid);
        let jan8 = occurrences
            .iter()
            .find(|occurrence| occurrence.scheduled_at == at(2024, 1, 8, 9))
            .unwrap();
        assert!(jan8.is_completed);
        assert!(confirmed.is_empty(), "confirmed log is never touched");
    }

    #[test]
    fn rejection_rolls_back_to_the_confirmed_state() {
        let confirmed = ActionLog::new();
        let mut queue = PendingQueue::new();
        let local_id = predicted_completion(&mut queue);

        queue.reject(local_id);
        assert!(queue.is_empty());
        assert_eq!(queue.overlay(&confirmed), confirmed);
    }

    #[test]
    fn confirmed_writes_leave_the_queue() {
        let mut confirmed = ActionLog::new();
        let mut queue = PendingQueue::new();
        let local_id = predicted_completion(&mut queue);

        // Storage acknowledges: the confirmed log now carries the entry.
        confirmed
            .record(NewAction::completed("plants", at(2024, 1, 8, 9), at(2024, 1, 8, 9)))
            .unwrap();
        queue.confirm(local_id);

        assert!(queue.is_empty());
        assert_eq!(queue.overlay(&confirmed), confirmed);
    }

    #[test]
    fn flush_confirms_and_rejects_independently() {
        let mut queue = PendingQueue::new();
        let good = predicted_completion(&mut queue);
        let bad = queue.enqueue(
            PendingPayload::UndoAction { action_id: 404 },
            at(2024, 1, 8, 10),
        );

        let report = queue.flush(|payload| match payload {
            PendingPayload::UndoAction { .. } => Err(anyhow::anyhow!("no such action")),
            _ => Ok(()),
        });

        assert_eq!(report.confirmed, vec![good]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, bad);
        assert!(queue.is_empty());
    }

    #[test]
    fn completion_overlay_applies_pending_toggles() {
        let confirmed = CompletionLog::new();
        let mut queue = PendingQueue::new();
        queue.enqueue(
            PendingPayload::RecordCompletion {
                subtask_id: "s-1".into(),
                occurrence_at: at(2024, 1, 8, 9),
                completed: true,
            },
            at(2024, 1, 8, 9),
        );

        let overlaid = queue.overlay_completions(&confirmed);
        assert!(overlaid.is_completed("s-1", "2024-01-08"));
        assert!(!confirmed.is_completed("s-1", "2024-01-08"));
    }

    #[test]
    fn pending_ids_never_collide_with_storage_ids() {
        let mut queue = PendingQueue::new();
        let local_id = predicted_completion(&mut queue);
        assert!(local_id > PENDING_ID_BASE);
    }
}

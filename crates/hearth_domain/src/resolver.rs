use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::action_log::{date_key, parse_date_key, ActionKind, ActionLog};
use crate::item::Item;
use crate::recurrence::{self, week_start};

/// One concrete instance of an item, computed at resolution time and never
/// persisted. `scheduled_at` is the originally scheduled slot and remains
/// the action-log key even after a postponement relocates the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub item_id: String,
    pub scheduled_at: NaiveDateTime,
    pub effective_at: NaiveDateTime,
    pub is_completed: bool,
    pub is_postponed: bool,
}

impl Occurrence {
    /// The originally scheduled date, present only for relocated instances.
    pub fn original_at(&self) -> Option<NaiveDateTime> {
        self.is_postponed.then_some(self.scheduled_at)
    }

    /// The key under which actions against this occurrence are logged.
    pub fn log_key(&self) -> String {
        date_key(self.scheduled_at)
    }
}

impl PartialEq for Occurrence {
    fn eq(&self, other: &Self) -> bool {
        self.item_id == other.item_id
            && self.scheduled_at == other.scheduled_at
            && self.effective_at == other.effective_at
            && self.is_completed == other.is_completed
            && self.is_postponed == other.is_postponed
    }
}

impl Eq for Occurrence {}

impl PartialOrd for Occurrence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Occurrence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.effective_at
            .cmp(&other.effective_at)
            .then_with(|| self.scheduled_at.cmp(&other.scheduled_at))
            .then_with(|| self.item_id.cmp(&other.item_id))
    }
}

/// Resolves one item's effective occurrences over `[window_start,
/// window_end]`, overlaying the action log on the base series. Pure: the
/// same inputs always produce the same ordered output, and no I/O happens
/// here.
///
/// Cancelled slots are dropped from the output entirely, removing them from
/// every downstream count; they are not "not yet done". Postponed slots are
/// consumed at their original date and resurface at their target date, which
/// may fall in a different window than the original.
pub fn resolve(
    item: &Item,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
    log: &ActionLog,
) -> Vec<Occurrence> {
    debug_assert!(window_start <= window_end);

    let latest = log.latest_by_key(&item.id);
    let mut out: Vec<Occurrence> = Vec::new();
    let mut taken: HashSet<NaiveDateTime> = HashSet::new();

    for scheduled in base_dates(item, window_start, window_end) {
        let key = date_key(scheduled);
        match latest.get(key.as_str()) {
            Some(action) if action.kind == ActionKind::Cancelled => continue,
            Some(action) if action.kind == ActionKind::Postponed => continue,
            Some(action) => {
                debug_assert_eq!(action.kind, ActionKind::Completed);
                taken.insert(scheduled);
                out.push(Occurrence {
                    item_id: item.id.clone(),
                    scheduled_at: scheduled,
                    effective_at: scheduled,
                    is_completed: true,
                    is_postponed: false,
                });
            }
            None => {
                taken.insert(scheduled);
                out.push(Occurrence {
                    item_id: item.id.clone(),
                    scheduled_at: scheduled,
                    effective_at: scheduled,
                    is_completed: false,
                    is_postponed: false,
                });
            }
        }
    }

    // Relocated instances land in the window their target date falls in,
    // even when the original slot is outside this window.
    let slot_time = anchor_time(item);
    for (key, action) in &latest {
        if action.kind != ActionKind::Postponed {
            continue;
        }
        let Some(new_date) = action.new_date else {
            tracing::warn!(item = %item.id, key = %key, "postponed action has no target date");
            continue;
        };
        if new_date < window_start || new_date > window_end {
            continue;
        }
        let Some(original_day) = parse_date_key(key) else {
            tracing::warn!(item = %item.id, key = %key, "unparseable occurrence key");
            continue;
        };
        if !taken.insert(new_date) {
            // A scheduled slot already holds this effective date; the base
            // series wins and the relocation is resolved last-write-wins.
            tracing::debug!(item = %item.id, %new_date, "relocated occurrence collides with a scheduled slot");
            continue;
        }
        out.push(Occurrence {
            item_id: item.id.clone(),
            scheduled_at: original_day.and_time(slot_time),
            effective_at: new_date,
            is_completed: false,
            is_postponed: true,
        });
    }

    out.sort();
    out
}

fn base_dates(
    item: &Item,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    match &item.recurrence {
        None => item
            .anchor()
            .filter(|anchor| *anchor >= window_start && *anchor <= window_end)
            .into_iter()
            .collect(),
        Some(rule) => match recurrence::expand(rule, window_start, window_end) {
            Ok(dates) => dates,
            Err(error) => {
                tracing::warn!(
                    item = %item.id,
                    %error,
                    "unparseable recurrence rule, resolving zero occurrences"
                );
                Vec::new()
            }
        },
    }
}

/// Time of day the item's instances occur at, taken from the series anchor.
fn anchor_time(item: &Item) -> NaiveTime {
    item.recurrence
        .as_ref()
        .map(|rule| rule.start_anchor.time())
        .or_else(|| item.anchor().map(|anchor| anchor.time()))
        .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is a valid time"))
}

/// Display policy over raw resolution: past-due occurrences still worth
/// surfacing. An occurrence completed in a previous calendar week (weeks
/// start Monday) counts as settled and drops out of the overdue view; one
/// completed within the current week stays visible.
pub fn currently_overdue<'a>(
    occurrences: &'a [Occurrence],
    log: &ActionLog,
    now: NaiveDateTime,
) -> Vec<&'a Occurrence> {
    let archive_horizon = week_start(now.date());
    occurrences
        .iter()
        .filter(|occurrence| {
            if occurrence.effective_at >= now {
                return false;
            }
            if !occurrence.is_completed {
                return true;
            }
            match log.find(&occurrence.item_id, &occurrence.log_key(), ActionKind::Completed) {
                Some(action) => action.recorded_at.date() >= archive_horizon,
                None => true,
            }
        })
        .collect()
}

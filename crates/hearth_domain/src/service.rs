use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{Days, Local, NaiveDateTime};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::action_log::{ActionLog, NewAction, OccurrenceAction, PostponeKind};
use crate::item::Item;
use crate::recurrence;
use crate::resolver::{self, Occurrence};
use crate::subtask::{self, CompletionLog, Subtask};

/// On-disk snapshot format. Roots may hold several snapshot files; they are
/// merged on ingest and written back to the primary file as one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub actions: ActionLog,
    #[serde(default)]
    pub completions: CompletionLog,
}

#[derive(Debug, Default)]
struct Store {
    items: HashMap<String, Item>,
    subtasks: HashMap<String, Subtask>,
    actions: ActionLog,
    completions: CompletionLog,
}

impl Store {
    fn absorb(&mut self, snapshot: StoreSnapshot) {
        for item in snapshot.items {
            if self.items.insert(item.id.clone(), item).is_some() {
                tracing::debug!("duplicate item id across snapshots, later file wins");
            }
        }
        for subtask in snapshot.subtasks {
            self.subtasks.insert(subtask.id.clone(), subtask);
        }
        self.actions.merge(snapshot.actions);
        self.completions.merge(snapshot.completions);
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut items: Vec<Item> = self.items.values().cloned().collect();
        items.sort();
        let mut subtasks: Vec<Subtask> = self.subtasks.values().cloned().collect();
        subtasks.sort_by(|a, b| a.id.cmp(&b.id));
        StoreSnapshot {
            items,
            subtasks,
            actions: self.actions.clone(),
            completions: self.completions.clone(),
        }
    }
}

/// The full window view handed to consumers: every effective occurrence of
/// every live item, plus the carried-forward subtask bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannerSnapshot {
    pub occurrences: Vec<Occurrence>,
    pub carried_forward: Vec<Subtask>,
}

pub struct PlannerService {
    roots: Vec<PathBuf>,
    store: RwLock<Store>,
    watcher: Option<RecommendedWatcher>,
}

pub struct PlannerServiceBuilder {
    roots: Vec<PathBuf>,
}

impl PlannerServiceBuilder {
    pub fn new() -> Self {
        Self { roots: Vec::new() }
    }

    pub fn add_store_root(mut self, path: impl AsRef<Path>) -> Self {
        Self::push_unique(&mut self.roots, path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<PlannerService> {
        let service = PlannerService {
            roots: self.roots,
            store: RwLock::new(Store::default()),
            watcher: None,
        };
        service.reload_all()?;
        Ok(service)
    }

    fn push_unique(vec: &mut Vec<PathBuf>, path: PathBuf) {
        if !vec.contains(&path) {
            vec.push(path);
        }
    }
}

impl Default for PlannerServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannerService {
    pub fn builder() -> PlannerServiceBuilder {
        PlannerServiceBuilder::new()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = self.roots.clone();
        roots.sort();
        roots
    }

    pub fn reload_all(&self) -> Result<()> {
        let mut store = self.store.write();
        *store = Store::default();
        for root in &self.roots {
            Self::ingest_root(&mut store, root)?;
        }
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    pub fn list_items(&self) -> Vec<Item> {
        let store = self.store.read();
        let mut items: Vec<Item> = store.items.values().cloned().collect();
        items.sort();
        items
    }

    pub fn get_item(&self, item_id: &str) -> Result<Item> {
        self.store
            .read()
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| anyhow!("item `{item_id}` not loaded"))
    }

    pub fn subtasks_for(&self, item_id: &str) -> Vec<Subtask> {
        let store = self.store.read();
        let mut subtasks: Vec<Subtask> = store
            .subtasks
            .values()
            .filter(|subtask| subtask.item_id == item_id)
            .cloned()
            .collect();
        subtasks.sort_by(|a, b| subtask::display_order(a, b));
        subtasks
    }

    pub fn actions(&self) -> ActionLog {
        self.store.read().actions.clone()
    }

    pub fn completions(&self) -> CompletionLog {
        self.store.read().completions.clone()
    }

    // ---- item and subtask writes ---------------------------------------

    pub fn upsert_item(&self, item: Item) -> Result<()> {
        item.validate()?;
        let mut store = self.store.write();
        store.items.insert(item.id.clone(), item);
        self.persist(&store)
    }

    /// Soft delete: the item stays resolvable from the log's point of view
    /// but disappears from snapshots.
    pub fn archive_item(&self, item_id: &str) -> Result<()> {
        let mut store = self.store.write();
        let item = store
            .items
            .get_mut(item_id)
            .ok_or_else(|| anyhow!("item `{item_id}` not loaded"))?;
        item.archived_at = Some(now());
        item.status = crate::item::ItemStatus::Archived;
        self.persist(&store)
    }

    /// Hard delete, refused while any action still references the item.
    pub fn remove_item(&self, item_id: &str) -> Result<()> {
        let mut store = self.store.write();
        if store.actions.references_item(item_id) {
            return Err(anyhow!(
                "item `{item_id}` is referenced by occurrence actions; archive it instead"
            ));
        }
        store
            .items
            .remove(item_id)
            .ok_or_else(|| anyhow!("item `{item_id}` not loaded"))?;
        store.subtasks.retain(|_, subtask| subtask.item_id != item_id);
        self.persist(&store)
    }

    pub fn upsert_subtask(&self, subtask: Subtask) -> Result<()> {
        let mut store = self.store.write();
        if !store.items.contains_key(&subtask.item_id) {
            return Err(anyhow!("subtask parent item `{}` not loaded", subtask.item_id));
        }
        store.subtasks.insert(subtask.id.clone(), subtask);
        self.persist(&store)
    }

    // ---- occurrence action writes --------------------------------------

    pub fn complete_occurrence(
        &self,
        item_id: &str,
        occurrence_at: NaiveDateTime,
        reason: Option<String>,
    ) -> Result<u64> {
        let mut action = NewAction::completed(item_id, occurrence_at, now());
        action.reason = reason;
        self.record_action(action)
    }

    pub fn cancel_occurrence(
        &self,
        item_id: &str,
        occurrence_at: NaiveDateTime,
        reason: Option<String>,
    ) -> Result<u64> {
        let mut action = NewAction::cancelled(item_id, occurrence_at, now());
        action.reason = reason;
        self.record_action(action)
    }

    pub fn postpone_occurrence(
        &self,
        item_id: &str,
        occurrence_at: NaiveDateTime,
        kind: PostponeKind,
        custom_target: Option<NaiveDateTime>,
        reason: Option<String>,
    ) -> Result<u64> {
        let item = self.get_item(item_id)?;
        let target = postpone_target(&item, occurrence_at, kind, custom_target)?;
        let mut action = NewAction::postponed(item_id, occurrence_at, target, kind, now());
        action.reason = reason;
        self.record_action(action)
    }

    pub fn undo_occurrence_action(&self, action_id: u64) -> Result<OccurrenceAction> {
        let mut store = self.store.write();
        let removed = store.actions.undo(action_id)?;
        self.persist(&store)?;
        Ok(removed)
    }

    /// Records a subtask toggle and reports whether every top-level subtask
    /// bound to that occurrence is now complete. Acting on the signal (for
    /// instance completing the parent occurrence) is left to the caller.
    pub fn record_subtask_completion(
        &self,
        subtask_id: &str,
        occurrence_at: NaiveDateTime,
        completed: bool,
    ) -> Result<bool> {
        let mut store = self.store.write();
        let item_id = store
            .subtasks
            .get(subtask_id)
            .map(|subtask| subtask.item_id.clone())
            .ok_or_else(|| anyhow!("subtask `{subtask_id}` not loaded"))?;
        store
            .completions
            .record(subtask_id, occurrence_at, completed, now());
        self.persist(&store)?;

        let siblings: Vec<Subtask> = store
            .subtasks
            .values()
            .filter(|subtask| subtask.item_id == item_id)
            .cloned()
            .collect();
        Ok(subtask::all_top_level_done(
            &siblings,
            occurrence_at,
            &store.completions,
        ))
    }

    fn record_action(&self, action: NewAction) -> Result<u64> {
        let mut store = self.store.write();
        if !store.items.contains_key(&action.item_id) {
            return Err(anyhow!("item `{}` not loaded", action.item_id));
        }
        let id = store.actions.record(action)?;
        self.persist(&store)?;
        Ok(id)
    }

    // ---- resolution ----------------------------------------------------

    pub fn resolve_window(
        &self,
        item_id: &str,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
    ) -> Result<Vec<Occurrence>> {
        let item = self.get_item(item_id)?;
        let store = self.store.read();
        Ok(resolver::resolve(&item, window_start, window_end, &store.actions))
    }

    pub fn window_snapshot(
        &self,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
    ) -> Result<PlannerSnapshot> {
        let store = self.store.read();
        let mut occurrences: Vec<Occurrence> = Vec::new();
        for item in store.items.values() {
            if item.is_archived() {
                continue;
            }
            occurrences.extend(resolver::resolve(
                item,
                window_start,
                window_end,
                &store.actions,
            ));
        }
        occurrences.sort();

        let recurring_subtasks: Vec<Subtask> = store
            .subtasks
            .values()
            .filter(|subtask| {
                store
                    .items
                    .get(&subtask.item_id)
                    .map(|item| item.is_recurring() && !item.is_archived())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let mut carried_forward: Vec<Subtask> = subtask::carried_forward(&recurring_subtasks)
            .into_iter()
            .cloned()
            .collect();
        carried_forward.sort_by(|a, b| subtask::display_order(a, b));

        Ok(PlannerSnapshot {
            occurrences,
            carried_forward,
        })
    }

    pub fn watch(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let mut watcher = notify::recommended_watcher(|res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                tracing::debug!(?event, "store change detected");
            }
        })?;
        for root in &self.roots {
            let mode = if Self::root_is_file(root) {
                RecursiveMode::NonRecursive
            } else {
                RecursiveMode::Recursive
            };
            watcher.watch(root, mode)?;
        }
        self.watcher = Some(watcher);
        Ok(())
    }
}

impl PlannerService {
    fn ingest_root(store: &mut Store, path: &Path) -> Result<()> {
        if path.is_file() || Self::root_is_file(path) {
            if Self::is_snapshot_file(path) {
                store.absorb(Self::load_snapshot(path)?);
            }
            return Ok(());
        }

        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                let entry_path = entry.path();
                if entry.file_type().is_file() && Self::is_snapshot_file(entry_path) {
                    store.absorb(Self::load_snapshot(entry_path)?);
                }
            }
        }
        Ok(())
    }

    fn load_snapshot(path: &Path) -> Result<StoreSnapshot> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading store snapshot `{}`", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing store snapshot `{}`", path.display()))
    }

    fn persist(&self, store: &Store) -> Result<()> {
        let Some(path) = self.primary_path() else {
            // In-memory only: no root configured.
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating store directory `{}`", parent.display()))?;
            }
        }
        let payload = serde_json::to_string_pretty(&store.snapshot())?;
        fs::write(&path, payload)
            .with_context(|| format!("writing store snapshot `{}`", path.display()))
    }

    fn primary_path(&self) -> Option<PathBuf> {
        let root = self.roots.first()?;
        if Self::root_is_file(root) {
            Some(root.clone())
        } else {
            Some(root.join("hearth.json"))
        }
    }

    fn root_is_file(path: &Path) -> bool {
        Self::extension_is_json(path) || path.is_file()
    }

    fn is_snapshot_file(path: &Path) -> bool {
        Self::extension_is_json(path)
    }

    fn extension_is_json(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Where a postponed occurrence lands. `Tomorrow` keeps the wall-clock
/// time; `NextOccurrence` walks the base series forward from the original
/// slot; `Custom` uses the caller's target verbatim.
pub fn postpone_target(
    item: &Item,
    occurrence_at: NaiveDateTime,
    kind: PostponeKind,
    custom_target: Option<NaiveDateTime>,
) -> Result<NaiveDateTime> {
    match kind {
        PostponeKind::Tomorrow => occurrence_at
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("postpone target out of range")),
        PostponeKind::Custom => {
            custom_target.ok_or_else(|| anyhow!("custom postponement needs a target date"))
        }
        PostponeKind::NextOccurrence => {
            let rule = item
                .recurrence
                .as_ref()
                .ok_or_else(|| anyhow!("item `{}` has no recurrence to postpone into", item.id))?;
            let horizon = occurrence_at
                .checked_add_days(Days::new(4 * 366))
                .ok_or_else(|| anyhow!("postpone horizon out of range"))?;
            let upcoming = recurrence::expand(rule, occurrence_at, horizon)
                .with_context(|| format!("expanding rule for item `{}`", item.id))?;
            upcoming
                .into_iter()
                .find(|candidate| *candidate > occurrence_at)
                .ok_or_else(|| anyhow!("item `{}` has no later occurrence", item.id))
        }
    }
}

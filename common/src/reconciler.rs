// Snapshot diffing and incremental trigger persistence

use crate::errors::PersistenceError;
use crate::models::{ScheduleEntry, ScheduleSnapshot};
use crate::persistence::TriggerStore;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, instrument, warn};

/// Project ids that differ between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub changed: BTreeSet<String>,
}

impl ScheduleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
}

fn serialized_set(entries: &[ScheduleEntry]) -> HashSet<String> {
    entries.iter().map(ScheduleEntry::serialized).collect()
}

fn entries_differ(previous: &[ScheduleEntry], current: &[ScheduleEntry]) -> bool {
    previous.len() != current.len() || serialized_set(previous) != serialized_set(current)
}

pub fn diff(previous: &ScheduleSnapshot, current: &ScheduleSnapshot) -> ScheduleDiff {
    let mut result = ScheduleDiff::default();

    for (project_id, entries) in current.iter() {
        match previous.get(project_id) {
            None => {
                result.added.insert(project_id.to_string());
            }
            Some(old) if entries_differ(old, entries) => {
                result.changed.insert(project_id.to_string());
            }
            Some(_) => {}
        }
    }

    for project_id in previous.project_ids() {
        if !current.contains(project_id) {
            result.removed.insert(project_id.to_string());
        }
    }

    result
}

/// Owns the authoritative schedule and applies deltas through a store
pub struct ScheduleReconciler<S: TriggerStore> {
    store: S,
    current: ScheduleSnapshot,
}

impl<S: TriggerStore> ScheduleReconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            current: ScheduleSnapshot::empty(),
        }
    }

    pub fn current(&self) -> &ScheduleSnapshot {
        &self.current
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply the delta between the held snapshot and `next`.
    ///
    /// The held snapshot follows the store project by project. When a store
    /// call fails, already-issued writes and removals stay recorded and the
    /// failing project is left absent, so the next pass writes it again.
    #[instrument(skip_all, fields(projects = next.len()))]
    pub async fn reconcile(
        &mut self,
        next: ScheduleSnapshot,
    ) -> Result<ReconcileSummary, PersistenceError> {
        let delta = diff(&self.current, &next);
        let summary = ReconcileSummary {
            added: delta.added.len(),
            removed: delta.removed.len(),
            changed: delta.changed.len(),
            unchanged: next.len() - delta.added.len() - delta.changed.len(),
        };

        if delta.is_empty() {
            debug!("Schedule unchanged");
            self.current = next;
            return Ok(summary);
        }

        let mut applied = self.current.clone();
        let result = self.apply(&delta, &next, &mut applied).await;
        self.current = applied;
        result.map(|()| summary)
    }

    async fn apply(
        &self,
        delta: &ScheduleDiff,
        next: &ScheduleSnapshot,
        applied: &mut ScheduleSnapshot,
    ) -> Result<(), PersistenceError> {
        for project_id in &delta.removed {
            let removed = self.store.remove_project(project_id).await?;
            applied.remove(project_id);
            info!(project_id = %project_id, removed, "Removed project schedule");
        }

        for project_id in &delta.changed {
            let entries = next.get(project_id).unwrap_or_default();
            self.store.remove_project(project_id).await?;
            applied.remove(project_id);
            self.write(project_id, entries).await?;
            applied.insert(project_id, entries.to_vec());
            info!(project_id = %project_id, entries = entries.len(), "Updated project schedule");
        }

        for project_id in &delta.added {
            let entries = next.get(project_id).unwrap_or_default();
            if entries.is_empty() {
                warn!(project_id = %project_id, "Added project has no entries");
                continue;
            }
            self.write(project_id, entries).await?;
            applied.insert(project_id, entries.to_vec());
            info!(project_id = %project_id, entries = entries.len(), "Added project schedule");
        }

        Ok(())
    }

    /// Write a project's triggers. On failure its partial files are removed
    /// so the project is absent from both the store and the held snapshot.
    async fn write(
        &self,
        project_id: &str,
        entries: &[ScheduleEntry],
    ) -> Result<(), PersistenceError> {
        let Err(e) = self.store.write_project(project_id, entries).await else {
            return Ok(());
        };
        if let Err(cleanup) = self.store.remove_project(project_id).await {
            warn!(project_id = %project_id, error = %cleanup, "Failed to clean up partial triggers");
        }
        Err(e)
    }
}

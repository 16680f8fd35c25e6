//! Per-type synchronization backlog.
//!
//! The backlog is an arena of per-entity-type state machines indexed by
//! [`EntityTypeId`]: `Waiting` (an unmet dependency exists) → `InProgress`
//! (work items created, not all complete) → `Done` (terminal). Transition
//! methods enforce that order; the scheduler's control loop is the only
//! mutator.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bail;
use crate::catalog::EntityTypeId;
use crate::error::{ErrorKind, SyncResult};

/// Identifier of one work item within a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorkItemId(pub u64);

/// Coarse status of a backlog entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BacklogStatus {
    Waiting,
    InProgress,
    Done,
}

#[derive(Debug)]
enum EntryState {
    Waiting {
        blockers: HashSet<EntityTypeId>,
    },
    InProgress {
        expected_total: u64,
        completed: u64,
        outstanding: HashSet<WorkItemId>,
        started_at: Instant,
    },
    Done {
        completed: u64,
        elapsed: Duration,
    },
}

/// State machine of one entity type's synchronization.
#[derive(Debug)]
pub struct BacklogEntry {
    entity_type: EntityTypeId,
    name: String,
    state: EntryState,
}

impl BacklogEntry {
    fn new(entity_type: EntityTypeId, name: String, blockers: HashSet<EntityTypeId>) -> Self {
        Self {
            entity_type,
            name,
            state: EntryState::Waiting { blockers },
        }
    }

    /// Current status of the entry.
    pub fn status(&self) -> BacklogStatus {
        match self.state {
            EntryState::Waiting { .. } => BacklogStatus::Waiting,
            EntryState::InProgress { .. } => BacklogStatus::InProgress,
            EntryState::Done { .. } => BacklogStatus::Done,
        }
    }

    /// `true` for a waiting entry whose blockers are all met.
    pub fn is_ready(&self) -> bool {
        matches!(&self.state, EntryState::Waiting { blockers } if blockers.is_empty())
    }

    /// `true` for an in-progress entry with no outstanding work items.
    pub fn is_exhausted(&self) -> bool {
        matches!(&self.state, EntryState::InProgress { outstanding, .. } if outstanding.is_empty())
    }

    /// Records fetched so far.
    pub fn completed(&self) -> u64 {
        match &self.state {
            EntryState::Waiting { .. } => 0,
            EntryState::InProgress { completed, .. } => *completed,
            EntryState::Done { completed, .. } => *completed,
        }
    }

    /// Expected total as reported when the entry entered `InProgress`.
    pub fn expected_total(&self) -> Option<u64> {
        match &self.state {
            EntryState::InProgress { expected_total, .. } => Some(*expected_total),
            _ => None,
        }
    }

    fn unblock(&mut self, done: EntityTypeId) {
        if let EntryState::Waiting { blockers } = &mut self.state {
            blockers.remove(&done);
        }
    }

    fn begin(
        &mut self,
        expected_total: u64,
        items: impl IntoIterator<Item = WorkItemId>,
    ) -> SyncResult<()> {
        if !self.is_ready() {
            bail!(
                ErrorKind::InvalidState,
                "Entry cannot enter in-progress",
                format!(
                    "`{}` is {:?}, only a waiting entry with met blockers can begin",
                    self.name,
                    self.status()
                )
            );
        }

        self.state = EntryState::InProgress {
            expected_total,
            completed: 0,
            outstanding: items.into_iter().collect(),
            started_at: Instant::now(),
        };

        Ok(())
    }

    fn complete_item(&mut self, item: WorkItemId, records: u64) -> SyncResult<()> {
        let EntryState::InProgress {
            completed,
            outstanding,
            ..
        } = &mut self.state
        else {
            bail!(
                ErrorKind::InvalidState,
                "Work item completed for an entry that is not in progress",
                format!("`{}` is {:?}", self.name, self.status())
            );
        };

        if !outstanding.remove(&item) {
            bail!(
                ErrorKind::InvalidState,
                "Unknown work item completed",
                format!("`{}` has no outstanding item {item:?}", self.name)
            );
        }
        *completed += records;

        Ok(())
    }

    fn finish(&mut self) -> SyncResult<()> {
        let EntryState::InProgress {
            expected_total,
            completed,
            outstanding,
            started_at,
        } = &self.state
        else {
            bail!(
                ErrorKind::InvalidState,
                "Entry finished twice or before starting",
                format!("`{}` is {:?}", self.name, self.status())
            );
        };

        if !outstanding.is_empty() {
            bail!(
                ErrorKind::InvalidState,
                "Entry finished with outstanding work items",
                format!("`{}` still has {} item(s)", self.name, outstanding.len())
            );
        }

        // The remote is not transactionally consistent across paginated
        // calls; a count mismatch is reported, never fatal.
        if *completed != *expected_total {
            warn!(
                entity_type = %self.name,
                expected = expected_total,
                completed = completed,
                "mismatch of expected and actual number of records"
            );
        }

        let completed = *completed;
        let elapsed = started_at.elapsed();

        info!(
            entity_type = %self.name,
            records = completed,
            elapsed_ms = elapsed.as_millis() as u64,
            "entity type completed"
        );

        self.state = EntryState::Done { completed, elapsed };

        Ok(())
    }
}

/// Arena of backlog entries for one run.
#[derive(Debug)]
pub struct Backlog {
    entries: Vec<Option<BacklogEntry>>,
}

impl Backlog {
    /// Creates an empty backlog sized for the catalog.
    pub fn new(catalog_len: usize) -> Self {
        Self {
            entries: (0..catalog_len).map(|_| None).collect(),
        }
    }

    /// Adds a waiting entry for an entity type.
    pub fn insert_waiting(
        &mut self,
        entity_type: EntityTypeId,
        name: impl Into<String>,
        blockers: HashSet<EntityTypeId>,
    ) {
        self.entries[entity_type.index()] =
            Some(BacklogEntry::new(entity_type, name.into(), blockers));
    }

    /// Returns the entry for an entity type, if scheduled.
    pub fn entry(&self, entity_type: EntityTypeId) -> Option<&BacklogEntry> {
        self.entries[entity_type.index()].as_ref()
    }

    /// Entity types that are waiting with all blockers met.
    pub fn ready_types(&self) -> Vec<EntityTypeId> {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.is_ready())
            .map(|entry| entry.entity_type)
            .collect()
    }

    /// Moves an entry into `InProgress` with its expected total and items.
    pub fn begin(
        &mut self,
        entity_type: EntityTypeId,
        expected_total: u64,
        items: impl IntoIterator<Item = WorkItemId>,
    ) -> SyncResult<()> {
        self.entry_mut(entity_type)?.begin(expected_total, items)
    }

    /// Records a completed work item; returns `true` when the entry has no
    /// outstanding items left.
    pub fn complete_item(
        &mut self,
        entity_type: EntityTypeId,
        item: WorkItemId,
        records: u64,
    ) -> SyncResult<bool> {
        let entry = self.entry_mut(entity_type)?;
        entry.complete_item(item, records)?;
        Ok(entry.is_exhausted())
    }

    /// Retires an exhausted entry into `Done` and returns the entity types
    /// that became ready because this one was their last unmet blocker.
    pub fn finish(&mut self, entity_type: EntityTypeId) -> SyncResult<Vec<EntityTypeId>> {
        self.entry_mut(entity_type)?.finish()?;

        let mut newly_ready = Vec::new();
        for entry in self.entries.iter_mut().flatten() {
            if entry.status() == BacklogStatus::Waiting {
                let was_ready = entry.is_ready();
                entry.unblock(entity_type);
                if !was_ready && entry.is_ready() {
                    newly_ready.push(entry.entity_type);
                }
            }
        }

        Ok(newly_ready)
    }

    /// Counts of (waiting, in progress, done) entries.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut waiting = 0;
        let mut in_progress = 0;
        let mut done = 0;

        for entry in self.entries.iter().flatten() {
            match entry.status() {
                BacklogStatus::Waiting => waiting += 1,
                BacklogStatus::InProgress => in_progress += 1,
                BacklogStatus::Done => done += 1,
            }
        }

        (waiting, in_progress, done)
    }

    /// `true` once nothing is waiting or in progress.
    pub fn is_complete(&self) -> bool {
        let (waiting, in_progress, _) = self.counts();
        waiting == 0 && in_progress == 0
    }

    /// Names of entries currently in a given status.
    pub fn names_with_status(&self, status: BacklogStatus) -> Vec<&str> {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.status() == status)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    fn entry_mut(&mut self, entity_type: EntityTypeId) -> SyncResult<&mut BacklogEntry> {
        match self.entries[entity_type.index()].as_mut() {
            Some(entry) => Ok(entry),
            None => Err(crate::sync_error!(
                ErrorKind::InvalidState,
                "Entity type is not part of the backlog",
                format!("no entry for entity type {entity_type}")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> EntityTypeId {
        EntityTypeId(raw)
    }

    fn backlog_of_two() -> Backlog {
        let mut backlog = Backlog::new(2);
        backlog.insert_waiting(id(0), "Party", HashSet::new());
        backlog.insert_waiting(id(1), "Member", [id(0)].into_iter().collect());
        backlog
    }

    #[test]
    fn blocked_entry_is_not_ready() {
        let backlog = backlog_of_two();
        assert_eq!(backlog.ready_types(), vec![id(0)]);
    }

    #[test]
    fn begin_requires_readiness() {
        let mut backlog = backlog_of_two();

        let err = backlog.begin(id(1), 3, [WorkItemId(1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        backlog.begin(id(0), 2, [WorkItemId(0)]).unwrap();
        assert_eq!(
            backlog.entry(id(0)).unwrap().status(),
            BacklogStatus::InProgress
        );
    }

    #[test]
    fn completion_unblocks_dependents() {
        let mut backlog = backlog_of_two();

        backlog.begin(id(0), 2, [WorkItemId(0)]).unwrap();
        assert!(backlog.complete_item(id(0), WorkItemId(0), 2).unwrap());

        let newly_ready = backlog.finish(id(0)).unwrap();
        assert_eq!(newly_ready, vec![id(1)]);
        assert_eq!(backlog.entry(id(0)).unwrap().status(), BacklogStatus::Done);
        assert!(backlog.entry(id(1)).unwrap().is_ready());
        assert!(!backlog.is_complete());
    }

    #[test]
    fn entry_finishes_exactly_once() {
        let mut backlog = backlog_of_two();

        backlog.begin(id(0), 1, [WorkItemId(0)]).unwrap();
        backlog.complete_item(id(0), WorkItemId(0), 1).unwrap();
        backlog.finish(id(0)).unwrap();

        let err = backlog.finish(id(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn unknown_item_completion_is_rejected() {
        let mut backlog = backlog_of_two();

        backlog.begin(id(0), 1, [WorkItemId(0)]).unwrap();
        let err = backlog
            .complete_item(id(0), WorkItemId(99), 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn counts_track_states() {
        let mut backlog = backlog_of_two();
        assert_eq!(backlog.counts(), (2, 0, 0));

        backlog.begin(id(0), 1, [WorkItemId(0)]).unwrap();
        assert_eq!(backlog.counts(), (1, 1, 0));

        backlog.complete_item(id(0), WorkItemId(0), 1).unwrap();
        backlog.finish(id(0)).unwrap();
        assert_eq!(backlog.counts(), (1, 0, 1));
    }
}

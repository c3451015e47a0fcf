//! Ledger of locally-initiated mutations that the authority has not yet
//! confirmed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordId};

/// Kind of a submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum MutationKind {
    /// A new record was created.
    Create,
    /// An existing record's content was changed.
    Update,
    /// An existing record was deleted.
    Delete,
}

/// Snapshot needed to undo an optimistic effect exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// Remove the tentative record that the optimistic create inserted.
    RemoveCreated,
    /// Restore the record as it was before the optimistic edit or delete.
    RestoreRecord(Record),
}

/// A locally-initiated mutation awaiting its result from the authority.
///
/// Keyed by the tentative id for creates, by the target id for edits and
/// deletes. Created at submit time, removed on confirm or rollback.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Tentative id (create) or target id (update/delete).
    pub target: RecordId,
    /// What was submitted.
    pub kind: MutationKind,
    /// Submission timestamp, micros since the Unix epoch.
    pub submitted_at: u64,
    /// How to undo the optimistic effect.
    pub rollback: Rollback,
}

/// Status of a pending mutation, suitable for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatus {
    /// Tentative id (create) or target id (update/delete).
    pub target: RecordId,
    /// What was submitted.
    pub kind: MutationKind,
    /// Submission timestamp, micros since the Unix epoch.
    pub submitted_at: u64,
}

/// Tracks pending mutations, at most one in flight per target id.
#[derive(Debug, Default)]
pub struct PendingLedger {
    by_target: HashMap<RecordId, PendingMutation>,
}

impl PendingLedger {
    /// Registers a pending mutation.
    ///
    /// Returns false (and leaves the ledger unchanged) if a mutation for the
    /// same target is already in flight.
    pub fn register(&mut self, mutation: PendingMutation) -> bool {
        if self.by_target.contains_key(&mutation.target) {
            return false;
        }
        self.by_target.insert(mutation.target, mutation);
        true
    }

    /// Removes and returns the pending mutation for `target`, on confirm or
    /// rollback.
    pub fn resolve(&mut self, target: &RecordId) -> Option<PendingMutation> {
        self.by_target.remove(target)
    }

    /// Whether a mutation for `target` is in flight.
    pub fn contains(&self, target: &RecordId) -> bool {
        self.by_target.contains_key(target)
    }

    /// Statuses of all pending mutations, oldest first.
    pub fn statuses(&self) -> Vec<PendingStatus> {
        let mut statuses: Vec<PendingStatus> = self
            .by_target
            .values()
            .map(|m| PendingStatus {
                target: m.target,
                kind: m.kind,
                submitted_at: m.submitted_at,
            })
            .collect();
        statuses.sort_by_key(|s| s.submitted_at);
        statuses
    }

    /// Number of pending mutations.
    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    /// True if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }
}

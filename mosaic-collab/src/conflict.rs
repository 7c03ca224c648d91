//! Conflict vocabulary and client-side resolution bookkeeping.
//!
//! Detection and merging happen on the server. This module models what
//! the client needs: the conflict record the server announces, the menu
//! of strategies a UI can offer for it, and a tracker for resolutions
//! that have been requested but not yet acknowledged.
//!
//! Reference: Kleppmann, "Designing Data-Intensive Applications", ch. 5
//! (conflict resolution strategies for multi-leader replication).

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{EntityId, Operation};

/// What kind of concurrent edit collided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Two writers set the same property to different values.
    Property,
    /// One side deleted an entity the other side modified.
    DeleteModify,
    /// Competing layer reorderings.
    Layer,
    /// Competing geometric transforms on the same entity.
    Transform,
    /// A constraint can no longer be satisfied after both edits.
    Constraint,
    /// Parent/child structure diverged.
    Structural,
}

/// How disruptive the conflict is to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// How to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    FirstWriteWins,
    /// A human picks the surviving operations.
    Manual,
    /// Combine both sides (only meaningful for composable edits).
    Merge,
    /// The higher-priority participant wins.
    UserPriority,
}

impl ConflictKind {
    /// Strategies a UI should offer for this kind of conflict.
    pub fn available_strategies(&self) -> Vec<ResolutionStrategy> {
        let mut strategies = vec![
            ResolutionStrategy::LastWriteWins,
            ResolutionStrategy::FirstWriteWins,
            ResolutionStrategy::Manual,
        ];
        match self {
            ConflictKind::Transform => strategies.push(ResolutionStrategy::Merge),
            ConflictKind::Property => strategies.push(ResolutionStrategy::UserPriority),
            _ => {}
        }
        strategies
    }
}

/// A server-detected conflict awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: Severity,
    /// Entities the conflicting operations touch.
    pub entity_ids: Vec<EntityId>,
    pub description: String,
    /// The operations that collided, in server arrival order.
    pub operations: Vec<Operation>,
    pub auto_resolvable: bool,
}

impl Conflict {
    pub fn new(
        kind: ConflictKind,
        severity: Severity,
        entity_ids: Vec<EntityId>,
        description: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            entity_ids,
            description: description.into(),
            operations,
            auto_resolvable: severity < Severity::High,
        }
    }

    /// Default strategy for one-click resolution.
    ///
    /// High-severity conflicts always go to a human; everything else
    /// defaults to last-write-wins, which matches what the server would
    /// have done had the edits arrived seconds apart.
    pub fn recommended_strategy(&self) -> ResolutionStrategy {
        match self.severity {
            Severity::High => ResolutionStrategy::Manual,
            Severity::Low | Severity::Medium => ResolutionStrategy::LastWriteWins,
        }
    }
}

/// A resolution sent to the server and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResolution {
    pub conflict_id: Uuid,
    pub strategy: ResolutionStrategy,
    pub requested_at: Instant,
}

/// Tracks in-flight resolutions so the UI can show spinners and so a
/// second click on "resolve" becomes a no-op instead of a duplicate
/// envelope. The conflict records themselves stay in the store.
#[derive(Debug, Default)]
pub struct ResolutionTracker {
    pending: Vec<PendingResolution>,
}

impl ResolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing resolution. Returns `false` if one is already
    /// in flight for this conflict.
    pub fn record(&mut self, conflict_id: Uuid, strategy: ResolutionStrategy) -> bool {
        if self.contains(conflict_id) {
            return false;
        }
        self.pending.push(PendingResolution {
            conflict_id,
            strategy,
            requested_at: Instant::now(),
        });
        true
    }

    /// Server acknowledged the resolution. Returns the entry, if any.
    pub fn complete(&mut self, conflict_id: Uuid) -> Option<PendingResolution> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.conflict_id == conflict_id)?;
        Some(self.pending.remove(idx))
    }

    /// Drop an entry without acknowledgement (disconnect, conflict
    /// withdrawn by the server).
    pub fn cancel(&mut self, conflict_id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.conflict_id != conflict_id);
        self.pending.len() != before
    }

    pub fn contains(&self, conflict_id: Uuid) -> bool {
        self.pending.iter().any(|p| p.conflict_id == conflict_id)
    }

    pub fn pending(&self) -> &[PendingResolution] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

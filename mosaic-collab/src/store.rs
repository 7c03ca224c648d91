//! The collaboration store: one owned state value, mutated only by a
//! closed set of actions.
//!
//! Every inbound envelope maps to exactly one [`Action`]; local calls
//! (connect, cursor moves) map to actions too. The reducer is pure and
//! synchronous. It performs no I/O, so replies and reconnects are the
//! dispatcher's business, and a test can drive the whole state machine
//! with plain function calls.
//!
//! Reference: Kleppmann, "Designing Data-Intensive Applications", ch. 5
//! (single-writer state replication).

use uuid::Uuid;

use crate::conflict::Conflict;
use crate::protocol::{CursorPosition, EntityId, SyncState, User, UserPresence};

impl SyncState {
    /// Whether `self → next` is a legal sync-state transition.
    ///
    /// Error and close always pass through `Offline` before the next
    /// `Connecting` attempt. Same-state transitions are legal no-ops so
    /// repeated server announcements never log noise.
    pub fn can_transition(self, next: SyncState) -> bool {
        use SyncState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Offline, Connecting)
                | (Connecting, Synchronized)
                | (Connecting, Error)
                | (Connecting, Offline)
                | (Synchronized, Syncing)
                | (Synchronized, Conflicted)
                | (Synchronized, Error)
                | (Synchronized, Offline)
                | (Syncing, Synchronized)
                | (Syncing, Conflicted)
                | (Syncing, Error)
                | (Syncing, Offline)
                | (Conflicted, Synchronized)
                | (Conflicted, Syncing)
                | (Conflicted, Error)
                | (Conflicted, Offline)
                | (Error, Offline)
        )
    }
}

/// The single source of truth for one collaboration session.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CollaborationState {
    pub session_id: Option<Uuid>,
    pub document_id: Option<Uuid>,
    pub current_user: Option<User>,
    /// Roster of all participants including the local user. At most one
    /// entry per `user_id`.
    pub users: Vec<UserPresence>,
    pub sync_state: SyncState,
    pub version: u64,
    pub conflicts: Vec<Conflict>,
    pub is_connected: bool,
}

/// The closed mutation vocabulary.
#[derive(Debug, Clone)]
pub enum Action {
    SetSession {
        session_id: Uuid,
        document_id: Uuid,
    },
    /// Set the local user and place them in the roster.
    SetUser {
        user: User,
        timestamp: u64,
    },
    AddUser(UserPresence),
    RemoveUser(Uuid),
    /// Full ephemeral-state snapshot for one participant.
    UpdateUserPresence {
        user_id: Uuid,
        cursor: Option<CursorPosition>,
        selection: Vec<EntityId>,
        timestamp: u64,
    },
    /// Replace the whole roster.
    UpdateUsers(Vec<UserPresence>),
    SetSyncState(SyncState),
    SetVersion(u64),
    AddConflict(Conflict),
    RemoveConflict(Uuid),
    UpdateConflicts(Vec<Conflict>),
    SetConnected(bool),
    Reset,
}

impl CollaborationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one action. Illegal sync-state transitions, stale presence
    /// snapshots and presence for unknown users are ignored with a debug
    /// log line; nothing here returns an error or performs I/O.
    pub fn apply(&mut self, action: Action) {
        match action {
            Action::SetSession {
                session_id,
                document_id,
            } => {
                self.session_id = Some(session_id);
                self.document_id = Some(document_id);
            }

            Action::SetUser { user, timestamp } => {
                self.upsert_presence(UserPresence::new(user.clone(), timestamp));
                self.current_user = Some(user);
            }

            Action::AddUser(presence) => {
                self.upsert_presence(presence);
            }

            Action::RemoveUser(user_id) => {
                self.users.retain(|p| p.user_id != user_id);
            }

            Action::UpdateUserPresence {
                user_id,
                cursor,
                selection,
                timestamp,
            } => match self.users.iter_mut().find(|p| p.user_id == user_id) {
                Some(presence) => {
                    if timestamp < presence.last_active {
                        log::debug!(
                            "Stale presence for {} ({} < {}), ignoring",
                            user_id,
                            timestamp,
                            presence.last_active
                        );
                        return;
                    }
                    presence.cursor = cursor;
                    presence.selection = selection;
                    presence.last_active = timestamp;
                    presence.is_active = true;
                }
                None => {
                    log::debug!("Presence update for unknown user {}, ignoring", user_id);
                }
            },

            Action::UpdateUsers(users) => {
                let mut roster: Vec<UserPresence> = Vec::with_capacity(users.len());
                for presence in users {
                    match roster.iter_mut().find(|p| p.user_id == presence.user_id) {
                        Some(existing) => *existing = presence,
                        None => roster.push(presence),
                    }
                }
                self.users = roster;
            }

            Action::SetSyncState(next) => {
                self.transition(next);
            }

            Action::SetVersion(version) => {
                self.version = version;
            }

            Action::AddConflict(conflict) => {
                if self.conflicts.iter().any(|c| c.id == conflict.id) {
                    return;
                }
                self.conflicts.push(conflict);
                self.transition(SyncState::Conflicted);
            }

            Action::RemoveConflict(conflict_id) => {
                self.conflicts.retain(|c| c.id != conflict_id);
                if self.conflicts.is_empty() && self.sync_state == SyncState::Conflicted {
                    self.transition(SyncState::Synchronized);
                }
            }

            Action::UpdateConflicts(conflicts) => {
                self.conflicts = conflicts;
                if self.conflicts.is_empty() {
                    if self.sync_state == SyncState::Conflicted {
                        self.transition(SyncState::Synchronized);
                    }
                } else {
                    self.transition(SyncState::Conflicted);
                }
            }

            Action::SetConnected(connected) => {
                self.is_connected = connected;
            }

            Action::Reset => {
                *self = Self::default();
            }
        }
    }

    fn upsert_presence(&mut self, presence: UserPresence) {
        match self
            .users
            .iter_mut()
            .find(|p| p.user_id == presence.user_id)
        {
            Some(existing) => *existing = presence,
            None => self.users.push(presence),
        }
    }

    fn transition(&mut self, next: SyncState) {
        if self.sync_state.can_transition(next) {
            self.sync_state = next;
        } else {
            log::debug!(
                "Ignoring illegal sync transition {:?} -> {:?}",
                self.sync_state,
                next
            );
        }
    }

    /// Presence entry for the local user, if `SetUser` has fired.
    pub fn local_presence(&self) -> Option<&UserPresence> {
        let user = self.current_user.as_ref()?;
        self.users.iter().find(|p| p.user_id == user.id)
    }

    /// Remote participants only.
    pub fn remote_users(&self) -> impl Iterator<Item = &UserPresence> {
        let local = self.current_user.as_ref().map(|u| u.id);
        self.users.iter().filter(move |p| Some(p.user_id) != local)
    }
}

//! JSON envelope protocol for client/server collaboration traffic.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! {"type": "cursor_update", "payload": {"user_id": "…", "cursor": {…}, "timestamp": 1712…}}
//! ```
//! The `type` tag selects the variant and `payload` carries its fields.
//! Unknown inbound types decode to [`Inbound::Unknown`] so a newer server
//! can never break an older client; the dispatcher drops them with a log
//! line instead of failing the connection.
//!
//! Performance target: encode < 2µs for a typical cursor envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::{Conflict, ResolutionStrategy};
use crate::version::{Branch, DocumentVersion, MergeStrategy};

/// Identifier of a document entity (layer, node, shape…).
pub type EntityId = Uuid;

/// Opaque document operation.
///
/// The merge engine lives on the server; this core forwards operations
/// verbatim and never inspects their structure.
pub type Operation = serde_json::Value;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Data model
// ───────────────────────────────────────────────────────────────────

/// Participant identity with display metadata.
///
/// Immutable once the server has assigned it for a session; `color` in
/// particular is a server decision so every client renders the same hue
/// for the same person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
    /// CSS hex color for cursor/selection rendering.
    pub color: String,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            avatar: None,
            color: "#4285f5".to_string(),
        }
    }

    /// Create with explicit id (for testing).
    pub fn with_id(id: Uuid, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            avatar: None,
            color: "#4285f5".to_string(),
        }
    }
}

/// Cursor location in document coordinates.
///
/// Ephemeral and last-write-wins per user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub viewport_id: Option<Uuid>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            viewport_id: None,
        }
    }
}

/// Live cursor/selection/activity state of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub user: User,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Vec<EntityId>,
    /// Milliseconds since the Unix epoch of the last presence traffic.
    pub last_active: u64,
    pub is_active: bool,
}

impl UserPresence {
    pub fn new(user: User, last_active: u64) -> Self {
        Self {
            user_id: user.id,
            user,
            cursor: None,
            selection: Vec::new(),
            last_active,
            is_active: true,
        }
    }
}

/// The session's relationship to the server.
///
/// Legal transitions are enforced by the store reducer, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Offline,
    Connecting,
    Synchronized,
    Syncing,
    Conflicted,
    Error,
}

// ───────────────────────────────────────────────────────────────────
// Envelopes
// ───────────────────────────────────────────────────────────────────

/// Client → server envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    JoinSession {
        document_id: Uuid,
        user: User,
    },
    SyncRequest {
        document_id: Uuid,
        last_known_version: u64,
    },
    Heartbeat {
        user_id: Uuid,
        timestamp: u64,
    },
    /// `cursor: None` means the local cursor left the document.
    CursorUpdate {
        user_id: Uuid,
        cursor: Option<CursorPosition>,
        timestamp: u64,
    },
    SelectionUpdate {
        user_id: Uuid,
        selection: Vec<EntityId>,
    },
    ApplyOperation {
        user_id: Uuid,
        operation: Operation,
    },
    ResolveConflict {
        conflict_id: Uuid,
        strategy: ResolutionStrategy,
        user_id: Uuid,
    },
    CreateBranch {
        request_id: Uuid,
        name: String,
    },
    SwitchBranch {
        request_id: Uuid,
        name: String,
    },
    MergeBranch {
        request_id: Uuid,
        source: String,
        strategy: MergeStrategy,
    },
    CreateTag {
        request_id: Uuid,
        name: String,
        version_id: Option<Uuid>,
    },
    GetVersionHistory {
        request_id: Uuid,
    },
}

impl Outbound {
    /// Create a heartbeat stamped with the current wall clock.
    pub fn heartbeat(user_id: Uuid) -> Self {
        Self::Heartbeat {
            user_id,
            timestamp: now_ms(),
        }
    }

    /// Create a cursor update stamped with the current wall clock.
    pub fn cursor_update(user_id: Uuid, cursor: Option<CursorPosition>) -> Self {
        Self::CursorUpdate {
            user_id,
            cursor,
            timestamp: now_ms(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a JSON text frame (the server side of the wire).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Server → client envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Inbound {
    SessionJoined {
        session_id: Uuid,
        document_id: Uuid,
    },
    UserJoined {
        presence: UserPresence,
    },
    UserLeft {
        user_id: Uuid,
    },
    /// Full ephemeral-state snapshot for one participant. `cursor: null`
    /// means no cursor; `selection` is always the complete current set.
    PresenceUpdate {
        user_id: Uuid,
        cursor: Option<CursorPosition>,
        #[serde(default)]
        selection: Vec<EntityId>,
        timestamp: u64,
    },
    UsersList {
        users: Vec<UserPresence>,
    },
    SyncState {
        state: SyncState,
    },
    VersionUpdate {
        version: u64,
    },
    OperationApplied {
        version: u64,
        operation: Operation,
    },
    FullSync {
        version: u64,
        document: Operation,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictResolved {
        conflict_id: Uuid,
    },
    BranchCreated {
        request_id: Uuid,
        branch: Branch,
    },
    BranchSwitched {
        request_id: Uuid,
        branch: Branch,
        version: u64,
    },
    BranchMerged {
        request_id: Uuid,
        version: DocumentVersion,
    },
    TagCreated {
        request_id: Uuid,
        version_id: Uuid,
        tag: String,
    },
    VersionHistory {
        request_id: Uuid,
        versions: Vec<DocumentVersion>,
    },
    RequestFailed {
        request_id: Uuid,
        reason: String,
    },
    /// Any `type` this build does not know about.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Serialize to a JSON text frame (used by servers and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize and validate a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Inbound =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks beyond what serde enforces.
    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Inbound::ConflictDetected { conflict } if conflict.operations.is_empty() => {
                Err(ProtocolError::EmptyConflict { id: conflict.id })
            }
            _ => Ok(()),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
    #[error("conflict {id} carries no operations")]
    EmptyConflict { id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictKind, Severity};
    use serde_json::json;

    #[test]
    fn test_envelope_shape_on_wire() {
        let env = Outbound::Heartbeat {
            user_id: Uuid::nil(),
            timestamp: 42,
        };
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["payload"]["timestamp"], 42);
        assert_eq!(
            value["payload"]["user_id"],
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_session_joined_roundtrip() {
        let env = Inbound::SessionJoined {
            session_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
        };
        let decoded = Inbound::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_cursor_update_roundtrip() {
        let env = Outbound::CursorUpdate {
            user_id: Uuid::new_v4(),
            cursor: Some(CursorPosition::new(120.5, -30.25)),
            timestamp: 7,
        };
        let decoded = Outbound::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_cursor_optional_fields_omitted() {
        let pos = CursorPosition::new(1.0, 2.0);
        let value = serde_json::to_value(pos).unwrap();
        assert!(value.get("z").is_none());
        assert!(value.get("viewport_id").is_none());
    }

    #[test]
    fn test_cursor_clear_serializes_as_null() {
        let env = Outbound::cursor_update(Uuid::new_v4(), None);
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert!(value["payload"]["cursor"].is_null());
    }

    #[test]
    fn test_unknown_inbound_type_is_tolerated() {
        let frame = r#"{"type":"server_maintenance","payload":{"at":"03:00"}}"#;
        let decoded = Inbound::decode(frame).unwrap();
        assert_eq!(decoded, Inbound::Unknown);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(Inbound::decode("{not json").is_err());
        assert!(Inbound::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_conflict_without_operations_rejected() {
        let conflict = json!({
            "type": "conflict_detected",
            "payload": {
                "conflict": {
                    "id": Uuid::new_v4(),
                    "type": "property",
                    "severity": "low",
                    "entity_ids": [],
                    "description": "fill color changed twice",
                    "operations": [],
                    "auto_resolvable": true
                }
            }
        });
        let err = Inbound::decode(&conflict.to_string()).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyConflict { .. }));
    }

    #[test]
    fn test_conflict_with_operations_accepted() {
        let conflict = Conflict::new(
            ConflictKind::Property,
            Severity::Low,
            vec![Uuid::new_v4()],
            "fill color changed twice",
            vec![json!({"op": "set", "path": "fill", "value": "#fff"})],
        );
        let env = Inbound::ConflictDetected { conflict };
        let decoded = Inbound::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_sync_state_wire_names() {
        for (state, name) in [
            (SyncState::Offline, "offline"),
            (SyncState::Connecting, "connecting"),
            (SyncState::Synchronized, "synchronized"),
            (SyncState::Syncing, "syncing"),
            (SyncState::Conflicted, "conflicted"),
            (SyncState::Error, "error"),
        ] {
            assert_eq!(serde_json::to_value(state).unwrap(), name);
        }
    }

    #[test]
    fn test_presence_defaults_fill_missing_fields() {
        let frame = json!({
            "type": "presence_update",
            "payload": {
                "user_id": Uuid::new_v4(),
                "cursor": null,
                "timestamp": 9
            }
        });
        let decoded = Inbound::decode(&frame.to_string()).unwrap();
        match decoded {
            Inbound::PresenceUpdate {
                cursor, selection, ..
            } => {
                assert!(cursor.is_none());
                assert!(selection.is_empty());
            }
            other => panic!("expected presence_update, got {other:?}"),
        }
    }

    #[test]
    fn test_operation_payload_is_opaque() {
        let operation = json!({
            "kind": "transform",
            "entity": Uuid::new_v4(),
            "matrix": [1.0, 0.0, 0.0, 1.0, 15.5, -2.25],
            "nested": {"anything": ["goes", 1, null]}
        });
        let env = Outbound::ApplyOperation {
            user_id: Uuid::new_v4(),
            operation: operation.clone(),
        };
        match Outbound::decode(&env.encode().unwrap()).unwrap() {
            Outbound::ApplyOperation { operation: got, .. } => assert_eq!(got, operation),
            other => panic!("expected apply_operation, got {other:?}"),
        }
    }

    #[test]
    fn test_version_reply_roundtrip() {
        let env = Inbound::VersionHistory {
            request_id: Uuid::new_v4(),
            versions: vec![DocumentVersion {
                id: Uuid::new_v4(),
                message: "initial import".into(),
                author: "alice".into(),
                timestamp: 1_700_000_000_000,
                operations: vec![json!({"op": "create"})],
                tags: vec!["v1.0".into()],
            }],
        };
        let decoded = Inbound::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_user_presence_helper() {
        let user = User::new("Alice", "alice@example.com");
        let id = user.id;
        let presence = UserPresence::new(user, 1234);

        assert_eq!(presence.user_id, id);
        assert!(presence.cursor.is_none());
        assert!(presence.selection.is_empty());
        assert_eq!(presence.last_active, 1234);
        assert!(presence.is_active);
    }

    #[test]
    fn test_heartbeat_constructor_stamps_clock() {
        let before = now_ms();
        match Outbound::heartbeat(Uuid::new_v4()) {
            Outbound::Heartbeat { timestamp, .. } => {
                assert!(timestamp >= before);
                assert!(timestamp <= now_ms());
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }
}

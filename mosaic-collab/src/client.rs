//! Consumer-facing handle for one collaboration session.
//!
//! [`CollabClient`] spawns the session task and talks to it over a
//! command channel. Reads go through shared snapshots the task
//! publishes after every state change, so selectors never block on
//! session work and the UI can poll them at render rate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::conflict::{Conflict, ResolutionStrategy};
use crate::connection::{Command, RequestError, Session, SessionConfig};
use crate::protocol::{
    CursorPosition, EntityId, Operation, SyncState, User, UserPresence,
};
use crate::store::CollaborationState;
use crate::version::{Branch, DocumentVersion, MergeStrategy, VersionReply, VersionRequest};

/// Buffer for commands from handle to session task.
const COMMAND_BUFFER: usize = 64;

/// Notable things that happened in the session, for UIs that react to
/// changes instead of polling selectors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionJoined { session_id: Uuid, document_id: Uuid },
    Connected,
    Disconnected,
    SyncStateChanged(SyncState),
    UserJoined(UserPresence),
    UserLeft(Uuid),
    ConflictDetected(Conflict),
    ConflictResolved { conflict_id: Uuid },
    VersionAdvanced(u64),
    RemoteOperation { version: u64, operation: Operation },
    StateSynced { version: u64, document: Operation },
}

/// Snapshot of session-side bookkeeping that lives outside the store:
/// version history, branch selection, in-flight resolutions and queue
/// counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    /// Conflicts with a resolution sent but not yet acknowledged.
    pub pending_resolutions: Vec<Uuid>,
    pub current_branch: String,
    pub branches: Vec<Branch>,
    pub versions: Vec<DocumentVersion>,
    pub queued_envelopes: usize,
    pub dropped_envelopes: u64,
    pub rejected_envelopes: u64,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            pending_resolutions: Vec::new(),
            current_branch: "main".to_string(),
            branches: Vec::new(),
            versions: Vec::new(),
            queued_envelopes: 0,
            dropped_envelopes: 0,
            rejected_envelopes: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("session task is no longer running")]
    SessionGone,
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Handle to a collaboration session.
///
/// Dropping the handle stops the session task.
///
/// ```no_run
/// use mosaic_collab::{CollabClient, User};
/// use uuid::Uuid;
///
/// #[tokio::main]
/// async fn main() {
///     let user = User::new("Ada", "ada@example.com");
///     let mut client = CollabClient::new(user, Uuid::new_v4(), "ws://127.0.0.1:9090");
///     let mut events = client.take_event_rx().expect("first take");
///     client.connect().await.expect("session running");
///
///     while let Some(event) = events.recv().await {
///         println!("session event: {event:?}");
///     }
/// }
/// ```
pub struct CollabClient {
    cmd_tx: mpsc::Sender<Command>,
    shared_state: Arc<RwLock<CollaborationState>>,
    shared_cursors: Arc<RwLock<HashMap<Uuid, CursorPosition>>>,
    shared_view: Arc<RwLock<SessionView>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    user: User,
    document_id: Uuid,
}

impl CollabClient {
    /// Create a client for `document_id` with default settings. Must be
    /// called from within a tokio runtime; the session task starts
    /// immediately but stays offline until [`connect`](Self::connect).
    pub fn new(user: User, document_id: Uuid, server_url: impl Into<String>) -> Self {
        let config = SessionConfig {
            server_url: server_url.into(),
            ..SessionConfig::default()
        };
        Self::with_config(user, document_id, config)
    }

    pub fn with_config(user: User, document_id: Uuid, config: SessionConfig) -> Self {
        let shared_state = Arc::new(RwLock::new(CollaborationState::new()));
        let shared_cursors = Arc::new(RwLock::new(HashMap::new()));
        let shared_view = Arc::new(RwLock::new(SessionView::default()));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        let session = Session::new(
            config,
            user.clone(),
            document_id,
            Arc::clone(&shared_state),
            Arc::clone(&shared_cursors),
            Arc::clone(&shared_view),
            event_tx,
        );
        tokio::spawn(session.run(cmd_rx));

        Self {
            cmd_tx,
            shared_state,
            shared_cursors,
            shared_view,
            event_rx: Some(event_rx),
            user,
            document_id,
        }
    }

    // ─── lifecycle ─────────────────────────────────────────────────

    /// Open the connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect).await
    }

    /// Tear everything down: channel, timers, queue, pending requests.
    /// No reconnect happens until `connect` is called again.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect).await
    }

    // ─── local actions ─────────────────────────────────────────────

    /// Announce the local cursor. `None` means it left the document.
    /// Updates are throttled and coalesced before transmission.
    pub async fn update_cursor(&self, cursor: Option<CursorPosition>) -> Result<(), ClientError> {
        self.command(Command::UpdateCursor(cursor)).await
    }

    pub async fn update_selection(&self, selection: Vec<EntityId>) -> Result<(), ClientError> {
        self.command(Command::UpdateSelection(selection)).await
    }

    /// Submit a document operation. Queued for the next open when
    /// offline.
    pub async fn apply_operation(&self, operation: Operation) -> Result<(), ClientError> {
        self.command(Command::ApplyOperation(operation)).await
    }

    /// Request resolution of one conflict. Without an explicit strategy
    /// the conflict's recommended one is used. The conflict leaves the
    /// store only when the server acknowledges.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<(), ClientError> {
        self.command(Command::ResolveConflict {
            conflict_id,
            strategy,
        })
        .await
    }

    /// Resolve every auto-resolvable conflict with last-write-wins.
    pub async fn resolve_auto(&self) -> Result<(), ClientError> {
        self.command(Command::ResolveAuto).await
    }

    // ─── version and branch requests ───────────────────────────────

    pub async fn create_branch(&self, name: impl Into<String>) -> Result<Branch, ClientError> {
        match self
            .version_request(VersionRequest::CreateBranch { name: name.into() })
            .await?
        {
            VersionReply::BranchCreated(branch) => Ok(branch),
            _ => Err(RequestError::ReplyMismatch.into()),
        }
    }

    pub async fn switch_branch(&self, name: impl Into<String>) -> Result<Branch, ClientError> {
        match self
            .version_request(VersionRequest::SwitchBranch { name: name.into() })
            .await?
        {
            VersionReply::BranchSwitched { branch, .. } => Ok(branch),
            _ => Err(RequestError::ReplyMismatch.into()),
        }
    }

    /// Merge `source` into the current branch. Returns the merge
    /// version the server committed.
    pub async fn merge_branch(
        &self,
        source: impl Into<String>,
        strategy: MergeStrategy,
    ) -> Result<DocumentVersion, ClientError> {
        match self
            .version_request(VersionRequest::MergeBranch {
                source: source.into(),
                strategy,
            })
            .await?
        {
            VersionReply::BranchMerged(version) => Ok(version),
            _ => Err(RequestError::ReplyMismatch.into()),
        }
    }

    /// Tag a version (the latest one when `version_id` is `None`).
    /// Returns the id of the version that was tagged.
    pub async fn create_tag(
        &self,
        name: impl Into<String>,
        version_id: Option<Uuid>,
    ) -> Result<Uuid, ClientError> {
        match self
            .version_request(VersionRequest::CreateTag {
                name: name.into(),
                version_id,
            })
            .await?
        {
            VersionReply::TagCreated { version_id, .. } => Ok(version_id),
            _ => Err(RequestError::ReplyMismatch.into()),
        }
    }

    pub async fn version_history(&self) -> Result<Vec<DocumentVersion>, ClientError> {
        match self.version_request(VersionRequest::History).await? {
            VersionReply::History(versions) => Ok(versions),
            _ => Err(RequestError::ReplyMismatch.into()),
        }
    }

    // ─── selectors ─────────────────────────────────────────────────

    pub async fn state(&self) -> CollaborationState {
        self.shared_state.read().await.clone()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.shared_state.read().await.sync_state
    }

    pub async fn is_connected(&self) -> bool {
        self.shared_state.read().await.is_connected
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.shared_state.read().await.conflicts.clone()
    }

    /// Interpolated remote cursor positions, as currently drawn.
    pub async fn remote_cursors(&self) -> HashMap<Uuid, CursorPosition> {
        self.shared_cursors.read().await.clone()
    }

    pub async fn session_view(&self) -> SessionView {
        self.shared_view.read().await.clone()
    }

    pub async fn pending_resolutions(&self) -> Vec<Uuid> {
        self.shared_view.read().await.pending_resolutions.clone()
    }

    pub async fn current_branch(&self) -> String {
        self.shared_view.read().await.current_branch.clone()
    }

    pub async fn branches(&self) -> Vec<Branch> {
        self.shared_view.read().await.branches.clone()
    }

    pub async fn versions(&self) -> Vec<DocumentVersion> {
        self.shared_view.read().await.versions.clone()
    }

    /// The session event stream. Can only be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    // ─── plumbing ──────────────────────────────────────────────────

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ClientError::SessionGone)
    }

    async fn version_request(&self, request: VersionRequest) -> Result<VersionReply, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::VersionRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::SessionGone)?;
        match reply_rx.await {
            Ok(result) => result.map_err(ClientError::Request),
            Err(_) => Err(ClientError::SessionGone),
        }
    }
}

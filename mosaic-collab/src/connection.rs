//! Connection lifecycle and the per-session actor.
//!
//! One tokio task owns everything mutable for a session: the store, the
//! outbound queue, presence, in-flight requests and the channel handle.
//! Commands from [`CollabClient`](crate::client::CollabClient), channel
//! events and timers are multiplexed through one `select!` loop, so no
//! locking is needed around state transitions and every mutation sees a
//! consistent world.
//!
//! ```text
//!             connect()                 open
//!   offline ───────────▶ connecting ──────────▶ synchronized
//!      ▲                     │                  ▲    │ │
//!      │      error/timeout  │          resolve │    │ └──▶ syncing
//!      │◀────────────────────┘                  │    ▼
//!      │                                      conflicted
//!      └──────────── close (backoff, then retry) ◀───┘
//! ```
//!
//! Reconnection uses exponential backoff with jitter so a briefly
//! unreachable server is not stampeded by every client at once.
//!
//! Reference: Kleppmann, "Designing Data-Intensive Applications", ch. 8
//! (timeouts and unbounded delays).

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::{ChannelEvent, MessageChannel};
use crate::client::{SessionEvent, SessionView};
use crate::conflict::{ResolutionStrategy, ResolutionTracker};
use crate::presence::{sweep_idle, CursorThrottle, PresenceTracker};
use crate::protocol::{
    now_ms, CursorPosition, EntityId, Inbound, Operation, Outbound, SyncState, User,
};
use crate::queue::{OutboundQueue, OverflowPolicy};
use crate::store::{Action, CollaborationState};
use crate::version::{VersionReply, VersionRequest, VersionTimeline};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Exponential backoff schedule for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the nominal delay randomized away, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        // exponent is clamped so the i32 cast cannot wrap
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Nominal delay with jitter applied, still capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let spread = nominal * self.jitter.min(1.0);
        let jittered = rand::thread_rng().gen_range((nominal - spread).max(0.0)..=nominal + spread);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// Everything tunable about a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    /// Fixed heartbeat period; the first beat fires one full period
    /// after open.
    pub heartbeat_interval: Duration,
    /// Cursor animation tick, runs only while remote cursors exist.
    pub animation_interval: Duration,
    /// Time for a displayed cursor to reach its announced target.
    pub animation_duration: Duration,
    /// Minimum spacing between outgoing `cursor_update`s.
    pub cursor_throttle: Duration,
    /// Branch/tag/history requests are rejected after this long without
    /// a matching reply.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
    /// Participants with no presence traffic for this long are flagged
    /// inactive.
    pub idle_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            animation_interval: Duration::from_millis(16),
            animation_duration: Duration::from_millis(150),
            cursor_throttle: Duration::from_millis(50),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            idle_timeout: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

/// Why a correlated request did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("session disconnected")]
    Disconnected,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("outbound queue refused the request")]
    QueueFull,
    #[error("server reply did not match the request")]
    ReplyMismatch,
}

/// What the client handle asks the session task to do.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    UpdateCursor(Option<CursorPosition>),
    UpdateSelection(Vec<EntityId>),
    ApplyOperation(Operation),
    ResolveConflict {
        conflict_id: Uuid,
        strategy: Option<ResolutionStrategy>,
    },
    ResolveAuto,
    VersionRequest {
        request: VersionRequest,
        reply: oneshot::Sender<Result<VersionReply, RequestError>>,
    },
}

struct PendingRequest {
    request: VersionRequest,
    reply: oneshot::Sender<Result<VersionReply, RequestError>>,
    deadline: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Session actor
// ───────────────────────────────────────────────────────────────────

pub(crate) struct Session {
    config: SessionConfig,
    user: User,
    document_id: Uuid,

    state: CollaborationState,
    shared_state: Arc<RwLock<CollaborationState>>,
    shared_cursors: Arc<RwLock<HashMap<Uuid, CursorPosition>>>,
    shared_view: Arc<RwLock<SessionView>>,
    event_tx: mpsc::Sender<SessionEvent>,

    channel: Option<MessageChannel>,
    chan_rx: Option<mpsc::Receiver<ChannelEvent>>,

    queue: OutboundQueue,
    tracker: PresenceTracker,
    throttle: CursorThrottle,
    resolutions: ResolutionTracker,
    timeline: VersionTimeline,
    pending_requests: HashMap<Uuid, PendingRequest>,

    local_cursor: Option<CursorPosition>,
    local_selection: Vec<EntityId>,

    heartbeat: Option<tokio::time::Interval>,
    animation: Option<tokio::time::Interval>,
    last_animation_tick: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    auto_reconnect_armed: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SessionConfig,
        user: User,
        document_id: Uuid,
        shared_state: Arc<RwLock<CollaborationState>>,
        shared_cursors: Arc<RwLock<HashMap<Uuid, CursorPosition>>>,
        shared_view: Arc<RwLock<SessionView>>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let queue = OutboundQueue::new(config.queue_capacity, config.overflow_policy);
        let tracker = PresenceTracker::new(user.id, config.animation_duration);
        let throttle = CursorThrottle::new(config.cursor_throttle);
        Self {
            config,
            user,
            document_id,
            state: CollaborationState::new(),
            shared_state,
            shared_cursors,
            shared_view,
            event_tx,
            channel: None,
            chan_rx: None,
            queue,
            tracker,
            throttle,
            resolutions: ResolutionTracker::new(),
            timeline: VersionTimeline::new(),
            pending_requests: HashMap::new(),
            local_cursor: None,
            local_selection: Vec::new(),
            heartbeat: None,
            animation: None,
            last_animation_tick: None,
            reconnect_at: None,
            reconnect_attempts: 0,
            auto_reconnect_armed: false,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.apply(Action::SetUser {
            user: self.user.clone(),
            timestamp: now_ms(),
        });
        self.publish().await;

        loop {
            let throttle_deadline = self.throttle.deadline().map(Instant::from_std);
            let request_deadline = self.next_request_deadline();

            tokio::select! {
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(command) => {
                            self.handle_command(command).await;
                            self.publish().await;
                        }
                        // every client handle is gone
                        None => break,
                    }
                }
                maybe_event = recv_opt(&mut self.chan_rx) => {
                    match maybe_event {
                        Some(ChannelEvent::Inbound(envelope)) => self.on_inbound(envelope).await,
                        Some(ChannelEvent::Error(reason)) => self.on_channel_error(reason),
                        Some(ChannelEvent::Closed) | None => self.on_channel_closed().await,
                    }
                    self.publish().await;
                }
                _ = tick_opt(&mut self.heartbeat) => {
                    self.on_heartbeat().await;
                    self.publish().await;
                }
                _ = tick_opt(&mut self.animation) => {
                    self.on_animation_tick().await;
                }
                _ = sleep_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect().await;
                    self.publish().await;
                }
                _ = sleep_opt(throttle_deadline) => {
                    if let Some(position) = self.throttle.take_due(std::time::Instant::now()) {
                        self.send_now(Outbound::cursor_update(self.user.id, Some(position)))
                            .await;
                    }
                }
                _ = sleep_opt(request_deadline) => {
                    self.expire_requests();
                    self.publish().await;
                }
            }
        }

        log::debug!("Session task for document {} shutting down", self.document_id);
        self.auto_reconnect_armed = false;
        self.fail_pending(RequestError::Disconnected);
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    // ─── commands ──────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.handle_connect().await,
            Command::Disconnect => self.handle_disconnect().await,
            Command::UpdateCursor(cursor) => self.handle_update_cursor(cursor).await,
            Command::UpdateSelection(selection) => self.handle_update_selection(selection).await,
            Command::ApplyOperation(operation) => {
                self.send_or_queue(Outbound::ApplyOperation {
                    user_id: self.user.id,
                    operation,
                })
                .await;
            }
            Command::ResolveConflict {
                conflict_id,
                strategy,
            } => self.handle_resolve_conflict(conflict_id, strategy).await,
            Command::ResolveAuto => self.handle_resolve_auto().await,
            Command::VersionRequest { request, reply } => {
                self.handle_version_request(request, reply).await
            }
        }
    }

    async fn handle_connect(&mut self) {
        if self.channel.is_some() {
            log::debug!("connect() while already connected, ignoring");
            return;
        }
        // an explicit connect overrides any backoff in progress
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        self.auto_reconnect_armed = self.config.auto_reconnect;
        self.apply(Action::SetUser {
            user: self.user.clone(),
            timestamp: now_ms(),
        });
        self.try_connect().await;
    }

    async fn handle_disconnect(&mut self) {
        log::info!("Disconnecting from document {}", self.document_id);
        let was_connected = self.state.is_connected;

        self.auto_reconnect_armed = false;
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        self.heartbeat = None;
        self.animation = None;
        self.last_animation_tick = None;
        self.throttle.reset();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.chan_rx = None;
        self.queue.clear();
        self.fail_pending(RequestError::Disconnected);
        self.resolutions.clear();
        self.tracker.clear();
        self.publish_cursors().await;
        self.timeline.clear();
        self.local_cursor = None;
        self.local_selection.clear();
        self.apply(Action::Reset);
        if was_connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    async fn handle_update_cursor(&mut self, cursor: Option<CursorPosition>) {
        self.local_cursor = cursor;
        self.apply(Action::UpdateUserPresence {
            user_id: self.user.id,
            cursor,
            selection: self.local_selection.clone(),
            timestamp: now_ms(),
        });
        if let Some(value) = self.throttle.submit(cursor, std::time::Instant::now()) {
            self.send_now(Outbound::cursor_update(self.user.id, value))
                .await;
        }
    }

    async fn handle_update_selection(&mut self, selection: Vec<EntityId>) {
        self.local_selection = selection.clone();
        self.apply(Action::UpdateUserPresence {
            user_id: self.user.id,
            cursor: self.local_cursor,
            selection: selection.clone(),
            timestamp: now_ms(),
        });
        self.send_now(Outbound::SelectionUpdate {
            user_id: self.user.id,
            selection,
        })
        .await;
    }

    async fn handle_resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        strategy: Option<ResolutionStrategy>,
    ) {
        let Some(conflict) = self.state.conflicts.iter().find(|c| c.id == conflict_id) else {
            log::warn!("Resolve requested for unknown conflict {}", conflict_id);
            return;
        };
        let strategy = strategy.unwrap_or_else(|| conflict.recommended_strategy());
        if !self.resolutions.record(conflict_id, strategy) {
            log::debug!("Resolution already in flight for conflict {}", conflict_id);
            return;
        }
        log::info!(
            "Requesting {:?} resolution for conflict {}",
            strategy,
            conflict_id
        );
        self.send_or_queue(Outbound::ResolveConflict {
            conflict_id,
            strategy,
            user_id: self.user.id,
        })
        .await;
    }

    async fn handle_resolve_auto(&mut self) {
        let auto: Vec<Uuid> = self
            .state
            .conflicts
            .iter()
            .filter(|c| c.auto_resolvable)
            .map(|c| c.id)
            .collect();
        if auto.is_empty() {
            return;
        }
        log::info!("Auto-resolving {} conflicts with last-write-wins", auto.len());
        for conflict_id in auto {
            if self
                .resolutions
                .record(conflict_id, ResolutionStrategy::LastWriteWins)
            {
                self.send_or_queue(Outbound::ResolveConflict {
                    conflict_id,
                    strategy: ResolutionStrategy::LastWriteWins,
                    user_id: self.user.id,
                })
                .await;
            }
        }
    }

    async fn handle_version_request(
        &mut self,
        request: VersionRequest,
        reply: oneshot::Sender<Result<VersionReply, RequestError>>,
    ) {
        let request_id = Uuid::new_v4();
        let envelope = match &request {
            VersionRequest::CreateBranch { name } => Outbound::CreateBranch {
                request_id,
                name: name.clone(),
            },
            VersionRequest::SwitchBranch { name } => Outbound::SwitchBranch {
                request_id,
                name: name.clone(),
            },
            VersionRequest::MergeBranch { source, strategy } => Outbound::MergeBranch {
                request_id,
                source: source.clone(),
                strategy: *strategy,
            },
            VersionRequest::CreateTag { name, version_id } => Outbound::CreateTag {
                request_id,
                name: name.clone(),
                version_id: *version_id,
            },
            VersionRequest::History => Outbound::GetVersionHistory { request_id },
        };
        log::debug!("Sending {} request {}", request.kind(), request_id);
        if !self.send_or_queue(envelope).await {
            let _ = reply.send(Err(RequestError::QueueFull));
            return;
        }
        self.pending_requests.insert(
            request_id,
            PendingRequest {
                request,
                reply,
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
    }

    // ─── connection lifecycle ──────────────────────────────────────

    async fn try_connect(&mut self) {
        self.apply(Action::SetSyncState(SyncState::Connecting));
        self.publish().await;
        log::info!("Connecting to {}", self.config.server_url);

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            MessageChannel::connect(&self.config.server_url),
        )
        .await;
        match attempt {
            Ok(Ok((channel, rx))) => {
                self.channel = Some(channel);
                self.chan_rx = Some(rx);
                self.on_open().await;
            }
            Ok(Err(e)) => self.on_connect_failure(e.to_string()),
            Err(_) => self.on_connect_failure("connect timed out".to_string()),
        }
    }

    fn on_connect_failure(&mut self, reason: String) {
        log::warn!("Connection attempt failed: {}", reason);
        self.apply(Action::SetSyncState(SyncState::Error));
        self.apply(Action::SetSyncState(SyncState::Offline));
        if self.auto_reconnect_armed {
            self.schedule_reconnect();
        }
    }

    async fn on_open(&mut self) {
        log::info!("Channel open, joining document {}", self.document_id);
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.apply(Action::SetConnected(true));
        self.apply(Action::SetSyncState(SyncState::Synchronized));

        self.send_now(Outbound::JoinSession {
            document_id: self.document_id,
            user: self.user.clone(),
        })
        .await;
        self.send_now(Outbound::SyncRequest {
            document_id: self.document_id,
            last_known_version: self.state.version,
        })
        .await;

        // the offline backlog goes out before anything new can happen;
        // each send waits for writer space, so a backlog larger than
        // the writer buffer still leaves in order with nothing dropped
        let backlog = self.queue.drain();
        if !backlog.is_empty() {
            log::info!("Flushing {} queued envelopes", backlog.len());
        }
        for envelope in backlog {
            self.send_or_queue(envelope).await;
        }

        // peers lost our ephemeral state while we were away
        if self.local_cursor.is_some() {
            self.send_now(Outbound::cursor_update(self.user.id, self.local_cursor))
                .await;
        }
        if !self.local_selection.is_empty() {
            self.send_now(Outbound::SelectionUpdate {
                user_id: self.user.id,
                selection: self.local_selection.clone(),
            })
            .await;
        }

        let period = self.config.heartbeat_interval;
        self.heartbeat = Some(tokio::time::interval_at(Instant::now() + period, period));
        self.throttle.reset();
        self.emit(SessionEvent::Connected);
    }

    fn on_channel_error(&mut self, reason: String) {
        log::warn!("Channel error: {}", reason);
        self.apply(Action::SetSyncState(SyncState::Error));
    }

    async fn on_channel_closed(&mut self) {
        if self.channel.is_none() && self.chan_rx.is_none() {
            return;
        }
        log::info!("Channel closed");
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.chan_rx = None;
        self.heartbeat = None;
        self.throttle.reset();
        self.tracker.clear();
        self.publish_cursors().await;
        self.sync_animation();
        self.apply(Action::SetConnected(false));
        self.apply(Action::SetSyncState(SyncState::Offline));
        self.emit(SessionEvent::Disconnected);
        if self.auto_reconnect_armed {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.channel.is_some() || self.reconnect_at.is_some() {
            return;
        }
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let delay = self.config.reconnect.delay_for(self.reconnect_attempts);
        log::info!(
            "Scheduling reconnect attempt {} in {:?}",
            self.reconnect_attempts,
            delay
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    // ─── timers ────────────────────────────────────────────────────

    async fn on_heartbeat(&mut self) {
        self.send_now(Outbound::heartbeat(self.user.id)).await;
        let now = now_ms();
        self.apply(Action::UpdateUserPresence {
            user_id: self.user.id,
            cursor: self.local_cursor,
            selection: self.local_selection.clone(),
            timestamp: now,
        });
        if let Some(users) = sweep_idle(&self.state.users, now, self.config.idle_timeout) {
            self.apply(Action::UpdateUsers(users));
        }
    }

    async fn on_animation_tick(&mut self) {
        let now = Instant::now();
        let elapsed = match self.last_animation_tick.replace(now) {
            Some(previous) => now.duration_since(previous),
            None => self.config.animation_interval,
        };
        let positions = self.tracker.step_all(elapsed);
        let mut shown = self.shared_cursors.write().await;
        shown.clear();
        shown.extend(positions);
    }

    /// Keep the animation loop running exactly while remote cursors
    /// exist.
    fn sync_animation(&mut self) {
        if self.tracker.has_remote_cursors() {
            if self.animation.is_none() {
                log::debug!("Starting cursor animation loop");
                self.animation = Some(tokio::time::interval(self.config.animation_interval));
                self.last_animation_tick = None;
            }
        } else if self.animation.is_some() {
            log::debug!("Stopping cursor animation loop");
            self.animation = None;
            self.last_animation_tick = None;
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending_requests
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.pending_requests.remove(&request_id) {
                log::warn!(
                    "Request {} ({}) timed out",
                    request_id,
                    pending.request.kind()
                );
                let _ = pending.reply.send(Err(RequestError::Timeout));
            }
        }
    }

    fn next_request_deadline(&self) -> Option<Instant> {
        self.pending_requests.values().map(|p| p.deadline).min()
    }

    // ─── inbound envelopes ─────────────────────────────────────────

    async fn on_inbound(&mut self, envelope: Inbound) {
        match envelope {
            Inbound::SessionJoined {
                session_id,
                document_id,
            } => {
                log::info!("Joined session {} for document {}", session_id, document_id);
                self.apply(Action::SetSession {
                    session_id,
                    document_id,
                });
                self.emit(SessionEvent::SessionJoined {
                    session_id,
                    document_id,
                });
            }

            Inbound::UserJoined { presence } => {
                let user_id = presence.user_id;
                if self
                    .tracker
                    .apply_update(user_id, presence.cursor, presence.last_active)
                {
                    self.publish_cursors().await;
                    self.sync_animation();
                }
                self.apply(Action::AddUser(presence.clone()));
                if user_id != self.user.id {
                    log::info!("User {} joined", presence.user.name);
                    self.emit(SessionEvent::UserJoined(presence));
                }
            }

            Inbound::UserLeft { user_id } => {
                self.apply(Action::RemoveUser(user_id));
                if self.tracker.remove(user_id) {
                    self.publish_cursors().await;
                    self.sync_animation();
                }
                self.emit(SessionEvent::UserLeft(user_id));
            }

            Inbound::PresenceUpdate {
                user_id,
                cursor,
                selection,
                timestamp,
            } => {
                self.apply(Action::UpdateUserPresence {
                    user_id,
                    cursor,
                    selection,
                    timestamp,
                });
                if self.tracker.apply_update(user_id, cursor, timestamp) {
                    self.publish_cursors().await;
                    self.sync_animation();
                }
            }

            Inbound::UsersList { users } => {
                self.tracker.clear();
                for presence in &users {
                    self.tracker
                        .apply_update(presence.user_id, presence.cursor, presence.last_active);
                }
                self.apply(Action::UpdateUsers(users));
                self.publish_cursors().await;
                self.sync_animation();
            }

            Inbound::SyncState { state } => {
                self.apply(Action::SetSyncState(state));
            }

            Inbound::VersionUpdate { version } => {
                self.apply(Action::SetVersion(version));
                self.emit(SessionEvent::VersionAdvanced(version));
            }

            Inbound::OperationApplied { version, operation } => {
                self.apply(Action::SetVersion(version));
                self.emit(SessionEvent::RemoteOperation { version, operation });
            }

            Inbound::FullSync { version, document } => {
                log::info!("Full sync to version {}", version);
                self.apply(Action::SetVersion(version));
                self.emit(SessionEvent::StateSynced { version, document });
            }

            Inbound::ConflictDetected { conflict } => {
                log::warn!(
                    "Conflict detected: {} ({:?}, {:?})",
                    conflict.description,
                    conflict.kind,
                    conflict.severity
                );
                self.apply(Action::AddConflict(conflict.clone()));
                self.emit(SessionEvent::ConflictDetected(conflict));
            }

            Inbound::ConflictResolved { conflict_id } => {
                self.resolutions.complete(conflict_id);
                self.apply(Action::RemoveConflict(conflict_id));
                self.emit(SessionEvent::ConflictResolved { conflict_id });
            }

            Inbound::BranchCreated { request_id, branch } => {
                self.timeline.upsert_branch(branch.clone());
                self.resolve_request(request_id, VersionReply::BranchCreated(branch));
            }

            Inbound::BranchSwitched {
                request_id,
                branch,
                version,
            } => {
                self.timeline.upsert_branch(branch.clone());
                self.timeline.switch_to(branch.name.clone());
                self.apply(Action::SetVersion(version));
                self.resolve_request(request_id, VersionReply::BranchSwitched { branch, version });
            }

            Inbound::BranchMerged {
                request_id,
                version,
            } => {
                self.timeline.record(version.clone());
                self.resolve_request(request_id, VersionReply::BranchMerged(version));
            }

            Inbound::TagCreated {
                request_id,
                version_id,
                tag,
            } => {
                self.timeline.tag(version_id, tag.clone());
                self.resolve_request(request_id, VersionReply::TagCreated { version_id, tag });
            }

            Inbound::VersionHistory {
                request_id,
                versions,
            } => {
                self.timeline.set_history(versions.clone());
                self.resolve_request(request_id, VersionReply::History(versions));
            }

            Inbound::RequestFailed { request_id, reason } => {
                self.reject_request(request_id, RequestError::Rejected(reason));
            }

            Inbound::Unknown => {
                log::debug!("Ignoring envelope of unknown type");
            }
        }
    }

    fn resolve_request(&mut self, request_id: Uuid, reply: VersionReply) {
        match self.pending_requests.remove(&request_id) {
            Some(pending) => {
                log::debug!("Request {} ({}) completed", request_id, pending.request.kind());
                let _ = pending.reply.send(Ok(reply));
            }
            None => log::debug!("Reply for unknown or expired request {}", request_id),
        }
    }

    fn reject_request(&mut self, request_id: Uuid, error: RequestError) {
        match self.pending_requests.remove(&request_id) {
            Some(pending) => {
                log::warn!(
                    "Request {} ({}) failed: {}",
                    request_id,
                    pending.request.kind(),
                    error
                );
                let _ = pending.reply.send(Err(error));
            }
            None => log::debug!("Failure for unknown or expired request {}", request_id),
        }
    }

    fn fail_pending(&mut self, error: RequestError) {
        for (request_id, pending) in self.pending_requests.drain() {
            log::debug!(
                "Failing request {} ({}): {}",
                request_id,
                pending.request.kind(),
                error
            );
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    // ─── plumbing ──────────────────────────────────────────────────

    /// Send when open or drop. For ephemeral traffic (heartbeat,
    /// cursor, selection) that must never occupy queue space.
    async fn send_now(&mut self, envelope: Outbound) {
        match &self.channel {
            Some(channel) => {
                if channel.send(envelope).await.is_err() {
                    log::debug!("Dropping ephemeral envelope, channel unavailable");
                }
            }
            None => log::debug!("Dropping ephemeral envelope, offline"),
        }
    }

    /// Send when open, waiting out writer backpressure; otherwise queue
    /// for the next open. An envelope handed back by a dying channel is
    /// queued too, so it rides the next flush instead of vanishing.
    /// Returns `false` only when the queue also refused the envelope.
    async fn send_or_queue(&mut self, envelope: Outbound) -> bool {
        let refused = match &self.channel {
            Some(channel) => match channel.send(envelope).await {
                Ok(()) => return true,
                Err(envelope) => envelope,
            },
            None => envelope,
        };
        self.queue.enqueue(refused)
    }

    /// Apply one action to the owned state, surfacing sync-state changes
    /// as events.
    fn apply(&mut self, action: Action) {
        let before = self.state.sync_state;
        self.state.apply(action);
        if self.state.sync_state != before {
            self.emit(SessionEvent::SyncStateChanged(self.state.sync_state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Dropping session event: {}", e);
        }
    }

    async fn publish(&self) {
        *self.shared_state.write().await = self.state.clone();
        let mut view = self.shared_view.write().await;
        view.pending_resolutions = self
            .resolutions
            .pending()
            .iter()
            .map(|p| p.conflict_id)
            .collect();
        view.current_branch = self.timeline.current_branch().to_string();
        view.branches = self.timeline.branches().to_vec();
        view.versions = self.timeline.versions().to_vec();
        view.queued_envelopes = self.queue.len();
        view.dropped_envelopes = self.queue.dropped();
        view.rejected_envelopes = self.queue.rejected();
    }

    async fn publish_cursors(&self) {
        let mut shown = self.shared_cursors.write().await;
        shown.clear();
        shown.extend(self.tracker.displayed());
    }
}

// select! arms over optional sources; a missing source never resolves

async fn recv_opt(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Remote cursor presence with client-side interpolation, plus the
//! outbound throttle for the local cursor.
//!
//! Remote positions arrive as discrete `presence_update` snapshots, at
//! whatever rate the peer's throttle allows. Drawing them raw makes
//! cursors teleport. Instead each remote cursor keeps two positions,
//! the last announced `target` and the currently `displayed` one, and
//! every animation tick moves `displayed` a fraction of the remaining
//! distance toward `target`:
//!
//! ```text
//! factor    = min(1, elapsed_ms / animation_duration_ms)
//! displayed = displayed + (target - displayed) * factor
//! ```
//!
//! A full-duration tick lands exactly on the target; shorter ticks
//! glide. The animation loop itself lives in the session task and runs
//! only while at least one remote cursor exists.
//!
//! Performance target: `step_all` over 100 cursors < 10µs per tick.
//!
//! Reference: Akenine-Möller et al., "Real-Time Rendering", 4th ed.,
//! ch. 4 (interpolated motion).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::protocol::{CursorPosition, UserPresence};

// ───────────────────────────────────────────────────────────────────
// Remote cursors
// ───────────────────────────────────────────────────────────────────

/// One remote participant's cursor, as announced and as drawn.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub user_id: Uuid,
    /// Where the peer last said their cursor is.
    pub target: CursorPosition,
    /// Where we are currently drawing it.
    pub displayed: CursorPosition,
    last_timestamp: u64,
}

impl RemoteCursor {
    /// A cursor seen for the first time is drawn at its announced
    /// position immediately; only subsequent moves glide.
    fn new(user_id: Uuid, position: CursorPosition, timestamp: u64) -> Self {
        Self {
            user_id,
            target: position,
            displayed: position,
            last_timestamp: timestamp,
        }
    }

    /// Adopt a newly announced position. Snapshots older than the last
    /// applied one are rejected, which keeps reordered frames from
    /// making the cursor jump backwards.
    pub fn update_target(&mut self, position: CursorPosition, timestamp: u64) -> bool {
        if timestamp < self.last_timestamp {
            return false;
        }
        self.target = position;
        self.last_timestamp = timestamp;
        true
    }

    /// Advance the displayed position by one tick of `elapsed`.
    pub fn step(&mut self, elapsed: Duration, duration: Duration) -> CursorPosition {
        let factor = interpolation_factor(elapsed, duration);
        self.displayed.x += (self.target.x - self.displayed.x) * factor;
        self.displayed.y += (self.target.y - self.displayed.y) * factor;
        // depth and viewport are discrete, no point easing them
        self.displayed.z = self.target.z;
        self.displayed.viewport_id = self.target.viewport_id;
        self.displayed
    }
}

/// Fraction of the remaining distance to cover for one tick.
fn interpolation_factor(elapsed: Duration, duration: Duration) -> f64 {
    let duration_ms = duration.as_secs_f64() * 1000.0;
    if duration_ms <= 0.0 {
        return 1.0;
    }
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    (elapsed_ms / duration_ms).clamp(0.0, 1.0)
}

/// All remote cursors for one session.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user_id: Uuid,
    cursors: HashMap<Uuid, RemoteCursor>,
    animation_duration: Duration,
}

impl PresenceTracker {
    pub fn new(local_user_id: Uuid, animation_duration: Duration) -> Self {
        Self {
            local_user_id,
            cursors: HashMap::new(),
            animation_duration,
        }
    }

    /// Apply one presence snapshot. `None` removes the cursor. Echoes of
    /// the local user are ignored. Returns `true` if the cursor set or a
    /// target changed, so the caller knows to re-arm the animation loop.
    pub fn apply_update(
        &mut self,
        user_id: Uuid,
        cursor: Option<CursorPosition>,
        timestamp: u64,
    ) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        match cursor {
            Some(position) => match self.cursors.get_mut(&user_id) {
                Some(existing) => existing.update_target(position, timestamp),
                None => {
                    self.cursors
                        .insert(user_id, RemoteCursor::new(user_id, position, timestamp));
                    true
                }
            },
            None => self.cursors.remove(&user_id).is_some(),
        }
    }

    /// Drop a participant's cursor (on `user_left`).
    pub fn remove(&mut self, user_id: Uuid) -> bool {
        self.cursors.remove(&user_id).is_some()
    }

    /// Advance every cursor by one tick and return the positions to draw.
    pub fn step_all(&mut self, elapsed: Duration) -> Vec<(Uuid, CursorPosition)> {
        let duration = self.animation_duration;
        self.cursors
            .values_mut()
            .map(|c| (c.user_id, c.step(elapsed, duration)))
            .collect()
    }

    /// Current targets, mostly for diagnostics.
    pub fn targets(&self) -> Vec<(Uuid, CursorPosition)> {
        self.cursors.values().map(|c| (c.user_id, c.target)).collect()
    }

    /// Positions as currently drawn, without advancing the animation.
    pub fn displayed(&self) -> Vec<(Uuid, CursorPosition)> {
        self.cursors
            .values()
            .map(|c| (c.user_id, c.displayed))
            .collect()
    }

    pub fn remote_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn has_remote_cursors(&self) -> bool {
        !self.cursors.is_empty()
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Idle detection
// ───────────────────────────────────────────────────────────────────

/// Flag participants with no presence traffic for `idle_timeout` as
/// inactive. Returns the corrected roster, or `None` when nothing
/// changed. Reactivation is not handled here: any presence snapshot
/// sets `is_active` again on its way through the store.
pub fn sweep_idle(
    users: &[UserPresence],
    now_ms: u64,
    idle_timeout: Duration,
) -> Option<Vec<UserPresence>> {
    let idle_ms = idle_timeout.as_millis() as u64;
    let stale = |p: &UserPresence| p.is_active && now_ms.saturating_sub(p.last_active) > idle_ms;

    if !users.iter().any(stale) {
        return None;
    }
    Some(
        users
            .iter()
            .map(|p| {
                let mut p = p.clone();
                if stale(&p) {
                    log::debug!("User {} idle for >{}ms, marking inactive", p.user_id, idle_ms);
                    p.is_active = false;
                }
                p
            })
            .collect(),
    )
}

// ───────────────────────────────────────────────────────────────────
// Local cursor throttle
// ───────────────────────────────────────────────────────────────────

/// Rate-limits outgoing `cursor_update`s to one per window.
///
/// Coalescing is last-value-wins: positions submitted inside the window
/// overwrite each other and only the newest goes out when the window
/// reopens. A cursor clear (`None`) bypasses the window entirely so a
/// departing cursor never lingers on other screens.
///
/// The clock is passed in by the caller, which keeps this testable
/// without sleeping.
#[derive(Debug)]
pub struct CursorThrottle {
    window: Duration,
    last_sent: Option<Instant>,
    pending: Option<CursorPosition>,
}

impl CursorThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a new local cursor value. Returns `Some(value)` when an
    /// update must be sent now (`None` inside means "cursor cleared"),
    /// or `None` when the value was coalesced for later.
    pub fn submit(
        &mut self,
        cursor: Option<CursorPosition>,
        now: Instant,
    ) -> Option<Option<CursorPosition>> {
        match cursor {
            None => {
                self.pending = None;
                self.last_sent = Some(now);
                Some(None)
            }
            Some(position) => {
                let window_open = match self.last_sent {
                    Some(sent) => now.duration_since(sent) >= self.window,
                    None => true,
                };
                if window_open {
                    self.last_sent = Some(now);
                    self.pending = None;
                    Some(Some(position))
                } else {
                    self.pending = Some(position);
                    None
                }
            }
        }
    }

    /// Flush the coalesced position once its window has reopened.
    pub fn take_due(&mut self, now: Instant) -> Option<CursorPosition> {
        self.pending?;
        let due = match self.last_sent {
            Some(sent) => now.duration_since(sent) >= self.window,
            None => true,
        };
        if due {
            self.last_sent = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// When the coalesced position becomes sendable, if one is waiting.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending?;
        Some(match self.last_sent {
            Some(sent) => sent + self.window,
            None => Instant::now(),
        })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::User;

    const DURATION: Duration = Duration::from_millis(150);

    fn tracker() -> (PresenceTracker, Uuid) {
        let local = Uuid::new_v4();
        (PresenceTracker::new(local, DURATION), local)
    }

    #[test]
    fn test_full_duration_tick_lands_on_target() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(CursorPosition::new(100.0, 0.0), 1);

        let shown = cursor.step(Duration::from_millis(150), DURATION);
        assert_eq!(shown.x, 100.0);
        assert_eq!(shown.y, 0.0);
    }

    #[test]
    fn test_partial_tick_covers_proportional_distance() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(CursorPosition::new(100.0, 0.0), 1);

        let shown = cursor.step(Duration::from_millis(15), DURATION);
        assert!((shown.x - 10.0).abs() < 1e-9, "got {}", shown.x);
    }

    #[test]
    fn test_oversized_tick_clamps_to_target() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(CursorPosition::new(100.0, 50.0), 1);

        let shown = cursor.step(Duration::from_millis(400), DURATION);
        assert_eq!(shown.x, 100.0);
        assert_eq!(shown.y, 50.0);
    }

    #[test]
    fn test_zero_duration_snaps() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(CursorPosition::new(10.0, 10.0), 1);

        let shown = cursor.step(Duration::from_millis(1), Duration::ZERO);
        assert_eq!(shown.x, 10.0);
    }

    #[test]
    fn test_repeated_ticks_converge() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(CursorPosition::new(100.0, 0.0), 1);

        let mut last = 0.0;
        for _ in 0..60 {
            last = cursor.step(Duration::from_millis(16), DURATION).x;
        }
        assert!(last > 99.0, "cursor stalled at {last}");
        assert!(last <= 100.0);
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 100);

        assert!(!cursor.update_target(CursorPosition::new(5.0, 5.0), 99));
        assert_eq!(cursor.target, CursorPosition::new(0.0, 0.0));

        // equal timestamps are accepted, last writer wins
        assert!(cursor.update_target(CursorPosition::new(7.0, 7.0), 100));
        assert_eq!(cursor.target.x, 7.0);
    }

    #[test]
    fn test_depth_and_viewport_snap() {
        let viewport = Uuid::new_v4();
        let mut cursor = RemoteCursor::new(Uuid::new_v4(), CursorPosition::new(0.0, 0.0), 0);
        cursor.update_target(
            CursorPosition {
                x: 100.0,
                y: 0.0,
                z: Some(3.0),
                viewport_id: Some(viewport),
            },
            1,
        );

        let shown = cursor.step(Duration::from_millis(15), DURATION);
        assert!(shown.x < 100.0);
        assert_eq!(shown.z, Some(3.0));
        assert_eq!(shown.viewport_id, Some(viewport));
    }

    #[test]
    fn test_first_appearance_draws_in_place() {
        let (mut tracker, _) = tracker();
        let user = Uuid::new_v4();

        tracker.apply_update(user, Some(CursorPosition::new(40.0, 8.0)), 1);
        let shown = tracker.step_all(Duration::from_millis(1));
        assert_eq!(shown, [(user, CursorPosition::new(40.0, 8.0))]);
    }

    #[test]
    fn test_local_echo_ignored() {
        let (mut tracker, local) = tracker();
        assert!(!tracker.apply_update(local, Some(CursorPosition::new(1.0, 1.0)), 1));
        assert!(!tracker.has_remote_cursors());
    }

    #[test]
    fn test_cursor_clear_removes_entry() {
        let (mut tracker, _) = tracker();
        let user = Uuid::new_v4();

        tracker.apply_update(user, Some(CursorPosition::new(1.0, 1.0)), 1);
        assert!(tracker.has_remote_cursors());

        assert!(tracker.apply_update(user, None, 2));
        assert!(!tracker.has_remote_cursors());
        assert!(!tracker.apply_update(user, None, 3));
    }

    #[test]
    fn test_remove_on_user_left() {
        let (mut tracker, _) = tracker();
        let user = Uuid::new_v4();
        tracker.apply_update(user, Some(CursorPosition::new(1.0, 1.0)), 1);

        assert!(tracker.remove(user));
        assert!(!tracker.remove(user));
        assert_eq!(tracker.remote_count(), 0);
    }

    #[test]
    fn test_step_all_moves_every_cursor() {
        let (mut tracker, _) = tracker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.apply_update(a, Some(CursorPosition::new(0.0, 0.0)), 1);
        tracker.apply_update(b, Some(CursorPosition::new(50.0, 50.0)), 1);
        tracker.apply_update(a, Some(CursorPosition::new(100.0, 0.0)), 2);

        let shown = tracker.step_all(Duration::from_millis(150));
        assert_eq!(shown.len(), 2);
        let a_pos = shown.iter().find(|(id, _)| *id == a).map(|(_, p)| *p);
        assert_eq!(a_pos, Some(CursorPosition::new(100.0, 0.0)));
    }

    #[test]
    fn test_sweep_idle_flags_stale_users() {
        let fresh = UserPresence::new(User::new("fresh", "f@example.com"), 10_000);
        let stale = UserPresence::new(User::new("stale", "s@example.com"), 1_000);
        let users = vec![fresh.clone(), stale.clone()];

        let swept = sweep_idle(&users, 70_000, Duration::from_secs(60)).unwrap();
        assert!(!swept.iter().find(|p| p.user_id == stale.user_id).unwrap().is_active);
        assert!(swept.iter().find(|p| p.user_id == fresh.user_id).unwrap().is_active);
    }

    #[test]
    fn test_sweep_idle_none_when_everyone_fresh() {
        let users = vec![UserPresence::new(User::new("a", "a@example.com"), 65_000)];
        assert!(sweep_idle(&users, 70_000, Duration::from_secs(60)).is_none());

        // already-inactive users do not retrigger the sweep
        let mut inactive = UserPresence::new(User::new("b", "b@example.com"), 0);
        inactive.is_active = false;
        assert!(sweep_idle(&[inactive], 70_000, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_throttle_first_update_sends_immediately() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();

        let sent = throttle.submit(Some(CursorPosition::new(1.0, 1.0)), t0);
        assert_eq!(sent, Some(Some(CursorPosition::new(1.0, 1.0))));
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_throttle_coalesces_last_value_wins() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();

        throttle.submit(Some(CursorPosition::new(1.0, 1.0)), t0);
        assert!(throttle
            .submit(Some(CursorPosition::new(2.0, 2.0)), t0 + Duration::from_millis(10))
            .is_none());
        assert!(throttle
            .submit(Some(CursorPosition::new(3.0, 3.0)), t0 + Duration::from_millis(20))
            .is_none());
        assert!(throttle.has_pending());

        // window still closed
        assert!(throttle.take_due(t0 + Duration::from_millis(40)).is_none());
        // window reopened, only the newest position goes out
        let flushed = throttle.take_due(t0 + Duration::from_millis(50));
        assert_eq!(flushed, Some(CursorPosition::new(3.0, 3.0)));
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_throttle_reopened_window_sends_inline() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();

        throttle.submit(Some(CursorPosition::new(1.0, 1.0)), t0);
        let sent = throttle.submit(Some(CursorPosition::new(2.0, 2.0)), t0 + Duration::from_millis(60));
        assert_eq!(sent, Some(Some(CursorPosition::new(2.0, 2.0))));
    }

    #[test]
    fn test_throttle_clear_bypasses_window() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();

        throttle.submit(Some(CursorPosition::new(1.0, 1.0)), t0);
        throttle.submit(Some(CursorPosition::new(2.0, 2.0)), t0 + Duration::from_millis(10));

        let sent = throttle.submit(None, t0 + Duration::from_millis(20));
        assert_eq!(sent, Some(None));
        // the coalesced position died with the clear
        assert!(!throttle.has_pending());
        assert!(throttle.take_due(t0 + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_throttle_deadline_tracks_pending() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        assert!(throttle.deadline().is_none());

        throttle.submit(Some(CursorPosition::new(1.0, 1.0)), t0);
        throttle.submit(Some(CursorPosition::new(2.0, 2.0)), t0 + Duration::from_millis(10));
        assert_eq!(throttle.deadline(), Some(t0 + Duration::from_millis(50)));

        throttle.reset();
        assert!(throttle.deadline().is_none());
        assert!(!throttle.has_pending());
    }
}

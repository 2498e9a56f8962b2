//! A single sliding-window counter for one `(model, dimension)` pair.

use std::time::Duration;

use tokio::time::Instant;

/// A snapshot of one counter window at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Units currently reserved (tentatively promised to in-flight jobs).
    pub reserved: u64,
    /// Units already committed (charged) in the current window.
    pub committed: u64,
    /// `limit - reserved - committed`, saturating at zero.
    pub remaining: u64,
    /// Milliseconds until the current window rolls over.
    pub resets_in_ms: u64,
}

/// One sliding-window counter, e.g. tokens-per-minute for a single model.
///
/// Windows are nominally 60s (minute) or 86_400s (day); boundaries are aligned to
/// `epoch_ms % window_ms` so independent instances agree on window boundaries without
/// coordination.
#[derive(Debug)]
pub struct CounterWindow {
    limit: u64,
    window: Duration,
    reserved: u64,
    committed: u64,
    window_start: Instant,
    /// Wall-clock epoch corresponding to `window_start`, used only for alignment math.
    epoch_origin_ms: u64,
}

impl CounterWindow {
    /// Creates a window with the given `limit` over the given `window` duration.
    ///
    /// `now` and `now_epoch_ms` must refer to the same instant; the latter is used only
    /// to align window boundaries to `epoch_ms % window_ms`.
    pub fn new(limit: u64, window: Duration, now: Instant, now_epoch_ms: u64) -> Self {
        let window_ms = window.as_millis().max(1) as u64;
        let aligned_start_epoch = now_epoch_ms - (now_epoch_ms % window_ms);
        let behind = now_epoch_ms - aligned_start_epoch;
        Self {
            limit,
            window,
            reserved: 0,
            committed: 0,
            window_start: now - Duration::from_millis(behind),
            epoch_origin_ms: aligned_start_epoch,
        }
    }

    /// Rolls the window forward if `now` has passed the current window's end.
    ///
    /// Reservations do NOT reset with the window — they track in-flight work, which can
    /// span windows. Only `committed` resets.
    fn roll_if_expired(&mut self, now: Instant) {
        if now >= self.window_start + self.window {
            let window_ms = self.window.as_millis().max(1) as u64;
            let elapsed_ms = (now - self.window_start).as_millis() as u64;
            let windows_elapsed = elapsed_ms / window_ms;
            self.window_start += self.window * windows_elapsed.max(1) as u32;
            self.epoch_origin_ms += window_ms * windows_elapsed.max(1);
            self.committed = 0;
        }
    }

    /// Attempts to reserve `n` units, succeeding iff `reserved + committed + n <= limit`.
    ///
    /// On success, `reserved` is incremented by `n` and `true` is returned; on failure
    /// nothing changes.
    pub fn try_reserve(&mut self, n: u64, now: Instant) -> bool {
        self.roll_if_expired(now);
        if self.reserved + self.committed + n <= self.limit {
            self.reserved += n;
            true
        } else {
            false
        }
    }

    /// Releases a reservation that will never be committed (the attempt failed before
    /// the model was invoked, or the caller is rolling back a partial reservation).
    pub fn release(&mut self, n: u64, now: Instant) {
        self.roll_if_expired(now);
        self.reserved = self.reserved.saturating_sub(n);
    }

    /// Commits the actual usage for a reservation, replacing the provisional hold.
    ///
    /// `reserved` here is the amount originally reserved for this attempt; it is removed
    /// from the outstanding `reserved` total, and `actual` is added to `committed`.
    /// Over-use (actual > reserved) is allowed to push `committed` past `limit`; it
    /// simply blocks the next reservation.
    pub fn commit(&mut self, actual: u64, reserved: u64, now: Instant) {
        self.roll_if_expired(now);
        self.reserved = self.reserved.saturating_sub(reserved);
        self.committed += actual;
    }

    /// A read-only snapshot of the window's state, rolling it forward first if expired.
    pub fn snapshot(&mut self, now: Instant) -> WindowSnapshot {
        self.roll_if_expired(now);
        let used = self.reserved + self.committed;
        let remaining = self.limit.saturating_sub(used);
        let window_ms = self.window.as_millis().max(1) as u64;
        let elapsed_ms = (now - self.window_start).as_millis() as u64;
        WindowSnapshot {
            reserved: self.reserved,
            committed: self.committed,
            remaining,
            resets_in_ms: window_ms.saturating_sub(elapsed_ms),
        }
    }

    /// Whether a reservation of `n` units would currently succeed, without reserving it.
    ///
    /// Like [`crate::model_limiter::ModelLimiter::has_capacity`], this is a cheap,
    /// non-reserving predicate: its answer can become stale immediately.
    pub fn has_capacity(&mut self, n: u64, now: Instant) -> bool {
        self.roll_if_expired(now);
        self.reserved + self.committed + n <= self.limit
    }

    /// Replaces the limit in place. Currently reserved/committed units are not rescaled.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// The currently configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(limit: u64, dur: Duration) -> CounterWindow {
        CounterWindow::new(limit, dur, Instant::now(), 0)
    }

    #[test]
    fn reserve_then_release_restores_capacity() {
        let mut w = window(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(w.try_reserve(7, now));
        assert!(!w.try_reserve(5, now), "7 + 5 > 10");
        w.release(7, now);
        assert!(w.try_reserve(10, now));
    }

    #[test]
    fn commit_replaces_reservation_with_actual() {
        let mut w = window(1000, Duration::from_secs(60));
        let now = Instant::now();
        assert!(w.try_reserve(100, now));
        w.commit(40, 100, now);
        let snap = w.snapshot(now);
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.committed, 40);
        assert_eq!(snap.remaining, 960);
    }

    #[test]
    fn overuse_is_allowed_but_blocks_next_reservation() {
        let mut w = window(1000, Duration::from_secs(60));
        let now = Instant::now();
        assert!(w.try_reserve(100, now));
        w.commit(1100, 100, now);
        assert!(!w.has_capacity(1, now), "committed already exceeds limit");
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_reservation_survives_window_roll() {
        let mut w = window(100, Duration::from_secs(60));
        let now = Instant::now();
        assert!(w.try_reserve(50, now));

        tokio::time::advance(Duration::from_secs(61)).await;
        let now = Instant::now();

        let snap = w.snapshot(now);
        assert_eq!(snap.committed, 0, "committed resets with the window");
        assert_eq!(snap.reserved, 50, "reservation persists across the window roll");

        w.commit(200, 50, now);
        let snap = w.snapshot(now);
        assert_eq!(snap.committed, 200, "overuse reported even though it exceeds limit");
    }
}

//! Heartbeat liveness and watchdog state owned by the connection worker.
//!
//! Everything here is plain state driven by timestamps passed in by the
//! caller. The worker feeds tokio's clock for heartbeats and the injected
//! wall clock for suspend detection.

use std::time::Duration;

use tokio::time::Instant;

/// Liveness of one peer derived from its pong stream.
#[derive(Clone, Debug)]
pub struct PeerLiveness {
    allowed_silence: Duration,
    last_pong: Option<Instant>,
    alive: bool,
    stale_reported: bool,
}

impl PeerLiveness {
    pub fn new(allowed_silence: Duration) -> Self {
        Self {
            allowed_silence,
            last_pong: None,
            alive: false,
            stale_reported: false,
        }
    }

    /// Starts a fresh observation window.
    ///
    /// With `baseline = None` the peer cannot go stale before its first pong.
    pub fn reset(&mut self, baseline: Option<Instant>) {
        self.last_pong = baseline;
        self.alive = false;
        self.stale_reported = false;
    }

    /// Records a pong. Returns `true` when the peer just became alive.
    pub fn record_pong(&mut self, now: Instant) -> bool {
        self.last_pong = Some(now);
        self.stale_reported = false;
        let became_alive = !self.alive;
        self.alive = true;
        became_alive
    }

    /// Marks the peer down on an explicit signal. Returns `true` if it was alive.
    pub fn mark_down(&mut self) -> bool {
        let was_alive = self.alive;
        self.alive = false;
        self.stale_reported = true;
        was_alive
    }

    /// Returns `true` exactly once when silence first exceeds the threshold.
    pub fn check(&mut self, now: Instant) -> bool {
        let Some(last_pong) = self.last_pong else {
            return false;
        };
        if self.stale_reported || now.saturating_duration_since(last_pong) <= self.allowed_silence {
            return false;
        }
        self.stale_reported = true;
        self.alive = false;
        true
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// The two independently monitored peers.
#[derive(Clone, Debug)]
pub struct LivenessTracker {
    pub agent: PeerLiveness,
    pub server: PeerLiveness,
}

impl LivenessTracker {
    pub fn new(agent_allowed_silence: Duration, server_allowed_silence: Duration) -> Self {
        Self {
            agent: PeerLiveness::new(agent_allowed_silence),
            server: PeerLiveness::new(server_allowed_silence),
        }
    }

    /// Called when a socket opens. The relay must answer within its window
    /// from the open; the agent is judged only after its first pong.
    pub fn reset_on_open(&mut self, opened_at: Instant) {
        self.agent.reset(None);
        self.server.reset(Some(opened_at));
    }
}

/// Detects host suspend from gaps in wall-clock ticks.
#[derive(Clone, Debug)]
pub struct SuspendDetector {
    tick: Duration,
    last_tick_ms: Option<u64>,
}

impl SuspendDetector {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            last_tick_ms: None,
        }
    }

    /// Records a tick. Returns the gap in ms when it exceeded twice the tick.
    pub fn observe(&mut self, now_ms: u64) -> Option<u64> {
        let previous = self.last_tick_ms.replace(now_ms)?;
        let gap = now_ms.saturating_sub(previous);
        let limit = self.tick.as_millis() as u64 * 2;
        (gap > limit).then_some(gap)
    }
}

/// Reentrancy guard for reconnect attempts.
#[derive(Clone, Debug)]
pub struct ReconnectGuard {
    ceiling: Duration,
    started_at: Option<Instant>,
}

impl ReconnectGuard {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            started_at: None,
        }
    }

    /// Claims the guard. Fails while an attempt is in flight unless that
    /// attempt has exceeded the ceiling.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.started_at.is_some() && !self.is_stuck(now) {
            return false;
        }
        self.started_at = Some(now);
        true
    }

    pub fn is_stuck(&self, now: Instant) -> bool {
        self.started_at
            .is_some_and(|started| now.saturating_duration_since(started) > self.ceiling)
    }

    pub fn in_flight(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn finish(&mut self) {
        self.started_at = None;
    }
}

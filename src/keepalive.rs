//! Keepalive and reconnect supervision state, per connection.
//!
//! A registered connection is either "alive and pinged" or "down and
//! backing off", never both: arming the ping cycle drops any reconnect
//! timer and vice versa. All timer handles live here so that one
//! `teardown` cancels every outstanding wait.

use std::time::Duration;

use crate::state::ServerId;
use crate::timer::Timer;

/// Interval between outbound keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for the matching pong before declaring the link dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect delays in seconds, indexed by attempt; clamped at the last
/// rung for further attempts.
const BACKOFF_LADDER: [u64; 5] = [3, 6, 12, 24, 30];

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let rung = (attempt.max(1) as usize - 1).min(BACKOFF_LADDER.len() - 1);
    Duration::from_secs(BACKOFF_LADDER[rung])
}

#[derive(Default)]
pub struct KeepaliveState {
    ping_timer: Option<Timer>,
    pong_timer: Option<Timer>,
    reconnect_timer: Option<Timer>,
    /// Token of the ping currently awaiting its pong.
    outstanding_ping: Option<String>,
    ping_serial: u64,
    /// Reconnect attempts since the last successful registration.
    pub attempts: u32,
    /// Set by an explicit disconnect; cleared on the next registration.
    /// While set, a close never schedules a reconnect.
    pub suppress_reconnect: bool,
}

impl KeepaliveState {
    pub fn new() -> Self {
        KeepaliveState::default()
    }

    /// Arm the next ping-interval timer. Drops any reconnect timer: an
    /// alive connection is not backing off.
    pub fn arm_ping(&mut self, timer: Timer) {
        self.reconnect_timer = None;
        self.ping_timer = Some(timer);
    }

    /// A unique token for the next outbound PING.
    pub fn next_ping_token(&mut self, conn: ServerId) -> String {
        self.ping_serial += 1;
        format!("skiff-{}-{}", conn.0, self.ping_serial)
    }

    /// The ping went out: remember its token and arm the pong timeout.
    pub fn ping_sent(&mut self, token: String, timeout: Timer) {
        self.outstanding_ping = Some(token);
        self.pong_timer = Some(timeout);
    }

    /// A pong arrived. Cancels the timeout only when the token matches
    /// the outstanding ping; stale pongs are not evidence of liveness.
    pub fn pong_received(&mut self, token: &str) -> bool {
        if self.outstanding_ping.as_deref() == Some(token) {
            self.outstanding_ping = None;
            self.pong_timer = None;
            true
        } else {
            false
        }
    }

    /// Bump the attempt counter and return it with the ladder delay.
    pub fn next_attempt(&mut self) -> (u32, Duration) {
        self.attempts += 1;
        (self.attempts, backoff_delay(self.attempts))
    }

    /// Arm the reconnect timer. Drops the ping cycle: a connection that
    /// is backing off is not being pinged.
    pub fn arm_reconnect(&mut self, timer: Timer) {
        self.ping_timer = None;
        self.pong_timer = None;
        self.outstanding_ping = None;
        self.reconnect_timer = Some(timer);
    }

    /// The reconnect timer fired; it is spent.
    pub fn reconnect_due(&mut self) -> bool {
        self.reconnect_timer.take().is_some()
    }

    /// Registration succeeded: reset the ladder and the suppression flag.
    pub fn registered(&mut self) {
        self.attempts = 0;
        self.suppress_reconnect = false;
    }

    /// Cancel every outstanding timer. Called on any disconnect path.
    pub fn teardown(&mut self) {
        self.ping_timer = None;
        self.pong_timer = None;
        self.reconnect_timer = None;
        self.outstanding_ping = None;
    }

    pub fn is_backing_off(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn has_outstanding_ping(&self) -> bool {
        self.outstanding_ping.is_some()
    }
}

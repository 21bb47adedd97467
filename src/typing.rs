//! Per-buffer typing indicators with auto-expiry.
//!
//! The tracker owns one expiry [`Timer`] per (buffer, user) pair. The
//! visible typing set lives on the buffer itself; the engine keeps the
//! two in step. An entry dies on a "done" signal, on a message from the
//! user, or when its timer fires, whichever comes first.

use std::collections::HashMap;
use std::time::Duration;

use crate::state::{BufferId, ServerId};
use crate::timer::Timer;

/// How long a typing signal stays live without a refresh.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct TypingTracker {
    timers: HashMap<(BufferId, String), Timer>,
}

impl TypingTracker {
    pub fn new() -> Self {
        TypingTracker::default()
    }

    /// Start or refresh a typing entry. Replacing the timer drops (and
    /// thereby cancels) the previous one.
    pub fn set(&mut self, buffer: &BufferId, user: &str, expiry: Timer) {
        self.timers
            .insert((buffer.clone(), user.to_string()), expiry);
    }

    /// Stop tracking a pair; cancels its timer. Returns whether an entry
    /// existed.
    pub fn clear(&mut self, buffer: &BufferId, user: &str) -> bool {
        self.timers
            .remove(&(buffer.clone(), user.to_string()))
            .is_some()
    }

    /// Timer fired: forget the entry. Returns false if it was already
    /// cleared by another path (stale fire).
    pub fn expire(&mut self, buffer: &BufferId, user: &str) -> bool {
        self.clear(buffer, user)
    }

    /// Drop every entry belonging to a connection, cancelling the timers.
    pub fn clear_server(&mut self, server: ServerId) {
        self.timers.retain(|(buffer, _), _| buffer.server() != server);
    }

    pub fn is_tracking(&self, buffer: &BufferId, user: &str) -> bool {
        self.timers
            .contains_key(&(buffer.clone(), user.to_string()))
    }
}

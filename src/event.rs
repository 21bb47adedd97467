//! Events the engine emits for the UI layer to consume.
//!
//! The engine owns the buffer store outright once its dispatch loop is
//! running, so every event carries the data a subscriber needs to keep
//! its own view current.

use crate::client::ConnectionState;
use crate::state::{BufferId, ChatMessage, Member, Reaction, ServerId};

#[derive(Debug, Clone)]
pub enum Event {
    /// A connection changed lifecycle state.
    ConnectionState {
        server: ServerId,
        state: ConnectionState,
    },

    /// Registration completed; `nick` is the confirmed nickname.
    Registered { server: ServerId, nick: String },

    /// Our nickname changed (collision retry or confirmed NICK).
    NickChanged { server: ServerId, nick: String },

    /// The negotiated capability set grew.
    CapsUpdated { server: ServerId, caps: Vec<String> },

    /// A buffer was created.
    BufferOpened { buffer: BufferId },

    /// A buffer was destroyed (self-part, server removal).
    BufferClosed { buffer: BufferId },

    /// A buffer's message history and unread accounting were dropped
    /// (pre-reconnect).
    BufferCleared { buffer: BufferId },

    /// A message was appended to a buffer.
    MessageAdded {
        buffer: BufferId,
        message: ChatMessage,
    },

    /// An existing message's reaction set changed in place.
    MessageUpdated {
        buffer: BufferId,
        message_id: u64,
        reactions: Vec<Reaction>,
    },

    /// A channel's member list changed; `members` is the full new list.
    MembersChanged {
        buffer: BufferId,
        members: Vec<Member>,
    },

    /// A buffer's unread count or mention flag changed.
    UnreadChanged {
        buffer: BufferId,
        unread: u32,
        mentioned: bool,
    },

    /// A channel topic was set or received.
    TopicChanged {
        buffer: BufferId,
        topic: Option<String>,
    },

    /// The set of users typing in a buffer changed.
    TypingChanged {
        buffer: BufferId,
        users: Vec<String>,
    },

    /// A protocol- or application-level error worth surfacing.
    Error { server: ServerId, text: String },
}

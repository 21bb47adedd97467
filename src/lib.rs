//! Protocol connection engine for the skiff terminal IRC client.
//!
//! Owns the transport socket per server, drives IRC registration
//! (CAP negotiation, SASL PLAIN, nick-collision recovery), keeps
//! connections alive (ping/pong, backoff reconnect), and projects the
//! decoded event stream onto in-memory conversation state. The UI layer
//! drives the engine through a command handle and subscribes to the
//! typed [`event::Event`] stream, which carries the changed data for
//! every mutation; it never touches engine state directly.

pub mod batch;
pub mod client;
pub mod event;
pub mod irc;
pub mod keepalive;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;
pub mod typing;

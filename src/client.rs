//! The connection engine: one dispatch loop per session, one transport
//! per configured server.
//!
//! All protocol events, timer firings, and buffer mutations are
//! serialized onto the [`Session`] dispatch sequence; per-connection
//! socket I/O runs in spawned tasks that feed it. Registration, the
//! keepalive/reconnect supervisor, and buffer projection all live here
//! and operate on an explicit [`Connection`] state struct.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::{BatchKind, PendingReaction, Reconciler};
use crate::event::Event;
use crate::irc::Line;
use crate::keepalive::{KeepaliveState, PING_INTERVAL, PONG_TIMEOUT};
use crate::state::{
    apply_mode_string, is_mention, BufferId, ChatMessage, Member, MessageKind, ServerId, State,
};
use crate::store::{ChannelRecord, ServerRecord, Store};
use crate::timer::Timer;
use crate::transport::{Target, Transport};
use crate::typing::{TypingTracker, TYPING_EXPIRY};

/// Capabilities requested when the server offers them. SASL is added
/// separately when credentials are configured.
const WANTED_CAPS: &[&str] = &[
    "message-tags",
    "server-time",
    "account-tag",
    "batch",
    "echo-message",
    "draft/chathistory",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Registered,
}

/// Requests from the UI layer.
#[derive(Debug)]
pub enum Command {
    Connect(ServerId),
    Disconnect(ServerId),
    Join {
        server: ServerId,
        channel: String,
    },
    Part {
        server: ServerId,
        channel: String,
        reason: Option<String>,
    },
    SendMessage {
        buffer: BufferId,
        text: String,
    },
    SendAction {
        buffer: BufferId,
        text: String,
    },
    SendTyping {
        buffer: BufferId,
        active: bool,
    },
    React {
        buffer: BufferId,
        msgid: String,
        emoji: String,
        remove: bool,
    },
    OpenPrivate {
        server: ServerId,
        nick: String,
    },
    SetFocus(Option<BufferId>),
    ChangeNick {
        server: ServerId,
        nick: String,
    },
    Raw {
        server: ServerId,
        line: String,
    },
    AddServer(ServerRecord),
    UpdateServer(ServerRecord),
    RemoveServer(ServerId),
    SaveChannel(ChannelRecord),
    ForgetChannel {
        server: ServerId,
        name: String,
    },
}

/// Everything funnelled into the single dispatch sequence.
#[derive(Debug)]
enum Dispatch {
    Line { server: ServerId, line: String },
    Opened { server: ServerId },
    Closed { server: ServerId, reason: String },
    PingDue { server: ServerId },
    PongTimeout { server: ServerId },
    ReconnectDue { server: ServerId },
    TypingExpired { buffer: BufferId, user: String },
    Command(Command),
}

/// Per-server connection state. Owns its transport writer, timers,
/// capability set, and batch/reaction bookkeeping, so disconnect
/// teardown is a matter of dropping fields.
struct Connection {
    id: ServerId,
    config: ServerRecord,
    nick: String,
    state: ConnectionState,
    caps: HashSet<String>,
    offered_caps: HashSet<String>,
    sasl_in_flight: bool,
    out_tx: Option<mpsc::UnboundedSender<String>>,
    socket_task: Option<JoinHandle<()>>,
    keepalive: KeepaliveState,
    reconciler: Reconciler,
}

impl Connection {
    fn new(config: ServerRecord) -> Self {
        Connection {
            id: config.id,
            nick: config.nick.clone(),
            config,
            state: ConnectionState::Disconnected,
            caps: HashSet::new(),
            offered_caps: HashSet::new(),
            sasl_in_flight: false,
            out_tx: None,
            socket_task: None,
            keepalive: KeepaliveState::new(),
            reconciler: Reconciler::new(),
        }
    }

    fn sasl_configured(&self) -> bool {
        self.config.sasl_user.is_some() && self.config.sasl_pass.is_some()
    }

    fn send(&self, line: Line) {
        self.send_raw(line.to_string());
    }

    fn send_raw(&self, line: impl Into<String>) {
        let line = line.into();
        match &self.out_tx {
            Some(tx) => {
                let _ = tx.send(line);
            }
            None => tracing::debug!(server = %self.id, line, "dropping outbound line, no transport"),
        }
    }

    fn target(&self) -> Target {
        Target::new(&self.config.host, self.config.port, self.config.tls)
    }
}

/// Handle for the UI layer to drive the engine.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl SessionHandle {
    pub fn command(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(Dispatch::Command(cmd))
            .map_err(|_| anyhow::anyhow!("session is gone"))
    }

    pub fn connect(&self, server: ServerId) -> Result<()> {
        self.command(Command::Connect(server))
    }

    pub fn disconnect(&self, server: ServerId) -> Result<()> {
        self.command(Command::Disconnect(server))
    }

    pub fn send_message(&self, buffer: BufferId, text: &str) -> Result<()> {
        self.command(Command::SendMessage {
            buffer,
            text: text.to_string(),
        })
    }

    pub fn set_focus(&self, buffer: Option<BufferId>) -> Result<()> {
        self.command(Command::SetFocus(buffer))
    }
}

/// The engine. Owns the buffer store and every connection; all state
/// mutation happens on its dispatch sequence.
pub struct Session {
    pub state: State,
    store: Store,
    connections: HashMap<ServerId, Connection>,
    typing: TypingTracker,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatch_rx: Option<mpsc::UnboundedReceiver<Dispatch>>,
    event_tx: mpsc::UnboundedSender<Event>,
}

/// A decoded message on its way into a buffer.
struct Incoming {
    buffer: BufferId,
    name: String,
    kind: MessageKind,
    sender: String,
    text: String,
    msgid: Option<String>,
    reply_to: Option<String>,
    time: DateTime<Utc>,
    lines: Option<Vec<String>>,
    replay: bool,
    counts_unread: bool,
}

impl Incoming {
    fn system(buffer: BufferId, name: &str, text: &str) -> Self {
        Incoming {
            buffer,
            name: name.to_string(),
            kind: MessageKind::System,
            sender: String::new(),
            text: text.to_string(),
            msgid: None,
            reply_to: None,
            time: Utc::now(),
            lines: None,
            replay: false,
            counts_unread: false,
        }
    }
}

impl Session {
    /// Build a session over a persistence store. Configured servers are
    /// loaded into disconnected connections with their server buffers
    /// opened.
    pub fn new(store: Store) -> Result<(Self, SessionHandle, mpsc::UnboundedReceiver<Event>)> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            state: State::new(),
            store,
            connections: HashMap::new(),
            typing: TypingTracker::new(),
            dispatch_tx: dispatch_tx.clone(),
            dispatch_rx: Some(dispatch_rx),
            event_tx,
        };
        for record in session.store.list_servers()? {
            session.insert_server(record);
        }
        Ok((session, SessionHandle { tx: dispatch_tx }, event_rx))
    }

    /// Drive the dispatch loop until every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        let mut rx = self
            .dispatch_rx
            .take()
            .context("session is already running")?;
        while let Some(dispatch) = rx.recv().await {
            self.dispatch(dispatch);
        }
        Ok(())
    }

    fn insert_server(&mut self, record: ServerRecord) {
        let id = record.id;
        let host = record.host.clone();
        self.state.buffer_mut(BufferId::Server(id), &host);
        self.connections.insert(id, Connection::new(record));
        self.emit(Event::BufferOpened {
            buffer: BufferId::Server(id),
        });
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Member-list change notification carrying the full new list.
    fn emit_members(&self, buffer: &BufferId) {
        let members = self
            .state
            .buffer(buffer)
            .map(|b| b.members.clone())
            .unwrap_or_default();
        self.emit(Event::MembersChanged {
            buffer: buffer.clone(),
            members,
        });
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Line { server, line } => self.handle_line(server, &line),
            Dispatch::Opened { server } => self.handle_opened(server),
            Dispatch::Closed { server, reason } => self.handle_closed(server, &reason),
            Dispatch::PingDue { server } => self.handle_ping_due(server),
            Dispatch::PongTimeout { server } => self.handle_pong_timeout(server),
            Dispatch::ReconnectDue { server } => self.handle_reconnect_due(server),
            Dispatch::TypingExpired { buffer, user } => self.handle_typing_expired(&buffer, &user),
            Dispatch::Command(cmd) => self.handle_command(cmd),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn start_connect(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if conn.state != ConnectionState::Disconnected {
            return;
        }
        conn.state = ConnectionState::Connecting;
        conn.nick = conn.config.nick.clone();
        let target = conn.target();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        conn.out_tx = Some(out_tx);

        let dtx = self.dispatch_tx.clone();
        conn.socket_task = Some(tokio::spawn(async move {
            let mut transport = Transport::new();
            match transport.open(&target).await {
                Ok(reader) => {
                    let _ = dtx.send(Dispatch::Opened { server });
                    run_socket(server, transport, reader, out_rx, dtx).await;
                }
                Err(e) => {
                    let _ = dtx.send(Dispatch::Closed {
                        server,
                        reason: e.to_string(),
                    });
                }
            }
        }));
        tracing::info!(%server, host = %self.connections[&server].config.host, "connecting");
        self.emit(Event::ConnectionState {
            server,
            state: ConnectionState::Connecting,
        });
    }

    /// Transport reached OPEN: begin registration.
    fn handle_opened(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        if conn.out_tx.is_none() {
            // Disconnected while the connect was in flight. The aborted
            // task never reports Closed, so transition here.
            if let Some(task) = conn.socket_task.take() {
                task.abort();
            }
            conn.state = ConnectionState::Disconnected;
            self.emit(Event::ConnectionState {
                server,
                state: ConnectionState::Disconnected,
            });
            return;
        }
        conn.state = ConnectionState::Registering;
        conn.offered_caps.clear();
        conn.send_raw("CAP LS 302");
        if let Some(password) = conn.config.password.clone() {
            conn.send(Line::cmd("PASS", &[&password]));
        }
        let nick = conn.nick.clone();
        conn.send(Line::cmd("NICK", &[&nick]));
        let username = conn.config.username.clone();
        let realname = conn.config.realname.clone();
        conn.send(Line::cmd("USER", &[&username, "0", "*", &realname]));
        self.emit(Event::ConnectionState {
            server,
            state: ConnectionState::Registering,
        });
    }

    fn handle_closed(&mut self, server: ServerId, reason: &str) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if conn.state == ConnectionState::Disconnected {
            return;
        }
        tracing::info!(%server, reason, "connection closed");
        conn.state = ConnectionState::Disconnected;
        conn.out_tx = None;
        if let Some(task) = conn.socket_task.take() {
            task.abort();
        }
        conn.caps.clear();
        conn.offered_caps.clear();
        conn.sasl_in_flight = false;
        conn.reconciler = Reconciler::new();
        conn.keepalive.teardown();
        let host = conn.config.host.clone();
        let suppress = conn.keepalive.suppress_reconnect;

        self.typing.clear_server(server);
        for id in self.state.server_buffer_ids(server) {
            if let Some(buffer) = self.state.buffers.get_mut(&id) {
                if !buffer.typing.is_empty() {
                    buffer.typing.clear();
                    self.event_tx
                        .send(Event::TypingChanged {
                            buffer: id.clone(),
                            users: Vec::new(),
                        })
                        .ok();
                }
            }
        }

        self.emit(Event::ConnectionState {
            server,
            state: ConnectionState::Disconnected,
        });
        if suppress {
            self.append_message(Incoming::system(
                BufferId::Server(server),
                &host,
                &format!("Disconnected from {host}: {reason}"),
            ));
        } else {
            self.schedule_reconnect(server, &host, reason);
        }
    }

    fn schedule_reconnect(&mut self, server: ServerId, host: &str, reason: &str) {
        let dtx = self.dispatch_tx.clone();
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        let (attempt, delay) = conn.keepalive.next_attempt();
        conn.keepalive
            .arm_reconnect(Timer::spawn(delay, dtx, Dispatch::ReconnectDue { server }));

        // Message history will be re-requested after registration, so
        // the stale copy goes now.
        for id in self.state.server_buffer_ids(server) {
            if let Some(buffer) = self.state.buffers.get_mut(&id) {
                buffer.clear();
            }
            self.emit(Event::BufferCleared { buffer: id });
        }
        self.append_message(Incoming::system(
            BufferId::Server(server),
            host,
            &format!(
                "Disconnected from {host}: {reason}; reconnecting in {}s (attempt {attempt})",
                delay.as_secs()
            ),
        ));
    }

    fn handle_reconnect_due(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if !conn.keepalive.reconnect_due() || conn.state != ConnectionState::Disconnected {
            return;
        }
        self.start_connect(server);
    }

    fn user_disconnect(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        conn.keepalive.suppress_reconnect = true;
        conn.keepalive.teardown();
        if conn.state == ConnectionState::Disconnected {
            return;
        }
        conn.send_raw("QUIT :leaving");
        // Dropping the sender lets the socket task flush the QUIT and
        // then close; the Closed dispatch finishes the teardown.
        conn.out_tx = None;
    }

    /// Hard-fail a connection from inside the engine (ping timeout).
    fn fail_connection(&mut self, server: ServerId, reason: &str) {
        if let Some(conn) = self.connections.get_mut(&server) {
            conn.out_tx = None;
            if let Some(task) = conn.socket_task.take() {
                task.abort();
            }
        }
        self.handle_closed(server, reason);
    }

    // ── Keepalive ───────────────────────────────────────────────────

    fn handle_ping_due(&mut self, server: ServerId) {
        let dtx = self.dispatch_tx.clone();
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if conn.state != ConnectionState::Registered {
            return;
        }
        let token = conn.keepalive.next_ping_token(server);
        conn.send_raw(format!("PING :{token}"));
        conn.keepalive.ping_sent(
            token,
            Timer::spawn(PONG_TIMEOUT, dtx.clone(), Dispatch::PongTimeout { server }),
        );
        conn.keepalive
            .arm_ping(Timer::spawn(PING_INTERVAL, dtx, Dispatch::PingDue { server }));
    }

    fn handle_pong_timeout(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get(&server) else {
            return;
        };
        if !conn.keepalive.has_outstanding_ping() {
            return;
        }
        tracing::warn!(%server, "ping timeout");
        self.fail_connection(server, "ping timeout");
    }

    // ── Protocol dispatch ───────────────────────────────────────────

    fn handle_line(&mut self, server: ServerId, raw: &str) {
        if !self.connections.contains_key(&server) {
            return;
        }
        let Some(line) = Line::parse(raw) else {
            tracing::debug!(%server, raw, "dropping malformed line");
            return;
        };
        match line.command.as_str() {
            "PING" => {
                let token = line.trailing().to_string();
                if let Some(conn) = self.connections.get(&server) {
                    conn.send(Line::cmd("PONG", &[&token]));
                }
            }
            "PONG" => {
                if let Some(conn) = self.connections.get_mut(&server) {
                    conn.keepalive.pong_received(line.trailing());
                }
            }
            "CAP" => self.on_cap(server, &line),
            "AUTHENTICATE" => self.on_authenticate(server, &line),
            "001" => self.on_welcome(server, &line),
            "433" => self.on_nick_collision(server, &line),
            "903" => self.on_sasl_result(server, true, &line),
            "904" | "905" | "906" | "907" => self.on_sasl_result(server, false, &line),
            "353" => self.on_names(server, &line),
            "366" => {
                if let Some(channel) = line.params.get(1) {
                    self.emit_members(&BufferId::channel(server, channel));
                }
            }
            "331" | "332" => self.on_topic_numeric(server, &line),
            "482" => self.on_operator_needed(server, &line),
            "JOIN" => self.on_join(server, &line),
            "PART" => self.on_part(server, &line),
            "QUIT" => self.on_quit(server, &line),
            "KICK" => self.on_kick(server, &line),
            "NICK" => self.on_nick(server, &line),
            "MODE" => self.on_mode(server, &line),
            "TOPIC" => self.on_topic(server, &line),
            "PRIVMSG" => self.on_privmsg(server, &line, false),
            "NOTICE" => self.on_privmsg(server, &line, true),
            "TAGMSG" => self.on_tagmsg(server, &line),
            "BATCH" => self.on_batch(server, &line),
            "ERROR" => {
                let host = self.host_of(server);
                self.append_message(Incoming::system(
                    BufferId::Server(server),
                    &host,
                    &format!("Server error: {}", line.trailing()),
                ));
            }
            cmd if cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit()) => {
                self.on_numeric(server, &line);
            }
            _ => {}
        }
    }

    // ── Registration ────────────────────────────────────────────────

    fn on_cap(&mut self, server: ServerId, line: &Line) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        // The capability set is frozen once registration completes.
        if conn.state == ConnectionState::Registered {
            return;
        }
        let sub = line.params.get(1).map(|s| s.to_ascii_uppercase());
        match sub.as_deref() {
            Some("LS") => {
                for cap in line.trailing().split_whitespace() {
                    let name = cap.split('=').next().unwrap_or(cap);
                    conn.offered_caps.insert(name.to_string());
                }
                // A `*` marker before the list means more LS lines follow.
                let more = line.params.len() >= 4 && line.params.get(2).is_some_and(|p| p == "*");
                if more {
                    return;
                }
                let mut request: Vec<&str> = WANTED_CAPS
                    .iter()
                    .copied()
                    .filter(|cap| conn.offered_caps.contains(*cap))
                    .collect();
                if conn.sasl_configured() && conn.offered_caps.contains("sasl") {
                    request.push("sasl");
                }
                if request.is_empty() {
                    conn.send_raw("CAP END");
                } else {
                    conn.send_raw(format!("CAP REQ :{}", request.join(" ")));
                }
            }
            Some("ACK") => {
                let granted: Vec<String> = line
                    .trailing()
                    .split_whitespace()
                    .map(|c| c.to_string())
                    .collect();
                for cap in &granted {
                    conn.caps.insert(cap.clone());
                }
                let mut caps: Vec<String> = conn.caps.iter().cloned().collect();
                caps.sort();
                if granted.iter().any(|c| c == "sasl") && conn.sasl_configured() {
                    conn.sasl_in_flight = true;
                    conn.send_raw("AUTHENTICATE PLAIN");
                } else if !conn.sasl_in_flight {
                    conn.send_raw("CAP END");
                }
                self.emit(Event::CapsUpdated { server, caps });
            }
            Some("NAK") => {
                conn.send_raw("CAP END");
            }
            _ => {}
        }
    }

    fn on_authenticate(&mut self, server: ServerId, line: &Line) {
        let Some(conn) = self.connections.get(&server) else {
            return;
        };
        if line.params.first().map(|p| p.as_str()) != Some("+") {
            return;
        }
        let (Some(user), Some(pass)) = (
            conn.config.sasl_user.as_deref(),
            conn.config.sasl_pass.as_deref(),
        ) else {
            return;
        };
        let payload = BASE64.encode(format!("{user}\0{user}\0{pass}"));
        conn.send_raw(format!("AUTHENTICATE {payload}"));
    }

    fn on_sasl_result(&mut self, server: ServerId, ok: bool, line: &Line) {
        let host = self.host_of(server);
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        conn.sasl_in_flight = false;
        if conn.state == ConnectionState::Registering {
            conn.send_raw("CAP END");
        }
        if ok {
            tracing::info!(%server, "SASL authentication succeeded");
            self.append_message(Incoming::system(
                BufferId::Server(server),
                &host,
                "SASL authentication successful",
            ));
        } else {
            let reason = line.trailing().to_string();
            tracing::warn!(%server, reason, "SASL authentication failed");
            self.append_message(Incoming::system(
                BufferId::Server(server),
                &host,
                &format!("SASL authentication failed: {reason}"),
            ));
            self.emit(Event::Error {
                server,
                text: format!("SASL authentication failed: {reason}"),
            });
        }
    }

    fn on_nick_collision(&mut self, server: ServerId, line: &Line) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if conn.state == ConnectionState::Registered {
            // A failed /nick attempt, not a registration collision.
            self.on_numeric(server, line);
            return;
        }
        conn.nick.push('_');
        let nick = conn.nick.clone();
        conn.send(Line::cmd("NICK", &[&nick]));
        self.emit(Event::NickChanged { server, nick });
    }

    fn on_welcome(&mut self, server: ServerId, line: &Line) {
        let dtx = self.dispatch_tx.clone();
        let autojoin = self.store.autojoin_channels(server).unwrap_or_default();
        let open_channels: Vec<String> = self
            .state
            .server_buffer_ids(server)
            .into_iter()
            .filter(|id| matches!(id, BufferId::Channel(..)))
            .filter_map(|id| self.state.buffer(&id).map(|b| b.name.clone()))
            .collect();

        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        conn.state = ConnectionState::Registered;
        if let Some(confirmed) = line.params.first() {
            if !confirmed.is_empty() {
                conn.nick = confirmed.clone();
            }
        }
        conn.keepalive.registered();
        conn.keepalive
            .arm_ping(Timer::spawn(PING_INTERVAL, dtx, Dispatch::PingDue { server }));

        // Rejoin what is open, then auto-join what is flagged in the
        // store and not already an open buffer.
        let mut join_set: BTreeSet<String> = open_channels
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let mut to_join: Vec<String> = open_channels;
        for channel in autojoin {
            if join_set.insert(channel.to_lowercase()) {
                to_join.push(channel);
            }
        }
        for channel in to_join {
            conn.send(Line::cmd("JOIN", &[&channel]));
        }

        let nick = conn.nick.clone();
        let host = conn.config.host.clone();
        tracing::info!(%server, %nick, "registered");
        self.emit(Event::ConnectionState {
            server,
            state: ConnectionState::Registered,
        });
        self.emit(Event::Registered {
            server,
            nick,
        });
        self.append_message(Incoming::system(
            BufferId::Server(server),
            &host,
            line.trailing(),
        ));
    }

    // ── Projection handlers ─────────────────────────────────────────

    fn on_privmsg(&mut self, server: ServerId, line: &Line, notice: bool) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let Some(target) = line.params.first().cloned() else {
            return;
        };
        let Some(mut text) = line.params.get(1).cloned() else {
            return;
        };

        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            let replay = conn.reconciler.is_replay(line.tag("batch"));
            // Lines inside a multiline batch are collected, not appended.
            if let Some(batch_id) = line.tag("batch") {
                if let Some(batch) = conn.reconciler.batch_mut(batch_id) {
                    if matches!(batch.kind, BatchKind::Multiline { .. }) {
                        if batch.sender.is_none() {
                            batch.sender = Some(sender);
                        }
                        let concat = line.tags.contains_key("draft/multiline-concat");
                        batch.parts.push((text, concat));
                        return;
                    }
                }
            }
            (conn.nick.clone(), replay)
        };

        let mut kind = if notice {
            MessageKind::Notice
        } else if is_channel(&target) {
            MessageKind::Text
        } else {
            MessageKind::Whisper
        };
        if let Some(action) = ctcp_action(&text) {
            kind = MessageKind::Action;
            text = action;
        }

        let from_self = sender.eq_ignore_ascii_case(&own_nick);
        let (buffer, name) = if is_channel(&target) {
            (BufferId::channel(server, &target), target.clone())
        } else if from_self {
            (BufferId::private(server, &target), target.clone())
        } else {
            (BufferId::private(server, &sender), sender.clone())
        };

        let account = line.tag("account").map(str::to_string);
        self.append_message(Incoming {
            buffer: buffer.clone(),
            name,
            kind,
            sender: sender.clone(),
            text,
            msgid: line.tag("msgid").map(str::to_string),
            reply_to: line.tag("+draft/reply").map(str::to_string),
            time: server_time(line),
            lines: None,
            replay,
            counts_unread: true,
        });
        // After the append so a first private message can establish the
        // buffer the account attaches to.
        if let Some(account) = account {
            self.update_account(&buffer, &sender, &account);
        }
    }

    fn on_tagmsg(&mut self, server: ServerId, line: &Line) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let Some(target) = line.params.first().cloned() else {
            return;
        };
        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (conn.nick.clone(), conn.reconciler.is_replay(line.tag("batch")))
        };
        let from_self = sender.eq_ignore_ascii_case(&own_nick);

        if let Some(value) = line.tag("+typing") {
            // Echoes of our own typing signal carry no information.
            if !from_self && !replay {
                let buffer = if is_channel(&target) {
                    BufferId::channel(server, &target)
                } else {
                    BufferId::private(server, &sender)
                };
                if value == "done" {
                    self.clear_typing(&buffer, &sender);
                } else {
                    self.set_typing(buffer, &sender);
                }
            }
        }

        let reaction = line
            .tag("+draft/react")
            .map(|emoji| (emoji.to_string(), false))
            .or_else(|| line.tag("+draft/unreact").map(|e| (e.to_string(), true)));
        if let Some((emoji, remove)) = reaction {
            let Some(msgid) = line.tag("+draft/reply").map(str::to_string) else {
                return;
            };
            let buffer = if let Some(context) = line.tag("+draft/channel-context") {
                BufferId::channel(server, context)
            } else if is_channel(&target) {
                BufferId::channel(server, &target)
            } else if from_self {
                BufferId::private(server, &target)
            } else {
                BufferId::private(server, &sender)
            };
            self.apply_or_hold_reaction(server, buffer, &msgid, &emoji, &sender, remove);
        }
    }

    fn on_batch(&mut self, server: ServerId, line: &Line) {
        let Some(marker) = line.params.first().cloned() else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        if let Some(id) = marker.strip_prefix('+') {
            let kind = match line.params.get(1).map(|s| s.as_str()) {
                Some("chathistory") | Some("draft/chathistory") => BatchKind::Chathistory,
                Some("draft/multiline") | Some("multiline") => BatchKind::Multiline {
                    target: line.params.get(2).cloned().unwrap_or_default(),
                },
                _ => BatchKind::Other,
            };
            conn.reconciler
                .open_batch(id, kind, line.tag("batch"), line.tags.clone());
        } else if let Some(id) = marker.strip_prefix('-') {
            let Some(mut batch) = conn.reconciler.close_batch(id) else {
                return;
            };
            match std::mem::replace(&mut batch.kind, BatchKind::Other) {
                BatchKind::Multiline { target } => {
                    self.finish_multiline(server, target, batch);
                }
                BatchKind::Chathistory => self.sweep_pending(server),
                BatchKind::Other => {}
            }
        }
    }

    fn finish_multiline(&mut self, server: ServerId, target: String, batch: crate::batch::Batch) {
        let Some(sender) = batch.sender else {
            return;
        };
        if batch.parts.is_empty() {
            return;
        }
        let mut text = String::new();
        let mut parts = Vec::with_capacity(batch.parts.len());
        for (part, concat) in batch.parts {
            if !text.is_empty() && !concat {
                text.push('\n');
            }
            text.push_str(&part);
            parts.push(part);
        }

        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (
                conn.nick.clone(),
                conn.reconciler.is_replay(batch.parent.as_deref()),
            )
        };
        let from_self = sender.eq_ignore_ascii_case(&own_nick);
        let (buffer, name, kind) = if is_channel(&target) {
            (
                BufferId::channel(server, &target),
                target.clone(),
                MessageKind::Text,
            )
        } else if from_self {
            (
                BufferId::private(server, &target),
                target.clone(),
                MessageKind::Whisper,
            )
        } else {
            (
                BufferId::private(server, &sender),
                sender.clone(),
                MessageKind::Whisper,
            )
        };

        let time = batch
            .tags
            .get("time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        self.append_message(Incoming {
            buffer,
            name,
            kind,
            sender,
            text,
            msgid: batch.tags.get("msgid").cloned(),
            reply_to: batch.tags.get("+draft/reply").cloned(),
            time,
            lines: Some(parts),
            replay,
            counts_unread: true,
        });
    }

    /// Replay-batch end: apply every held reaction whose target now
    /// exists, drop the rest.
    fn sweep_pending(&mut self, server: ServerId) {
        let Some(conn) = self.connections.get_mut(&server) else {
            return;
        };
        let pending = conn.reconciler.sweep();
        for (msgid, reaction) in pending {
            if let Some(buffer) = self.state.buffers.get_mut(&reaction.buffer) {
                if let Some(message) = buffer.find_by_msgid_mut(&msgid) {
                    if message.apply_reaction(&reaction.emoji, &reaction.reactor, reaction.remove)
                    {
                        let id = message.id;
                        let reactions = message.reactions.clone();
                        self.event_tx
                            .send(Event::MessageUpdated {
                                buffer: reaction.buffer.clone(),
                                message_id: id,
                                reactions,
                            })
                            .ok();
                    }
                }
            }
        }
    }

    fn apply_or_hold_reaction(
        &mut self,
        server: ServerId,
        buffer: BufferId,
        msgid: &str,
        emoji: &str,
        reactor: &str,
        remove: bool,
    ) {
        if let Some(buf) = self.state.buffers.get_mut(&buffer) {
            if let Some(message) = buf.find_by_msgid_mut(msgid) {
                if message.apply_reaction(emoji, reactor, remove) {
                    let id = message.id;
                    let reactions = message.reactions.clone();
                    self.event_tx
                        .send(Event::MessageUpdated {
                            buffer,
                            message_id: id,
                            reactions,
                        })
                        .ok();
                }
                return;
            }
        }
        // Target not stored yet; hold until it arrives or the batch ends.
        if let Some(conn) = self.connections.get_mut(&server) {
            conn.reconciler.hold(
                msgid,
                PendingReaction {
                    buffer,
                    emoji: emoji.to_string(),
                    reactor: reactor.to_string(),
                    remove,
                },
            );
        }
    }

    fn on_join(&mut self, server: ServerId, line: &Line) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let Some(channel) = line.params.first().cloned() else {
            return;
        };
        let (own_nick, replay, chathistory) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (
                conn.nick.clone(),
                conn.reconciler.is_replay(line.tag("batch")),
                conn.caps.contains("draft/chathistory"),
            )
        };
        let buffer = BufferId::channel(server, &channel);
        let from_self = sender.eq_ignore_ascii_case(&own_nick);

        if from_self && !replay {
            let created = !self.state.buffers.contains_key(&buffer);
            // A fresh NAMES listing follows the join.
            self.state.buffer_mut(buffer.clone(), &channel).members.clear();
            if created {
                self.emit(Event::BufferOpened {
                    buffer: buffer.clone(),
                });
            }
            self.emit_members(&buffer);
            if chathistory {
                if let Some(conn) = self.connections.get(&server) {
                    conn.send_raw(format!("CHATHISTORY LATEST {channel} * 100"));
                }
            }
        } else if !from_self && !replay {
            if let Some(buf) = self.state.buffers.get_mut(&buffer) {
                let mut member = Member::new(&sender);
                if let Some(account) = line.tag("account") {
                    if !account.is_empty() {
                        member.account = Some(account.to_string());
                    }
                }
                buf.add_member(member);
                self.emit_members(&buffer);
            } else {
                return;
            }
        } else if !self.state.buffers.contains_key(&buffer) {
            // Replayed join for a channel we no longer have open.
            return;
        }

        self.append_message(Incoming {
            text: format!("{sender} joined {channel}"),
            kind: MessageKind::Join,
            ..Incoming {
                sender,
                replay,
                time: server_time(line),
                ..Incoming::system(buffer, &channel, "")
            }
        });
    }

    fn on_part(&mut self, server: ServerId, line: &Line) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let Some(channel) = line.params.first().cloned() else {
            return;
        };
        let reason = line.params.get(1).cloned().unwrap_or_default();
        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (conn.nick.clone(), conn.reconciler.is_replay(line.tag("batch")))
        };
        let buffer = BufferId::channel(server, &channel);
        let from_self = sender.eq_ignore_ascii_case(&own_nick);

        if from_self && !replay {
            // Self-part destroys the channel buffer.
            for user in self
                .state
                .buffer(&buffer)
                .map(|b| b.typing.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
            {
                self.typing.clear(&buffer, &user);
            }
            if self.state.remove_buffer(&buffer).is_some() {
                self.emit(Event::BufferClosed { buffer });
            }
            return;
        }

        if self.state.buffers.get(&buffer).is_none() {
            return;
        }
        if !replay {
            let removed = self
                .state
                .buffers
                .get_mut(&buffer)
                .is_some_and(|b| b.remove_member(&sender));
            if removed {
                self.emit_members(&buffer);
            }
            self.clear_typing(&buffer, &sender);
        }
        let text = if reason.is_empty() {
            format!("{sender} left {channel}")
        } else {
            format!("{sender} left {channel} ({reason})")
        };
        self.append_message(Incoming {
            text,
            kind: MessageKind::Part,
            ..Incoming {
                sender,
                replay,
                time: server_time(line),
                ..Incoming::system(buffer, &channel, "")
            }
        });
    }

    fn on_quit(&mut self, server: ServerId, line: &Line) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let reason = line.trailing().to_string();
        let replay = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            conn.reconciler.is_replay(line.tag("batch"))
        };

        let text = if reason.is_empty() {
            format!("{sender} quit")
        } else {
            format!("{sender} quit ({reason})")
        };
        for id in self.state.server_buffer_ids(server) {
            let affected = match &id {
                BufferId::Channel(..) => self
                    .state
                    .buffer(&id)
                    .is_some_and(|b| b.member(&sender).is_some()),
                BufferId::Private(_, nick) => nick.eq_ignore_ascii_case(&sender),
                BufferId::Server(_) => false,
            };
            if !affected {
                continue;
            }
            if !replay {
                let removed = self
                    .state
                    .buffers
                    .get_mut(&id)
                    .is_some_and(|b| b.remove_member(&sender));
                if removed {
                    self.emit_members(&id);
                }
                self.clear_typing(&id, &sender);
            }
            let name = self
                .state
                .buffer(&id)
                .map(|b| b.name.clone())
                .unwrap_or_default();
            self.append_message(Incoming {
                text: text.clone(),
                kind: MessageKind::Quit,
                ..Incoming {
                    sender: sender.clone(),
                    replay,
                    time: server_time(line),
                    ..Incoming::system(id, &name, "")
                }
            });
        }
    }

    fn on_kick(&mut self, server: ServerId, line: &Line) {
        let Some(sender) = line.sender().map(str::to_string) else {
            return;
        };
        let (Some(channel), Some(victim)) = (line.params.first().cloned(), line.params.get(1).cloned())
        else {
            return;
        };
        let reason = line.params.get(2).cloned().unwrap_or_default();
        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (conn.nick.clone(), conn.reconciler.is_replay(line.tag("batch")))
        };
        let buffer = BufferId::channel(server, &channel);
        if self.state.buffers.get(&buffer).is_none() {
            return;
        }

        let kicked_self = victim.eq_ignore_ascii_case(&own_nick);
        if !replay {
            if let Some(buf) = self.state.buffers.get_mut(&buffer) {
                if kicked_self {
                    // We are out; membership is stale until a rejoin.
                    buf.members.clear();
                } else {
                    buf.remove_member(&victim);
                }
            }
            self.emit_members(&buffer);
            self.clear_typing(&buffer, &victim);
        }

        let text = if kicked_self {
            format!("You were kicked from {channel} by {sender} ({reason})")
        } else {
            format!("{victim} was kicked by {sender} ({reason})")
        };
        self.append_message(Incoming {
            text,
            kind: MessageKind::Kick,
            ..Incoming {
                sender,
                replay,
                time: server_time(line),
                ..Incoming::system(buffer, &channel, "")
            }
        });
    }

    fn on_nick(&mut self, server: ServerId, line: &Line) {
        let Some(old) = line.sender().map(str::to_string) else {
            return;
        };
        let Some(new) = line.params.first().cloned() else {
            return;
        };
        let (own_nick, replay) = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            (conn.nick.clone(), conn.reconciler.is_replay(line.tag("batch")))
        };
        if old.eq_ignore_ascii_case(&own_nick) && !replay {
            if let Some(conn) = self.connections.get_mut(&server) {
                conn.nick = new.clone();
            }
            self.emit(Event::NickChanged {
                server,
                nick: new.clone(),
            });
        }

        let text = format!("{old} is now known as {new}");
        for id in self.state.server_buffer_ids(server) {
            if !matches!(id, BufferId::Channel(..)) {
                continue;
            }
            let is_member = self
                .state
                .buffer(&id)
                .is_some_and(|b| b.member(&old).is_some());
            if !is_member {
                continue;
            }
            if !replay {
                if let Some(buf) = self.state.buffers.get_mut(&id) {
                    if let Some(member) = buf.member_mut(&old) {
                        member.nick = new.clone();
                    }
                }
                self.emit_members(&id);
                self.clear_typing(&id, &old);
            }
            let name = self
                .state
                .buffer(&id)
                .map(|b| b.name.clone())
                .unwrap_or_default();
            self.append_message(Incoming {
                text: text.clone(),
                kind: MessageKind::Nick,
                ..Incoming {
                    sender: old.clone(),
                    replay,
                    time: server_time(line),
                    ..Incoming::system(id, &name, "")
                }
            });
        }
    }

    fn on_mode(&mut self, server: ServerId, line: &Line) {
        let Some(target) = line.params.first().cloned() else {
            return;
        };
        if !is_channel(&target) {
            return;
        }
        let Some(modes) = line.params.get(1).cloned() else {
            return;
        };
        let args: Vec<String> = line.params.iter().skip(2).cloned().collect();
        let sender = line.sender().unwrap_or("server").to_string();
        let replay = {
            let Some(conn) = self.connections.get_mut(&server) else {
                return;
            };
            conn.reconciler.is_replay(line.tag("batch"))
        };
        let buffer = BufferId::channel(server, &target);
        if self.state.buffers.get(&buffer).is_none() {
            return;
        }

        if !replay {
            if let Some(buf) = self.state.buffers.get_mut(&buffer) {
                apply_mode_string(buf, &modes, &args);
            }
            self.emit_members(&buffer);
        }
        let mut text = format!("{sender} sets mode {modes}");
        if !args.is_empty() {
            text.push(' ');
            text.push_str(&args.join(" "));
        }
        self.append_message(Incoming {
            text,
            kind: MessageKind::Mode,
            ..Incoming {
                sender,
                replay,
                time: server_time(line),
                ..Incoming::system(buffer, &target, "")
            }
        });
    }

    fn on_topic(&mut self, server: ServerId, line: &Line) {
        let Some(channel) = line.params.first().cloned() else {
            return;
        };
        let topic = line.params.get(1).cloned().unwrap_or_default();
        let sender = line.sender().unwrap_or("server").to_string();
        let buffer = BufferId::channel(server, &channel);
        let topic = if topic.is_empty() { None } else { Some(topic) };
        // A topic for a channel we are not in opens nothing.
        let Some(buf) = self.state.buffers.get_mut(&buffer) else {
            return;
        };
        buf.topic = topic.clone();
        self.emit(Event::TopicChanged {
            buffer: buffer.clone(),
            topic: topic.clone(),
        });
        let text = match topic {
            Some(t) => format!("{sender} set the topic to: {t}"),
            None => format!("{sender} cleared the topic"),
        };
        self.append_message(Incoming::system(buffer, &channel, &text));
    }

    /// RPL_TOPIC (332) and RPL_NOTOPIC (331).
    fn on_topic_numeric(&mut self, server: ServerId, line: &Line) {
        let Some(channel) = line.params.get(1).cloned() else {
            return;
        };
        let topic = if line.command == "332" {
            line.params.get(2).cloned().filter(|t| !t.is_empty())
        } else {
            None
        };
        let buffer = BufferId::channel(server, &channel);
        if let Some(buf) = self.state.buffers.get_mut(&buffer) {
            buf.topic = topic.clone();
            self.event_tx
                .send(Event::TopicChanged { buffer, topic })
                .ok();
        }
    }

    /// RPL_NAMREPLY: `<nick> <sym> <channel> :<prefixed nicks>`.
    fn on_names(&mut self, server: ServerId, line: &Line) {
        if line.params.len() < 2 {
            return;
        }
        let channel = line.params[line.params.len() - 2].clone();
        let buffer = BufferId::channel(server, &channel);
        let Some(buf) = self.state.buffers.get_mut(&buffer) else {
            return;
        };
        for entry in line.trailing().split_whitespace() {
            let symbols: String = entry
                .chars()
                .take_while(|c| "~&@%+".contains(*c))
                .collect();
            let nick = &entry[symbols.len()..];
            if nick.is_empty() {
                continue;
            }
            match buf.member_mut(nick) {
                Some(member) => member.symbols = symbols,
                None => {
                    let mut member = Member::new(nick);
                    member.symbols = symbols;
                    buf.add_member(member);
                }
            }
        }
    }

    /// ERR_CHANOPRIVSNEEDED: surfaced to the UI, routed like any other
    /// non-buffer-scoped reply.
    fn on_operator_needed(&mut self, server: ServerId, line: &Line) {
        let text = format!(
            "{}: {}",
            line.params.get(1).map(|s| s.as_str()).unwrap_or(""),
            line.trailing()
        );
        self.emit(Event::Error {
            server,
            text: text.clone(),
        });
        let route = self.route_server_reply(server);
        let name = self.buffer_name(&route);
        self.append_message(Incoming::system(route, &name, &text));
    }

    /// Non-buffer-scoped replies go to the focused buffer only when it
    /// belongs to the originating connection; otherwise to the server
    /// buffer. Prevents cross-connection leakage.
    fn on_numeric(&mut self, server: ServerId, line: &Line) {
        if line.params.len() < 2 {
            return;
        }
        let text = line.params[1..].join(" ");
        let route = self.route_server_reply(server);
        let name = self.buffer_name(&route);
        self.append_message(Incoming::system(route, &name, &text));
    }

    // ── Commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(server) => self.start_connect(server),
            Command::Disconnect(server) => self.user_disconnect(server),
            Command::Join { server, channel } => {
                if let Some(conn) = self.connections.get(&server) {
                    conn.send(Line::cmd("JOIN", &[&channel]));
                }
            }
            Command::Part {
                server,
                channel,
                reason,
            } => {
                if let Some(conn) = self.connections.get(&server) {
                    match reason {
                        Some(reason) => conn.send(Line::cmd("PART", &[&channel, &reason])),
                        None => conn.send(Line::cmd("PART", &[&channel])),
                    }
                }
            }
            Command::SendMessage { buffer, text } => self.send_chat(buffer, &text, false),
            Command::SendAction { buffer, text } => self.send_chat(buffer, &text, true),
            Command::SendTyping { buffer, active } => self.send_typing(&buffer, active),
            Command::React {
                buffer,
                msgid,
                emoji,
                remove,
            } => self.send_reaction(buffer, &msgid, &emoji, remove),
            Command::OpenPrivate { server, nick } => {
                let buffer = BufferId::private(server, &nick);
                let created = !self.state.buffers.contains_key(&buffer);
                self.state.buffer_mut(buffer.clone(), &nick);
                if created {
                    self.emit(Event::BufferOpened { buffer });
                }
            }
            Command::SetFocus(focus) => {
                if let Some(id) = &focus {
                    if let Some(buffer) = self.state.buffers.get_mut(id) {
                        if buffer.unread > 0 || buffer.mentioned {
                            buffer.unread = 0;
                            buffer.mentioned = false;
                            self.event_tx
                                .send(Event::UnreadChanged {
                                    buffer: id.clone(),
                                    unread: 0,
                                    mentioned: false,
                                })
                                .ok();
                        }
                    }
                }
                self.state.focus = focus;
            }
            Command::ChangeNick { server, nick } => {
                if let Some(conn) = self.connections.get(&server) {
                    conn.send(Line::cmd("NICK", &[&nick]));
                }
            }
            Command::Raw { server, line } => {
                if let Some(conn) = self.connections.get(&server) {
                    conn.send_raw(line);
                }
            }
            Command::AddServer(record) => match self.store.add_server(&record) {
                Ok(id) => {
                    let mut record = record;
                    record.id = id;
                    self.insert_server(record);
                }
                Err(e) => tracing::error!(error = %e, "failed to save server"),
            },
            Command::UpdateServer(record) => {
                if let Err(e) = self.store.update_server(&record) {
                    tracing::error!(error = %e, "failed to update server");
                    return;
                }
                if let Some(conn) = self.connections.get_mut(&record.id) {
                    if conn.state == ConnectionState::Disconnected {
                        conn.nick = record.nick.clone();
                        conn.config = record;
                    }
                }
            }
            Command::RemoveServer(server) => {
                self.user_disconnect(server);
                self.connections.remove(&server);
                if let Err(e) = self.store.delete_server(server) {
                    tracing::error!(error = %e, "failed to delete server");
                }
                for id in self.state.server_buffer_ids(server) {
                    self.state.remove_buffer(&id);
                    self.emit(Event::BufferClosed { buffer: id });
                }
            }
            Command::SaveChannel(record) => {
                if let Err(e) = self.store.save_channel(&record) {
                    tracing::error!(error = %e, "failed to save channel");
                }
            }
            Command::ForgetChannel { server, name } => {
                if let Err(e) = self.store.delete_channel(server, &name) {
                    tracing::error!(error = %e, "failed to delete channel");
                }
            }
        }
    }

    fn send_chat(&mut self, buffer: BufferId, text: &str, action: bool) {
        let Some(target) = self.buffer_target(&buffer) else {
            return;
        };
        let server = buffer.server();
        let (nick, echo) = {
            let Some(conn) = self.connections.get(&server) else {
                return;
            };
            if conn.state != ConnectionState::Registered {
                self.emit(Event::Error {
                    server,
                    text: "not connected".to_string(),
                });
                return;
            }
            let wire_text = if action {
                format!("\u{1}ACTION {text}\u{1}")
            } else {
                text.to_string()
            };
            conn.send(Line::cmd("PRIVMSG", &[&target, &wire_text]));
            (conn.nick.clone(), conn.caps.contains("echo-message"))
        };
        // With echo-message the server plays our line back to us and it
        // takes the normal projection path; otherwise echo locally.
        if !echo {
            let kind = if action {
                MessageKind::Action
            } else if is_channel(&target) {
                MessageKind::Text
            } else {
                MessageKind::Whisper
            };
            self.append_message(Incoming {
                kind,
                text: text.to_string(),
                ..Incoming {
                    sender: nick,
                    ..Incoming::system(buffer, &target, "")
                }
            });
        }
    }

    fn send_typing(&mut self, buffer: &BufferId, active: bool) {
        let Some(target) = self.buffer_target(buffer) else {
            return;
        };
        let Some(conn) = self.connections.get(&buffer.server()) else {
            return;
        };
        if conn.state != ConnectionState::Registered || !conn.caps.contains("message-tags") {
            return;
        }
        let mut tags = HashMap::new();
        tags.insert(
            "+typing".to_string(),
            if active { "active" } else { "done" }.to_string(),
        );
        conn.send(Line::tagged(tags, "TAGMSG", &[&target]));
    }

    fn send_reaction(&mut self, buffer: BufferId, msgid: &str, emoji: &str, remove: bool) {
        let Some(target) = self.buffer_target(&buffer) else {
            return;
        };
        let server = buffer.server();
        let nick = {
            let Some(conn) = self.connections.get(&server) else {
                return;
            };
            if conn.state != ConnectionState::Registered {
                return;
            }
            let mut tags = HashMap::new();
            let key = if remove { "+draft/unreact" } else { "+draft/react" };
            tags.insert(key.to_string(), emoji.to_string());
            tags.insert("+draft/reply".to_string(), msgid.to_string());
            conn.send(Line::tagged(tags, "TAGMSG", &[&target]));
            conn.nick.clone()
        };
        // Optimistic local application; a server echo is a no-op thanks
        // to idempotence.
        self.apply_or_hold_reaction(server, buffer, msgid, emoji, &nick, remove);
    }

    // ── Shared projection plumbing ──────────────────────────────────

    fn append_message(&mut self, incoming: Incoming) {
        let server = incoming.buffer.server();
        let own_nick = self
            .connections
            .get(&server)
            .map(|c| c.nick.clone())
            .unwrap_or_default();
        let pending = match (&incoming.msgid, self.connections.get_mut(&server)) {
            (Some(msgid), Some(conn)) => conn.reconciler.take_for(msgid),
            _ => Vec::new(),
        };

        let id = self.state.next_message_id();
        let mut message = ChatMessage {
            id,
            msgid: incoming.msgid,
            kind: incoming.kind,
            sender: incoming.sender.clone(),
            time: incoming.time,
            text: incoming.text,
            reply_to: incoming.reply_to,
            reactions: Vec::new(),
            lines: incoming.lines,
        };
        for reaction in pending {
            message.apply_reaction(&reaction.emoji, &reaction.reactor, reaction.remove);
        }

        let from_self = !incoming.sender.is_empty()
            && incoming.sender.eq_ignore_ascii_case(&own_nick);
        let mention = incoming.counts_unread
            && !from_self
            && is_mention(&message.text, &own_nick);

        let created = !self.state.buffers.contains_key(&incoming.buffer);
        let focused = self.state.is_focused(&incoming.buffer);
        let mut accounting = None;
        {
            let buffer = self
                .state
                .buffer_mut(incoming.buffer.clone(), &incoming.name);
            buffer.messages.push(message.clone());
            // Replay is catch-up history, not new attention-worthy
            // activity: no unread or mention side effects.
            if incoming.counts_unread && !incoming.replay && !from_self && !focused {
                buffer.unread += 1;
                if mention {
                    buffer.mentioned = true;
                }
                accounting = Some((buffer.unread, buffer.mentioned));
            }
        }
        if created {
            self.emit(Event::BufferOpened {
                buffer: incoming.buffer.clone(),
            });
        }
        self.emit(Event::MessageAdded {
            buffer: incoming.buffer.clone(),
            message,
        });
        if let Some((unread, mentioned)) = accounting {
            self.emit(Event::UnreadChanged {
                buffer: incoming.buffer.clone(),
                unread,
                mentioned,
            });
        }

        // A message from a user supersedes their typing indicator.
        if !incoming.sender.is_empty() {
            self.clear_typing(&incoming.buffer, &incoming.sender);
        }
    }

    fn set_typing(&mut self, buffer: BufferId, user: &str) {
        // Typing in a buffer we do not have open carries no information.
        let Some(buf) = self.state.buffers.get_mut(&buffer) else {
            return;
        };
        let changed = buf.typing.insert(user.to_string());
        let users: Vec<String> = buf.typing.iter().cloned().collect();
        let timer = Timer::spawn(
            TYPING_EXPIRY,
            self.dispatch_tx.clone(),
            Dispatch::TypingExpired {
                buffer: buffer.clone(),
                user: user.to_string(),
            },
        );
        self.typing.set(&buffer, user, timer);
        if changed {
            self.emit(Event::TypingChanged { buffer, users });
        }
    }

    fn clear_typing(&mut self, buffer: &BufferId, user: &str) {
        self.typing.clear(buffer, user);
        if let Some(buf) = self.state.buffers.get_mut(buffer) {
            if buf.typing.remove(user) {
                let users = buf.typing.iter().cloned().collect();
                self.event_tx
                    .send(Event::TypingChanged {
                        buffer: buffer.clone(),
                        users,
                    })
                    .ok();
            }
        }
    }

    fn handle_typing_expired(&mut self, buffer: &BufferId, user: &str) {
        if self.typing.expire(buffer, user) {
            if let Some(buf) = self.state.buffers.get_mut(buffer) {
                if buf.typing.remove(user) {
                    let users = buf.typing.iter().cloned().collect();
                    self.event_tx
                        .send(Event::TypingChanged {
                            buffer: buffer.clone(),
                            users,
                        })
                        .ok();
                }
            }
        }
    }

    fn update_account(&mut self, buffer: &BufferId, nick: &str, account: &str) {
        let Some(buf) = self.state.buffers.get_mut(buffer) else {
            return;
        };
        // An explicitly-empty account tag means "logged out".
        let account = if account.is_empty() {
            None
        } else {
            Some(account.to_string())
        };
        match buffer {
            // Private chats have no member list; the association lives
            // on the buffer, and only for the peer's own lines.
            BufferId::Private(_, peer) if peer.eq_ignore_ascii_case(nick) => {
                buf.peer_account = account;
            }
            _ => {
                if let Some(member) = buf.member_mut(nick) {
                    member.account = account;
                }
            }
        }
    }

    fn route_server_reply(&self, server: ServerId) -> BufferId {
        match &self.state.focus {
            Some(focus) if focus.server() == server => focus.clone(),
            _ => BufferId::Server(server),
        }
    }

    fn buffer_name(&self, id: &BufferId) -> String {
        self.state
            .buffer(id)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| self.host_of(id.server()))
    }

    fn host_of(&self, server: ServerId) -> String {
        self.connections
            .get(&server)
            .map(|c| c.config.host.clone())
            .unwrap_or_default()
    }

    /// The wire target for a buffer: channel name or peer nick. Server
    /// buffers have none.
    fn buffer_target(&self, id: &BufferId) -> Option<String> {
        match id {
            BufferId::Server(_) => None,
            BufferId::Channel(_, name) | BufferId::Private(_, name) => Some(
                self.state
                    .buffer(id)
                    .map(|b| b.name.clone())
                    .unwrap_or_else(|| name.clone()),
            ),
        }
    }
}

fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

fn ctcp_action(text: &str) -> Option<String> {
    let inner = text.strip_prefix("\u{1}ACTION ")?;
    Some(inner.trim_end_matches('\u{1}').to_string())
}

/// Timestamp for an incoming line: the `server-time` tag when present,
/// the local clock otherwise.
fn server_time(line: &Line) -> DateTime<Utc> {
    line.tag("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Per-connection socket task: pumps inbound lines into the dispatch
/// sequence and outbound lines onto the transport. Exits (closing the
/// transport and reporting once) on EOF, error, or when the engine
/// drops the outbound sender.
async fn run_socket(
    server: ServerId,
    mut transport: Transport,
    mut reader: crate::transport::LineReader,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
) {
    let reason = loop {
        tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    if dispatch_tx.send(Dispatch::Line { server, line }).is_err() {
                        break "session closed".to_string();
                    }
                }
                Ok(None) => break "connection closed by server".to_string(),
                Err(e) => break e.to_string(),
            },
            outbound = out_rx.recv() => match outbound {
                Some(line) => {
                    if let Err(e) = transport.send(&line).await {
                        break e.to_string();
                    }
                }
                None => break "disconnected".to_string(),
            },
        }
    };
    transport.close().await;
    let _ = dispatch_tx.send(Dispatch::Closed { server, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record() -> ServerRecord {
        ServerRecord {
            id: ServerId(0),
            host: "irc.example.net".to_string(),
            port: 6697,
            tls: true,
            nick: "dana".to_string(),
            username: "dana".to_string(),
            realname: "Dana".to_string(),
            password: Some("letmein".to_string()),
            sasl_user: Some("dana".to_string()),
            sasl_pass: Some("hunter2".to_string()),
        }
    }

    fn session_with_server() -> (Session, ServerId, mpsc::UnboundedReceiver<Event>) {
        let store = Store::open_memory().unwrap();
        let id = store.add_server(&record()).unwrap();
        let (session, _handle, events) = Session::new(store).unwrap();
        (session, id, events)
    }

    /// Attach a fake outbound channel in place of a real socket task.
    fn wire(session: &mut Session, server: ServerId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = session.connections.get_mut(&server).unwrap();
        conn.out_tx = Some(tx);
        conn.state = ConnectionState::Connecting;
        rx
    }

    fn out_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        rx.try_recv().expect("expected an outbound line")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) {
        while rx.try_recv().is_ok() {}
    }

    /// Session registered over a fake wire, no capabilities negotiated.
    fn registered() -> (
        Session,
        ServerId,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (mut session, id, events) = session_with_server();
        let mut rx = wire(&mut session, id);
        session.handle_opened(id);
        session.handle_line(id, ":srv CAP * LS :");
        session.handle_line(id, ":srv 001 dana :Welcome to IRC");
        drain(&mut rx);
        (session, id, rx, events)
    }

    fn join_ops(session: &mut Session, id: ServerId) -> BufferId {
        session.handle_line(id, ":dana!d@h JOIN #ops");
        session.handle_line(id, ":srv 353 dana = #ops :@alice bob +carol");
        session.handle_line(id, ":srv 366 dana #ops :End of names");
        BufferId::channel(id, "#ops")
    }

    #[tokio::test(start_paused = true)]
    async fn registration_handshake_with_sasl() {
        let (mut session, id, _events) = session_with_server();
        let mut rx = wire(&mut session, id);

        session.handle_opened(id);
        assert_eq!(out_line(&mut rx), "CAP LS 302");
        assert_eq!(out_line(&mut rx), "PASS letmein");
        assert_eq!(out_line(&mut rx), "NICK dana");
        assert_eq!(out_line(&mut rx), "USER dana 0 * Dana");

        session.handle_line(id, ":srv CAP * LS :message-tags server-time sasl=PLAIN unrelated");
        assert_eq!(out_line(&mut rx), "CAP REQ :message-tags server-time sasl");

        session.handle_line(id, ":srv CAP dana ACK :message-tags server-time sasl");
        assert_eq!(out_line(&mut rx), "AUTHENTICATE PLAIN");

        session.handle_line(id, "AUTHENTICATE +");
        let expected = BASE64.encode("dana\0dana\0hunter2");
        assert_eq!(out_line(&mut rx), format!("AUTHENTICATE {expected}"));

        session.handle_line(id, ":srv 903 dana :SASL authentication successful");
        assert_eq!(out_line(&mut rx), "CAP END");

        session.handle_line(id, ":srv 001 dana :Welcome to IRC");
        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Registered);
        assert!(conn.caps.contains("message-tags"));
    }

    #[tokio::test(start_paused = true)]
    async fn cap_ls_continuation_accumulates_before_req() {
        let (mut session, id, _events) = session_with_server();
        let mut rx = wire(&mut session, id);
        session.handle_opened(id);
        drain(&mut rx);

        session.handle_line(id, ":srv CAP * LS * :message-tags batch");
        assert!(rx.try_recv().is_err());

        session.handle_line(id, ":srv CAP * LS :server-time");
        assert_eq!(out_line(&mut rx), "CAP REQ :message-tags server-time batch");
    }

    #[tokio::test(start_paused = true)]
    async fn nick_collision_retries_with_underscore() {
        let (mut session, id, _events) = session_with_server();
        let mut rx = wire(&mut session, id);
        session.handle_opened(id);
        drain(&mut rx);

        session.handle_line(id, ":srv 433 * dana :Nickname is already in use");
        assert_eq!(out_line(&mut rx), "NICK dana_");
        session.handle_line(id, ":srv 433 * dana_ :Nickname is already in use");
        assert_eq!(out_line(&mut rx), "NICK dana__");

        session.handle_line(id, ":srv CAP * LS :");
        session.handle_line(id, ":srv 001 dana__ :Welcome");
        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Registered);
        assert_eq!(conn.nick, "dana__");
    }

    #[tokio::test(start_paused = true)]
    async fn names_and_mode_changes_shape_member_list() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.members.len(), 3);
        assert_eq!(buf.member("alice").unwrap().symbols, "@");
        assert_eq!(buf.member("carol").unwrap().symbols, "+");

        session.handle_line(id, ":alice!a@h MODE #ops +o-v bob carol");
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.member("bob").unwrap().symbols, "@");
        assert_eq!(buf.member("carol").unwrap().symbols, "");
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_events_leave_members_and_unread_alone() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, ":srv BATCH +hist chathistory #ops");
        session.handle_line(id, "@batch=hist :eve!e@h JOIN #ops");
        session.handle_line(id, "@batch=hist :alice!a@h PART #ops");
        session.handle_line(id, "@batch=hist :alice!a@h PRIVMSG #ops :old news for dana");
        session.handle_line(id, ":srv BATCH -hist");

        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.members.len(), 3);
        assert!(buf.member("alice").is_some());
        assert!(buf.member("eve").is_none());
        assert_eq!(buf.unread, 0);
        assert!(!buf.mentioned);
        // The replayed lines still landed as history.
        assert!(buf.messages.iter().any(|m| m.text.contains("old news")));
    }

    #[tokio::test(start_paused = true)]
    async fn reaction_held_until_target_arrives() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, ":srv BATCH +hist chathistory #ops");
        session.handle_line(
            id,
            "@batch=hist;+draft/react=👍;+draft/reply=m1 :bob!b@h TAGMSG #ops",
        );
        assert_eq!(session.connections[&id].reconciler.pending_count(), 1);

        session.handle_line(id, "@batch=hist;msgid=m1 :alice!a@h PRIVMSG #ops :hello");
        assert_eq!(session.connections[&id].reconciler.pending_count(), 0);

        let buf = session.state.buffer(&buffer).unwrap();
        let msg = buf.messages.last().unwrap();
        assert_eq!(msg.msgid.as_deref(), Some("m1"));
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.reactions[0].reactor, "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_reaction_dropped_at_batch_end() {
        let (mut session, id, _rx, _events) = registered();
        join_ops(&mut session, id);

        session.handle_line(id, ":srv BATCH +hist chathistory #ops");
        session.handle_line(
            id,
            "@batch=hist;+draft/react=👍;+draft/reply=ghost :bob!b@h TAGMSG #ops",
        );
        assert_eq!(session.connections[&id].reconciler.pending_count(), 1);
        session.handle_line(id, ":srv BATCH -hist");
        assert_eq!(session.connections[&id].reconciler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn live_reaction_applies_in_place() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, "@msgid=m5 :alice!a@h PRIVMSG #ops :react to this");
        session.handle_line(id, "@+draft/react=🎉;+draft/reply=m5 :bob!b@h TAGMSG #ops");
        // Duplicate applications are no-ops.
        session.handle_line(id, "@+draft/react=🎉;+draft/reply=m5 :bob!b@h TAGMSG #ops");

        let buf = session.state.buffer(&buffer).unwrap();
        let msg = buf
            .messages
            .iter()
            .find(|m| m.msgid.as_deref() == Some("m5"))
            .unwrap();
        assert_eq!(msg.reactions.len(), 1);

        session.handle_line(id, "@+draft/unreact=🎉;+draft/reply=m5 :bob!b@h TAGMSG #ops");
        let buf = session.state.buffer(&buffer).unwrap();
        assert!(buf.messages.last().unwrap().reactions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_set_by_tagmsg_and_cleared_by_message() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, "@+typing=active :alice!a@h TAGMSG #ops");
        assert!(session.state.buffer(&buffer).unwrap().typing.contains("alice"));
        assert!(session.typing.is_tracking(&buffer, "alice"));

        // Our own typing echo is not tracked.
        session.handle_line(id, "@+typing=active :dana!d@h TAGMSG #ops");
        assert!(!session.state.buffer(&buffer).unwrap().typing.contains("dana"));

        session.handle_line(id, ":alice!a@h PRIVMSG #ops :here it is");
        assert!(session.state.buffer(&buffer).unwrap().typing.is_empty());
        assert!(!session.typing.is_tracking(&buffer, "alice"));

        session.handle_line(id, "@+typing=active :bob!b@h TAGMSG #ops");
        session.handle_line(id, "@+typing=done :bob!b@h TAGMSG #ops");
        assert!(session.state.buffer(&buffer).unwrap().typing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_without_refresh() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);
        let mut drx = session.dispatch_rx.take().unwrap();

        session.handle_line(id, "@+typing=active :alice!a@h TAGMSG #ops");
        assert!(session.state.buffer(&buffer).unwrap().typing.contains("alice"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        while let Ok(d) = drx.try_recv() {
            session.dispatch(d);
        }
        assert!(session.state.buffer(&buffer).unwrap().typing.is_empty());
        assert!(!session.typing.is_tracking(&buffer, "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn unread_and_mention_accounting() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, ":alice!a@h PRIVMSG #ops :morning all");
        session.handle_line(id, ":alice!a@h PRIVMSG #ops :dana: you around?");
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.unread, 2);
        assert!(buf.mentioned);

        session.handle_command(Command::SetFocus(Some(buffer.clone())));
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.unread, 0);
        assert!(!buf.mentioned);

        // Focused buffers accumulate no unread.
        session.handle_line(id, ":alice!a@h PRIVMSG #ops :dana again");
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.unread, 0);
        assert!(!buf.mentioned);
    }

    #[tokio::test(start_paused = true)]
    async fn multiline_batch_assembles_one_message() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(
            id,
            "@msgid=m9;time=2026-01-02T03:04:05.000Z :srv BATCH +ml draft/multiline #ops",
        );
        session.handle_line(id, "@batch=ml :alice!a@h PRIVMSG #ops :first");
        session.handle_line(id, "@batch=ml;draft/multiline-concat :alice!a@h PRIVMSG #ops :-more");
        session.handle_line(id, "@batch=ml :alice!a@h PRIVMSG #ops :second line");
        // Nothing lands until the batch closes.
        let before = session.state.buffer(&buffer).unwrap().messages.len();
        session.handle_line(id, ":srv BATCH -ml");

        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.messages.len(), before + 1);
        let msg = buf.messages.last().unwrap();
        assert_eq!(msg.text, "first-more\nsecond line");
        assert_eq!(msg.msgid.as_deref(), Some("m9"));
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.lines.as_ref().unwrap().len(), 3);
        assert_eq!(buf.unread, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn numerics_route_to_focused_buffer_of_same_connection() {
        let (mut session, id, _rx, mut events) = registered();
        let buffer = join_ops(&mut session, id);

        session.state.focus = Some(buffer.clone());
        session.handle_line(id, ":srv 301 dana alice :is away");
        let buf = session.state.buffer(&buffer).unwrap();
        assert!(buf.messages.iter().any(|m| m.text.contains("is away")));

        session.state.focus = None;
        session.handle_line(id, ":srv 301 dana bob :is away too");
        let server_buf = session.state.buffer(&BufferId::Server(id)).unwrap();
        assert!(server_buf.messages.iter().any(|m| m.text.contains("is away too")));

        session.handle_line(id, ":srv 482 dana #ops :You're not channel operator");
        let mut saw_error = false;
        while let Ok(ev) = events.try_recv() {
            if let Event::Error { text, .. } = ev {
                saw_error = text.contains("not channel operator");
                if saw_error {
                    break;
                }
            }
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_settles_to_disconnected() {
        let (mut session, id, mut events) = session_with_server();
        let mut rx = wire(&mut session, id);

        session.user_disconnect(id);
        assert_eq!(out_line(&mut rx), "QUIT :leaving");
        // The open raced the disconnect and lost.
        session.handle_opened(id);

        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(!conn.keepalive.is_backing_off());
        let mut saw_down = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(
                ev,
                Event::ConnectionState {
                    state: ConnectionState::Disconnected,
                    ..
                }
            ) {
                saw_down = true;
            }
        }
        assert!(saw_down);
    }

    #[tokio::test(start_paused = true)]
    async fn events_carry_member_unread_and_reaction_payloads() {
        let (mut session, id, _rx, mut events) = registered();
        let buffer = join_ops(&mut session, id);

        let mut names: Vec<String> = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let Event::MembersChanged { buffer: b, members } = ev {
                if b == buffer && !members.is_empty() {
                    names = members.into_iter().map(|m| m.nick).collect();
                }
            }
        }
        assert_eq!(names, vec!["alice", "bob", "carol"]);

        session.handle_line(id, ":alice!a@h PRIVMSG #ops :dana: lunch?");
        let mut counts = None;
        while let Ok(ev) = events.try_recv() {
            if let Event::UnreadChanged {
                buffer: b,
                unread,
                mentioned,
            } = ev
            {
                if b == buffer {
                    counts = Some((unread, mentioned));
                }
            }
        }
        assert_eq!(counts, Some((1, true)));

        session.handle_command(Command::SetFocus(Some(buffer.clone())));
        let mut counts = None;
        while let Ok(ev) = events.try_recv() {
            if let Event::UnreadChanged {
                unread, mentioned, ..
            } = ev
            {
                counts = Some((unread, mentioned));
            }
        }
        assert_eq!(counts, Some((0, false)));

        session.handle_line(id, "@msgid=m7 :alice!a@h PRIVMSG #ops :react to me");
        session.handle_line(id, "@+draft/react=👍;+draft/reply=m7 :bob!b@h TAGMSG #ops");
        let mut reactions = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let Event::MessageUpdated { reactions: r, .. } = ev {
                reactions = r;
            }
        }
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].reactor, "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn stray_topic_and_typing_do_not_open_buffers() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = BufferId::channel(id, "#elsewhere");

        session.handle_line(id, ":alice!a@h TOPIC #elsewhere :big plans");
        assert!(session.state.buffer(&buffer).is_none());

        session.handle_line(id, "@+typing=active :alice!a@h TAGMSG #elsewhere");
        assert!(session.state.buffer(&buffer).is_none());
        assert!(!session.typing.is_tracking(&buffer, "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn account_tag_tracks_private_chat_peer() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = BufferId::private(id, "ed");

        session.handle_line(id, "@account=ed_prime :ed!e@h PRIVMSG dana :psst");
        assert_eq!(
            session.state.buffer(&buffer).unwrap().peer_account.as_deref(),
            Some("ed_prime")
        );

        // An empty tag value is a logout.
        session.handle_line(id, "@account= :ed!e@h PRIVMSG dana :gone again");
        assert!(session.state.buffer(&buffer).unwrap().peer_account.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_schedules_backoff_reconnect() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);
        session.handle_line(id, ":alice!a@h PRIVMSG #ops :pre-drop chatter");
        let mut drx = session.dispatch_rx.take().unwrap();

        session.handle_closed(id, "connection reset");
        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(conn.keepalive.is_backing_off());
        assert_eq!(conn.keepalive.attempts, 1);

        // History dropped, membership kept.
        let buf = session.state.buffer(&buffer).unwrap();
        assert!(buf.messages.is_empty());
        assert_eq!(buf.members.len(), 3);
        let server_buf = session.state.buffer(&BufferId::Server(id)).unwrap();
        assert!(server_buf
            .messages
            .last()
            .unwrap()
            .text
            .contains("reconnecting in 3s (attempt 1)"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let due = drx.try_recv().unwrap();
        assert!(matches!(due, Dispatch::ReconnectDue { server } if server == id));
    }

    #[tokio::test(start_paused = true)]
    async fn user_disconnect_suppresses_reconnect() {
        let (mut session, id, mut rx, _events) = registered();
        let mut drx = session.dispatch_rx.take().unwrap();

        session.user_disconnect(id);
        assert_eq!(out_line(&mut rx), "QUIT :leaving");
        session.handle_closed(id, "connection closed by server");

        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(!conn.keepalive.is_backing_off());
        let server_buf = session.state.buffer(&BufferId::Server(id)).unwrap();
        assert!(server_buf
            .messages
            .last()
            .unwrap()
            .text
            .contains("Disconnected from irc.example.net"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timeout_tears_the_connection_down() {
        let (mut session, id, mut rx, _events) = registered();
        let mut drx = session.dispatch_rx.take().unwrap();

        session.handle_ping_due(id);
        let ping = out_line(&mut rx);
        assert!(ping.starts_with("PING :skiff-"), "got {ping}");

        // A mismatched pong is not liveness.
        session.handle_line(id, ":srv PONG srv :stale-token");
        assert!(session.connections[&id].keepalive.has_outstanding_ping());

        tokio::time::sleep(Duration::from_secs(31)).await;
        while let Ok(d) = drx.try_recv() {
            session.dispatch(d);
        }
        let conn = &session.connections[&id];
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(conn.keepalive.is_backing_off());
    }

    #[tokio::test(start_paused = true)]
    async fn matching_pong_keeps_the_connection_alive() {
        let (mut session, id, mut rx, _events) = registered();
        let mut drx = session.dispatch_rx.take().unwrap();

        session.handle_ping_due(id);
        let ping = out_line(&mut rx);
        let token = ping.trim_start_matches("PING :").to_string();
        session.handle_line(id, &format!(":srv PONG srv :{token}"));
        assert!(!session.connections[&id].keepalive.has_outstanding_ping());

        tokio::time::sleep(Duration::from_secs(31)).await;
        while let Ok(d) = drx.try_recv() {
            session.dispatch(d);
        }
        assert_eq!(session.connections[&id].state, ConnectionState::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_messages_echo_locally_without_echo_message() {
        let (mut session, id, mut rx, _events) = registered();
        let buffer = join_ops(&mut session, id);
        drain(&mut rx);

        session.handle_command(Command::SendMessage {
            buffer: buffer.clone(),
            text: "hi there".to_string(),
        });
        assert_eq!(out_line(&mut rx), "PRIVMSG #ops :hi there");
        let buf = session.state.buffer(&buffer).unwrap();
        let msg = buf.messages.last().unwrap();
        assert_eq!(msg.sender, "dana");
        assert_eq!(msg.text, "hi there");
        assert_eq!(buf.unread, 0);

        // With echo-message the server's copy is authoritative.
        let before = session.state.buffer(&buffer).unwrap().messages.len();
        session
            .connections
            .get_mut(&id)
            .unwrap()
            .caps
            .insert("echo-message".to_string());
        session.handle_command(Command::SendMessage {
            buffer: buffer.clone(),
            text: "no local echo".to_string(),
        });
        assert_eq!(out_line(&mut rx), "PRIVMSG #ops :no local echo");
        assert_eq!(session.state.buffer(&buffer).unwrap().messages.len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn private_messages_open_a_buffer_keyed_by_peer() {
        let (mut session, id, _rx, _events) = registered();

        session.handle_line(id, ":ed!e@h PRIVMSG dana :psst");
        let buffer = BufferId::private(id, "ed");
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.messages.last().unwrap().kind, MessageKind::Whisper);
        assert_eq!(buf.unread, 1);

        // Echo of our own PM keys on the target, not the sender.
        session.handle_line(id, ":dana!d@h PRIVMSG ed :echoed reply");
        let buf = session.state.buffer(&buffer).unwrap();
        assert_eq!(buf.messages.last().unwrap().text, "echoed reply");
        assert_eq!(buf.unread, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ctcp_action_becomes_action_kind() {
        let (mut session, id, _rx, _events) = registered();
        let buffer = join_ops(&mut session, id);

        session.handle_line(id, ":alice!a@h PRIVMSG #ops :\u{1}ACTION waves\u{1}");
        let msg = session.state.buffer(&buffer).unwrap().messages.last().unwrap().clone();
        assert_eq!(msg.kind, MessageKind::Action);
        assert_eq!(msg.text, "waves");
    }
}

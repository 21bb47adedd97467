//! In-memory conversation state: servers, channels, private chats, and
//! their messages. Mutated only from the engine's dispatch sequence;
//! change notifications reach the UI layer as [`crate::event::Event`]
//! values carrying the updated data.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

/// Identifier of a configured server, assigned by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub i64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation surface. Channel and private-chat names are stored
/// lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferId {
    Server(ServerId),
    Channel(ServerId, String),
    Private(ServerId, String),
}

impl BufferId {
    pub fn channel(server: ServerId, name: &str) -> Self {
        BufferId::Channel(server, name.to_lowercase())
    }

    pub fn private(server: ServerId, nick: &str) -> Self {
        BufferId::Private(server, nick.to_lowercase())
    }

    /// The connection this buffer belongs to.
    pub fn server(&self) -> ServerId {
        match self {
            BufferId::Server(s) | BufferId::Channel(s, _) | BufferId::Private(s, _) => *s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Action,
    Notice,
    Whisper,
    Join,
    Part,
    Quit,
    Kick,
    Nick,
    Mode,
    System,
}

/// One {emoji, reactor} pair; unique per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    pub reactor: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Locally assigned, unique per session.
    pub id: u64,
    /// Protocol `msgid` tag; absent for synthesized or untagged messages.
    pub msgid: Option<String>,
    pub kind: MessageKind,
    pub sender: String,
    pub time: DateTime<Utc>,
    pub text: String,
    /// `+draft/reply` target msgid, if this message replies to another.
    pub reply_to: Option<String>,
    pub reactions: Vec<Reaction>,
    /// Constituent lines of a multiline message, in order.
    pub lines: Option<Vec<String>>,
}

impl ChatMessage {
    /// Apply a reaction or un-reaction. Idempotent: duplicate adds and
    /// absent removes are no-ops. Returns whether anything changed.
    pub fn apply_reaction(&mut self, emoji: &str, reactor: &str, remove: bool) -> bool {
        let at = self
            .reactions
            .iter()
            .position(|r| r.emoji == emoji && r.reactor == reactor);
        match (at, remove) {
            (Some(i), true) => {
                self.reactions.remove(i);
                true
            }
            (None, false) => {
                self.reactions.push(Reaction {
                    emoji: emoji.to_string(),
                    reactor: reactor.to_string(),
                });
                true
            }
            _ => false,
        }
    }
}

/// Channel member with prefix status symbols (`~&@%+`) and the account
/// the server has associated with them, if known.
#[derive(Debug, Clone)]
pub struct Member {
    pub nick: String,
    pub symbols: String,
    pub account: Option<String>,
}

impl Member {
    pub fn new(nick: &str) -> Self {
        Member {
            nick: nick.to_string(),
            symbols: String::new(),
            account: None,
        }
    }

    fn toggle_symbol(&mut self, symbol: char, grant: bool) {
        if grant {
            if !self.symbols.contains(symbol) {
                self.symbols.push(symbol);
            }
        } else {
            self.symbols.retain(|c| c != symbol);
        }
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub id: BufferId,
    /// Display name: channel name as joined, peer nick, or server host.
    pub name: String,
    pub topic: Option<String>,
    /// Account of the private-chat peer, from their `account` tags.
    pub peer_account: Option<String>,
    pub members: Vec<Member>,
    pub messages: Vec<ChatMessage>,
    pub unread: u32,
    pub mentioned: bool,
    /// Users currently typing here. Expiry is driven by the engine.
    pub typing: BTreeSet<String>,
}

impl Buffer {
    pub fn new(id: BufferId, name: &str) -> Self {
        Buffer {
            id,
            name: name.to_string(),
            topic: None,
            peer_account: None,
            members: Vec::new(),
            messages: Vec::new(),
            unread: 0,
            mentioned: false,
            typing: BTreeSet::new(),
        }
    }

    pub fn member(&self, nick: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.nick.eq_ignore_ascii_case(nick))
    }

    pub fn member_mut(&mut self, nick: &str) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.nick.eq_ignore_ascii_case(nick))
    }

    pub fn add_member(&mut self, member: Member) {
        if self.member(&member.nick).is_none() {
            self.members.push(member);
        }
    }

    pub fn remove_member(&mut self, nick: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| !m.nick.eq_ignore_ascii_case(nick));
        self.members.len() != before
    }

    pub fn find_by_msgid_mut(&mut self, msgid: &str) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.msgid.as_deref() == Some(msgid))
    }

    /// Drop message history and typing state, keeping identity and
    /// membership. Used before a reconnect attempt: history will be
    /// re-requested after registration.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.typing.clear();
        self.unread = 0;
        self.mentioned = false;
    }
}

/// The whole buffer/message store plus the viewer focus.
#[derive(Debug, Default)]
pub struct State {
    pub buffers: BTreeMap<BufferId, Buffer>,
    /// Buffer the viewer currently has open, if any.
    pub focus: Option<BufferId>,
    next_message_id: u64,
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    pub fn buffer(&self, id: &BufferId) -> Option<&Buffer> {
        self.buffers.get(id)
    }

    /// Get or create a buffer.
    pub fn buffer_mut(&mut self, id: BufferId, name: &str) -> &mut Buffer {
        self.buffers
            .entry(id.clone())
            .or_insert_with(|| Buffer::new(id, name))
    }

    pub fn remove_buffer(&mut self, id: &BufferId) -> Option<Buffer> {
        if self.focus.as_ref() == Some(id) {
            self.focus = None;
        }
        self.buffers.remove(id)
    }

    pub fn server_buffer_ids(&self, server: ServerId) -> Vec<BufferId> {
        self.buffers
            .keys()
            .filter(|id| id.server() == server)
            .cloned()
            .collect()
    }

    pub fn next_message_id(&mut self) -> u64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    /// True when the viewer has this buffer open.
    pub fn is_focused(&self, id: &BufferId) -> bool {
        self.focus.as_ref() == Some(id)
    }
}

/// Whole-word, case-insensitive nickname match. Word boundaries are any
/// characters that cannot appear in a nick.
pub fn is_mention(text: &str, nick: &str) -> bool {
    if nick.is_empty() {
        return false;
    }
    let text_lower = text.to_lowercase();
    let nick_lower = nick.to_lowercase();
    let mut start = 0;
    while let Some(at) = text_lower[start..].find(&nick_lower) {
        let begin = start + at;
        let end = begin + nick_lower.len();
        let before_ok = begin == 0
            || !text_lower[..begin]
                .chars()
                .next_back()
                .is_some_and(is_nick_char);
        let after_ok = end == text_lower.len()
            || !text_lower[end..].chars().next().is_some_and(is_nick_char);
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

fn is_nick_char(c: char) -> bool {
    c.is_alphanumeric() || "[]{}\\|^`_-".contains(c)
}

/// Prefix-granting mode letters and the status symbols they map to.
const PREFIX_MODES: [(char, char); 5] = [
    ('q', '~'),
    ('a', '&'),
    ('o', '@'),
    ('h', '%'),
    ('v', '+'),
];

/// Channel mode letters that consume an argument but carry no member
/// status.
const ARG_MODES: &str = "beIfkl";

/// Walk a channel mode string left to right, applying prefix changes to
/// the member list. Prefix modes consume the next argument as the target
/// nick; other known parameterized modes consume one argument without
/// side effects; unknown letters are ignored.
pub fn apply_mode_string(buffer: &mut Buffer, modes: &str, args: &[String]) {
    let mut grant = true;
    let mut next_arg = 0;
    for letter in modes.chars() {
        match letter {
            '+' => grant = true,
            '-' => grant = false,
            _ => {
                if let Some((_, symbol)) = PREFIX_MODES.iter().find(|(m, _)| *m == letter) {
                    let Some(nick) = args.get(next_arg) else {
                        return;
                    };
                    next_arg += 1;
                    if let Some(member) = buffer.member_mut(nick) {
                        member.toggle_symbol(*symbol, grant);
                    }
                } else if ARG_MODES.contains(letter) {
                    next_arg += 1;
                }
            }
        }
    }
}

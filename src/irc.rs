//! IRC wire format: parsing and formatting of single protocol lines.
//!
//! Handles the IRCv3 framing `@tags :prefix COMMAND params :trailing`,
//! including tag value escaping. Malformed lines parse to `None` and are
//! dropped by the dispatcher; a bad line is never fatal to a connection.

use std::collections::HashMap;
use std::fmt;

/// A decoded protocol line.
#[derive(Debug, Clone, Default)]
pub struct Line {
    /// IRCv3 message tags. Valueless tags map to an empty string.
    pub tags: HashMap<String, String>,
    /// Message source (`:nick!user@host` or `:server.name`), if present.
    pub source: Option<Source>,
    /// Command or three-digit numeric, uppercased.
    pub command: String,
    pub params: Vec<String>,
}

/// The prefix of a message, split into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Source {
    fn parse(raw: &str) -> Self {
        let (nick_user, host) = match raw.split_once('@') {
            Some((nu, h)) => (nu, Some(h.to_string())),
            None => (raw, None),
        };
        let (nick, user) = match nick_user.split_once('!') {
            Some((n, u)) => (n.to_string(), Some(u.to_string())),
            None => (nick_user.to_string(), None),
        };
        Source { nick, user, host }
    }
}

impl Line {
    /// Parse a raw wire line. Returns `None` for empty or malformed input.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return None;
        }

        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let end = tagged.find(' ')?;
            let tags = parse_tags(&tagged[..end]);
            rest = tagged[end + 1..].trim_start_matches(' ');
            tags
        } else {
            HashMap::new()
        };

        let source = if let Some(prefixed) = rest.strip_prefix(':') {
            let end = prefixed.find(' ')?;
            let source = Source::parse(&prefixed[..end]);
            rest = prefixed[end + 1..].trim_start_matches(' ');
            Some(source)
        } else {
            None
        };

        if rest.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let command = match rest.find(' ') {
            Some(at) => {
                let command = rest[..at].to_ascii_uppercase();
                rest = rest[at + 1..].trim_start_matches(' ');
                while !rest.is_empty() {
                    if let Some(trailing) = rest.strip_prefix(':') {
                        params.push(trailing.to_string());
                        break;
                    }
                    match rest.find(' ') {
                        Some(at) => {
                            params.push(rest[..at].to_string());
                            rest = rest[at + 1..].trim_start_matches(' ');
                        }
                        None => {
                            params.push(rest.to_string());
                            break;
                        }
                    }
                }
                command
            }
            None => rest.to_ascii_uppercase(),
        };

        Some(Line {
            tags,
            source,
            command,
            params,
        })
    }

    /// Build an outbound line with no tags.
    pub fn cmd(command: &str, params: &[&str]) -> Self {
        Line {
            tags: HashMap::new(),
            source: None,
            command: command.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Build an outbound line carrying tags.
    pub fn tagged(tags: HashMap<String, String>, command: &str, params: &[&str]) -> Self {
        Line {
            tags,
            ..Line::cmd(command, params)
        }
    }

    /// Nickname of the sender, if the line carries a user prefix.
    pub fn sender(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.nick.as_str())
    }

    /// Value of a tag, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    /// The trailing (last) parameter, or an empty string.
    pub fn trailing(&self) -> &str {
        self.params.last().map(|p| p.as_str()).unwrap_or("")
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            // Sort for a stable wire form; servers don't care, tests do.
            let mut keys: Vec<&String> = self.tags.keys().collect();
            keys.sort();
            write!(f, "@")?;
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                let value = &self.tags[*key];
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            let last = i == self.params.len() - 1;
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in raw.split(';') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => tags.insert(key.to_string(), unescape_tag_value(value)),
            None => tags.insert(pair.to_string(), String::new()),
        };
    }
    tags
}

/// `\:` → `;`, `\s` → space, `\\` → `\`, `\r`/`\n` → CR/LF.
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

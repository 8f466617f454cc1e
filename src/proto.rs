//! IRC line codec: parsing inbound protocol lines and formatting outbound
//! command lines.
//!
//! Parsing never fails. Malformed or partial input degrades to a
//! best-effort structure with empty fields, so the router can always
//! fall through to a generic display instead of dropping the line.

use std::time::Instant;

/// A parsed inbound protocol line. Immutable after construction, except
/// that the router overwrites `content` with decrypted plaintext and sets
/// `decrypted` when a direct message comes out of the encryption adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    /// Seconds since session start, mod 1000, zero-padded to 3 digits.
    pub timestamp: String,
    /// Sender nick (empty for lines without a sender prefix).
    pub nick: String,
    /// Sender ident/user portion of the prefix.
    pub user: String,
    /// Sender host portion of the prefix.
    pub host: String,
    /// Command verb (PRIVMSG, JOIN, PING, a numeric, ...).
    pub cmd: String,
    /// Recipient/target token (first middle argument).
    pub rcpt: String,
    /// Trailing free-text content.
    pub content: String,
    /// Remaining middle arguments after the target, space-joined.
    pub args: String,
    /// Set once `content` holds decrypted plaintext.
    pub decrypted: bool,
}

/// Splits `s` at the first occurrence of `sep`. The separator is consumed;
/// a missing separator yields `(s, "")`.
fn split2<'a>(s: &'a str, sep: &str) -> (&'a str, &'a str) {
    match s.split_once(sep) {
        Some((a, b)) => (a, b),
        None => (s, ""),
    }
}

/// Inbound line parser. Carries the session reference timestamp so every
/// message gets a relative stamp.
pub struct Codec {
    started: Instant,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn stamp(&self) -> String {
        format!("{:03}", self.started.elapsed().as_secs() % 1000)
    }

    /// Parse one raw protocol line into a [`ParsedMessage`]. Never fails;
    /// any field absent from the input is left empty.
    pub fn parse(&self, raw: &str) -> ParsedMessage {
        let mut m = ParsedMessage {
            timestamp: self.stamp(),
            ..Default::default()
        };

        let mut line = raw.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix(':') {
            let (prefix, remainder) = split2(rest, " ");
            line = remainder;
            let (nick, rest) = split2(prefix, "!");
            let (user, host) = split2(rest, "@");
            m.nick = nick.to_string();
            m.user = user.to_string();
            m.host = host.to_string();
        }

        let (head, content) = split2(line, " :");
        m.content = content.to_string();
        let (cmd, rest) = split2(head, " ");
        m.cmd = cmd.to_string();
        let (rcpt, args) = split2(rest, " ");
        m.rcpt = rcpt.to_string();
        m.args = args.to_string();
        m
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an outbound command line: verb first, space-separated middle
/// arguments, trailing free text prefixed with `:`.
pub fn format(verb: &str, args: &[&str], trailing: Option<&str>) -> String {
    let mut line = String::from(verb);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    if let Some(text) = trailing {
        line.push_str(" :");
        line.push_str(text);
    }
    line
}

//! Server-link wire protocol: message model, tokenizer, command table.
//!
//! The compact P10-style dialect puts a 1-2 digit numeric origin token first
//! on every post-handshake line (no leading `:`), then a command token, then
//! space-separated arguments with an optional `:`-prefixed trailing argument
//! that consumes the rest of the line.

pub mod codec;
pub mod send;

use crate::error::ProtocolError;

/// Hard IRC line limit, terminator included.
pub const MAX_LINE: usize = 512;

/// Maximum parameters on one line, origin and command included.
pub const MAX_PARAMS: usize = 200;

/// One parsed wire line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Origin token as it appeared (numeric, or `:name` stripped of `:`).
    /// Absent only during the pre-link handshake phase.
    pub origin: Option<String>,
    /// Command token, uppercased.
    pub command: String,
    /// Arguments, trailing argument last.
    pub args: Vec<String>,
}

impl RawMessage {
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

/// Split one line into tokens, honoring the `:`-trailing rule.
pub fn split_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = line.trim_end_matches(['\r', '\n']);
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        // A token starting with ':' is the trailing argument, except in the
        // leading (origin) position where it is the origin prefix.
        if rest.starts_with(':') && !out.is_empty() {
            out.push(rest[1..].to_string());
            break;
        }
        match rest.find(' ') {
            Some(pos) => {
                out.push(rest[..pos].to_string());
                rest = &rest[pos..];
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
        if out.len() >= MAX_PARAMS {
            break;
        }
    }
    out
}

/// Tokenize one wire line into a [`RawMessage`].
///
/// `linked` is whether the handshake has completed (an uplink exists): before
/// that, the very first token may be a bare command (`PASS`, `SERVER`) with
/// no origin; after it, the first token is always an origin.
pub fn parse_message(line: &str, linked: bool) -> Result<RawMessage, ProtocolError> {
    let mut tokens = split_line(line);
    if tokens.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    // Numeric origin tokens are 1-2 characters; a ':'-prefixed origin is a
    // full name. Anything longer in the lead position before link is the
    // command itself.
    let first = &tokens[0];
    let has_origin = first.starts_with(':') || linked || first.len() <= 2;
    if has_origin && tokens.len() < 2 {
        return Err(ProtocolError::MissingCommand);
    }
    let origin;
    let command;
    if has_origin {
        let raw = tokens.remove(0);
        origin = Some(raw.strip_prefix(':').map(str::to_string).unwrap_or(raw));
        command = tokens.remove(0);
    } else {
        origin = None;
        command = tokens.remove(0);
    }
    Ok(RawMessage {
        origin,
        command: command.to_ascii_uppercase(),
        args: tokens,
    })
}

macro_rules! commands {
    ($($name:ident => ($long:literal, $token:literal)),+ $(,)?) => {
        /// Canonical command names understood by the dispatcher.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Command {
            $($name),+
        }

        impl Command {
            /// Long wire name.
            #[allow(dead_code)] // With token(), the table doubles as wire documentation.
            pub fn long(self) -> &'static str {
                match self { $(Command::$name => $long),+ }
            }

            /// Short token used by the compact dialect.
            #[allow(dead_code)]
            pub fn token(self) -> &'static str {
                match self { $(Command::$name => $token),+ }
            }

            /// Resolve either spelling, case-insensitively.
            pub fn lookup(word: &str) -> Option<Command> {
                let upper = word.to_ascii_uppercase();
                $(
                    if upper == $long || upper == $token {
                        return Some(Command::$name);
                    }
                )+
                None
            }
        }
    };
}

commands! {
    Account => ("ACCOUNT", "AC"),
    Admin => ("ADMIN", "AD"),
    Away => ("AWAY", "A"),
    Burst => ("BURST", "B"),
    ClearMode => ("CLEARMODE", "CM"),
    Create => ("CREATE", "C"),
    EndOfBurst => ("END_OF_BURST", "EB"),
    EobAck => ("EOB_ACK", "EA"),
    Error => ("ERROR", "Y"),
    FakeHost => ("FAKE", "FA"),
    Gline => ("GLINE", "GL"),
    Invite => ("INVITE", "I"),
    Join => ("JOIN", "J"),
    Kick => ("KICK", "K"),
    Kill => ("KILL", "D"),
    Mode => ("MODE", "M"),
    Nick => ("NICK", "N"),
    Notice => ("NOTICE", "O"),
    OpMode => ("OPMODE", "OM"),
    Part => ("PART", "L"),
    Pass => ("PASS", "PA"),
    Ping => ("PING", "G"),
    Pong => ("PONG", "Z"),
    Privmsg => ("PRIVMSG", "P"),
    Quit => ("QUIT", "Q"),
    Server => ("SERVER", "S"),
    Squit => ("SQUIT", "SQ"),
    Stats => ("STATS", "R"),
    SvsNick => ("SVSNICK", "SN"),
    Topic => ("TOPIC", "T"),
    Version => ("VERSION", "V"),
    Whois => ("WHOIS", "W"),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_trailing() {
        let toks = split_line("AB P #chan :hello  world\r\n");
        assert_eq!(toks, vec!["AB", "P", "#chan", "hello  world"]);
    }

    #[test]
    fn split_collapses_interior_spaces() {
        let toks = split_line("AB  M   #chan  +nt");
        assert_eq!(toks, vec!["AB", "M", "#chan", "+nt"]);
    }

    #[test]
    fn parse_numeric_origin() {
        let msg = parse_message("AB N Alice 1 100 u host +i AAAAAA ABAAB :Real", true).unwrap();
        assert_eq!(msg.origin.as_deref(), Some("AB"));
        assert_eq!(msg.command, "N");
        assert_eq!(msg.args.len(), 9);
        assert_eq!(msg.last(), Some("Real"));
    }

    #[test]
    fn parse_handshake_command_without_origin() {
        let msg = parse_message("PASS :secret", false).unwrap();
        assert!(msg.origin.is_none());
        assert_eq!(msg.command, "PASS");
        assert_eq!(msg.args, vec!["secret"]);

        let msg = parse_message("SERVER irc.example.net 1 100 200 J10 ABAP] +s6 :desc", false)
            .unwrap();
        assert!(msg.origin.is_none());
        assert_eq!(msg.command, "SERVER");
    }

    #[test]
    fn parse_name_origin() {
        let msg = parse_message(":irc.example.net ERROR :bad", false).unwrap();
        assert_eq!(msg.origin.as_deref(), Some("irc.example.net"));
        assert_eq!(msg.command, "ERROR");
    }

    #[test]
    fn command_lookup_both_spellings() {
        assert_eq!(Command::lookup("privmsg"), Some(Command::Privmsg));
        assert_eq!(Command::lookup("P"), Some(Command::Privmsg));
        assert_eq!(Command::lookup("END_OF_BURST"), Some(Command::EndOfBurst));
        assert_eq!(Command::lookup("EB"), Some(Command::EndOfBurst));
        assert_eq!(Command::lookup("bogus"), None);
    }

    #[test]
    fn empty_line_is_an_error() {
        assert!(parse_message("   \r\n", true).is_err());
    }
}

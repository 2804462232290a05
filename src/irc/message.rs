/// IRC wire messages as seen by the relay client.
///
/// Format per RFC 2812:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// The codec strips `\r\n` before handing lines to [`Message::parse`].
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional source (`server.name` or `nick!user@host`).
    pub prefix: Option<String>,
    /// Command word or three-digit numeric.
    pub command: String,
    /// Parameters in order; a trailing param has already lost its `:`.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

/// The parts of a `nick!user@host` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source<'a> {
    pub nick: &'a str,
    pub user: Option<&'a str>,
    pub host: Option<&'a str>,
}

impl<'a> Source<'a> {
    pub fn parse(prefix: &'a str) -> Self {
        let (nick, rest) = match prefix.split_once('!') {
            Some((nick, rest)) => (nick, Some(rest)),
            None => (prefix, None),
        };
        let (user, host) = match rest {
            Some(rest) => match rest.split_once('@') {
                Some((user, host)) => (Some(user), Some(host)),
                None => (Some(rest), None),
            },
            None => (None, None),
        };
        Source { nick, user, host }
    }
}

impl Message {
    /// Build a client-originated message (no prefix).
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_owned(),
            params,
        }
    }

    /// Parse a single line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let line = input.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(stripped) => match stripped.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_owned()), rest.trim_start_matches(' ')),
                None => return Err(ParseError::MissingCommand),
            },
            None => (None, line),
        };

        let (command, mut remaining) = match rest.split_once(' ') {
            Some((command, params)) => (command, params),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, next)) => {
                    if !param.is_empty() {
                        params.push(param.to_owned());
                    }
                    remaining = next;
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// The prefix split into nick/user/host, if there is one.
    pub fn source(&self) -> Option<Source<'_>> {
        self.prefix.as_deref().map(Source::parse)
    }

    /// Nick of the sender (`wings` for `wings!user@host`).
    pub fn source_nick(&self) -> Option<&str> {
        self.source().map(|s| s.nick)
    }

    /// Three-digit numeric replies (`001`, `353`, ...).
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Parameter at `idx`, or `None` when the server sent too few.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Serialize to the wire format (without trailing `\r\n`).
    ///
    /// The last parameter is always written as a trailing param.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push_str(" :");
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_numeric_with_prefix() {
        let msg = Message::parse(":irc.libera.chat 001 bridge :Welcome to Libera").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("irc.libera.chat"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["bridge", "Welcome to Libera"]);
        assert!(msg.is_numeric());
    }

    #[test]
    fn parse_names_reply() {
        let msg = Message::parse(":srv 353 bridge = #rust :@alice +bob carol").unwrap();
        assert_eq!(msg.params, vec!["bridge", "=", "#rust", "@alice +bob carol"]);
    }

    #[test]
    fn parse_lowercase_command_is_normalised() {
        let msg = Message::parse("privmsg #rust :hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert!(!msg.is_numeric());
    }

    #[test]
    fn parse_collapses_repeated_spaces_between_params() {
        let msg = Message::parse("MODE #rust  +o  alice").unwrap();
        assert_eq!(msg.params, vec!["#rust", "+o", "alice"]);
    }

    #[test]
    fn parse_trailing_may_be_empty_or_start_with_colon() {
        assert_eq!(Message::parse("TOPIC #rust :").unwrap().params, vec!["#rust", ""]);
        assert_eq!(
            Message::parse("PRIVMSG #rust ::)").unwrap().params,
            vec!["#rust", ":)"]
        );
    }

    #[test]
    fn parse_strips_line_terminator() {
        let msg = Message::parse("PING :token\r\n").unwrap();
        assert_eq!(msg.params, vec!["token"]);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse(":only.prefix"), Err(ParseError::MissingCommand));
    }

    // ── Sources ──────────────────────────────────────────────────

    #[test]
    fn source_full_hostmask() {
        let msg = Message::parse(":alice!~al@host.example JOIN #rust").unwrap();
        let src = msg.source().unwrap();
        assert_eq!(src.nick, "alice");
        assert_eq!(src.user, Some("~al"));
        assert_eq!(src.host, Some("host.example"));
        assert_eq!(msg.source_nick(), Some("alice"));
    }

    #[test]
    fn source_server_name() {
        let msg = Message::parse(":irc.example.net NOTICE * :hi").unwrap();
        let src = msg.source().unwrap();
        assert_eq!(src.nick, "irc.example.net");
        assert_eq!(src.user, None);
        assert_eq!(src.host, None);
    }

    #[test]
    fn param_out_of_range_is_none() {
        let msg = Message::parse(":srv 311 me").unwrap();
        assert_eq!(msg.param(1), None);
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_marks_last_param_trailing() {
        let msg = Message::new("WHO", vec!["#rust".into()]);
        assert_eq!(msg.to_wire(), "WHO :#rust");
        let msg = Message::new("PRIVMSG", vec!["#rust".into(), "hello there".into()]);
        assert_eq!(msg.to_string(), "PRIVMSG #rust :hello there");
    }

    #[test]
    fn serialize_without_params() {
        assert_eq!(Message::new("LIST", vec![]).to_wire(), "LIST");
    }
}

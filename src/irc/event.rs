/// Inbound protocol events, as the tracker consumes them.
///
/// Semantic events cover what every client library parses for you; numeric
/// replies stay raw ([`RawFrame`]) and are interpreted by the tracker.
use std::collections::HashMap;

use super::message::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    Join {
        channel: String,
        nick: String,
        username: Option<String>,
        hostname: Option<String>,
        /// From `extended-join`; `None` when logged out or not negotiated.
        account: Option<String>,
        realname: Option<String>,
    },
    Part {
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    Kick {
        channel: String,
        nick: String,
        by: Option<String>,
        reason: Option<String>,
    },
    Quit {
        nick: String,
        reason: Option<String>,
    },
    Nick {
        old: String,
        new: String,
    },
    Topic {
        channel: String,
        topic: String,
        set_by: Option<String>,
    },
    Mode {
        target: String,
        set_by: Option<String>,
        modes: String,
        params: Vec<String>,
    },
    /// A complete NAMES listing: nick → membership glyphs (`"@"`, `"+"`, `""`).
    Names {
        channel: String,
        users: HashMap<String, String>,
    },
    /// `away-notify`: `None` means back.
    Away {
        nick: String,
        message: Option<String>,
    },
}

impl IrcEvent {
    /// Build the semantic event for a command message, if it is one.
    ///
    /// Returns `None` for numerics, unknown commands, and frames that are
    /// missing required parameters.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let source = msg.source();
        let nick = source.map(|s| s.nick.to_owned());

        let event = match msg.command.as_str() {
            "JOIN" => {
                let source = source?;
                IrcEvent::Join {
                    channel: msg.param(0)?.to_owned(),
                    nick: source.nick.to_owned(),
                    username: source.user.map(str::to_owned),
                    hostname: source.host.map(str::to_owned),
                    account: msg.param(1).filter(|a| *a != "*").map(str::to_owned),
                    realname: msg.param(2).map(str::to_owned),
                }
            }
            "PART" => IrcEvent::Part {
                channel: msg.param(0)?.to_owned(),
                nick: nick?,
                reason: msg.param(1).map(str::to_owned),
            },
            "KICK" => IrcEvent::Kick {
                channel: msg.param(0)?.to_owned(),
                nick: msg.param(1)?.to_owned(),
                by: nick,
                reason: msg.param(2).map(str::to_owned),
            },
            "QUIT" => IrcEvent::Quit {
                nick: nick?,
                reason: msg.param(0).map(str::to_owned),
            },
            "NICK" => IrcEvent::Nick {
                old: nick?,
                new: msg.param(0)?.to_owned(),
            },
            "TOPIC" => IrcEvent::Topic {
                channel: msg.param(0)?.to_owned(),
                topic: msg.param(1).unwrap_or_default().to_owned(),
                set_by: nick,
            },
            "MODE" => IrcEvent::Mode {
                target: msg.param(0)?.to_owned(),
                set_by: nick,
                modes: msg.param(1)?.to_owned(),
                params: msg.params.iter().skip(2).cloned().collect(),
            },
            "AWAY" => IrcEvent::Away {
                nick: nick?,
                message: msg.param(0).filter(|m| !m.is_empty()).map(str::to_owned),
            },
            _ => return None,
        };
        Some(event)
    }
}

/// A numeric reply line: code, ordered arguments, and the sending server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: String,
    pub args: Vec<String>,
    pub server: Option<String>,
}

impl RawFrame {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            server: None,
        }
    }

    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }
}

impl From<&Message> for RawFrame {
    fn from(msg: &Message) -> Self {
        Self {
            command: msg.command.clone(),
            args: msg.params.clone(),
            server: msg.prefix.clone(),
        }
    }
}

/// Mirror records for remote IRC users, channels, and the server itself.
///
/// All map keys are case-folded with [`irc_lower`]; the records keep the
/// nick/channel spelling the server last used.
use std::collections::HashMap;

use serde::Serialize;

use super::modes::{ChanModes, MemberFlags, PrefixTable};

/// Case-fold a nick or channel name for use as a map key.
pub fn irc_lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// What the bridge knows about one remote user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrcUserInfo {
    pub nick: String,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub hostname: Option<String>,
    pub server: Option<String>,
    pub account: Option<String>,
    /// Folded names of channels we share with this user.
    pub channels: Vec<String>,
    /// User modes, when the server told us.
    pub modes: Vec<char>,
    /// Network operator (313 / `*` WHO flag) or op in any shared channel.
    pub is_operator: bool,
    /// Voiced in any shared channel.
    pub is_voiced: bool,
    pub is_away: bool,
    pub away_message: Option<String>,
    /// Connected over TLS (671).
    pub is_secure: bool,
    /// Network operator as reported by WHOIS/WHO.
    pub is_network_operator: bool,
    pub idle_time: Option<u64>,
    pub signon_time: Option<u64>,
    pub last_seen: u64,
    /// When the last WHOIS reply finished.
    pub last_whois: Option<u64>,
}

impl IrcUserInfo {
    pub fn new(nick: &str, now: u64) -> Self {
        Self {
            nick: nick.to_owned(),
            username: None,
            realname: None,
            hostname: None,
            server: None,
            account: None,
            channels: Vec::new(),
            modes: Vec::new(),
            is_operator: false,
            is_voiced: false,
            is_away: false,
            away_message: None,
            is_secure: false,
            is_network_operator: false,
            idle_time: None,
            signon_time: None,
            last_seen: now,
            last_whois: None,
        }
    }

    pub(crate) fn add_channel(&mut self, channel_key: &str) {
        if !self.channels.iter().any(|c| c == channel_key) {
            self.channels.push(channel_key.to_owned());
        }
    }

    pub(crate) fn remove_channel(&mut self, channel_key: &str) {
        self.channels.retain(|c| c != channel_key);
    }

    /// Hostmask in `nick!user@host` form, with `*` for unknown parts.
    pub fn hostmask(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick,
            self.username.as_deref().unwrap_or("*"),
            self.hostname.as_deref().unwrap_or("*")
        )
    }
}

/// One user's membership in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrcChannelUser {
    pub nick: String,
    modes: Vec<char>,
    is_operator: bool,
    is_voiced: bool,
    is_half_operator: bool,
    pub join_time: u64,
}

impl IrcChannelUser {
    pub fn new(nick: &str, modes: Vec<char>, join_time: u64) -> Self {
        let mut user = Self {
            nick: nick.to_owned(),
            modes: Vec::new(),
            is_operator: false,
            is_voiced: false,
            is_half_operator: false,
            join_time,
        };
        user.set_modes(modes);
        user
    }

    pub fn modes(&self) -> &[char] {
        &self.modes
    }

    pub fn is_operator(&self) -> bool {
        self.is_operator
    }

    pub fn is_voiced(&self) -> bool {
        self.is_voiced
    }

    pub fn is_half_operator(&self) -> bool {
        self.is_half_operator
    }

    pub fn set_modes(&mut self, modes: Vec<char>) {
        self.modes = modes;
        self.recompute();
    }

    pub fn add_mode(&mut self, mode: char) {
        if !self.modes.contains(&mode) {
            self.modes.push(mode);
        }
        self.recompute();
    }

    pub fn remove_mode(&mut self, mode: char) {
        self.modes.retain(|m| *m != mode);
        self.recompute();
    }

    /// Highest-ranked glyph for display, e.g. `@` for an op.
    pub fn prefix_glyph(&self, prefixes: &PrefixTable) -> Option<char> {
        prefixes
            .entries()
            .iter()
            .find(|(_, letter)| self.modes.contains(letter))
            .map(|(glyph, _)| *glyph)
    }

    fn recompute(&mut self) {
        let flags = MemberFlags::from_modes(&self.modes);
        self.is_operator = flags.is_operator;
        self.is_voiced = flags.is_voiced;
        self.is_half_operator = flags.is_half_operator;
    }
}

/// A channel the bridge can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IrcChannelInfo {
    pub name: String,
    pub topic: Option<String>,
    pub topic_set_by: Option<String>,
    pub topic_set_at: Option<u64>,
    /// Channel mode string, e.g. `+nt`.
    pub modes: String,
    user_count: usize,
    users: HashMap<String, IrcChannelUser>,
}

impl IrcChannelInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            topic: None,
            topic_set_by: None,
            topic_set_at: None,
            modes: String::new(),
            user_count: 0,
            users: HashMap::new(),
        }
    }

    pub fn user_count(&self) -> usize {
        self.user_count
    }

    pub fn users(&self) -> &HashMap<String, IrcChannelUser> {
        &self.users
    }

    pub fn user(&self, nick: &str) -> Option<&IrcChannelUser> {
        self.users.get(&irc_lower(nick))
    }

    pub(crate) fn user_mut(&mut self, nick_key: &str) -> Option<&mut IrcChannelUser> {
        self.users.get_mut(nick_key)
    }

    pub(crate) fn insert_user(&mut self, nick_key: String, user: IrcChannelUser) {
        self.users.insert(nick_key, user);
        self.user_count = self.users.len();
    }

    pub(crate) fn remove_user(&mut self, nick_key: &str) -> Option<IrcChannelUser> {
        let removed = self.users.remove(nick_key);
        self.user_count = self.users.len();
        removed
    }

    pub(crate) fn replace_users(&mut self, users: HashMap<String, IrcChannelUser>) {
        self.users = users;
        self.user_count = self.users.len();
    }

    /// Apply a `+x`/`-x` flag-style channel mode to the mode string.
    pub(crate) fn apply_flag(&mut self, setting: bool, mode: char) {
        let mut letters: Vec<char> = self.modes.trim_start_matches('+').chars().collect();
        if setting {
            if !letters.contains(&mode) {
                letters.push(mode);
            }
        } else {
            letters.retain(|m| *m != mode);
        }
        self.modes = if letters.is_empty() {
            String::new()
        } else {
            format!("+{}", letters.into_iter().collect::<String>())
        };
    }
}

/// An ISUPPORT token's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Feature {
    Value(String),
    Flag(bool),
}

/// What the remote server has told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub network: Option<String>,
    pub supported_features: HashMap<String, Feature>,
    pub prefixes: PrefixTable,
    pub channel_modes: ChanModes,
}

impl ServerInfo {
    /// Record one ISUPPORT token (`KEY=value`, `KEY`, or `-KEY`).
    pub fn apply_isupport(&mut self, token: &str) {
        if let Some(negated) = token.strip_prefix('-') {
            self.supported_features
                .insert(negated.to_ascii_uppercase(), Feature::Flag(false));
            return;
        }
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key.to_ascii_uppercase(), Some(value)),
            None => (token.to_ascii_uppercase(), None),
        };

        match (key.as_str(), value) {
            ("PREFIX", Some(v)) => {
                if let Some(table) = PrefixTable::parse(v) {
                    self.prefixes = table;
                }
            }
            ("CHANMODES", Some(v)) => {
                if let Some(modes) = ChanModes::parse(v) {
                    self.channel_modes = modes;
                }
            }
            ("NETWORK", Some(v)) => self.network = Some(v.to_owned()),
            _ => {}
        }

        let feature = match value {
            Some(v) => Feature::Value(v.to_owned()),
            None => Feature::Flag(true),
        };
        self.supported_features.insert(key, feature);
    }

    pub fn feature(&self, key: &str) -> Option<&Feature> {
        self.supported_features.get(&key.to_ascii_uppercase())
    }

    /// Channel name sigils from `CHANTYPES`, `#&` until advertised.
    pub fn chantypes(&self) -> &str {
        match self.feature("CHANTYPES") {
            Some(Feature::Value(types)) => types,
            _ => "#&",
        }
    }
}

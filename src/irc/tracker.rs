/// Live mirror of the remote IRC network, rebuilt from the relay's inbound
/// stream.
///
/// The relay connection task owns the tracker and feeds it every frame in
/// arrival order through [`ProtocolTracker::handle_message`]. Everything else
/// reads it through [`SharedTracker`].
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::event::{IrcEvent, RawFrame};
use super::message::Message;
use super::modes::parse_mode_changes;
use super::pending::{
    ListEntry, PendingReply, PendingTable, Registration, RequestError, RequestKind, WhoEntry,
};
use super::state::{
    irc_lower, now_secs, IrcChannelInfo, IrcChannelUser, IrcUserInfo, ServerInfo,
};
use super::whois::WhoisQueue;

/// Tracker shared between the relay task and query callers.
pub type SharedTracker = Arc<Mutex<ProtocolTracker>>;

/// Timeouts and limits for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub who_timeout: Duration,
    pub list_timeout: Duration,
    /// Most LIST rows kept for a single request.
    pub list_cap: usize,
    /// A cached WHOIS older than this is refreshed on explicit lookup.
    pub whois_staleness: Duration,
    /// Channel-less users not seen for this long are collected.
    pub gc_max_age: Duration,
    pub gc_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            who_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(60),
            list_cap: 10_000,
            whois_staleness: Duration::from_secs(5 * 60),
            gc_max_age: Duration::from_secs(24 * 60 * 60),
            gc_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Aggregate counts for status output and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub users: usize,
    pub channels: usize,
    pub operators: usize,
    pub secure: usize,
    pub away: usize,
    pub pending_whois: usize,
    pub pending_who: usize,
    pub pending_list: usize,
}

pub struct ProtocolTracker {
    config: TrackerConfig,
    own_nick: Option<String>,
    users: HashMap<String, IrcUserInfo>,
    channels: HashMap<String, IrcChannelInfo>,
    server: ServerInfo,
    /// Folded nicks with a WHOIS requested and no 318 yet.
    whois_pending: HashSet<String>,
    whois_queue: Arc<dyn WhoisQueue>,
    /// 353 lines collected until the channel's 366 arrives.
    names_buffer: HashMap<String, HashMap<String, String>>,
    who: PendingTable<WhoEntry>,
    list: PendingTable<ListEntry>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ProtocolTracker {
    pub fn new(
        config: TrackerConfig,
        whois_queue: Arc<dyn WhoisQueue>,
        outgoing: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let who = PendingTable::new(RequestKind::Who, config.who_timeout);
        let list =
            PendingTable::new(RequestKind::List, config.list_timeout).with_cap(config.list_cap);
        Self {
            config,
            own_nick: None,
            users: HashMap::new(),
            channels: HashMap::new(),
            server: ServerInfo::default(),
            whois_pending: HashSet::new(),
            whois_queue,
            names_buffer: HashMap::new(),
            who,
            list,
            outgoing,
        }
    }

    pub fn into_shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    /// Forget everything learned from the previous connection.
    ///
    /// In-flight WHO/LIST requests are left to their deadlines.
    pub fn reset(&mut self) {
        self.own_nick = None;
        self.users.clear();
        self.channels.clear();
        self.server = ServerInfo::default();
        self.whois_pending.clear();
        self.names_buffer.clear();
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    /// Feed one inbound wire message.
    pub fn handle_message(&mut self, msg: &Message) {
        self.handle_message_at(msg, now_secs());
    }

    pub fn handle_message_at(&mut self, msg: &Message, now: u64) {
        if let Some(event) = IrcEvent::from_message(msg) {
            self.apply_event(event, now);
            return;
        }

        match msg.command.as_str() {
            "353" => self.collect_names(msg),
            "366" => {
                let Some(channel) = msg.param(1) else {
                    return;
                };
                let users = self
                    .names_buffer
                    .remove(&irc_lower(channel))
                    .unwrap_or_default();
                self.apply_event(
                    IrcEvent::Names {
                        channel: channel.to_owned(),
                        users,
                    },
                    now,
                );
            }
            "PRIVMSG" | "NOTICE" => {
                if let Some(nick) = msg.source_nick() {
                    if let Some(user) = self.users.get_mut(&irc_lower(nick)) {
                        user.last_seen = now;
                    }
                }
            }
            _ if msg.is_numeric() => self.apply_raw(&RawFrame::from(msg), now),
            _ => {}
        }
    }

    /// Apply a semantic event.
    pub fn handle_event(&mut self, event: IrcEvent) {
        self.apply_event(event, now_secs());
    }

    /// Apply a numeric reply.
    pub fn handle_raw(&mut self, frame: &RawFrame) {
        self.apply_raw(frame, now_secs());
    }

    fn collect_names(&mut self, msg: &Message) {
        // `353 me = #chan :names`; some servers drop the channel-type symbol.
        let n = msg.params.len();
        if n < 3 {
            trace!("dropping short 353");
            return;
        }
        let channel = &msg.params[n - 2];
        let buffer = self.names_buffer.entry(irc_lower(channel)).or_default();
        for entry in msg.params[n - 1].split_whitespace() {
            let (letters, nick) = self.server.prefixes.split_prefixed(entry);
            // userhost-in-names: `nick!user@host`.
            let nick = nick.split('!').next().unwrap_or(nick);
            if nick.is_empty() {
                continue;
            }
            let glyphs: String = letters
                .iter()
                .filter_map(|l| self.server.prefixes.glyph_for(*l))
                .collect();
            buffer.insert(nick.to_owned(), glyphs);
        }
    }

    fn apply_event(&mut self, event: IrcEvent, now: u64) {
        match event {
            IrcEvent::Join {
                channel,
                nick,
                username,
                hostname,
                account,
                realname,
            } => self.on_join(&channel, &nick, username, hostname, account, realname, now),
            IrcEvent::Part { channel, nick, .. } => self.on_leave(&channel, &nick, now),
            IrcEvent::Kick { channel, nick, by, .. } => {
                debug!(channel, nick, by = by.as_deref().unwrap_or("?"), "kick");
                self.on_leave(&channel, &nick, now);
            }
            IrcEvent::Quit { nick, .. } => self.on_quit(&nick),
            IrcEvent::Nick { old, new } => self.rename(&old, &new, now),
            IrcEvent::Topic {
                channel,
                topic,
                set_by,
            } => {
                let chan = self.ensure_channel(&channel);
                chan.topic = (!topic.is_empty()).then_some(topic);
                chan.topic_set_by = set_by;
                chan.topic_set_at = Some(now);
            }
            IrcEvent::Mode {
                target,
                modes,
                params,
                ..
            } => self.on_mode(&target, &modes, &params),
            IrcEvent::Names { channel, users } => self.on_names(&channel, users, now),
            IrcEvent::Away { nick, message } => {
                let user = self.ensure_user(&nick, now);
                user.is_away = message.is_some();
                user.away_message = message;
            }
        }
    }

    // ── Semantic events ──────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn on_join(
        &mut self,
        channel: &str,
        nick: &str,
        username: Option<String>,
        hostname: Option<String>,
        account: Option<String>,
        realname: Option<String>,
        now: u64,
    ) {
        let chan_key = irc_lower(channel);
        let nick_key = irc_lower(nick);

        if self.is_own_nick(nick) {
            info!(channel, "joined channel");
        }

        let chan = self.ensure_channel(channel);
        if chan.user(nick).is_none() {
            chan.insert_user(nick_key.clone(), IrcChannelUser::new(nick, Vec::new(), now));
        }

        let user = self.ensure_user(nick, now);
        user.last_seen = now;
        user.add_channel(&chan_key);
        if username.is_some() {
            user.username = username;
        }
        if hostname.is_some() {
            user.hostname = hostname;
        }
        if account.is_some() {
            user.account = account;
        }
        if realname.is_some() {
            user.realname = realname;
        }
        let needs_whois = user.hostname.is_none();

        self.refresh_user_flags(&nick_key);
        if needs_whois && !self.is_own_nick(nick) {
            self.request_whois(nick);
        }
    }

    fn on_leave(&mut self, channel: &str, nick: &str, now: u64) {
        let chan_key = irc_lower(channel);
        let nick_key = irc_lower(nick);

        if self.is_own_nick(nick) {
            info!(channel, "left channel");
            if let Some(chan) = self.channels.remove(&chan_key) {
                for member in chan.users().keys() {
                    if let Some(user) = self.users.get_mut(member) {
                        user.remove_channel(&chan_key);
                    }
                    self.refresh_user_flags(member);
                }
            }
            return;
        }

        if let Some(chan) = self.channels.get_mut(&chan_key) {
            chan.remove_user(&nick_key);
        }
        if let Some(user) = self.users.get_mut(&nick_key) {
            user.remove_channel(&chan_key);
            user.last_seen = now;
        }
        self.refresh_user_flags(&nick_key);
    }

    fn on_quit(&mut self, nick: &str) {
        let nick_key = irc_lower(nick);
        if let Some(user) = self.users.remove(&nick_key) {
            for chan_key in &user.channels {
                if let Some(chan) = self.channels.get_mut(chan_key) {
                    chan.remove_user(&nick_key);
                }
            }
        }
        self.whois_pending.remove(&nick_key);
    }

    /// Re-key a user and every membership that references it.
    fn rename(&mut self, old: &str, new: &str, now: u64) {
        let old_key = irc_lower(old);
        let new_key = irc_lower(new);

        if self.is_own_nick(old) {
            info!(old, new, "own nick changed");
            self.own_nick = Some(new.to_owned());
        }

        let mut user = self
            .users
            .remove(&old_key)
            .unwrap_or_else(|| IrcUserInfo::new(old, now));
        user.nick = new.to_owned();
        user.last_seen = now;

        for chan_key in &user.channels {
            if let Some(chan) = self.channels.get_mut(chan_key) {
                if let Some(mut member) = chan.remove_user(&old_key) {
                    member.nick = new.to_owned();
                    chan.insert_user(new_key.clone(), member);
                }
            }
        }
        self.users.insert(new_key, user);
    }

    fn on_mode(&mut self, target: &str, modes: &str, params: &[String]) {
        if !self.is_channel_name(target) {
            if self.is_own_nick(target) {
                let user = self.ensure_user(target, now_secs());
                for change in parse_mode_changes(modes, &[], &Default::default(), &Default::default())
                {
                    if change.setting {
                        if !user.modes.contains(&change.mode) {
                            user.modes.push(change.mode);
                        }
                    } else {
                        user.modes.retain(|m| *m != change.mode);
                    }
                }
            }
            return;
        }

        let changes = parse_mode_changes(
            modes,
            params,
            &self.server.prefixes,
            &self.server.channel_modes,
        );
        let chan_key = irc_lower(target);
        let mut touched = Vec::new();

        let Some(chan) = self.channels.get_mut(&chan_key) else {
            trace!(channel = target, "mode for untracked channel");
            return;
        };
        for change in changes {
            if self.server.prefixes.is_membership_mode(change.mode) {
                let Some(nick) = change.param else { continue };
                let nick_key = irc_lower(&nick);
                if let Some(member) = chan.user_mut(&nick_key) {
                    if change.setting {
                        member.add_mode(change.mode);
                    } else {
                        member.remove_mode(change.mode);
                    }
                    touched.push(nick_key);
                }
            } else if !self.server.channel_modes.list.contains(change.mode) {
                chan.apply_flag(change.setting, change.mode);
            }
        }
        for nick_key in touched {
            self.refresh_user_flags(&nick_key);
        }
    }

    /// Replace a channel's membership with a complete NAMES listing.
    fn on_names(&mut self, channel: &str, listing: HashMap<String, String>, now: u64) {
        let chan_key = irc_lower(channel);
        let prefixes = self.server.prefixes.clone();

        let previous: HashMap<String, IrcChannelUser> = self
            .channels
            .get(&chan_key)
            .map(|c| c.users().clone())
            .unwrap_or_default();

        let mut members = HashMap::with_capacity(listing.len());
        for (raw_nick, glyphs) in listing {
            let (mut letters, nick) = prefixes.split_prefixed(&raw_nick);
            for letter in prefixes.letters_for_glyphs(&glyphs) {
                if !letters.contains(&letter) {
                    letters.push(letter);
                }
            }
            if nick.is_empty() {
                continue;
            }
            let key = irc_lower(nick);
            let join_time = previous.get(&key).map_or(now, |m| m.join_time);
            members.insert(key, IrcChannelUser::new(nick, letters, join_time));
        }

        for gone in previous.keys().filter(|k| !members.contains_key(*k)) {
            if let Some(user) = self.users.get_mut(gone) {
                user.remove_channel(&chan_key);
            }
        }

        let mut first_sightings = Vec::new();
        for (key, member) in &members {
            let known = self.users.contains_key(key);
            let user = self.ensure_user(&member.nick, now);
            user.add_channel(&chan_key);
            if !known && user.hostname.is_none() {
                first_sightings.push(member.nick.clone());
            }
        }

        let affected: Vec<String> = previous.keys().chain(members.keys()).cloned().collect();
        self.ensure_channel(channel).replace_users(members);
        for key in affected {
            self.refresh_user_flags(&key);
        }
        for nick in first_sightings {
            if !self.is_own_nick(&nick) {
                self.request_whois(&nick);
            }
        }
    }

    // ── Numeric replies ──────────────────────────────────────────

    fn apply_raw(&mut self, frame: &RawFrame, now: u64) {
        let a = |i: usize| frame.arg(i);
        // Every arm below requires its arguments; short frames fall through
        // to the trace at the end.
        let handled = match frame.command.as_str() {
            // RPL_WELCOME
            "001" => a(0).map(|me| {
                info!(nick = me, server = frame.server.as_deref().unwrap_or("?"), "registered");
                self.own_nick = Some(me.to_owned());
                self.server.name = frame.server.clone();
                self.ensure_user(me, now);
            }),
            // RPL_MYINFO
            "004" => a(2).map(|version| {
                self.server.name = a(1).map(str::to_owned);
                self.server.version = Some(version.to_owned());
            }),
            // RPL_ISUPPORT: tokens sit between our nick and the trailing text.
            "005" => (frame.args.len() >= 3).then(|| {
                for token in &frame.args[1..frame.args.len() - 1] {
                    self.server.apply_isupport(token);
                }
            }),
            // RPL_AWAY
            "301" => a(2).zip(a(1)).map(|(message, nick)| {
                let user = self.ensure_user(nick, now);
                user.is_away = true;
                user.away_message = Some(message.to_owned());
            }),
            // RPL_UNAWAY / RPL_NOWAWAY
            "305" | "306" => a(0).map(|me| {
                let away = frame.command == "306";
                let user = self.ensure_user(me, now);
                user.is_away = away;
                if !away {
                    user.away_message = None;
                }
            }),
            // RPL_WHOISUSER
            "311" => a(5).map(|realname| {
                let (nick, username, host) = (a(1).unwrap_or_default(), a(2), a(3));
                let user = self.ensure_user(nick, now);
                user.nick = nick.to_owned();
                user.username = username.map(str::to_owned);
                user.hostname = host.map(str::to_owned);
                user.realname = Some(realname.to_owned());
            }),
            // RPL_WHOISSERVER
            "312" => a(2).zip(a(1)).map(|(server, nick)| {
                self.ensure_user(nick, now).server = Some(server.to_owned());
            }),
            // RPL_WHOISOPERATOR
            "313" => a(1).map(|nick| {
                self.ensure_user(nick, now).is_network_operator = true;
                self.refresh_user_flags(&irc_lower(nick));
            }),
            // RPL_WHOISIDLE: `me nick idle [signon] :text`
            "317" => a(2).zip(a(1)).map(|(idle, nick)| {
                let signon = a(3).and_then(|s| s.parse().ok());
                let user = self.ensure_user(nick, now);
                user.idle_time = idle.parse().ok();
                if signon.is_some() {
                    user.signon_time = signon;
                }
            }),
            // RPL_ENDOFWHOIS
            "318" => a(1).map(|nick| self.finish_whois(nick, now)),
            // RPL_WHOISCHANNELS: only channels we track are mirrored.
            "319" => a(2).zip(a(1)).map(|(list, nick)| self.on_whois_channels(nick, list, now)),
            // RPL_WHOISACCOUNT
            "330" => a(2).zip(a(1)).map(|(account, nick)| {
                self.ensure_user(nick, now).account = Some(account.to_owned());
            }),
            // ERR_NOSUCHNICK ends a WHOIS without 318 on some servers.
            "401" => a(1).map(|nick| {
                let key = irc_lower(nick);
                if self.whois_pending.remove(&key) {
                    debug!(nick, "whois target does not exist");
                }
                if self.users.get(&key).is_some_and(|u| u.channels.is_empty()) {
                    self.users.remove(&key);
                }
            }),
            // RPL_WHOISSECURE
            "671" => a(1).map(|nick| {
                self.ensure_user(nick, now).is_secure = true;
            }),
            // RPL_WHOREPLY
            "352" => a(7).map(|_| self.on_who_reply(frame, now)),
            // RPL_ENDOFWHO
            "315" => a(1).map(|target| {
                self.who.resolve(&irc_lower(target));
            }),
            // RPL_LIST
            "322" => a(2).map(|count| {
                let entry = ListEntry {
                    channel: a(1).unwrap_or_default().to_owned(),
                    user_count: count.parse().unwrap_or(0),
                    topic: a(3).unwrap_or_default().to_owned(),
                };
                if let Some(key) = self.list.oldest(|_| true) {
                    self.list.push(&key, entry);
                }
            }),
            // RPL_LISTEND
            "323" => {
                if let Some(key) = self.list.oldest(|_| true) {
                    self.list.resolve(&key);
                }
                Some(())
            }
            // RPL_CHANNELMODEIS
            "324" => a(2).zip(a(1)).map(|(modes, channel)| {
                self.ensure_channel(channel).modes = modes.to_owned();
            }),
            // RPL_NOTOPIC
            "331" => a(1).map(|channel| {
                let chan = self.ensure_channel(channel);
                chan.topic = None;
            }),
            // RPL_TOPIC
            "332" => a(2).zip(a(1)).map(|(topic, channel)| {
                let chan = self.ensure_channel(channel);
                chan.topic = (!topic.is_empty()).then(|| topic.to_owned());
            }),
            // RPL_TOPICWHOTIME
            "333" => a(2).zip(a(1)).map(|(setter, channel)| {
                let at = a(3).and_then(|t| t.parse().ok());
                let chan = self.ensure_channel(channel);
                chan.topic_set_by = Some(setter.split('!').next().unwrap_or(setter).to_owned());
                chan.topic_set_at = at;
            }),
            _ => Some(()),
        };

        if handled.is_none() {
            trace!(command = %frame.command, args = frame.args.len(), "dropping short numeric");
        }
    }

    fn on_who_reply(&mut self, frame: &RawFrame, now: u64) {
        // `me channel user host server nick flags :hops realname`
        let arg = |i: usize| frame.arg(i).unwrap_or_default().to_owned();
        let trailing = arg(7);
        let (hops, realname) = trailing.split_once(' ').unwrap_or((trailing.as_str(), ""));
        let entry = WhoEntry {
            channel: arg(1),
            username: arg(2),
            hostname: arg(3),
            server: arg(4),
            nick: arg(5),
            flags: arg(6),
            hopcount: hops.parse().unwrap_or(0),
            realname: realname.to_owned(),
        };

        let user = self.ensure_user(&entry.nick, now);
        user.username = Some(entry.username.clone());
        user.hostname = Some(entry.hostname.clone());
        user.server = Some(entry.server.clone());
        user.realname = Some(entry.realname.clone());
        user.is_away = entry.is_away();
        if !user.is_away {
            user.away_message = None;
        }
        user.is_network_operator = entry.is_network_operator();
        self.refresh_user_flags(&irc_lower(&entry.nick));

        let channel_key = irc_lower(&entry.channel);
        let nick_key = irc_lower(&entry.nick);
        let key = self
            .who
            .route(&[channel_key.as_str(), nick_key.as_str()])
            .or_else(|| self.who.oldest(is_who_mask));
        if let Some(key) = key {
            self.who.push(&key, entry);
        }
    }

    fn on_whois_channels(&mut self, nick: &str, list: &str, now: u64) {
        let nick_key = irc_lower(nick);
        let prefixes = self.server.prefixes.clone();
        let chantypes = self.server.chantypes().to_owned();
        let mut joined = Vec::new();
        for entry in list.split_whitespace() {
            let (letters, channel) = prefixes.split_prefixed_channel(entry, &chantypes);
            let chan_key = irc_lower(channel);
            if let Some(chan) = self.channels.get_mut(&chan_key) {
                match chan.user_mut(&nick_key) {
                    Some(member) => member.set_modes(letters),
                    None => chan.insert_user(nick_key.clone(), IrcChannelUser::new(nick, letters, now)),
                }
                joined.push(chan_key);
            }
        }
        let user = self.ensure_user(nick, now);
        for chan_key in joined {
            user.add_channel(&chan_key);
        }
        self.refresh_user_flags(&nick_key);
    }

    fn finish_whois(&mut self, nick: &str, now: u64) {
        let key = irc_lower(nick);
        self.whois_pending.remove(&key);
        if let Some(user) = self.users.get_mut(&key) {
            user.last_whois = Some(now);
            user.last_seen = now;
        }
    }

    // ── WHOIS pacing ─────────────────────────────────────────────

    /// Ask the pacer for a WHOIS unless one is already outstanding.
    fn request_whois(&mut self, nick: &str) {
        if self.whois_pending.insert(irc_lower(nick)) {
            trace!(nick, "queueing whois");
            self.whois_queue.add(nick);
        }
    }

    pub fn is_whois_pending(&self, nick: &str) -> bool {
        self.whois_pending.contains(&irc_lower(nick))
    }

    // ── Correlated requests ──────────────────────────────────────

    /// Send `WHO pattern` and collect the rows up to the 315 terminator.
    pub fn who_query(&self, pattern: &str) -> PendingReply<WhoEntry> {
        let key = irc_lower(pattern);
        let (registration, reply) = self.who.register(&key);
        if registration == Registration::New
            && self
                .outgoing
                .send(Message::new("WHO", vec![pattern.to_owned()]))
                .is_err()
        {
            self.who.fail(&key, RequestError::Disconnected(RequestKind::Who));
        }
        reply
    }

    /// Send `LIST [pattern]` and collect the rows up to the 323 terminator.
    pub fn list_channels(&self, pattern: Option<&str>) -> PendingReply<ListEntry> {
        let key = format!("list {}", pattern.map(irc_lower).unwrap_or_default());
        let (registration, reply) = self.list.register(&key);
        if registration == Registration::New {
            let params = pattern.map(|p| vec![p.to_owned()]).unwrap_or_default();
            if self.outgoing.send(Message::new("LIST", params)).is_err() {
                self.list.fail(&key, RequestError::Disconnected(RequestKind::List));
            }
        }
        reply
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn own_nick(&self) -> Option<&str> {
        self.own_nick.as_deref()
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn get_user(&self, nick: &str) -> Option<&IrcUserInfo> {
        self.users.get(&irc_lower(nick))
    }

    /// Look a user up on behalf of someone, refreshing stale WHOIS data.
    pub fn lookup_user(&mut self, nick: &str) -> Option<IrcUserInfo> {
        self.lookup_user_at(nick, now_secs())
    }

    pub fn lookup_user_at(&mut self, nick: &str, now: u64) -> Option<IrcUserInfo> {
        let staleness = self.config.whois_staleness.as_secs();
        let user = self.users.get(&irc_lower(nick)).cloned();
        let stale = match &user {
            Some(u) => u
                .last_whois
                .map_or(true, |at| now.saturating_sub(at) > staleness),
            None => true,
        };
        if stale && !self.is_own_nick(nick) {
            self.request_whois(nick);
        }
        user
    }

    pub fn get_channel(&self, channel: &str) -> Option<&IrcChannelInfo> {
        self.channels.get(&irc_lower(channel))
    }

    pub fn channels(&self) -> impl Iterator<Item = &IrcChannelInfo> {
        self.channels.values()
    }

    pub fn channel_users(&self, channel: &str) -> Vec<&IrcChannelUser> {
        let mut users: Vec<_> = self
            .get_channel(channel)
            .map(|c| c.users().values().collect())
            .unwrap_or_default();
        users.sort_by(|a, b| a.nick.cmp(&b.nick));
        users
    }

    pub fn user_channels(&self, nick: &str) -> Vec<String> {
        self.get_user(nick)
            .map(|u| {
                u.channels
                    .iter()
                    .filter_map(|key| self.channels.get(key))
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_user_in_channel(&self, nick: &str, channel: &str) -> bool {
        self.get_channel(channel)
            .is_some_and(|c| c.user(nick).is_some())
    }

    /// Case-insensitive substring search over nick, username, realname and
    /// hostname.
    pub fn search_users(&self, query: &str) -> Vec<&IrcUserInfo> {
        let needle = query.to_lowercase();
        let matches = |field: Option<&str>| {
            field.is_some_and(|f| f.to_lowercase().contains(&needle))
        };
        let mut found: Vec<_> = self
            .users
            .values()
            .filter(|u| {
                matches(Some(&u.nick))
                    || matches(u.username.as_deref())
                    || matches(u.realname.as_deref())
                    || matches(u.hostname.as_deref())
            })
            .collect();
        found.sort_by(|a, b| a.nick.cmp(&b.nick));
        found
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            users: self.users.len(),
            channels: self.channels.len(),
            operators: self.users.values().filter(|u| u.is_operator).count(),
            secure: self.users.values().filter(|u| u.is_secure).count(),
            away: self.users.values().filter(|u| u.is_away).count(),
            pending_whois: self.whois_pending.len(),
            pending_who: self.who.len(),
            pending_list: self.list.len(),
        }
    }

    // ── Garbage collection ───────────────────────────────────────

    /// Drop users that share no channel with us and haven't been seen for
    /// `gc_max_age`. Returns how many were removed.
    pub fn collect_garbage(&mut self) -> usize {
        self.collect_garbage_at(now_secs())
    }

    pub fn collect_garbage_at(&mut self, now: u64) -> usize {
        let max_age = self.config.gc_max_age.as_secs();
        let own = self.own_nick.as_deref().map(irc_lower);
        let before = self.users.len();
        self.users.retain(|key, user| {
            Some(key) == own.as_ref()
                || !user.channels.is_empty()
                || now.saturating_sub(user.last_seen) <= max_age
        });
        let removed = before - self.users.len();
        if removed > 0 {
            debug!(removed, "collected stale users");
        }
        removed
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn is_own_nick(&self, nick: &str) -> bool {
        self.own_nick
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(nick))
    }

    fn is_channel_name(&self, name: &str) -> bool {
        let chantypes = self.server.chantypes();
        name.chars().next().is_some_and(|c| chantypes.contains(c))
    }

    fn ensure_user(&mut self, nick: &str, now: u64) -> &mut IrcUserInfo {
        self.users
            .entry(irc_lower(nick))
            .or_insert_with(|| IrcUserInfo::new(nick, now))
    }

    fn ensure_channel(&mut self, channel: &str) -> &mut IrcChannelInfo {
        self.channels
            .entry(irc_lower(channel))
            .or_insert_with(|| IrcChannelInfo::new(channel))
    }

    /// Recompute a user's summary flags from their memberships.
    fn refresh_user_flags(&mut self, nick_key: &str) {
        let Some(user) = self.users.get(nick_key) else {
            return;
        };
        let memberships: Vec<&IrcChannelUser> = user
            .channels
            .iter()
            .filter_map(|c| self.channels.get(c))
            .filter_map(|c| c.users().get(nick_key))
            .collect();
        let op = memberships.iter().any(|m| m.is_operator());
        let voiced = memberships.iter().any(|m| m.is_voiced());

        if let Some(user) = self.users.get_mut(nick_key) {
            user.is_operator = user.is_network_operator || op;
            user.is_voiced = voiced;
        }
    }
}

/// Rows for a wildcard WHO name neither the mask nor a fixed target.
fn is_who_mask(key: &str) -> bool {
    key.contains(['*', '?'])
}

/// Periodically collect stale users.
pub fn spawn_gc(tracker: SharedTracker, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; nothing is stale yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracker.lock().collect_garbage();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingQueue {
        nicks: Mutex<Vec<String>>,
    }

    impl WhoisQueue for RecordingQueue {
        fn add(&self, nick: &str) {
            self.nicks.lock().push(nick.to_owned());
        }
    }

    struct Harness {
        tracker: ProtocolTracker,
        queue: Arc<RecordingQueue>,
        outgoing: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(TrackerConfig::default())
        }

        fn with_config(config: TrackerConfig) -> Self {
            let queue = Arc::new(RecordingQueue::default());
            let (tx, outgoing) = mpsc::unbounded_channel();
            let mut tracker = ProtocolTracker::new(config, queue.clone(), tx);
            tracker.handle_message_at(&line(":irc.test 001 bridge :Welcome"), 0);
            Self {
                tracker,
                queue,
                outgoing,
            }
        }

        fn feed(&mut self, raw: &str) {
            self.tracker.handle_message_at(&line(raw), 1_000);
        }

        fn whois_requests(&self) -> Vec<String> {
            self.queue.nicks.lock().clone()
        }
    }

    fn line(raw: &str) -> Message {
        Message::parse(raw).unwrap()
    }

    fn names(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(n, p)| ((*n).to_owned(), (*p).to_owned()))
            .collect()
    }

    // ── Membership ───────────────────────────────────────────────

    #[test]
    fn names_event_derives_member_flags() {
        let mut h = Harness::new();
        h.tracker.handle_event(IrcEvent::Names {
            channel: "#c".into(),
            users: names(&[("@op", "@"), ("+voice", "+"), ("plain", "")]),
        });

        let chan = h.tracker.get_channel("#c").unwrap();
        assert_eq!(chan.user_count(), 3);
        assert_eq!(chan.users().len(), 3);

        let op = chan.user("op").unwrap();
        let voice = chan.user("voice").unwrap();
        let plain = chan.user("plain").unwrap();
        assert!(op.is_operator() && !op.is_voiced());
        assert!(voice.is_voiced() && !voice.is_operator());
        assert!(!plain.is_operator() && !plain.is_voiced());
    }

    #[test]
    fn names_replaces_membership() {
        let mut h = Harness::new();
        h.feed(":alice!a@h JOIN #rust");
        h.feed(":bob!b@h JOIN #rust");
        h.feed(":srv 353 bridge = #rust :@bob carol");
        h.feed(":srv 366 bridge #rust :End of /NAMES list.");

        let users: Vec<_> = h
            .tracker
            .channel_users("#rust")
            .iter()
            .map(|u| u.nick.clone())
            .collect();
        assert_eq!(users, vec!["bob", "carol"]);
        assert!(h.tracker.user_channels("alice").is_empty());
        assert!(h.tracker.get_user("bob").unwrap().is_operator);
    }

    #[test]
    fn names_uses_advertised_prefixes() {
        let mut h = Harness::new();
        h.feed(":srv 005 bridge PREFIX=(Yov)!@+ :are supported by this server");
        h.feed(":srv 353 bridge = #rust :!founder @op");
        h.feed(":srv 366 bridge #rust :End");

        let chan = h.tracker.get_channel("#rust").unwrap();
        assert_eq!(chan.user("founder").unwrap().modes(), &['Y']);
        assert!(chan.user("op").unwrap().is_operator());
        assert_eq!(chan.user_count(), 2);
    }

    #[test]
    fn names_across_multiple_lines() {
        let mut h = Harness::new();
        h.feed(":srv 353 bridge = #big :a b c");
        h.feed(":srv 353 bridge = #big :+d e!u@host");
        assert!(h.tracker.get_channel("#big").is_none());

        h.feed(":srv 366 bridge #big :End");
        let chan = h.tracker.get_channel("#big").unwrap();
        assert_eq!(chan.user_count(), 5);
        assert!(chan.user("d").unwrap().is_voiced());
        assert!(chan.user("e").is_some());
    }

    #[test]
    fn mode_adds_and_removes_single_letter() {
        let mut h = Harness::new();
        h.feed(":alice!a@h JOIN #rust");
        h.feed(":op!o@h MODE #rust +ov alice alice");
        {
            let member = h.tracker.get_channel("#rust").unwrap().user("alice").unwrap();
            assert!(member.is_operator() && member.is_voiced());
        }
        assert!(h.tracker.get_user("alice").unwrap().is_operator);

        h.feed(":op!o@h MODE #rust -o alice");
        let member = h.tracker.get_channel("#rust").unwrap().user("alice").unwrap();
        assert!(!member.is_operator());
        assert!(member.is_voiced());
        assert_eq!(member.modes(), &['v']);
        assert!(!h.tracker.get_user("alice").unwrap().is_operator);
    }

    #[test]
    fn channel_flag_modes_and_bans() {
        let mut h = Harness::new();
        h.feed(":bridge!b@h JOIN #rust");
        h.feed(":op!o@h MODE #rust +ntb *!*@spam");
        assert_eq!(h.tracker.get_channel("#rust").unwrap().modes, "+nt");
    }

    #[test]
    fn part_kick_and_quit() {
        let mut h = Harness::new();
        h.feed(":alice!a@h JOIN #a");
        h.feed(":alice!a@h JOIN #b");
        h.feed(":alice!a@h PART #a :bye");
        assert_eq!(h.tracker.user_channels("alice"), vec!["#b"]);
        assert!(!h.tracker.is_user_in_channel("alice", "#a"));

        h.feed(":op!o@h KICK #b alice :out");
        assert!(h.tracker.user_channels("alice").is_empty());
        assert!(h.tracker.get_user("alice").is_some());

        h.feed(":alice!a@h JOIN #a");
        h.feed(":alice!a@h QUIT :gone");
        assert!(h.tracker.get_user("alice").is_none());
        assert_eq!(h.tracker.get_channel("#a").unwrap().user_count(), 0);
    }

    #[test]
    fn own_part_forgets_channel() {
        let mut h = Harness::new();
        h.feed(":bridge!b@h JOIN #rust");
        h.feed(":alice!a@h JOIN #rust");
        h.feed(":bridge!b@h PART #rust");
        assert!(h.tracker.get_channel("#rust").is_none());
        assert!(h.tracker.user_channels("alice").is_empty());
    }

    // ── Identity ─────────────────────────────────────────────────

    #[test]
    fn rename_preserves_record() {
        let mut h = Harness::new();
        h.feed(":alice!al@example.org JOIN #rust");
        h.feed(":srv 311 bridge alice al example.org * :Alice Liddell");
        h.feed(":op!o@h MODE #rust +v alice");

        h.feed(":alice!al@example.org NICK bob");

        assert!(h.tracker.get_user("alice").is_none());
        let bob = h.tracker.get_user("bob").unwrap();
        assert_eq!(bob.nick, "bob");
        assert_eq!(bob.hostname.as_deref(), Some("example.org"));
        assert_eq!(bob.realname.as_deref(), Some("Alice Liddell"));
        assert_eq!(h.tracker.user_channels("bob"), vec!["#rust"]);

        let chan = h.tracker.get_channel("#rust").unwrap();
        assert!(chan.user("alice").is_none());
        let member = chan.user("bob").unwrap();
        assert_eq!(member.nick, "bob");
        assert!(member.is_voiced());
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let mut h = Harness::new();
        h.feed(":Alice!a@h JOIN #Rust");
        assert!(h.tracker.get_user("ALICE").is_some());
        assert!(h.tracker.is_user_in_channel("alice", "#rust"));
        assert_eq!(h.tracker.get_user("alice").unwrap().nick, "Alice");
        assert_eq!(h.tracker.get_channel("#RUST").unwrap().name, "#Rust");
    }

    #[test]
    fn own_nick_change_is_tracked() {
        let mut h = Harness::new();
        h.feed(":bridge!b@h NICK bridge_");
        assert_eq!(h.tracker.own_nick(), Some("bridge_"));
    }

    // ── WHOIS ────────────────────────────────────────────────────

    #[test]
    fn whois_requested_once_until_reply() {
        let mut h = Harness::new();
        h.feed(":srv 353 bridge = #a :alice");
        h.feed(":srv 366 bridge #a :End");
        h.feed(":srv 353 bridge = #b :alice");
        h.feed(":srv 366 bridge #b :End");
        h.tracker.lookup_user_at("alice", 1_000);
        assert_eq!(h.whois_requests(), vec!["alice"]);
        assert!(h.tracker.is_whois_pending("ALICE"));

        h.feed(":srv 311 bridge alice al host.example * :Alice");
        h.feed(":srv 312 bridge alice irc.test :Test server");
        h.feed(":srv 317 bridge alice 42 1700000000 :seconds idle, signon time");
        h.feed(":srv 330 bridge alice alice_acct :is logged in as");
        h.feed(":srv 671 bridge alice :is using a secure connection");
        h.feed(":srv 318 bridge alice :End of /WHOIS list.");
        assert!(!h.tracker.is_whois_pending("alice"));

        let alice = h.tracker.get_user("alice").unwrap();
        assert_eq!(alice.username.as_deref(), Some("al"));
        assert_eq!(alice.server.as_deref(), Some("irc.test"));
        assert_eq!(alice.idle_time, Some(42));
        assert_eq!(alice.signon_time, Some(1_700_000_000));
        assert_eq!(alice.account.as_deref(), Some("alice_acct"));
        assert!(alice.is_secure);
        assert_eq!(alice.last_whois, Some(1_000));
    }

    #[test]
    fn join_with_hostmask_skips_whois() {
        let mut h = Harness::new();
        h.feed(":alice!a@known.host JOIN #rust");
        assert!(h.whois_requests().is_empty());
    }

    #[test]
    fn stale_lookup_triggers_refresh() {
        let mut h = Harness::new();
        h.feed(":alice!a@h JOIN #rust");
        h.feed(":srv 318 bridge alice :End");

        h.tracker.lookup_user_at("alice", 1_000 + 60);
        assert!(h.whois_requests().is_empty());

        let user = h.tracker.lookup_user_at("alice", 1_000 + 301).unwrap();
        assert_eq!(user.nick, "alice");
        assert_eq!(h.whois_requests(), vec!["alice"]);
    }

    #[test]
    fn no_such_nick_clears_pending() {
        let mut h = Harness::new();
        assert!(h.tracker.lookup_user_at("ghost", 0).is_none());
        assert!(h.tracker.is_whois_pending("ghost"));
        h.feed(":srv 401 bridge ghost :No such nick/channel");
        assert!(!h.tracker.is_whois_pending("ghost"));
    }

    #[test]
    fn short_numerics_are_ignored() {
        let mut h = Harness::new();
        h.feed(":srv 311 bridge alice");
        h.feed(":srv 352 bridge #rust");
        h.feed(":srv 332 bridge");
        h.feed(":srv 999 whatever");
        assert!(h.tracker.get_user("alice").is_none());
        assert_eq!(h.tracker.stats().channels, 0);
    }

    #[test]
    fn whois_channels_keep_local_channel_sigil() {
        let mut h = Harness::new();
        h.feed(":bob!b@h JOIN &ops");
        h.feed(":bob!b@h JOIN #rust");
        h.feed(":srv 319 bridge alice :&ops +#rust");

        assert!(h.tracker.is_user_in_channel("alice", "&ops"));
        let ops = h.tracker.get_channel("&ops").unwrap();
        assert!(ops.user("alice").unwrap().modes().is_empty());
        assert!(h.tracker.get_channel("#rust").unwrap().user("alice").unwrap().is_voiced());

        h.feed(":srv 319 bridge alice :@&ops");
        let ops = h.tracker.get_channel("&ops").unwrap();
        assert!(ops.user("alice").unwrap().is_operator());
    }

    #[test]
    fn raw_frames_apply_and_short_ones_drop() {
        let mut h = Harness::new();
        h.tracker.handle_raw(&RawFrame::new("332", &["bridge", "#rust", "Rust talk"]));
        assert_eq!(
            h.tracker.get_channel("#rust").unwrap().topic.as_deref(),
            Some("Rust talk")
        );

        let before = h.tracker.stats();
        h.tracker.handle_raw(&RawFrame::new("311", &["bridge", "alice"]));
        h.tracker.handle_raw(&RawFrame::new("352", &["bridge", "#rust", "u"]));
        h.tracker.handle_raw(&RawFrame::new("333", &["bridge"]));
        h.tracker.handle_raw(&RawFrame::new("319", &[]));
        assert!(h.tracker.get_user("alice").is_none());
        assert_eq!(h.tracker.stats(), before);
    }

    // ── Server and topic ─────────────────────────────────────────

    #[test]
    fn welcome_and_isupport() {
        let mut h = Harness::new();
        h.feed(":irc.test 004 bridge irc.test solanum-1.0 DOQRSZaghilopsuwz CFILMPQSbcefgijklmnopqrstuvz");
        h.feed(":irc.test 005 bridge NETWORK=Test CHANTYPES=# :are supported by this server");
        let server = h.tracker.server_info();
        assert_eq!(server.name.as_deref(), Some("irc.test"));
        assert_eq!(server.version.as_deref(), Some("solanum-1.0"));
        assert_eq!(server.network.as_deref(), Some("Test"));
        assert_eq!(h.tracker.own_nick(), Some("bridge"));
    }

    #[test]
    fn topic_numerics_and_event() {
        let mut h = Harness::new();
        h.feed(":srv 332 bridge #rust :Rust talk");
        h.feed(":srv 333 bridge #rust alice!a@h 1700000000");
        let chan = h.tracker.get_channel("#rust").unwrap();
        assert_eq!(chan.topic.as_deref(), Some("Rust talk"));
        assert_eq!(chan.topic_set_by.as_deref(), Some("alice"));
        assert_eq!(chan.topic_set_at, Some(1_700_000_000));

        h.feed(":bob!b@h TOPIC #rust :New topic");
        let chan = h.tracker.get_channel("#rust").unwrap();
        assert_eq!(chan.topic.as_deref(), Some("New topic"));
        assert_eq!(chan.topic_set_by.as_deref(), Some("bob"));
    }

    // ── WHO / LIST ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn who_query_collects_rows() {
        let mut h = Harness::new();
        let reply = h.tracker.who_query("#rust");
        assert_eq!(h.outgoing.recv().await.unwrap().to_wire(), "WHO :#rust");

        h.feed(":srv 352 bridge #rust al host.example irc.test alice G* :0 Alice Liddell");
        h.feed(":srv 352 bridge #rust bo host2 irc.test bob H@ :2 Bob");
        h.feed(":srv 315 bridge #rust :End of /WHO list.");

        let rows = reply.await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].nick, "alice");
        assert_eq!(rows[0].realname, "Alice Liddell");
        assert_eq!(rows[1].hopcount, 2);

        let alice = h.tracker.get_user("alice").unwrap();
        assert!(alice.is_away);
        assert!(alice.is_network_operator && alice.is_operator);
        assert_eq!(alice.hostname.as_deref(), Some("host.example"));
        assert_eq!(h.tracker.stats().pending_who, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn who_query_times_out() {
        let h = Harness::new();
        let reply = h.tracker.who_query("#quiet");
        let err = reply.await.unwrap_err();
        assert_eq!(err, RequestError::Timeout(RequestKind::Who));
        assert_eq!(h.tracker.stats().pending_who, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_terminal_after_timeout_is_noop() {
        let mut h = Harness::new();
        let reply = h.tracker.who_query("#slow");
        assert!(reply.await.is_err());
        h.feed(":srv 352 bridge #slow u h s carol H :0 Carol");
        h.feed(":srv 315 bridge #slow :End of /WHO list.");
        assert_eq!(h.tracker.stats().pending_who, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_lines_for_expired_who_leave_others_alone() {
        let mut h = Harness::new();
        let first = h.tracker.who_query("#a");
        assert_eq!(first.await.unwrap_err(), RequestError::Timeout(RequestKind::Who));

        let second = h.tracker.who_query("#b");
        h.feed(":srv 352 bridge #a u h s carol H :0 Carol");
        h.feed(":srv 315 bridge #a :End of /WHO list.");
        assert_eq!(h.tracker.stats().pending_who, 1);

        h.feed(":srv 352 bridge #b u h s dave H :0 Dave");
        h.feed(":srv 315 bridge #b :End of /WHO list.");
        let rows = second.await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nick, "dave");
        assert_eq!(rows[0].channel, "#b");
    }

    #[tokio::test(start_paused = true)]
    async fn wildcard_who_collects_unkeyed_rows() {
        let mut h = Harness::new();
        let reply = h.tracker.who_query("da*");
        h.feed(":srv 352 bridge * u h s dave H :0 Dave");
        h.feed(":srv 352 bridge #rust u h s dan H :0 Dan");
        h.feed(":srv 315 bridge da* :End of /WHO list.");

        let nicks: Vec<_> = reply.await.unwrap().into_iter().map(|r| r.nick).collect();
        assert_eq!(nicks, vec!["dave", "dan"]);
    }

    #[tokio::test(start_paused = true)]
    async fn list_rows_stop_at_cap() {
        let mut h = Harness::with_config(TrackerConfig {
            list_cap: 2,
            ..TrackerConfig::default()
        });
        let reply = h.tracker.list_channels(None);
        for (name, users) in [("#a", 5), ("#b", 4), ("#c", 3), ("#d", 2)] {
            h.feed(&format!(":srv 322 bridge {name} {users} :topic"));
        }
        h.feed(":srv 323 bridge :End of /LIST");

        let channels: Vec<_> = reply.await.unwrap().into_iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec!["#a", "#b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn list_times_out_after_its_own_deadline() {
        let mut h = Harness::new();
        let started = tokio::time::Instant::now();
        let reply = h.tracker.list_channels(Some("#q*"));

        assert_eq!(reply.await.unwrap_err(), RequestError::Timeout(RequestKind::List));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(h.tracker.stats().pending_list, 0);

        h.feed(":srv 323 bridge :End of /LIST");
        assert_eq!(h.tracker.stats().pending_list, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn list_channels_collects_rows() {
        let mut h = Harness::new();
        let reply = h.tracker.list_channels(None);
        assert_eq!(h.outgoing.recv().await.unwrap().to_wire(), "LIST");

        h.feed(":srv 321 bridge Channel :Users  Name");
        h.feed(":srv 322 bridge #rust 42 :Rust talk");
        h.feed(":srv 322 bridge #go 7 :");
        h.feed(":srv 323 bridge :End of /LIST");

        let rows = reply.await.unwrap();
        assert_eq!(
            rows,
            vec![
                ListEntry { channel: "#rust".into(), user_count: 42, topic: "Rust talk".into() },
                ListEntry { channel: "#go".into(), user_count: 7, topic: String::new() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn requests_fail_when_relay_is_down() {
        let Harness {
            tracker, outgoing, ..
        } = Harness::new();
        drop(outgoing);
        let err = tracker.list_channels(Some("#r*")).await.unwrap_err();
        assert_eq!(err, RequestError::Disconnected(RequestKind::List));
    }

    // ── Queries and GC ───────────────────────────────────────────

    #[test]
    fn search_and_stats() {
        let mut h = Harness::new();
        h.feed(":alice!al@wonder.land JOIN #rust");
        h.feed(":bob!b@h JOIN #rust");
        h.feed(":srv 671 bridge bob :is using a secure connection");
        h.feed(":op!o@h MODE #rust +o bob");

        let found: Vec<_> = h.tracker.search_users("WONDER").iter().map(|u| u.nick.clone()).collect();
        assert_eq!(found, vec!["alice"]);

        let stats = h.tracker.stats();
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.operators, 1);
        assert_eq!(stats.secure, 1);
    }

    #[test]
    fn gc_removes_only_stale_channelless_users() {
        let mut h = Harness::new();
        h.feed(":alice!a@h JOIN #rust");
        h.feed(":bob!b@h JOIN #rust");
        h.feed(":bob!b@h PART #rust");

        let day = 24 * 60 * 60;
        assert_eq!(h.tracker.collect_garbage_at(1_000 + day), 0);
        assert_eq!(h.tracker.collect_garbage_at(1_000 + day + 1), 1);
        assert!(h.tracker.get_user("bob").is_none());
        assert!(h.tracker.get_user("alice").is_some());
        assert!(h.tracker.get_user("bridge").is_some());
    }
}

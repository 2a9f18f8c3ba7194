//! The network state replica and its mutation operations.
//!
//! Three dictionaries keyed with RFC1459 casemapping (servers by name,
//! clients by nick, channels by name) plus a per-server flat user table
//! indexed by local numeric. Handlers mutate this structure one wire line at
//! a time; hook lists fire synchronously inside the mutation so observers
//! see the same per-line atomicity the dispatcher guarantees.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::hooks::Hooks;
use crate::numeric::{base64_to_int, split_numeric};
use crate::policer::PolicerParams;
use crate::proto::send;
use crate::uplink::Outbox;
use crate::util::{irc_to_lower, is_channel_name, is_valid_nick};

use super::channel::{Channel, MemberModes, Membership};
use super::modes::{ModeChange, ParseFlags};
use super::server::Server;
use super::user::{User, UserModes};
use super::{NICKLEN, PREHISTORY, TOPICLEN};

/// Outcome of reconciling a channel received in burst against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstMerge {
    /// Channel did not exist locally.
    New,
    /// Incoming timestamp was older: incoming state replaced local modes,
    /// bans, and membership privileges.
    IncomingWon,
    /// Local timestamp was older: incoming privileges must be discarded.
    LocalWon,
    /// Equal timestamps: union.
    Equal,
}

pub struct Network {
    pub clock: Clock,
    /// Our own numeric prefix.
    pub self_prefix: String,
    /// Numeric prefix of the server we are linked to, once the handshake
    /// names it.
    pub uplink_prefix: Option<String>,
    /// Servers by numeric prefix.
    pub servers: HashMap<String, Server>,
    /// Casefolded server name -> numeric prefix.
    pub server_names: HashMap<String, String>,
    /// Users by combined numeric.
    pub users: HashMap<String, User>,
    /// Casefolded nick -> combined numeric.
    pub nicks: HashMap<String, String>,
    /// Channels by casefolded name.
    pub channels: HashMap<String, Channel>,
    /// Users removed mid-line, reclaimed when the top-level dispatch ends.
    pub dead_users: Vec<User>,
    /// Numerics of current opers, in oper order.
    pub curr_opers: Vec<String>,
    pub invis_clients: u32,
    pub max_clients: usize,
    #[allow(dead_code)] // Reported by the stats service command.
    pub max_clients_time: i64,
    /// Current nick length limit; lowered on numeric 432 recovery.
    pub nicklen: usize,
    pub force_n2k: bool,
    pub join_policer_params: PolicerParams,
    /// WHOIS masking (when set, non-opers see this server instead of the
    /// user's real one).
    pub his_servername: Option<String>,
    pub his_servercomment: Option<String>,
    next_local: u32,
}

impl Network {
    /// Build the replica around our own server entry. `numeric` is the
    /// combined prefix+mask form used on the wire (e.g. `AB]]]`).
    pub fn new(clock: Clock, name: &str, numeric: &str, description: &str, boot: i64) -> Self {
        let (slen, mlen) = split_numeric(numeric).expect("self numeric must be 3-5 digits");
        let prefix = numeric[..slen].to_string();
        let num_mask = base64_to_int(&numeric[slen..], mlen);
        let now = clock.now();
        let server = Server::new(
            prefix.clone(),
            num_mask,
            name.to_string(),
            description.to_string(),
            0,
            boot,
            now,
            None,
        );
        let mut net = Self {
            clock,
            self_prefix: prefix.clone(),
            uplink_prefix: None,
            servers: HashMap::new(),
            server_names: HashMap::new(),
            users: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
            dead_users: Vec::new(),
            curr_opers: Vec::new(),
            invis_clients: 0,
            max_clients: 0,
            max_clients_time: now,
            nicklen: NICKLEN,
            force_n2k: true,
            join_policer_params: PolicerParams::new(5.0, 0.5),
            his_servername: None,
            his_servercomment: None,
            next_local: 0,
        };
        net.server_names.insert(irc_to_lower(name), prefix.clone());
        net.servers.insert(prefix, server);
        net
    }

    // ------------------------------------------------------------------
    // Lookups

    pub fn self_server(&self) -> &Server {
        &self.servers[&self.self_prefix]
    }

    pub fn self_name(&self) -> &str {
        &self.self_server().name
    }

    pub fn server_by_name(&self, name: &str) -> Option<&Server> {
        self.server_names
            .get(&irc_to_lower(name))
            .and_then(|prefix| self.servers.get(prefix))
    }

    /// Resolve an origin token known to be a server numeric.
    pub fn server_by_token(&self, token: &str) -> Option<&Server> {
        let slen = crate::numeric::server_prefix_len(token.len()).min(token.len());
        self.servers.get(&token[..slen])
    }

    /// Resolve a combined user numeric.
    pub fn user_by_numeric(&self, token: &str) -> Option<&User> {
        let (slen, llen) = split_numeric(token)?;
        let server = self.servers.get(&token[..slen])?;
        let local = base64_to_int(&token[slen..], llen) & server.num_mask;
        let numeric = server.users.get(local as usize)?.as_ref()?;
        self.users.get(numeric)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        self.nicks
            .get(&irc_to_lower(nick))
            .and_then(|numeric| self.users.get(numeric))
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&irc_to_lower(name))
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&irc_to_lower(name))
    }

    /// A user removed earlier in the current line, still parked.
    #[allow(dead_code)] // Handlers chasing a mid-line kill.
    pub fn find_dead(&self, numeric: &str) -> Option<&User> {
        self.dead_users.iter().find(|u| u.numeric == numeric)
    }

    pub fn is_local(&self, user: &User) -> bool {
        user.uplink == self.self_prefix
    }

    // ------------------------------------------------------------------
    // Servers

    /// Introduce a server. A previous holder of the same numeric prefix is
    /// destroyed first, subtree and all.
    #[allow(clippy::too_many_arguments)]
    pub fn add_server(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        uplink: Option<&str>,
        name: &str,
        hops: u32,
        boot: i64,
        link: i64,
        numeric: &str,
        description: &str,
    ) -> Option<String> {
        let Some((slen, mlen)) = split_numeric(numeric) else {
            warn!(name, numeric, "server numeric has invalid length");
            return None;
        };
        let prefix = numeric[..slen].to_string();
        let num_mask = base64_to_int(&numeric[slen..], mlen);

        if self.servers.contains_key(&prefix) {
            // A replayed or recycled numeric; forget the previous
            // incarnation and its whole subtree.
            self.del_server(out, hooks, &prefix, false, None);
        }

        if boot <= PREHISTORY && hops == 1 {
            warn!(name, boot, "server claims an absurd boot time");
        }

        let server = Server::new(
            prefix.clone(),
            num_mask,
            name.to_string(),
            description.to_string(),
            hops,
            boot,
            link,
            uplink.map(str::to_string),
        );
        if let Some(parent) = uplink.and_then(|p| self.servers.get_mut(p)) {
            parent.children.push(prefix.clone());
        }
        self.server_names.insert(irc_to_lower(name), prefix.clone());
        self.servers.insert(prefix.clone(), server);
        Some(prefix)
    }

    /// Destroy a server: children first, then its users (with synthetic
    /// quits), then the node itself.
    pub fn del_server(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        prefix: &str,
        announce: bool,
        reason: Option<&str>,
    ) {
        let Some(srv) = self.servers.get(prefix) else {
            return;
        };
        let name = srv.name.clone();
        let parent = srv.uplink.clone();
        let children = srv.children.clone();
        let is_self_uplink = self.uplink_prefix.as_deref() == Some(prefix);

        // Only locally-juped servers get an announced SQUIT from us.
        if announce && parent.as_deref() == Some(self.self_prefix.as_str()) && !is_self_uplink {
            out.send_line(send::squit(&self.self_prefix, &name, reason.unwrap_or("")));
        }

        for child in children {
            if child != self.self_prefix {
                self.del_server(out, hooks, &child, false, None);
            }
        }

        let owned: Vec<String> = self
            .servers
            .get(prefix)
            .map(|s| s.users.iter().flatten().cloned().collect())
            .unwrap_or_default();
        for numeric in owned {
            self.del_user(out, hooks, &numeric, None, false, "server delinked");
        }

        if let Some(srv) = self.servers.remove(prefix) {
            self.server_names.remove(&irc_to_lower(&srv.name));
            if let Some(parent) = srv.uplink.as_ref().and_then(|p| self.servers.get_mut(p)) {
                parent.children.retain(|c| c != prefix);
            }
        }
        if is_self_uplink {
            self.uplink_prefix = None;
        }
    }

    /// Recompute burst flags down a subtree after an end-of-burst.
    pub fn recalc_bursts(&mut self, prefix: &str) {
        let (self_burst, uplink_burst, children) = match self.servers.get(prefix) {
            Some(srv) => {
                let uplink_burst = srv
                    .uplink
                    .as_ref()
                    .filter(|p| **p != self.self_prefix)
                    .and_then(|p| self.servers.get(p))
                    .map(|p| p.burst)
                    .unwrap_or(false);
                (srv.self_burst, uplink_burst, srv.children.clone())
            }
            None => return,
        };
        if let Some(srv) = self.servers.get_mut(prefix) {
            srv.burst = self_burst || uplink_burst;
        }
        for child in children {
            self.recalc_bursts(&child);
        }
    }

    // ------------------------------------------------------------------
    // Users

    /// Introduce a user, applying the nick-collision rules.
    #[allow(clippy::too_many_arguments)]
    pub fn add_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        uplink_prefix: &str,
        nick: &str,
        ident: &str,
        hostname: &str,
        mode_words: &str,
        numeric: &str,
        info: &str,
        timestamp: i64,
        ip: IpAddr,
    ) -> Option<String> {
        let Some((slen, _)) = split_numeric(numeric) else {
            warn!(nick, numeric, "user numeric has invalid length");
            return None;
        };
        let Some(server) = self.servers.get(uplink_prefix) else {
            warn!(nick, numeric, "uplink server for numeric does not exist");
            return None;
        };
        if server.numeric != numeric[..slen] {
            warn!(
                nick,
                numeric,
                uplink = %server.name,
                "numeric prefix does not match nominal uplink"
            );
            return None;
        }

        let (dummy, modes) = match mode_words.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, mode_words),
        };
        if !dummy && !is_valid_nick(nick, self.nicklen) {
            warn!(nick, "invalid nickname in introduction");
            return None;
        }

        let mut ignore_user = false;
        let collision = self
            .user_by_nick(nick)
            .map(|old| (old.numeric.clone(), self.is_local(old) && old.modes.service, old.timestamp));
        if let Some((old_numeric, old_protected, old_ts)) = collision {
            let mut old_ts = old_ts;
            if old_protected {
                // The service collides the newcomer off: lower our copy's
                // timestamp and reintroduce it so the peer kills theirs.
                old_ts = timestamp - 1;
                if let Some(old) = self.users.get_mut(&old_numeric) {
                    old.timestamp = old_ts;
                }
                self.reintroduce_user(out, &old_numeric);
            }
            if old_ts > timestamp {
                // The "old" user is really newer; remove them.
                self.del_user(out, hooks, &old_numeric, None, true, "Overruled by older nick");
            } else {
                // Introduction is too new. Keep it in the server table only;
                // the network will kill it momentarily.
                ignore_user = true;
            }
        }

        let server = self.servers.get_mut(uplink_prefix).expect("checked above");
        let num_local = base64_to_int(&numeric[slen..], 3) & server.num_mask;
        let slot = server.local_slot(num_local);
        server.clients += 1;
        if server.clients > server.max_clients {
            server.max_clients = server.clients;
        }
        server.users[slot] = Some(numeric.to_string());

        let user = User {
            nick: nick.to_string(),
            ident: ident.chars().take(super::USERLEN).collect(),
            info: info.chars().take(super::REALLEN).collect(),
            hostname: hostname.chars().take(super::HOSTLEN).collect(),
            fakehost: None,
            numeric: numeric.to_string(),
            num_local,
            ip,
            modes: UserModes::default(),
            timestamp,
            uplink: uplink_prefix.to_string(),
            channels: Vec::new(),
            account: None,
            dead: false,
            dummy,
            auth_policer: crate::policer::Policer::new(),
        };
        self.users.insert(numeric.to_string(), user);
        self.apply_usermode(out, hooks, numeric, modes);

        if ignore_user {
            return Some(numeric.to_string());
        }

        self.nicks
            .insert(irc_to_lower(nick), numeric.to_string());
        if self.nicks.len() > self.max_clients {
            self.max_clients = self.nicks.len();
            self.max_clients_time = self.clock.now();
        }
        if uplink_prefix == self.self_prefix {
            self.reintroduce_user(out, numeric);
        }
        for hook in &hooks.new_user {
            if hook(self, out, numeric) {
                break;
            }
        }
        Some(numeric.to_string())
    }

    /// Remove a user from the indices. The value is parked on the dead-user
    /// list so code later in the same line can still inspect it.
    pub fn del_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        numeric: &str,
        killer: Option<&str>,
        announce: bool,
        why: &str,
    ) {
        let Some(mut user) = self.users.remove(numeric) else {
            return;
        };
        user.dead = true;

        while let Some(chan_key) = user.channels.pop() {
            self.remove_membership(out, hooks, &chan_key, numeric, false);
        }

        if let Some(srv) = self.servers.get_mut(&user.uplink) {
            srv.clients = srv.clients.saturating_sub(1);
            let slot = srv.local_slot(user.num_local);
            if srv.users.get(slot).and_then(|s| s.as_deref()) == Some(numeric) {
                srv.users[slot] = None;
            }
        }
        if user.modes.oper {
            self.curr_opers.retain(|n| n != numeric);
        }
        if user.modes.invisible {
            self.invis_clients = self.invis_clients.saturating_sub(1);
        }
        // Not removed after a collision stole the key.
        let folded = irc_to_lower(&user.nick);
        if self.nicks.get(&folded).map(String::as_str) == Some(numeric) {
            self.nicks.remove(&folded);
        }

        // Reverse order so ChanServ-alikes update presence before the
        // account layer drops its bindings.
        for hook in hooks.del_user.iter().rev() {
            hook(self, out, &user, killer, why);
        }

        if announce && !user.dummy {
            if user.uplink == self.self_prefix {
                out.send_line(send::quit(numeric, why));
            } else {
                let from = killer.and_then(|k| {
                    self.users
                        .get(k)
                        .map(|u| (u.numeric.clone(), u.nick.clone()))
                });
                out.send_line(send::kill(
                    &self.self_prefix,
                    &self.self_name().to_string(),
                    from.as_ref().map(|(n, k)| (n.as_str(), k.as_str())),
                    numeric,
                    why,
                ));
            }
        }
        if user.uplink == self.self_prefix {
            hooks.unregister_delivery(user.num_local);
        }
        self.dead_users.push(user);
    }

    /// Reclaim dead users. Only the top-level line dispatch calls this.
    pub fn drain_dead(&mut self) {
        self.dead_users.clear();
    }

    pub fn nick_change(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        numeric: &str,
        new_nick: &str,
        announce: bool,
    ) {
        let now = self.clock.now();
        let Some(user) = self.users.get_mut(numeric) else {
            return;
        };
        let old_nick = std::mem::replace(&mut user.nick, new_nick.to_string());
        user.timestamp = now;
        let old_folded = irc_to_lower(&old_nick);
        if self.nicks.get(&old_folded).map(String::as_str) == Some(numeric) {
            self.nicks.remove(&old_folded);
        }
        self.nicks
            .insert(irc_to_lower(new_nick), numeric.to_string());
        if announce {
            out.send_line(send::nick_change(numeric, new_nick, now));
        }
        for hook in &hooks.nick_change {
            hook(self, out, numeric, &old_nick);
        }
    }

    /// Apply a user mode string, including the argument-carrying `+r`
    /// (account stamp) and `+f` (fakehost) forms seen in bursts.
    pub fn apply_usermode(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        numeric: &str,
        mode_change: &str,
    ) {
        let mut parts = mode_change.split_whitespace();
        let letters = parts.next().unwrap_or("");
        let mut args = parts;
        let mut add = true;
        for letter in letters.chars() {
            match letter {
                '+' => add = true,
                '-' => add = false,
                'o' => {
                    if let Some(user) = self.users.get_mut(numeric) {
                        user.modes.oper = add;
                    }
                    if add {
                        self.curr_opers.push(numeric.to_string());
                        self.call_oper_hooks(out, hooks, numeric);
                    } else {
                        self.curr_opers.retain(|n| n != numeric);
                    }
                }
                'i' => {
                    if let Some(user) = self.users.get_mut(numeric) {
                        if user.modes.invisible != add {
                            user.modes.invisible = add;
                            if add {
                                self.invis_clients += 1;
                            } else {
                                self.invis_clients = self.invis_clients.saturating_sub(1);
                            }
                        }
                    }
                }
                'r' => {
                    if let Some(stamp) = args.next() {
                        let stamp = stamp.to_string();
                        self.call_account(out, hooks, numeric, &stamp);
                    }
                }
                'f' => {
                    if let Some(host) = args.next() {
                        let host = host.to_string();
                        self.assign_fakehost(out, numeric, &host, false);
                    }
                }
                other => {
                    if let Some(user) = self.users.get_mut(numeric) {
                        user.modes.set(other, add);
                    }
                }
            }
        }
    }

    fn call_oper_hooks(&mut self, out: &dyn Outbox, hooks: &Hooks, numeric: &str) {
        let local = self
            .users
            .get(numeric)
            .map(|u| u.uplink == self.self_prefix)
            .unwrap_or(true);
        if local {
            return;
        }
        for hook in &hooks.oper {
            if self.users.contains_key(numeric) {
                hook(self, out, numeric);
            }
        }
    }

    /// Bind an account stamp to a user and run the account hooks.
    pub fn call_account(&mut self, out: &dyn Outbox, hooks: &Hooks, numeric: &str, stamp: &str) {
        if let Some(user) = self.users.get_mut(numeric) {
            user.account = Some(stamp.to_string());
        } else {
            return;
        }
        for hook in &hooks.account {
            hook(self, out, numeric, stamp);
        }
    }

    /// Stamp a local user and announce the binding to the network.
    #[allow(dead_code)] // The account service stamps through this.
    pub fn stamp_user(&mut self, out: &dyn Outbox, hooks: &Hooks, numeric: &str, stamp: &str) {
        out.send_line(send::account(&self.self_prefix, numeric, stamp));
        self.call_account(out, hooks, numeric, stamp);
    }

    pub fn assign_fakehost(
        &mut self,
        out: &dyn Outbox,
        numeric: &str,
        host: &str,
        announce: bool,
    ) {
        if let Some(user) = self.users.get_mut(numeric) {
            user.fakehost = Some(host.to_string());
        } else {
            return;
        }
        if announce {
            out.send_line(send::fakehost(&self.self_prefix, numeric, host));
        }
    }

    /// Pick a free local numeric on our own server.
    fn get_local_numeric(&mut self) -> Option<u32> {
        let (num_mask, clients) = {
            let srv = self.servers.get(&self.self_prefix)?;
            (srv.num_mask, srv.clients)
        };
        if clients > num_mask {
            return None;
        }
        let start = self.next_local;
        let mut candidate = start;
        loop {
            let occupied = self.servers[&self.self_prefix].users[candidate as usize].is_some();
            if !occupied {
                self.next_local = candidate;
                return Some(candidate);
            }
            candidate = if candidate >= num_mask { 0 } else { candidate + 1 };
            if candidate == start {
                return None;
            }
        }
    }

    /// Introduce one of our own service clients.
    #[allow(dead_code)] // Service modules introduce their bots with this.
    pub fn add_local_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        nick: &str,
        ident: &str,
        hostname: Option<&str>,
        info: &str,
        modes: Option<&str>,
    ) -> Option<String> {
        let modes = modes.unwrap_or("+oik");
        let mut timestamp = self.clock.now();
        if let Some(old) = self.user_by_nick(nick) {
            if self.is_local(old) {
                return Some(old.numeric.clone());
            }
            timestamp = old.timestamp - 1;
        }
        let local_num = match self.get_local_numeric() {
            Some(num) => num,
            None => {
                warn!(nick, "unable to allocate local numeric for service");
                return None;
            }
        };
        let hostname = hostname
            .map(str::to_string)
            .unwrap_or_else(|| self.self_name().to_string());
        let numeric =
            crate::numeric::make_numeric(&self.self_prefix.clone(), local_num, self.force_n2k);
        self.add_user(
            out,
            hooks,
            &self.self_prefix.clone(),
            nick,
            ident,
            &hostname,
            modes,
            &numeric,
            info,
            timestamp,
            User::unknown_ip(),
        )
    }

    /// Re-send the introduction for one of our users (used after a peer
    /// kills a service).
    pub fn reintroduce_user(&self, out: &dyn Outbox, numeric: &str) {
        let Some(user) = self.users.get(numeric) else {
            return;
        };
        if user.dummy {
            return;
        }
        let Some(server) = self.servers.get(&user.uplink) else {
            return;
        };
        out.send_line(send::user_intro(server, user));
    }

    // ------------------------------------------------------------------
    // Channels

    /// Get-or-create a channel and reconcile burst state against it.
    ///
    /// `mode_words` are the burst's `+modes` and argument tokens; `bans` the
    /// `%`-section masks. Returns the channel key and the merge outcome.
    pub fn add_channel(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        name: &str,
        timestamp: i64,
        mode_words: &[&str],
        bans: &[&str],
    ) -> Option<(String, BurstMerge)> {
        if !is_channel_name(name) || name.len() > super::CHANNELLEN {
            warn!(name, "refusing bad channel name");
            return None;
        }
        let key = irc_to_lower(name);
        let now = self.clock.now();
        let parse_burst_modes = |chan: &Channel, words: &[&str]| -> Option<ModeChange> {
            if words.is_empty() {
                return None;
            }
            ModeChange::parse(
                chan,
                words,
                ParseFlags {
                    from_server: true,
                    ..Default::default()
                },
                0,
                &|_| None,
            )
        };

        let merge;
        if let Some(chan) = self.channels.get_mut(&key) {
            if timestamp < chan.timestamp {
                // Incoming wins: members stay joined but all privileges,
                // modes, and bans are replaced by the incoming state.
                chan.timestamp = timestamp;
                chan.clear_member_modes();
                chan.bans.clear();
                chan.modes = Default::default();
                chan.limit = 0;
                chan.key.clear();
                chan.upass.clear();
                chan.apass.clear();
                if let Some(change) = parse_burst_modes(chan, mode_words) {
                    change.apply(chan, None, now);
                }
                merge = BurstMerge::IncomingWon;
            } else if timestamp > chan.timestamp {
                merge = BurstMerge::LocalWon;
            } else {
                if let Some(change) = parse_burst_modes(chan, mode_words) {
                    change.apply(chan, None, now);
                }
                merge = BurstMerge::Equal;
            }
            // Incoming bans land in every outcome: they replace a cleared
            // list when incoming won, and union into the local list
            // otherwise.
            for mask in bans {
                if !mask.is_empty() {
                    chan.add_ban(mask, "<unknown>", now);
                }
            }
        } else {
            let mut chan = Channel::new(name.to_string(), if timestamp > 0 { timestamp } else { now });
            if let Some(change) = parse_burst_modes(&chan, mode_words) {
                change.apply(&mut chan, None, now);
            }
            for mask in bans {
                if !mask.is_empty() {
                    chan.add_ban(mask, "<unknown>", now);
                }
            }
            self.channels.insert(key.clone(), chan);
            for hook in &hooks.new_channel {
                hook(self, out, &key);
            }
            merge = BurstMerge::New;
        }
        Some((key, merge))
    }

    /// Add a membership, creating the channel on first join. Idempotent.
    /// Returns false when a join hook vetoed (the join was undone).
    pub fn add_channel_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        numeric: &str,
        chan_name: &str,
        when: Option<i64>,
    ) -> bool {
        if !self.users.contains_key(numeric) {
            return false;
        }
        let key = irc_to_lower(chan_name);
        let now = self.clock.now();
        let params = self.join_policer_params;
        if !self.channels.contains_key(&key) {
            let chan = Channel::new(chan_name.to_string(), when.unwrap_or(now));
            self.channels.insert(key.clone(), chan);
            for hook in &hooks.new_channel {
                hook(self, out, &key);
            }
        }
        let chan = self.channels.get_mut(&key).expect("just inserted");
        if chan.member(numeric).is_some() {
            return true;
        }
        if !chan.join_policer.conforms(&params, now, 1.0) && !chan.join_flooded {
            chan.join_flooded = true;
            info!(channel = %chan.name, "channel is join-flooded");
        }
        chan.members.push(Membership {
            user: numeric.to_string(),
            modes: MemberModes::default(),
            idle_since: now,
        });
        if let Some(user) = self.users.get_mut(numeric) {
            user.channels.push(key.clone());
        }

        for hook in &hooks.join {
            if hook(self, out, numeric, &key) {
                // Policy rejection: undo with a part on the user's behalf.
                out.send_line(send::part(numeric, chan_name, None));
                if let Some(user) = self.users.get_mut(numeric) {
                    user.channels.retain(|c| c != &key);
                }
                self.remove_membership(out, hooks, &key, numeric, false);
                return false;
            }
        }
        true
    }

    /// Remove one membership; `deleting` skips the empty-channel teardown
    /// (the caller is tearing the channel down anyway).
    pub fn del_channel_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        numeric: &str,
        chan_name: &str,
        reason: Option<&str>,
        deleting: bool,
    ) {
        let key = irc_to_lower(chan_name);
        if let Some(reason) = reason {
            let member = self
                .channels
                .get(&key)
                .and_then(|c| c.member(numeric))
                .cloned();
            if let Some(member) = member {
                for hook in &hooks.part {
                    hook(self, out, &member, &key, reason);
                }
            }
        }
        if let Some(user) = self.users.get_mut(numeric) {
            user.channels.retain(|c| c != &key);
        }
        self.remove_membership(out, hooks, &key, numeric, deleting);
    }

    fn remove_membership(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        key: &str,
        numeric: &str,
        deleting: bool,
    ) {
        let destroy = match self.channels.get_mut(key) {
            Some(chan) => {
                chan.members.retain(|m| m.user != numeric);
                chan.members.is_empty() && chan.locks == 0 && !deleting
            }
            None => false,
        };
        if destroy {
            self.destroy_channel(out, hooks, key);
        }
    }

    fn destroy_channel(&mut self, out: &dyn Outbox, hooks: &Hooks, key: &str) {
        if let Some(chan) = self.channels.remove(key) {
            for hook in &hooks.del_channel {
                hook(self, out, &chan);
            }
        }
    }

    #[allow(dead_code)] // Service modules pin channels they manage.
    pub fn lock_channel(&mut self, name: &str) {
        if let Some(chan) = self.channel_mut(name) {
            chan.locks += 1;
        }
    }

    #[allow(dead_code)]
    pub fn unlock_channel(&mut self, out: &dyn Outbox, hooks: &Hooks, name: &str) {
        let key = irc_to_lower(name);
        let destroy = match self.channels.get_mut(&key) {
            Some(chan) => {
                chan.locks = chan.locks.saturating_sub(1);
                chan.locks == 0 && chan.members.is_empty()
            }
            None => false,
        };
        if destroy {
            self.destroy_channel(out, hooks, &key);
        }
    }

    /// Peer-announced kick: trust it and update the replica.
    pub fn channel_user_kicked(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        kicker: Option<&str>,
        victim: &str,
        chan_name: &str,
    ) {
        let key = irc_to_lower(chan_name);
        if self
            .channels
            .get(&key)
            .map(|c| c.member(victim).is_none())
            .unwrap_or(true)
        {
            return;
        }
        for hook in &hooks.kick {
            hook(self, out, kicker, victim, &key);
        }
        if let Some(user) = self.users.get_mut(victim) {
            user.channels.retain(|c| c != &key);
        }
        self.remove_membership(out, hooks, &key, victim, false);
    }

    /// Locally-initiated kick: emit the wire kick, then process it.
    #[allow(dead_code)] // Service modules enforce with this.
    pub fn kick_channel_user(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        victim: &str,
        chan_name: &str,
        kicker: &str,
        why: &str,
    ) {
        let key = irc_to_lower(chan_name);
        let kicker_is_op = self
            .channels
            .get(&key)
            .and_then(|c| c.member(kicker))
            .map(|m| m.modes.op)
            .unwrap_or(false);
        let origin = if kicker_is_op {
            kicker.to_string()
        } else {
            self.self_prefix.clone()
        };
        out.send_line(send::kick(&origin, chan_name, victim, why));
        self.channel_user_kicked(out, hooks, Some(kicker), victim, chan_name);
    }

    pub fn set_channel_topic(
        &mut self,
        out: &dyn Outbox,
        hooks: &Hooks,
        chan_name: &str,
        who: Option<&str>,
        topic: &str,
        announce: bool,
    ) {
        let key = irc_to_lower(chan_name);
        let now = self.clock.now();
        let who_nick = who
            .and_then(|n| self.users.get(n))
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| self.self_name().to_string());
        let old = match self.channels.get_mut(&key) {
            Some(chan) => {
                let old = std::mem::take(&mut chan.topic);
                chan.topic = topic.chars().take(TOPICLEN).collect();
                chan.topic_nick = who_nick;
                chan.topic_time = now;
                old
            }
            None => return,
        };
        for hook in &hooks.topic {
            hook(self, out, who, &key, &old);
        }
        if announce {
            let origin = who.map(str::to_string).unwrap_or_else(|| self.self_prefix.clone());
            out.send_line(send::topic(&origin, chan_name, topic));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChannelModes;
    use parking_lot::Mutex;

    /// Outbox capturing lines for assertions.
    #[derive(Default)]
    pub struct Capture(pub Mutex<Vec<String>>);

    impl Outbox for Capture {
        fn send_line(&self, line: String) {
            self.0.lock().push(line);
        }
    }

    fn fresh() -> (Network, Hooks, Capture) {
        let net = Network::new(
            Clock::fixed(1000),
            "services.example.net",
            "ABAA]",
            "Network Services",
            900,
        );
        (net, Hooks::new(), Capture::default())
    }

    fn link_peer(net: &mut Network, hooks: &Hooks, out: &dyn Outbox) -> String {
        let prefix = net
            .add_server(out, hooks, Some("AB"), "hub.example.net", 1, 800, 900, "ADAA]", "Hub")
            .unwrap();
        net.uplink_prefix = Some(prefix.clone());
        prefix
    }

    fn intro_user(net: &mut Network, hooks: &Hooks, out: &dyn Outbox, nick: &str, numeric: &str, ts: i64) {
        net.add_user(
            out,
            hooks,
            "AD",
            nick,
            "ident",
            "host.example.com",
            "+i",
            numeric,
            "Real Name",
            ts,
            "1.2.3.4".parse().unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn user_server_cross_index() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);

        let user = net.user_by_nick("alice").expect("nick lookup");
        assert_eq!(user.numeric, "ADAAB");
        let via_numeric = net.user_by_numeric("ADAAB").expect("numeric lookup");
        assert_eq!(via_numeric.nick, "Alice");
        let srv = net.servers.get("AD").unwrap();
        assert_eq!(
            srv.users[srv.local_slot(user.num_local)].as_deref(),
            Some("ADAAB")
        );
    }

    #[test]
    fn nick_collision_lower_ts_wins() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "X", "ADAAB", 100);
        intro_user(&mut net, &hooks, &out, "X", "ADAAC", 99);

        // The older (ts=99) introduction supersedes; the first is dead.
        let user = net.user_by_nick("X").expect("survivor");
        assert_eq!(user.numeric, "ADAAC");
        assert!(net.users.get("ADAAB").is_none());
        assert!(net.find_dead("ADAAB").is_some());
        let kills: Vec<_> = out
            .0
            .lock()
            .iter()
            .filter(|l| l.contains(" D ADAAB"))
            .cloned()
            .collect();
        assert_eq!(kills.len(), 1, "first user killed with announcement");
        assert!(kills[0].contains("Overruled by older nick"));
    }

    #[test]
    fn nick_collision_newer_is_ignored() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "X", "ADAAB", 100);
        intro_user(&mut net, &hooks, &out, "X", "ADAAC", 101);

        let user = net.user_by_nick("X").expect("original survives");
        assert_eq!(user.numeric, "ADAAB");
        // The duplicate is reachable by numeric (server table) only.
        assert!(net.users.contains_key("ADAAC"));
    }

    #[test]
    fn del_server_cascades() {
        let (mut net, hooks, out) = fresh();
        let hub = link_peer(&mut net, &hooks, &out);
        net.add_server(&out, &hooks, Some("AD"), "leaf.example.net", 2, 850, 950, "AEAA[", "Leaf")
            .unwrap();
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);
        net.add_user(
            &out,
            &hooks,
            "AE",
            "Bob",
            "bob",
            "b.example.com",
            "+",
            "AEAAB",
            "Bob",
            100,
            "5.6.7.8".parse().unwrap(),
        )
        .unwrap();

        net.del_server(&out, &hooks, &hub, false, None);
        assert!(net.servers.get("AD").is_none());
        assert!(net.servers.get("AE").is_none());
        assert!(net.user_by_nick("Alice").is_none());
        assert!(net.user_by_nick("Bob").is_none());
        assert!(net.uplink_prefix.is_none());
    }

    #[test]
    fn membership_consistency() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);

        assert!(net.add_channel_user(&out, &hooks, "ADAAB", "#test", Some(500)));
        let chan = net.channel("#test").unwrap();
        assert_eq!(chan.members.len(), 1);
        assert_eq!(net.users["ADAAB"].channels, vec!["#test"]);

        // Idempotent.
        assert!(net.add_channel_user(&out, &hooks, "ADAAB", "#test", None));
        assert_eq!(net.channel("#test").unwrap().members.len(), 1);

        net.del_channel_user(&out, &hooks, "ADAAB", "#test", Some("bye"), false);
        assert!(net.channel("#test").is_none(), "empty channel destroyed");
        assert!(net.users["ADAAB"].channels.is_empty());
    }

    #[test]
    fn join_veto_parts_user() {
        let (mut net, mut hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        hooks.on_join(|_, _, _, chan| chan == "#private");
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);

        assert!(!net.add_channel_user(&out, &hooks, "ADAAB", "#private", None));
        assert!(net.channel("#private").is_none());
        assert!(net.users["ADAAB"].channels.is_empty());
        assert!(out.0.lock().iter().any(|l| l.contains("ADAAB L #private")));
    }

    #[test]
    fn locked_channel_survives_empty() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);
        net.add_channel_user(&out, &hooks, "ADAAB", "#keep", None);
        net.lock_channel("#keep");
        net.del_channel_user(&out, &hooks, "ADAAB", "#keep", None, false);
        assert!(net.channel("#keep").is_some());
        net.unlock_channel(&out, &hooks, "#keep");
        assert!(net.channel("#keep").is_none());
    }

    #[test]
    fn burst_merge_incoming_older_wins() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "X", "ADAAB", 100);
        net.add_channel_user(&out, &hooks, "ADAAB", "#a", Some(200));
        {
            let chan = net.channel_mut("#a").unwrap();
            chan.modes.insert(ChannelModes::NO_PRIVMSGS);
            chan.modes.insert(ChannelModes::TOPIC_LIMIT);
            chan.member_mut("ADAAB").unwrap().modes.op = true;
        }

        let (_, merge) = net
            .add_channel(&out, &hooks, "#a", 100, &["+im"], &[])
            .unwrap();
        assert_eq!(merge, BurstMerge::IncomingWon);
        let chan = net.channel("#a").unwrap();
        assert_eq!(chan.timestamp, 100);
        assert!(chan.modes.contains(ChannelModes::INVITE_ONLY));
        assert!(chan.modes.contains(ChannelModes::MODERATED));
        assert!(!chan.modes.contains(ChannelModes::NO_PRIVMSGS));
        assert!(!chan.member("ADAAB").unwrap().modes.op, "local op stripped");
    }

    #[test]
    fn burst_merge_local_older_wins() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        net.add_channel(&out, &hooks, "#a", 100, &["+nt"], &[]).unwrap();
        let (_, merge) = net
            .add_channel(&out, &hooks, "#a", 200, &["+i"], &["*!*@spam.example.org"])
            .unwrap();
        assert_eq!(merge, BurstMerge::LocalWon);
        let chan = net.channel("#a").unwrap();
        assert_eq!(chan.timestamp, 100);
        assert!(chan.modes.contains(ChannelModes::NO_PRIVMSGS));
        assert!(!chan.modes.contains(ChannelModes::INVITE_ONLY));
        // Bans still merge.
        assert!(chan.ban_exists("*!*@spam.example.org"));
    }

    #[test]
    fn dead_users_drain_at_line_end() {
        let (mut net, hooks, out) = fresh();
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);
        net.del_user(&out, &hooks, "ADAAB", None, false, "test");
        assert!(net.find_dead("ADAAB").is_some());
        net.drain_dead();
        assert!(net.find_dead("ADAAB").is_none());
    }

    #[test]
    fn local_service_lifecycle() {
        let (mut net, hooks, out) = fresh();
        let numeric = net
            .add_local_user(&out, &hooks, "O3", "o3", None, "Oper Service", None)
            .unwrap();
        let user = net.users.get(&numeric).unwrap();
        assert!(user.modes.oper && user.modes.invisible && user.modes.service);
        assert!(out.0.lock().iter().any(|l| l.contains(" N O3 ")));

        // Re-adding the same nick returns the existing service.
        let again = net
            .add_local_user(&out, &hooks, "O3", "o3", None, "Oper Service", None)
            .unwrap();
        assert_eq!(again, numeric);
    }

    #[test]
    fn del_user_hooks_run_in_reverse() {
        let (mut net, mut hooks, out) = fresh();
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            hooks.on_del_user(move |_, _, _, _, _| order.lock().push(tag));
        }
        link_peer(&mut net, &hooks, &out);
        intro_user(&mut net, &hooks, &out, "Alice", "ADAAB", 100);
        net.del_user(&out, &hooks, "ADAAB", None, false, "bye");
        assert_eq!(*order.lock(), vec!["second", "first"]);
    }
}

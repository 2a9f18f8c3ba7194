//! Channel-mode transaction engine.
//!
//! A [`ModeChange`] is one immutable batch of channel mode changes: flag bits
//! to set and clear, new parameter values, and an ordered list of ban and
//! membership changes. Parse, apply, announce, and format are separate passes
//! over the same record, so a change can be built programmatically, applied
//! to the replica, and serialized to the wire without re-parsing.

use tracing::debug;

use super::channel::{Channel, ChannelModes};
use super::{MAX_MODE_PARAMS, MAX_OPLEVEL};

/// One per-argument change within a mode transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeArg {
    Ban {
        add: bool,
        mask: String,
    },
    Member {
        add: bool,
        op: bool,
        voice: bool,
        /// Combined numeric of the member.
        user: String,
        /// Oplevel to assign on +o, when known.
        oplevel: Option<u16>,
    },
}

fn arg_is_add(arg: &ModeArg) -> bool {
    match arg {
        ModeArg::Ban { add, .. } | ModeArg::Member { add, .. } => *add,
    }
}

/// Parse-time context flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseFlags {
    /// Allow `o`/`v`/`b` arguments.
    pub allow_ovb: bool,
    /// The change came from a server: victims are numerics, unknown letters
    /// are tolerated, and oplevel clamping is skipped.
    pub from_server: bool,
    /// `-k`/`-U`/`-A` do not consume an argument.
    pub key_free: bool,
    pub upass_free: bool,
    pub apass_free: bool,
    /// Refuse `z` changes (channel registration is managed elsewhere).
    pub registered: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeChange {
    pub set: ChannelModes,
    pub clear: ChannelModes,
    pub new_limit: u32,
    pub new_key: String,
    pub new_upass: String,
    pub new_apass: String,
    pub args: Vec<ModeArg>,
}

impl ModeChange {
    #[allow(dead_code)] // Callers skip announcing no-op changes.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.clear.is_empty() && self.args.is_empty()
    }

    fn flag(&mut self, bit: ChannelModes, add: bool) {
        if add {
            self.set.insert(bit);
            self.clear.remove(bit);
        } else {
            self.clear.insert(bit);
            self.set.remove(bit);
        }
    }

    /// Parse a textual mode change (`words[0]` is the letter string, the
    /// rest are its arguments).
    ///
    /// `resolve` maps a victim token (nick, or numeric when
    /// [`ParseFlags::from_server`]) to a combined numeric; victims that do
    /// not resolve to a member of `channel` are dropped silently. Any other
    /// malformed input fails the whole parse.
    pub fn parse(
        channel: &Channel,
        words: &[&str],
        flags: ParseFlags,
        base_oplevel: u16,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Option<ModeChange> {
        if words.is_empty() {
            return None;
        }
        fn take<'a>(words: &[&'a str], idx: &mut usize) -> Option<&'a str> {
            let arg = words.get(*idx).copied();
            if arg.is_some() {
                *idx += 1;
            }
            arg
        }

        let mut change = ModeChange::default();
        let mut add = true;
        let mut in_arg = 1usize;

        for letter in words[0].chars() {
            match letter {
                ' ' => break,
                '+' => add = true,
                '-' => add = false,
                'p' => change.flag(ChannelModes::PRIVATE, add),
                's' => change.flag(ChannelModes::SECRET, add),
                'm' => change.flag(ChannelModes::MODERATED, add),
                't' => change.flag(ChannelModes::TOPIC_LIMIT, add),
                'i' => change.flag(ChannelModes::INVITE_ONLY, add),
                'n' => change.flag(ChannelModes::NO_PRIVMSGS, add),
                'D' => change.flag(ChannelModes::DELAYED_JOINS, add),
                'r' => change.flag(ChannelModes::REG_ONLY, add),
                'c' => change.flag(ChannelModes::NO_COLORS, add),
                'C' => change.flag(ChannelModes::NO_CTCPS, add),
                'z' => {
                    if flags.registered {
                        return None;
                    }
                    change.flag(ChannelModes::REGISTERED, add);
                }
                'l' => {
                    if add {
                        let arg = take(words, &mut in_arg)?;
                        change.set.insert(ChannelModes::LIMIT);
                        change.new_limit = arg.parse().unwrap_or(0);
                    } else {
                        change.set.remove(ChannelModes::LIMIT);
                        change.clear.insert(ChannelModes::LIMIT);
                    }
                }
                'k' => {
                    if add {
                        change.new_key = take(words, &mut in_arg)?.to_string();
                        change.set.insert(ChannelModes::KEY);
                    } else {
                        change.clear.insert(ChannelModes::KEY);
                        if !flags.key_free {
                            take(words, &mut in_arg)?;
                        }
                    }
                }
                'U' => {
                    if add {
                        change.new_upass = take(words, &mut in_arg)?.to_string();
                        change.set.insert(ChannelModes::UPASS);
                    } else {
                        change.clear.insert(ChannelModes::UPASS);
                        if !flags.upass_free {
                            take(words, &mut in_arg)?;
                        }
                    }
                }
                'A' => {
                    if add {
                        change.new_apass = take(words, &mut in_arg)?.to_string();
                        change.set.insert(ChannelModes::APASS);
                    } else {
                        change.clear.insert(ChannelModes::APASS);
                        if !flags.apass_free {
                            take(words, &mut in_arg)?;
                        }
                    }
                }
                'b' => {
                    if !flags.allow_ovb {
                        return None;
                    }
                    let mask = take(words, &mut in_arg)?;
                    change.args.push(ModeArg::Ban {
                        add,
                        mask: mask.to_string(),
                    });
                }
                'o' | 'v' => {
                    if !flags.allow_ovb {
                        return None;
                    }
                    let arg = take(words, &mut in_arg)?;
                    let (token, oplevel_str) = match arg.split_once(':') {
                        Some((tok, lvl)) => (tok, Some(lvl)),
                        None => (arg, None),
                    };
                    let oplevel = match oplevel_str {
                        Some(lvl) => {
                            let mut level = parse_oplevel(lvl);
                            if level <= base_oplevel && !flags.from_server {
                                level = base_oplevel.saturating_add(1);
                            }
                            Some(level.min(MAX_OPLEVEL))
                        }
                        None if channel.modes.contains(ChannelModes::UPASS) => {
                            Some(base_oplevel.saturating_add(1).min(MAX_OPLEVEL))
                        }
                        None => None,
                    };
                    let Some(numeric) = resolve(token) else {
                        continue;
                    };
                    if channel.member(&numeric).is_none() {
                        continue;
                    }
                    change.args.push(ModeArg::Member {
                        add,
                        op: letter == 'o',
                        voice: letter == 'v',
                        user: numeric,
                        oplevel,
                    });
                }
                _ => {
                    if !flags.from_server {
                        return None;
                    }
                }
            }
        }

        // Secret and private are mutually exclusive; setting one clears the
        // other, never both.
        if change.set.contains(ChannelModes::SECRET) {
            change.set.remove(ChannelModes::PRIVATE);
            change.clear.insert(ChannelModes::PRIVATE);
        } else if change.set.contains(ChannelModes::PRIVATE) {
            change.set.remove(ChannelModes::SECRET);
            change.clear.insert(ChannelModes::SECRET);
        }
        Some(change)
    }

    /// Apply the record to the in-memory channel state.
    pub fn apply(&self, channel: &mut Channel, who_nick: Option<&str>, now: i64) {
        channel.modes = channel.modes.difference(self.clear).union(self.set);
        if self.set.contains(ChannelModes::LIMIT) {
            channel.limit = self.new_limit;
        }
        if self.clear.contains(ChannelModes::LIMIT) {
            channel.limit = 0;
        }
        if self.set.contains(ChannelModes::KEY) {
            channel.key = self.new_key.clone();
        }
        if self.clear.contains(ChannelModes::KEY) {
            channel.key.clear();
        }
        if self.set.contains(ChannelModes::UPASS) {
            channel.upass = self.new_upass.clone();
        }
        if self.clear.contains(ChannelModes::UPASS) {
            channel.upass.clear();
        }
        if self.set.contains(ChannelModes::APASS) {
            channel.apass = self.new_apass.clone();
        }
        if self.clear.contains(ChannelModes::APASS) {
            channel.apass.clear();
        }
        for arg in &self.args {
            match arg {
                ModeArg::Ban { add: true, mask } => {
                    channel.add_ban(mask, who_nick.unwrap_or("<unknown>"), now);
                }
                ModeArg::Ban { add: false, mask } => {
                    channel.remove_ban(mask);
                }
                ModeArg::Member {
                    add,
                    op,
                    voice,
                    user,
                    oplevel,
                } => {
                    if let Some(member) = channel.member_mut(user) {
                        if *add {
                            if *op {
                                member.modes.op = true;
                                member.modes.oplevel = *oplevel;
                            }
                            if *voice {
                                member.modes.voice = true;
                            }
                        } else {
                            if *op {
                                member.modes.op = false;
                                member.modes.oplevel = None;
                            }
                            if *voice {
                                member.modes.voice = false;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Serialize to wire MODE lines.
    ///
    /// Emits the removal run first, then the addition run; within each run
    /// simple letters precede parameterized letters, which precede member
    /// and ban arguments. Lines are cut at [`MAX_MODE_PARAMS`] arguments or
    /// a conservative 450 bytes including the channel name. Each run gets at
    /// most one continuation line: arguments past that bound are applied to
    /// the replica but not announced (the count is logged).
    #[allow(dead_code)] // Service modules announce the changes they originate.
    pub fn announce_lines(&self, channel: &Channel, origin: &str) -> Vec<String> {
        let mut buf = ModeBuffer::new(origin, &channel.name, channel.timestamp);

        if !self.clear.is_empty() || self.args.iter().any(|a| !arg_is_add(a)) {
            buf.begin_sweep();
        }
        if !self.clear.is_empty() {
            buf.sign('-');
            for (letter, bit) in ChannelModes::simple_letters() {
                if self.clear.contains(*bit) {
                    buf.letter(*letter);
                }
            }
            if self.clear.contains(ChannelModes::LIMIT) {
                buf.letter('l');
            }
            // Parameterized removals echo the value being removed.
            if self.clear.intersection(channel.modes).contains(ChannelModes::KEY) {
                buf.with_arg('k', &channel.key);
            }
            if self.clear.intersection(channel.modes).contains(ChannelModes::UPASS) {
                buf.with_arg('U', &channel.upass);
            }
            if self.clear.intersection(channel.modes).contains(ChannelModes::APASS) {
                buf.with_arg('A', &channel.apass);
            }
        }
        for arg in &self.args {
            match arg {
                ModeArg::Ban { add: false, mask } => {
                    buf.sign('-');
                    buf.with_arg('b', mask);
                }
                ModeArg::Member {
                    add: false,
                    op,
                    voice,
                    user,
                    ..
                } => {
                    buf.sign('-');
                    if *op {
                        buf.with_arg('o', user);
                    }
                    if *voice {
                        buf.with_arg('v', user);
                    }
                }
                _ => {}
            }
        }

        if !self.set.is_empty() || self.args.iter().any(arg_is_add) {
            buf.begin_sweep();
        }
        if !self.set.is_empty() {
            buf.sign('+');
            for (letter, bit) in ChannelModes::simple_letters() {
                if self.set.contains(*bit) {
                    buf.letter(*letter);
                }
            }
            if self.set.contains(ChannelModes::KEY) {
                buf.with_arg('k', &self.new_key);
            }
            if self.set.contains(ChannelModes::UPASS) {
                buf.with_arg('U', &self.new_upass);
            }
            if self.set.contains(ChannelModes::APASS) {
                buf.with_arg('A', &self.new_apass);
            }
            if self.set.contains(ChannelModes::LIMIT) {
                buf.with_arg('l', &self.new_limit.to_string());
            }
        }
        for arg in &self.args {
            match arg {
                ModeArg::Ban { add: true, mask } => {
                    buf.sign('+');
                    buf.with_arg('b', mask);
                }
                ModeArg::Member {
                    add: true,
                    op,
                    voice,
                    user,
                    ..
                } => {
                    buf.sign('+');
                    if *op {
                        buf.with_arg('o', user);
                    }
                    if *voice {
                        buf.with_arg('v', user);
                    }
                }
                _ => {}
            }
        }
        buf.finish()
    }

    /// Diagnostic string: flag letters and parameter values, no member/ban
    /// arguments. Also the burst wire form when built from a channel
    /// snapshot.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.clear.is_empty() {
            out.push('-');
            for (letter, bit) in ChannelModes::simple_letters() {
                if self.clear.contains(*bit) {
                    out.push(*letter);
                }
            }
            for (letter, bit) in [
                ('l', ChannelModes::LIMIT),
                ('k', ChannelModes::KEY),
                ('U', ChannelModes::UPASS),
                ('A', ChannelModes::APASS),
            ] {
                if self.clear.contains(bit) {
                    out.push(letter);
                }
            }
        }
        if !self.set.is_empty() {
            out.push('+');
            for (letter, bit) in ChannelModes::simple_letters() {
                if self.set.contains(*bit) {
                    out.push(*letter);
                }
            }
            let mut params: Vec<&str> = Vec::new();
            let limit = self.new_limit.to_string();
            if self.set.contains(ChannelModes::LIMIT) {
                out.push('l');
                params.push(&limit);
            }
            if self.set.contains(ChannelModes::KEY) {
                out.push('k');
                params.push(&self.new_key);
            }
            if self.set.contains(ChannelModes::APASS) {
                out.push('A');
                params.push(&self.new_apass);
            }
            if self.set.contains(ChannelModes::UPASS) {
                out.push('U');
                params.push(&self.new_upass);
            }
            for param in params {
                out.push(' ');
                out.push_str(param);
            }
        }
        out
    }

    /// Snapshot a channel's mode state as an all-additive change.
    pub fn from_channel(channel: &Channel) -> ModeChange {
        ModeChange {
            set: channel.modes,
            clear: ChannelModes::default(),
            new_limit: channel.limit,
            new_key: channel.key.clone(),
            new_upass: channel.upass.clone(),
            new_apass: channel.apass.clone(),
            args: Vec::new(),
        }
    }

    /// Build the change that undoes this one against the pre-apply snapshot
    /// `before`.
    #[allow(dead_code)] // Service modules roll back vetoed changes.
    pub fn inverse(&self, before: &Channel) -> ModeChange {
        let mut inv = ModeChange::default();
        // Bits we set that were not set before get cleared; bits we cleared
        // that were set before get restored with their old values.
        inv.clear = self.set.difference(before.modes);
        inv.set = self.clear.intersection(before.modes);
        if inv.set.contains(ChannelModes::LIMIT) {
            inv.new_limit = before.limit;
        }
        if inv.set.contains(ChannelModes::KEY) {
            inv.new_key = before.key.clone();
        }
        if inv.set.contains(ChannelModes::UPASS) {
            inv.new_upass = before.upass.clone();
        }
        if inv.set.contains(ChannelModes::APASS) {
            inv.new_apass = before.apass.clone();
        }
        for arg in self.args.iter().rev() {
            match arg {
                ModeArg::Ban { add, mask } => inv.args.push(ModeArg::Ban {
                    add: !add,
                    mask: mask.clone(),
                }),
                ModeArg::Member {
                    add,
                    op,
                    voice,
                    user,
                    ..
                } => {
                    let prior = before.member(user).map(|m| m.modes).unwrap_or_default();
                    inv.args.push(ModeArg::Member {
                        add: !add,
                        op: *op,
                        voice: *voice,
                        user: user.clone(),
                        oplevel: if !add { prior.oplevel } else { None },
                    });
                }
            }
        }
        inv
    }
}

/// Leading-digit oplevel parse; stops at the first non-digit.
fn parse_oplevel(text: &str) -> u16 {
    let mut level: u32 = 0;
    for c in text.chars() {
        match c.to_digit(10) {
            Some(d) => level = (level * 10 + d).min(u16::MAX as u32),
            None => break,
        }
    }
    level as u16
}

/// Wholesale mode stripping (the CLEARMODE operation).
pub fn clear_chanmode(channel: &mut Channel, letters: &str) {
    let mut remove = ChannelModes::default();
    let mut strip_ops = false;
    let mut strip_voice = false;
    for letter in letters.chars() {
        match letter {
            'o' => strip_ops = true,
            'v' => strip_voice = true,
            'p' => remove.insert(ChannelModes::PRIVATE),
            's' => remove.insert(ChannelModes::SECRET),
            'm' => remove.insert(ChannelModes::MODERATED),
            't' => remove.insert(ChannelModes::TOPIC_LIMIT),
            'i' => remove.insert(ChannelModes::INVITE_ONLY),
            'n' => remove.insert(ChannelModes::NO_PRIVMSGS),
            'k' => {
                remove.insert(ChannelModes::KEY);
                channel.key.clear();
            }
            'A' => {
                remove.insert(ChannelModes::APASS);
                channel.apass.clear();
            }
            'U' => {
                remove.insert(ChannelModes::UPASS);
                channel.upass.clear();
            }
            'l' => {
                remove.insert(ChannelModes::LIMIT);
                channel.limit = 0;
            }
            'b' => remove.insert(ChannelModes::BAN),
            'D' => remove.insert(ChannelModes::DELAYED_JOINS),
            'r' => remove.insert(ChannelModes::REG_ONLY),
            'c' => remove.insert(ChannelModes::NO_COLORS),
            'C' => remove.insert(ChannelModes::NO_CTCPS),
            'z' => remove.insert(ChannelModes::REGISTERED),
            _ => {}
        }
    }
    if remove.is_empty() && !strip_ops && !strip_voice {
        return;
    }
    channel.modes.remove(remove);
    if remove.contains(ChannelModes::BAN) {
        channel.bans.clear();
    }
    if strip_ops || strip_voice {
        for member in &mut channel.members {
            if strip_ops {
                member.modes.op = false;
                member.modes.oplevel = None;
            }
            if strip_voice {
                member.modes.voice = false;
            }
        }
    }
}

/// Serialization buffer for announce: accumulates mode letters and their
/// arguments separately, flushing a full MODE line when the parameter count
/// or length budget runs out.
///
/// Each sweep (the removal run, then the addition run) gets at most one
/// such mid-sweep flush, so a sweep never spans more than its line plus one
/// continuation. Arguments that would need a further line are dropped from
/// the announcement.
struct ModeBuffer {
    origin: String,
    channel: String,
    timestamp: i64,
    modes: String,
    args: String,
    arg_count: usize,
    sign: char,
    /// Mid-sweep flushes taken in the current sweep.
    continuations: usize,
    dropped: usize,
    lines: Vec<String>,
}

impl ModeBuffer {
    fn new(origin: &str, channel: &str, timestamp: i64) -> Self {
        Self {
            origin: origin.to_string(),
            channel: channel.to_string(),
            timestamp,
            modes: String::new(),
            args: String::new(),
            arg_count: 0,
            sign: '\0',
            continuations: 0,
            dropped: 0,
            lines: Vec::new(),
        }
    }

    /// Start a new sweep: the continuation budget resets.
    fn begin_sweep(&mut self) {
        self.continuations = 0;
    }

    fn sign(&mut self, sign: char) {
        if self.sign != sign {
            self.sign = sign;
            self.modes.push(sign);
        }
    }

    fn letter(&mut self, letter: char) {
        self.modes.push(letter);
    }

    fn with_arg(&mut self, letter: char, arg: &str) {
        if self.arg_count >= MAX_MODE_PARAMS
            || self.modes.len() + self.args.len() + self.channel.len() + arg.len() > 450
        {
            if self.continuations >= 1 {
                self.dropped += 1;
                return;
            }
            self.continuations += 1;
            self.flush();
        }
        self.modes.push(letter);
        self.args.push(' ');
        self.args.push_str(arg);
        self.arg_count += 1;
    }

    fn flush(&mut self) {
        if self.modes.is_empty() {
            return;
        }
        self.lines.push(format!(
            "{} M {} {}{} {}",
            self.origin, self.channel, self.modes, self.args, self.timestamp
        ));
        self.modes.clear();
        self.args.clear();
        self.arg_count = 0;
        if self.sign != '\0' {
            self.modes.push(self.sign);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        if self.dropped > 0 {
            debug!(
                channel = %self.channel,
                dropped = self.dropped,
                "mode announcement truncated at one continuation line per sweep"
            );
        }
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::channel::{MemberModes, Membership};

    fn chan_with_members(members: &[&str]) -> Channel {
        let mut chan = Channel::new("#test".into(), 1000);
        for numeric in members {
            chan.members.push(Membership {
                user: numeric.to_string(),
                modes: MemberModes::default(),
                idle_since: 0,
            });
        }
        chan
    }

    fn resolve_identity(token: &str) -> Option<String> {
        Some(token.to_string())
    }

    #[test]
    fn parse_simple_flags() {
        let chan = chan_with_members(&[]);
        let change = ModeChange::parse(
            &chan,
            &["+ntk", "secret"],
            ParseFlags {
                allow_ovb: true,
                ..Default::default()
            },
            0,
            &resolve_identity,
        )
        .unwrap();
        assert!(change.set.contains(ChannelModes::NO_PRIVMSGS));
        assert!(change.set.contains(ChannelModes::TOPIC_LIMIT));
        assert!(change.set.contains(ChannelModes::KEY));
        assert_eq!(change.new_key, "secret");
    }

    #[test]
    fn parse_missing_arg_fails() {
        let chan = chan_with_members(&[]);
        assert!(
            ModeChange::parse(&chan, &["+l"], ParseFlags::default(), 0, &resolve_identity)
                .is_none()
        );
        assert!(
            ModeChange::parse(&chan, &["+k"], ParseFlags::default(), 0, &resolve_identity)
                .is_none()
        );
    }

    #[test]
    fn parse_secret_clears_private() {
        let chan = chan_with_members(&[]);
        let change =
            ModeChange::parse(&chan, &["+sp"], ParseFlags::default(), 0, &resolve_identity)
                .unwrap();
        // 'p' came last, so private wins and secret is cleared.
        assert!(change.set.contains(ChannelModes::PRIVATE));
        assert!(!change.set.contains(ChannelModes::SECRET));
        assert!(change.clear.contains(ChannelModes::SECRET));
        assert!(
            change
                .set
                .intersection(change.clear)
                .intersection(ChannelModes::PRIVATE.union(ChannelModes::SECRET))
                .is_empty()
        );
    }

    #[test]
    fn parse_nonmember_victim_is_dropped() {
        let chan = chan_with_members(&["AAB"]);
        let change = ModeChange::parse(
            &chan,
            &["+oo", "AAB", "AAC"],
            ParseFlags {
                allow_ovb: true,
                from_server: true,
                ..Default::default()
            },
            0,
            &resolve_identity,
        )
        .unwrap();
        assert_eq!(change.args.len(), 1);
        assert!(matches!(
            &change.args[0],
            ModeArg::Member { user, op: true, .. } if user == "AAB"
        ));
    }

    #[test]
    fn parse_oplevel_clamps_for_users() {
        let chan = chan_with_members(&["AAB"]);
        let change = ModeChange::parse(
            &chan,
            &["+o", "AAB:3"],
            ParseFlags {
                allow_ovb: true,
                from_server: false,
                ..Default::default()
            },
            5,
            &resolve_identity,
        )
        .unwrap();
        match &change.args[0] {
            ModeArg::Member { oplevel, .. } => assert_eq!(*oplevel, Some(6)),
            other => panic!("unexpected arg {:?}", other),
        }

        // Servers are exempt from clamping.
        let change = ModeChange::parse(
            &chan,
            &["+o", "AAB:3"],
            ParseFlags {
                allow_ovb: true,
                from_server: true,
                ..Default::default()
            },
            5,
            &resolve_identity,
        )
        .unwrap();
        match &change.args[0] {
            ModeArg::Member { oplevel, .. } => assert_eq!(*oplevel, Some(3)),
            other => panic!("unexpected arg {:?}", other),
        }
    }

    #[test]
    fn parse_unknown_letter() {
        let chan = chan_with_members(&[]);
        assert!(
            ModeChange::parse(&chan, &["+q"], ParseFlags::default(), 0, &resolve_identity)
                .is_none()
        );
        // Servers may send letters we do not track.
        assert!(
            ModeChange::parse(
                &chan,
                &["+q"],
                ParseFlags {
                    from_server: true,
                    ..Default::default()
                },
                0,
                &resolve_identity
            )
            .is_some()
        );
    }

    #[test]
    fn apply_flags_and_params() {
        let mut chan = chan_with_members(&["AAB"]);
        let change = ModeChange::parse(
            &chan,
            &["+ntl-k", "10", "oldkey"],
            ParseFlags::default(),
            0,
            &resolve_identity,
        )
        .unwrap();
        chan.key = "oldkey".into();
        chan.modes.insert(ChannelModes::KEY);
        change.apply(&mut chan, Some("X"), 2000);
        assert!(chan.modes.contains(ChannelModes::NO_PRIVMSGS));
        assert!(chan.modes.contains(ChannelModes::LIMIT));
        assert_eq!(chan.limit, 10);
        assert!(!chan.modes.contains(ChannelModes::KEY));
        assert!(chan.key.is_empty());
    }

    #[test]
    fn announce_orders_removals_before_additions() {
        let mut chan = chan_with_members(&["AAB"]);
        chan.bans.push(crate::state::BanEntry {
            mask: "*!*@bad.example.org".into(),
            who: "X".into(),
            set: 100,
        });
        let change = ModeChange::parse(
            &chan,
            &["+o-b", "AAB", "*!*@bad.example.org"],
            ParseFlags {
                allow_ovb: true,
                from_server: true,
                ..Default::default()
            },
            0,
            &resolve_identity,
        )
        .unwrap();
        let lines = change.announce_lines(&chan, "AA");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], "AA M #test -b+o *!*@bad.example.org AAB 1000");
    }

    /// Arguments announced on one line: everything between the mode string
    /// and the trailing timestamp.
    fn announced_args(line: &str) -> usize {
        line.split_whitespace().count() - 5
    }

    #[test]
    fn announce_splits_long_batches() {
        let numerics: Vec<String> = (0u8..10).map(|i| format!("AA{}", (b'B' + i) as char)).collect();
        let chan = chan_with_members(&numerics.iter().map(String::as_str).collect::<Vec<_>>());
        let mut change = ModeChange::default();
        for numeric in &numerics {
            change.args.push(ModeArg::Member {
                add: true,
                op: true,
                voice: false,
                user: numeric.clone(),
                oplevel: None,
            });
        }
        let lines = change.announce_lines(&chan, "AA");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("+oooooo"));
        assert!(lines[1].contains("+oooo"));
    }

    #[test]
    fn announce_caps_at_one_continuation_per_sweep() {
        // 15 op grants in a single sweep: the line plus one continuation
        // carry twelve; the rest are applied but not announced.
        let numerics: Vec<String> = (0..15).map(|i| format!("AB{:02}", i)).collect();
        let chan = chan_with_members(&numerics.iter().map(String::as_str).collect::<Vec<_>>());
        let mut change = ModeChange::default();
        for numeric in &numerics {
            change.args.push(ModeArg::Member {
                add: true,
                op: true,
                voice: false,
                user: numeric.clone(),
                oplevel: None,
            });
        }
        let lines = change.announce_lines(&chan, "XX");
        assert_eq!(lines.len(), 2, "never a third line per sweep: {:?}", lines);
        assert_eq!(announced_args(&lines[0]), 6);
        assert_eq!(announced_args(&lines[1]), 6);
        assert!(lines[1].contains("AB11"));
        assert!(!lines.iter().any(|l| l.contains("AB12")), "overflow dropped");
    }

    #[test]
    fn announce_continuation_budget_is_per_sweep() {
        // Eight removals then eight additions: each sweep spends its own
        // continuation, so all sixteen arguments still go out.
        let numerics: Vec<String> = (0..16).map(|i| format!("AB{:02}", i)).collect();
        let chan = chan_with_members(&numerics.iter().map(String::as_str).collect::<Vec<_>>());
        let mut change = ModeChange::default();
        for (i, numeric) in numerics.iter().enumerate() {
            change.args.push(ModeArg::Member {
                add: i >= 8,
                op: true,
                voice: false,
                user: numeric.clone(),
                oplevel: None,
            });
        }
        let lines = change.announce_lines(&chan, "XX");
        assert_eq!(lines.len(), 3, "{:?}", lines);
        let total: usize = lines.iter().map(|l| announced_args(l)).sum();
        assert_eq!(total, 16, "nothing dropped when each sweep stays in budget");
        assert!(lines[0].starts_with("XX M #test -oooooo"));
        assert!(lines[1].contains("-oo+oooo"), "{:?}", lines[1]);
        assert!(lines[2].contains("+oooo"));
    }

    #[test]
    fn format_orders_parameters() {
        let chan = chan_with_members(&[]);
        let change = ModeChange::parse(
            &chan,
            &["+ntlk", "25", "hunter2"],
            ParseFlags::default(),
            0,
            &resolve_identity,
        )
        .unwrap();
        assert_eq!(change.format(), "+ntlk 25 hunter2");
    }

    #[test]
    fn inverse_round_trips() {
        let mut chan = chan_with_members(&["AAB"]);
        chan.modes.insert(ChannelModes::NO_PRIVMSGS);
        chan.member_mut("AAB").unwrap().modes.op = true;
        let before = chan.clone();

        let change = ModeChange::parse(
            &chan,
            &["+si-n-o", "AAB"],
            ParseFlags {
                allow_ovb: true,
                from_server: true,
                ..Default::default()
            },
            0,
            &resolve_identity,
        )
        .unwrap();
        change.apply(&mut chan, Some("X"), 2000);
        assert!(chan.modes.contains(ChannelModes::SECRET));
        assert!(!chan.member("AAB").unwrap().modes.op);

        let inverse = change.inverse(&before);
        inverse.apply(&mut chan, Some("X"), 2001);
        assert_eq!(chan.modes, before.modes);
        assert_eq!(
            chan.member("AAB").unwrap().modes,
            before.member("AAB").unwrap().modes
        );
    }

    #[test]
    fn clearmode_strips_wholesale() {
        let mut chan = chan_with_members(&["AAB", "AAC"]);
        chan.modes.insert(ChannelModes::INVITE_ONLY);
        chan.modes.insert(ChannelModes::KEY);
        chan.key = "k".into();
        chan.add_ban("*!*@x", "X", 1);
        chan.member_mut("AAB").unwrap().modes.op = true;
        chan.member_mut("AAC").unwrap().modes.voice = true;

        clear_chanmode(&mut chan, "ikbov");
        assert!(!chan.modes.contains(ChannelModes::INVITE_ONLY));
        assert!(chan.key.is_empty());
        assert!(chan.bans.is_empty());
        assert!(!chan.member("AAB").unwrap().modes.op);
        assert!(!chan.member("AAC").unwrap().modes.voice);
    }
}

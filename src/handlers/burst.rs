//! Netburst: sending our state and reconciling the peer's.

use tracing::warn;

use crate::error::{HandlerError, HandlerResult};
use crate::proto::{RawMessage, send};
use crate::state::network::BurstMerge;
use crate::state::{Membership, ModeChange, Network};
use crate::util::irc_to_lower;

use super::{Context, Origin};

/// Introduce everything we know to a freshly-linked uplink: juped servers
/// closest-first, then our local clients. Channels are snapshotted and
/// trickled out as the peer's burst names them (or in bulk at its EOB).
pub fn send_burst(ctx: &Context, net: &mut Network) {
    let mut servers: Vec<(u32, String)> = net
        .servers
        .values()
        .filter(|s| {
            s.numeric != net.self_prefix && Some(&s.numeric) != net.uplink_prefix.as_ref()
        })
        .map(|s| (s.hops, s.numeric.clone()))
        .collect();
    servers.sort();
    for (_, prefix) in servers {
        if let Some(srv) = net.servers.get(&prefix) {
            ctx.out
                .send_line(send::server_intro(&net.self_prefix, srv, false));
        }
    }

    let locals: Vec<String> = net.self_server().users.iter().flatten().cloned().collect();
    for numeric in locals {
        net.reintroduce_user(&*ctx.out, &numeric);
    }

    *ctx.unbursted.lock() = Some(net.channels.keys().cloned().collect());
}

/// Emit the BURST line(s) for one channel: timestamp, modes, members with
/// sticky `:ov` runs, then the `%`-prefixed ban section. Long channels are
/// split with the shared fields repeated.
pub fn burst_channel(ctx: &Context, net: &Network, key: &str) {
    let Some(chan) = net.channels.get(key) else {
        return;
    };
    let base = format!("{} B {} {}", net.self_prefix, chan.name, chan.timestamp);
    let mode_str = ModeChange::from_channel(chan).format();

    let mut line = base.clone();
    if !mode_str.is_empty() {
        line.push(' ');
        line.push_str(&mode_str);
    }

    // Group privilege runs so the sticky mode marker stays correct.
    let mut members: Vec<&Membership> = chan.members.iter().collect();
    members.sort_by_key(|m| (m.modes.op, m.modes.voice));

    let mut last_mode: Option<(bool, bool)> = None;
    let mut first = true;
    for member in members {
        let mode_key = (member.modes.op, member.modes.voice);
        let mut token = member.user.clone();
        if (mode_key.0 || mode_key.1) && last_mode != Some(mode_key) {
            token.push(':');
            if mode_key.0 {
                token.push('o');
            }
            if mode_key.1 {
                token.push('v');
            }
        }
        if line.len() + token.len() + 1 > 500 {
            ctx.out.send_line(line);
            line = base.clone();
            first = true;
            last_mode = None;
            // Re-derive the token: a fresh line restarts the mode run.
            token = member.user.clone();
            if mode_key.0 || mode_key.1 {
                token.push(':');
                if mode_key.0 {
                    token.push('o');
                }
                if mode_key.1 {
                    token.push('v');
                }
            }
        }
        line.push(if first { ' ' } else { ',' });
        line.push_str(&token);
        first = false;
        last_mode = Some(mode_key);
    }

    if !chan.bans.is_empty() {
        let mut in_section = false;
        for ban in &chan.bans {
            if !in_section || line.len() + ban.mask.len() + 1 > 505 {
                if in_section {
                    ctx.out.send_line(line.clone());
                    line = base.clone();
                }
                line.push_str(" :%");
                in_section = true;
            } else {
                line.push(' ');
            }
            line.push_str(&ban.mask);
        }
    }

    ctx.out.send_line(line);
}

/// `BURST <chan> <ts> [+modes args...] [%bans] [members]`
pub fn cmd_burst(
    ctx: &Context,
    net: &mut Network,
    _origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let chan_name = msg.arg(0).unwrap().to_string();
    let in_ts: i64 = msg.arg(1).unwrap_or("0").parse().unwrap_or(0);

    let mut mode_words: Vec<String> = Vec::new();
    let mut bans: Vec<String> = Vec::new();
    let mut members = String::new();
    let mut next = 2;
    while next < msg.args.len() {
        let token = &msg.args[next];
        if token.starts_with('+') {
            // The mode letters say how many of the following tokens belong
            // to this section.
            let mut n_modes = 1;
            for c in token.chars() {
                if matches!(c, 'k' | 'l' | 'A' | 'U') {
                    n_modes += 1;
                }
            }
            let end = (next + n_modes).min(msg.args.len());
            mode_words = msg.args[next..end].to_vec();
            next = end;
        } else if let Some(section) = token.strip_prefix('%') {
            bans = section
                .split(' ')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            next += 1;
        } else {
            members = token.clone();
            next += 1;
        }
    }

    // A burst for a channel we had queued for our own burst: adopt the
    // timestamp and answer with our corrective burst right away.
    let key = irc_to_lower(&chan_name);
    let was_unbursted = ctx
        .unbursted
        .lock()
        .as_mut()
        .map(|set| set.remove(&key))
        .unwrap_or(false);
    if was_unbursted {
        if let Some(chan) = net.channels.get_mut(&key) {
            chan.timestamp = in_ts;
        }
        burst_channel(ctx, net, &key);
    }

    let mode_refs: Vec<&str> = mode_words.iter().map(String::as_str).collect();
    let ban_refs: Vec<&str> = bans.iter().map(String::as_str).collect();
    let Some((key, merge)) = net.add_channel(
        &*ctx.out,
        &ctx.hooks,
        &chan_name,
        in_ts,
        &mode_refs,
        &ban_refs,
    ) else {
        return Err(HandlerError::Malformed("bad burst channel"));
    };

    // Member entries: numeric, optionally `:modes`. A mode run is sticky
    // across entries until the next `:`. Digit runs set the oplevel
    // (absolute first, accumulating afterwards) and imply op.
    let mut res = Ok(());
    let mut op = false;
    let mut voice = false;
    let mut oplevel: Option<u16> = None;
    for entry in members.split(',').filter(|e| !e.is_empty()) {
        let (numeric_token, mode_part) = match entry.split_once(':') {
            Some((n, m)) => (n, Some(m)),
            None => (entry, None),
        };
        if let Some(mode_part) = mode_part {
            op = false;
            voice = false;
            let mut chars = mode_part.chars().peekable();
            while let Some(&c) = chars.peek() {
                match c {
                    'o' => {
                        op = true;
                        oplevel = None;
                        chars.next();
                    }
                    'v' => {
                        voice = true;
                        oplevel = None;
                        chars.next();
                    }
                    '0'..='9' => {
                        op = true;
                        let mut run: u32 = 0;
                        while let Some(&d) = chars.peek() {
                            if let Some(v) = d.to_digit(10) {
                                run = run * 10 + v;
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        oplevel = Some(match oplevel {
                            Some(prev) => prev.saturating_add(run as u16),
                            None => run as u16,
                        });
                    }
                    _ => break,
                }
            }
        }
        let Some(user) = net.user_by_numeric(numeric_token) else {
            warn!(numeric = numeric_token, channel = %chan_name, "burst names unknown member");
            res = Err(HandlerError::NoSuchUser(numeric_token.to_string()));
            continue;
        };
        let numeric = user.numeric.clone();
        net.add_channel_user(&*ctx.out, &ctx.hooks, &numeric, &chan_name, Some(in_ts));
        if merge != BurstMerge::LocalWon {
            if let Some(member) = net
                .channels
                .get_mut(&key)
                .and_then(|c| c.member_mut(&numeric))
            {
                member.modes.op = op;
                member.modes.voice = voice;
                member.modes.oplevel = oplevel;
            }
        }
    }
    res
}

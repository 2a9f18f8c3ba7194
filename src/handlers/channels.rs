//! Channel membership, mode, and topic commands.

use tracing::error;

use crate::error::{HandlerError, HandlerResult};
use crate::proto::RawMessage;
use crate::state::modes::clear_chanmode;
use crate::state::{MAX_OPLEVEL, ModeChange, Network, ParseFlags};
use crate::util::{irc_to_lower, is_channel_name};

use super::{Context, Origin};

/// Apply an already-propagated wire mode change to the replica.
///
/// The network applied it remotely; we only track it (no announce). Victims
/// are numerics and unknown letters are tolerated, per the server dialect.
fn apply_wire_mode(
    ctx: &Context,
    net: &mut Network,
    actor: Option<&str>,
    key: &str,
    words: &[String],
    notify: bool,
) -> HandlerResult {
    let now = ctx.clock.now();
    let base_oplevel = actor
        .and_then(|numeric| {
            net.channels
                .get(key)
                .and_then(|c| c.member(numeric))
                .and_then(|m| m.modes.oplevel)
        })
        .unwrap_or(MAX_OPLEVEL);
    let change = {
        let net_ref = &*net;
        let chan = net_ref
            .channels
            .get(key)
            .ok_or_else(|| HandlerError::NoSuchChannel(key.to_string()))?;
        let words_ref: Vec<&str> = words.iter().map(String::as_str).collect();
        ModeChange::parse(
            chan,
            &words_ref,
            ParseFlags {
                allow_ovb: true,
                from_server: true,
                ..Default::default()
            },
            base_oplevel,
            &|token| net_ref.user_by_numeric(token).map(|u| u.numeric.clone()),
        )
        .ok_or(HandlerError::BadModeChange)?
    };
    let who_nick = actor
        .and_then(|n| net.users.get(n))
        .map(|u| u.nick.clone());
    if let Some(chan) = net.channels.get_mut(key) {
        change.apply(chan, who_nick.as_deref(), now);
    }
    if notify {
        for hook in &ctx.hooks.mode_change {
            hook(net, &*ctx.out, key, actor, &change);
        }
    }
    Ok(())
}

pub fn cmd_mode(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let target = msg.arg(0).unwrap();
    if !is_channel_name(target) {
        let Some(user) = net.user_by_nick(target) else {
            error!(target, "unable to find user whose mode is changing");
            return Err(HandlerError::NoSuchUser(target.to_string()));
        };
        let numeric = user.numeric.clone();
        let modes = msg.args[1..].join(" ");
        net.apply_usermode(&*ctx.out, &ctx.hooks, &numeric, &modes);
        return Ok(());
    }

    let key = irc_to_lower(target);
    if !net.channels.contains_key(&key) {
        error!(target, "unable to find channel whose mode is changing");
        return Err(HandlerError::NoSuchChannel(target.to_string()));
    }
    let now = ctx.clock.now();
    match origin {
        Origin::User(numeric) => {
            // Mode setters count as active.
            if let Some(member) = net
                .channels
                .get_mut(&key)
                .and_then(|c| c.member_mut(numeric))
            {
                member.idle_since = now;
            }
        }
        _ => {
            // From a server: the attached TS is authoritative; re-sync.
            if let Some(ts) = msg.last().and_then(|s| s.parse::<i64>().ok()) {
                if let Some(chan) = net.channels.get_mut(&key) {
                    chan.timestamp = ts;
                }
            }
        }
    }
    let actor = origin.user_numeric().map(str::to_string);
    apply_wire_mode(
        ctx,
        net,
        actor.as_deref(),
        &key,
        &msg.args[1..],
        actor.is_some(),
    )
}

pub fn cmd_opmode(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let key = irc_to_lower(msg.arg(0).unwrap());
    if !net.channels.contains_key(&key) {
        return Err(HandlerError::NoSuchChannel(key));
    }
    let Some(numeric) = origin.user_numeric() else {
        return Err(HandlerError::Malformed("OPMODE origin must be a user"));
    };
    if !net.users.get(numeric).map(|u| u.modes.oper).unwrap_or(false) {
        error!(numeric, "non-privileged user using OPMODE");
        return Err(HandlerError::Malformed("OPMODE requires privileges"));
    }
    let actor = numeric.to_string();
    // Deliberately no notify: OPMODE overrides are not announced locally.
    apply_wire_mode(ctx, net, Some(&actor), &key, &msg.args[1..], false)
}

pub fn cmd_clearmode(
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let key = irc_to_lower(msg.arg(0).unwrap());
    let Some(numeric) = origin.user_numeric() else {
        return Err(HandlerError::Malformed("CLEARMODE origin must be a user"));
    };
    if !net.users.get(numeric).map(|u| u.modes.oper).unwrap_or(false) {
        error!(numeric, "non-privileged user using CLEARMODE");
        return Err(HandlerError::Malformed("CLEARMODE requires privileges"));
    }
    let Some(chan) = net.channels.get_mut(&key) else {
        return Err(HandlerError::NoSuchChannel(key));
    };
    clear_chanmode(chan, msg.arg(1).unwrap());
    Ok(())
}

fn join_targets(
    ctx: &Context,
    net: &mut Network,
    numeric: &str,
    list: &str,
    when: i64,
) -> HandlerResult {
    for name in list.split(',') {
        if name == "0" {
            // JOIN 0 leaves everything.
            let channels = net
                .users
                .get(numeric)
                .map(|u| u.channels.clone())
                .unwrap_or_default();
            for chan in channels {
                net.del_channel_user(&*ctx.out, &ctx.hooks, numeric, &chan, None, false);
            }
            continue;
        }
        if name.is_empty() {
            continue;
        }
        net.add_channel_user(&*ctx.out, &ctx.hooks, numeric, name, Some(when));
    }
    Ok(())
}

pub fn cmd_create(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let numeric = origin
        .user_numeric()
        .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
        .to_string();
    let when: i64 = msg.arg(1).unwrap_or("0").parse().unwrap_or(0);
    join_targets(ctx, net, &numeric, msg.arg(0).unwrap(), when)
}

pub fn cmd_join(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let numeric = origin
        .user_numeric()
        .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
        .to_string();
    let list = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
    let when: i64 = msg
        .arg(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| ctx.clock.now());
    join_targets(ctx, net, &numeric, &list, when)
}

pub fn cmd_part(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let numeric = origin
        .user_numeric()
        .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
        .to_string();
    let list = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
    let reason = if msg.args.len() > 1 {
        msg.last().map(str::to_string)
    } else {
        None
    };
    for name in list.split(',') {
        if !name.is_empty() {
            net.del_channel_user(
                &*ctx.out,
                &ctx.hooks,
                &numeric,
                name,
                reason.as_deref(),
                false,
            );
        }
    }
    Ok(())
}

pub fn cmd_kick(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let chan = msg.arg(0).unwrap().to_string();
    let victim = net
        .user_by_numeric(msg.arg(1).unwrap())
        .map(|u| u.numeric.clone())
        .ok_or_else(|| HandlerError::NoSuchUser(msg.arg(1).unwrap().to_string()))?;
    let kicker = origin.user_numeric().map(str::to_string);
    net.channel_user_kicked(&*ctx.out, &ctx.hooks, kicker.as_deref(), &victim, &chan);
    Ok(())
}

pub fn cmd_topic(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let chan_name = msg.arg(0).unwrap().to_string();
    let key = irc_to_lower(&chan_name);
    if !net.channels.contains_key(&key) {
        error!(channel = %chan_name, "unable to find channel whose topic is being set");
        return Err(HandlerError::NoSuchChannel(chan_name));
    }
    // Four-plus arguments means a burst-style topic with timestamps.
    let topic_ts: i64 = if msg.args.len() >= 4 {
        msg.arg(2).and_then(|s| s.parse().ok()).unwrap_or(0)
    } else {
        ctx.clock.now()
    };
    let topic = msg.last().unwrap_or("").to_string();
    let who = origin.user_numeric().map(str::to_string);
    net.set_channel_topic(&*ctx.out, &ctx.hooks, &chan_name, who.as_deref(), &topic, false);
    if let Some(chan) = net.channels.get_mut(&key) {
        chan.topic_time = topic_ts;
    }
    Ok(())
}

/// Topic-related numeric replies (331 no topic, 332 text, 333 setter+time).
pub fn cmd_num_topic(net: &mut Network, msg: &RawMessage) -> HandlerResult {
    let chan_name = msg.arg(1).ok_or(HandlerError::NeedMoreParams)?;
    let key = irc_to_lower(chan_name);
    let Some(chan) = net.channels.get_mut(&key) else {
        error!(channel = chan_name, "unable to find channel in topic reply");
        return Err(HandlerError::NoSuchChannel(chan_name.to_string()));
    };
    match msg.command.as_str() {
        "331" => chan.topic_time = 0,
        "332" => {
            chan.topic = msg.last().unwrap_or("").chars().take(crate::state::TOPICLEN).collect();
        }
        "333" => {
            chan.topic_nick = msg.arg(2).unwrap_or("").to_string();
            chan.topic_time = msg.arg(3).and_then(|s| s.parse().ok()).unwrap_or(0);
        }
        _ => return Err(HandlerError::Malformed("unexpected topic numeric")),
    }
    Ok(())
}


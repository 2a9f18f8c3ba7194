//! Message routing to local services and user query replies.

use tracing::error;

use crate::error::{HandlerError, HandlerResult};
use crate::proto::{RawMessage, send};
use crate::state::{ChannelModes, Network};
use crate::util::{irc_to_lower, is_channel_name};

use super::{Context, Origin};

const RPL_AWAY: u32 = 301;
const RPL_WHOISUSER: u32 = 311;
const RPL_WHOISSERVER: u32 = 312;
const RPL_WHOISOPERATOR: u32 = 313;
const RPL_ENDOFWHOIS: u32 = 318;
const RPL_WHOISCHANNELS: u32 = 319;
const RPL_WHOISACCOUNT: u32 = 330;
const RPL_WHOISACTUALLY: u32 = 338;
const RPL_STATSUPTIME: u32 = 242;
const RPL_STATSCONN: u32 = 250;
const RPL_ENDOFSTATS: u32 = 219;
const RPL_VERSION: u32 = 351;
const ERR_NOSUCHNICK: u32 = 401;
const ERR_NOADMININFO: u32 = 423;

fn reply(ctx: &Context, net: &Network, to_nick: &str, num: u32, text: &str) {
    ctx.out
        .send_line(send::numeric_reply(net.self_name(), num, to_nick, text));
}

/// PRIVMSG/NOTICE: update idle state for channel targets and deliver user
/// targets addressed at our local services.
pub fn cmd_privmsg(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
    is_notice: bool,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let Some(from) = origin.user_numeric() else {
        return Ok(());
    };
    let from = from.to_string();
    let text = msg.last().unwrap_or("").to_string();
    let now = ctx.clock.now();

    for target in msg.arg(0).unwrap_or("").to_string().split(',') {
        if is_channel_name(target) || target == "0" {
            // The channel may be -n, so an absent membership is fine.
            if let Some(member) = net
                .channels
                .get_mut(&irc_to_lower(target))
                .and_then(|c| c.member_mut(&from))
            {
                member.idle_since = now;
            }
            continue;
        }

        let mut qualified = false;
        let resolved = if target.starts_with('@') {
            None
        } else if let Some((nick, server_name)) = target.split_once('@') {
            // user@server form: the pair must agree, or we must not index
            // into another server's tables with this numeric.
            qualified = true;
            match (net.user_by_nick(nick), net.server_by_name(server_name)) {
                (Some(user), Some(server)) if user.uplink == server.numeric => {
                    Some(user.numeric.clone())
                }
                _ => None,
            }
        } else {
            net.user_by_numeric(target).map(|u| u.numeric.clone())
        };

        match resolved {
            Some(to) => {
                let (local, num_local) = match net.users.get(&to) {
                    Some(user) => (user.uplink == net.self_prefix, user.num_local),
                    None => continue,
                };
                if !local {
                    continue;
                }
                let handler = if is_notice {
                    ctx.hooks.notice_handler(num_local)
                } else {
                    ctx.hooks.privmsg_handler(num_local)
                };
                if let Some(handler) = handler {
                    handler(net, &*ctx.out, &from, &to, &text, qualified);
                }
            }
            None => {
                if !target.starts_with('$') {
                    let sender = match net.users.get(&from) {
                        Some(user) => user.nick.clone(),
                        None => continue,
                    };
                    let text = format!("{}@{} :No such nick", target, net.self_name());
                    reply(ctx, net, &sender, ERR_NOSUCHNICK, &text);
                }
            }
        }
    }
    Ok(())
}

pub fn cmd_whois(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let Some(from) = origin.user_numeric().and_then(|n| net.users.get(n)) else {
        error!("could not find WHOIS origin user");
        return Err(HandlerError::UnknownOrigin(format!("{:?}", origin)));
    };
    let from_nick = from.nick.clone();
    let from_oper = from.modes.oper;
    let from_numeric = from.numeric.clone();
    let asked = msg.arg(1).unwrap();

    let Some(who) = net.user_by_nick(asked) else {
        let text = format!("{}@{} :No such nick", asked, net.self_name());
        reply(ctx, net, &from_nick, ERR_NOSUCHNICK, &text);
        return Ok(());
    };

    let shown_host = match (&who.fakehost, who.modes.hidden_host) {
        (Some(fake), true) => fake.clone(),
        (None, true) => match (&who.account, &ctx.hidden_host_suffix) {
            (Some(account), Some(suffix)) => format!("{}.{}", account, suffix),
            _ => who.hostname.clone(),
        },
        _ => who.hostname.clone(),
    };
    reply(
        ctx,
        net,
        &from_nick,
        RPL_WHOISUSER,
        &format!("{} {} {} * :{}", who.nick, who.ident, shown_host, who.info),
    );

    let is_self_query = who.numeric == from_numeric;
    if (!who.modes.service && !who.modes.no_chan) || is_self_query {
        let mut buf = String::new();
        let who_nick = who.nick.clone();
        let who_deaf = who.modes.deaf;
        let memberships: Vec<(String, bool, bool, bool)> = who
            .channels
            .iter()
            .filter_map(|key| {
                let chan = net.channels.get(key)?;
                let hidden = chan
                    .modes
                    .intersects(ChannelModes::PRIVATE.union(ChannelModes::SECRET));
                let from_on = chan.member(&from_numeric).is_some();
                let member = chan.member(who.numeric.as_str())?;
                Some((chan.name.clone(), hidden && !from_on, member.modes.op, member.modes.voice))
            })
            .collect();
        for (name, hidden, op, voice) in memberships {
            if hidden && !from_oper {
                continue;
            }
            if buf.len() + name.len() > 400 {
                reply(
                    ctx,
                    net,
                    &from_nick,
                    RPL_WHOISCHANNELS,
                    &format!("{} :{}", who_nick, buf.trim_end()),
                );
                buf.clear();
            }
            if who_deaf {
                buf.push('-');
            }
            if hidden {
                buf.push('*');
            }
            if op {
                buf.push('@');
            } else if voice {
                buf.push('+');
            }
            buf.push_str(&name);
            buf.push(' ');
        }
        if !buf.is_empty() {
            reply(
                ctx,
                net,
                &from_nick,
                RPL_WHOISCHANNELS,
                &format!("{} :{}", who_nick, buf.trim_end()),
            );
        }
    }

    let who = net.user_by_nick(asked).expect("still present");
    let masked = net.his_servername.is_some()
        && net.his_servercomment.is_some()
        && !from_oper
        && !is_self_query;
    let (server_line_name, server_line_desc) = if masked {
        (
            net.his_servername.clone().unwrap_or_default(),
            net.his_servercomment.clone().unwrap_or_default(),
        )
    } else {
        match net.servers.get(&who.uplink) {
            Some(srv) => (srv.name.clone(), srv.description.clone()),
            None => (net.self_name().to_string(), String::new()),
        }
    };
    reply(
        ctx,
        net,
        &from_nick,
        RPL_WHOISSERVER,
        &format!("{} {} :{}", who.nick, server_line_name, server_line_desc),
    );

    let who = net.user_by_nick(asked).expect("still present");
    if who.modes.away {
        reply(ctx, net, &from_nick, RPL_AWAY, &format!("{} :Away", who.nick));
    }
    if who.modes.oper {
        let text = if net.is_local(who) {
            format!("{} :is a megalomaniacal power hungry tyrant", who.nick)
        } else {
            format!("{} :is an IRC Operator", who.nick)
        };
        reply(ctx, net, &from_nick, RPL_WHOISOPERATOR, &text);
    }
    if let Some(account) = &who.account {
        let text = format!("{} {} :is logged in as", who.nick, account);
        reply(ctx, net, &from_nick, RPL_WHOISACCOUNT, &text);
    }
    if who.modes.hidden_host && who.account.is_some() && (from_oper || is_self_query) {
        let text = format!(
            "{} {}@{} {} :Actual user@host, Actual IP",
            who.nick, who.ident, who.hostname, who.ip
        );
        reply(ctx, net, &from_nick, RPL_WHOISACTUALLY, &text);
    }
    let end = format!("{} :End of /WHOIS list", who.nick);
    reply(ctx, net, &from_nick, RPL_ENDOFWHOIS, &end);
    Ok(())
}

pub fn cmd_stats(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let kind = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
    let Some(from) = origin.user_numeric().and_then(|n| net.users.get(n)) else {
        return Err(HandlerError::UnknownOrigin(format!("{:?}", origin)));
    };
    let nick = from.nick.clone();
    if kind.starts_with('u') {
        let uptime = ctx.clock.now() - net.self_server().boot;
        reply(
            ctx,
            net,
            &nick,
            RPL_STATSUPTIME,
            &format!(
                ":Server Up {} days {}:{:02}:{:02}",
                uptime / 86_400,
                (uptime / 3600) % 24,
                (uptime / 60) % 60,
                uptime % 60
            ),
        );
        reply(
            ctx,
            net,
            &nick,
            RPL_STATSCONN,
            &format!(
                ":Highest connection count: {} ({} clients)",
                net.max_clients + 1,
                net.max_clients
            ),
        );
    }
    reply(
        ctx,
        net,
        &nick,
        RPL_ENDOFSTATS,
        &format!("{} :End of /STATS report", kind),
    );
    Ok(())
}

pub fn cmd_version(ctx: &Context, net: &mut Network, origin: &Origin) -> HandlerResult {
    let Some(from) = origin.user_numeric().and_then(|n| net.users.get(n)) else {
        error!("could not find VERSION origin user");
        return Err(HandlerError::UnknownOrigin(format!("{:?}", origin)));
    };
    let nick = from.nick.clone();
    reply(
        ctx,
        net,
        &nick,
        RPL_VERSION,
        &format!(
            "{}.{} {} :Straylight",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            net.self_name()
        ),
    );
    Ok(())
}

pub fn cmd_admin(ctx: &Context, net: &mut Network, origin: &Origin) -> HandlerResult {
    let Some(from) = origin.user_numeric().and_then(|n| net.users.get(n)) else {
        error!("could not find ADMIN origin user");
        return Err(HandlerError::UnknownOrigin(format!("{:?}", origin)));
    };
    let nick = from.nick.clone();
    if ctx.admin_info.is_empty() {
        reply(ctx, net, &nick, ERR_NOADMININFO, ":No administrative info available");
        return Ok(());
    }
    reply(
        ctx,
        net,
        &nick,
        256,
        &format!(":Administrative info about {}", net.self_name()),
    );
    for (idx, line) in ctx.admin_info.iter().take(3).enumerate() {
        reply(ctx, net, &nick, 257 + idx as u32, &format!(":{}", line));
    }
    Ok(())
}

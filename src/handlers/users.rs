//! User lifecycle commands.

use tracing::{error, warn};

use crate::error::{HandlerError, HandlerResult};
use crate::numeric::base64_to_ip;
use crate::proto::RawMessage;
use crate::state::Network;

use super::{Context, Origin, link};

pub fn cmd_nick(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if let Some(numeric) = origin.user_numeric() {
        // Origin is a user: this is a nick change.
        let new_nick = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
        net.nick_change(&*ctx.out, &ctx.hooks, numeric, new_nick, false);
        return Ok(());
    }

    // Otherwise a server is introducing a new user:
    // <nick> <hops> <ts> <ident> <host> [+modes [args...]] <b64ip> <numeric> :<info>
    if msg.args.len() < 8 {
        return Err(HandlerError::NeedMoreParams);
    }
    let server_prefix = origin
        .server_prefix()
        .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
        .to_string();
    let argc = msg.args.len();
    let modes = if argc > 8 {
        msg.args[5..argc - 3].join(" ")
    } else {
        "+".to_string()
    };
    let nick = msg.arg(0).unwrap();
    let timestamp: i64 = msg.arg(2).unwrap_or("0").parse().unwrap_or(0);
    let ip = base64_to_ip(msg.arg(argc - 3).unwrap_or("AAAAAA"));
    net.add_user(
        &*ctx.out,
        &ctx.hooks,
        &server_prefix,
        nick,
        msg.arg(3).unwrap(),
        msg.arg(4).unwrap(),
        &modes,
        msg.arg(argc - 2).unwrap(),
        msg.arg(argc - 1).unwrap(),
        timestamp,
        ip,
    )
    .map(|_| ())
    .ok_or(HandlerError::Malformed("user introduction rejected"))
}

pub fn cmd_quit(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let reason = msg.last().ok_or(HandlerError::NeedMoreParams)?.to_string();
    // A KILL can beat the QUIT here; only act when we still know the user.
    if let Some(numeric) = origin.user_numeric() {
        let numeric = numeric.to_string();
        net.del_user(&*ctx.out, &ctx.hooks, &numeric, None, false, &reason);
    }
    Ok(())
}

pub fn cmd_kill(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let target = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?.to_string();
    let reason = msg.last().unwrap_or("").to_string();
    let Some(user) = net.user_by_numeric(&target) else {
        // Could be the ghost reply to a kill we sent; only whine when the
        // victim should have been ours.
        if target.starts_with(net.self_prefix.as_str()) {
            error!(target = %target, "unable to find kill victim");
            return Err(HandlerError::NoSuchUser(target));
        }
        return Ok(());
    };
    let numeric = user.numeric.clone();
    if net.is_local(user) && user.modes.service {
        net.reintroduce_user(&*ctx.out, &numeric);
        return Ok(());
    }
    let killer = origin.user_numeric().map(str::to_string);
    net.del_user(
        &*ctx.out,
        &ctx.hooks,
        &numeric,
        killer.as_deref(),
        false,
        &reason,
    );
    Ok(())
}

pub fn cmd_account(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if origin.server_prefix().is_none() {
        return Err(HandlerError::Malformed("ACCOUNT origin must be a server"));
    }
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let stamp = msg.arg(1).unwrap().to_string();
    // A QUIT probably passed the ACCOUNT; nothing to do then.
    let Some(user) = net.user_by_numeric(msg.arg(0).unwrap()) else {
        return Ok(());
    };
    let numeric = user.numeric.clone();
    net.call_account(&*ctx.out, &ctx.hooks, &numeric, &stamp);
    Ok(())
}

pub fn cmd_fakehost(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if origin.server_prefix().is_none() {
        return Err(HandlerError::Malformed("FAKE origin must be a server"));
    }
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let host = msg.arg(1).unwrap().to_string();
    let Some(user) = net.user_by_numeric(msg.arg(0).unwrap()) else {
        return Ok(());
    };
    let numeric = user.numeric.clone();
    net.assign_fakehost(&*ctx.out, &numeric, &host, false);
    Ok(())
}

pub fn cmd_svsnick(ctx: &Context, net: &mut Network, msg: &RawMessage) -> HandlerResult {
    if msg.args.len() < 3 {
        return Err(HandlerError::NeedMoreParams);
    }
    let new_nick = msg.arg(1).unwrap().to_string();
    let target = msg.arg(0).unwrap();
    let Some(user) = net.user_by_numeric(target) else {
        return Err(HandlerError::NoSuchUser(target.to_string()));
    };
    if !net.is_local(user) || net.user_by_nick(&new_nick).is_some() {
        return Err(HandlerError::Malformed("SVSNICK target unusable"));
    }
    let numeric = user.numeric.clone();
    net.nick_change(&*ctx.out, &ctx.hooks, &numeric, &new_nick, true);
    Ok(())
}

pub fn cmd_away(net: &mut Network, origin: &Origin, msg: &RawMessage) -> HandlerResult {
    let Some(numeric) = origin.user_numeric() else {
        return Ok(());
    };
    if let Some(user) = net.users.get_mut(numeric) {
        user.modes.away = !msg.args.is_empty();
    }
    Ok(())
}

pub fn cmd_gline(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    let mask_arg = msg.arg(1).unwrap();
    let now = ctx.clock.now();
    let issuer = origin_display(net, origin);
    if let Some(mask) = mask_arg.strip_prefix('+') {
        if msg.args.len() < 4 {
            return Err(HandlerError::NeedMoreParams);
        }
        let duration: i64 = msg.arg(2).unwrap_or("0").parse().unwrap_or(0);
        let lastmod: i64 = if msg.args.len() > 4 {
            msg.arg(3).unwrap_or("0").parse().unwrap_or(0)
        } else {
            0
        };
        let reason = msg.last().unwrap_or("");
        ctx.glines.lock().add(
            &*ctx.out,
            &net.self_prefix,
            &issuer,
            mask,
            duration,
            reason,
            now,
            lastmod,
            false,
            now,
        );
        Ok(())
    } else if let Some(mask) = mask_arg.strip_prefix('-') {
        ctx.glines.lock().remove(&*ctx.out, &net.self_prefix, mask, false);
        Ok(())
    } else {
        Err(HandlerError::Malformed("GLINE mask must begin with + or -"))
    }
}

/// "Stats G" reply line: an existing gline relayed as numeric 247.
pub fn cmd_num_gline(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 5 {
        return Err(HandlerError::NeedMoreParams);
    }
    let now = ctx.clock.now();
    let mask = msg.arg(2).unwrap();
    let expires: i64 = msg.arg(3).unwrap_or("0").parse().unwrap_or(0);
    let lastmod: i64 = if msg.args.len() > 5 {
        msg.arg(4).unwrap_or("0").parse().unwrap_or(0)
    } else {
        0
    };
    let reason = msg.last().unwrap_or("");
    let issuer = origin_display(net, origin);
    ctx.glines.lock().add(
        &*ctx.out,
        &net.self_prefix,
        &issuer,
        mask,
        expires - now,
        reason,
        now,
        lastmod,
        false,
        now,
    );
    Ok(())
}

/// Numeric 432: the ircd rejected a nick we introduced. Fall back to the
/// original IRC nick length and relink.
pub fn cmd_error_nick(ctx: &Context, net: &mut Network) -> HandlerResult {
    warn!("got erroneous nickname, truncating nicks");
    net.nicklen = 9;
    let locals: Vec<(String, String)> = net
        .self_server()
        .users
        .iter()
        .flatten()
        .filter_map(|numeric| {
            net.users
                .get(numeric)
                .filter(|u| u.nick.len() > 9)
                .map(|u| (numeric.clone(), u.nick.chars().take(9).collect()))
        })
        .collect();
    for (numeric, new_nick) in locals {
        net.nick_change(&*ctx.out, &ctx.hooks, &numeric, &new_nick, false);
    }
    link::squit_self_for(ctx, net, "Got erroneous nickname, truncating nicks.");
    Ok(())
}

fn origin_display(net: &Network, origin: &Origin) -> String {
    match origin {
        Origin::Server(prefix) => net
            .servers
            .get(prefix)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| prefix.clone()),
        Origin::User(numeric) => net
            .users
            .get(numeric)
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| numeric.clone()),
        Origin::Unknown(token) => token.clone(),
        Origin::None => "<unknown>".to_string(),
    }
}

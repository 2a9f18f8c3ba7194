//! Link-level commands: handshake, keepalive, server topology.

use tracing::{error, info, warn};

use crate::error::{HandlerError, HandlerResult};
use crate::proto::{RawMessage, send};
use crate::state::{Network, PREHISTORY};
use crate::uplink::LinkState;

use super::{Context, Origin, burst};

/// Start the handshake on a fresh connection: PASS, then our SERVER line.
pub fn introduce(ctx: &Context, password: &str) {
    let mut net = ctx.net.write();
    let prefix = net.self_prefix.clone();
    let now = ctx.clock.now();
    if let Some(srv) = net.servers.get_mut(&prefix) {
        srv.self_burst = true;
        srv.burst = true;
        srv.link = now;
    }
    ctx.out.send_line(send::pass(password));
    let srv = net.self_server();
    ctx.out.send_line(send::server_intro(&prefix, srv, true));
}

pub fn send_ping(ctx: &Context) {
    let net = ctx.net.read();
    ctx.out
        .send_line(send::ping(&net.self_prefix, net.self_name()));
}

/// Leave the network: quit our clients, announce the SQUIT, drop the
/// socket. The connection manager reconnects afterwards.
pub fn squit_self(ctx: &Context, message: &str) {
    let mut net = ctx.net.write();
    squit_self_for(ctx, &mut net, message);
}

pub(super) fn squit_self_for(ctx: &Context, net: &mut Network, message: &str) {
    if ctx.uplink.state() == LinkState::Connected {
        let locals: Vec<String> = net
            .self_server()
            .users
            .iter()
            .flatten()
            .cloned()
            .collect();
        for numeric in locals {
            if net.users.get(&numeric).map(|u| u.dummy) == Some(false) {
                ctx.out.send_line(send::quit(&numeric, message));
            }
        }
    }
    let name = net.self_name().to_string();
    ctx.out
        .send_line(send::squit(&net.self_prefix, &name, message));
    info!(reason = message, "squitting from uplink");
    ctx.uplink.reset_tries();
    ctx.uplink.set_state(LinkState::Disconnected);
    ctx.uplink.close();
}

pub fn cmd_pass(ctx: &Context, net: &mut Network, msg: &RawMessage) -> HandlerResult {
    let supplied = msg.arg(0).ok_or(HandlerError::NeedMoreParams)?;
    if let Some(expected) = &ctx.their_password {
        if expected != supplied {
            squit_self_for(ctx, net, "Incorrect password received.");
            return Ok(());
        }
    }
    ctx.uplink.set_state(LinkState::Bursting);
    Ok(())
}

pub fn cmd_server(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    if msg.args.len() < 7 {
        return Err(HandlerError::NeedMoreParams);
    }
    let name = msg.arg(0).unwrap();
    let hops: u32 = msg.arg(1).unwrap_or("0").parse().unwrap_or(0);
    let boot: i64 = msg.arg(2).unwrap_or("0").parse().unwrap_or(0);
    let link: i64 = msg.arg(3).unwrap_or("0").parse().unwrap_or(0);
    let burst_marker = msg.arg(4).unwrap_or("");
    let numeric = msg.arg(5).unwrap_or("");
    let description = msg.last().unwrap_or("");
    let self_bursting = burst_marker.starts_with('J');

    let prefix = if net.uplink_prefix.is_some() {
        // Another server introduced by a peer.
        let parent = origin
            .server_prefix()
            .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
            .to_string();
        net.add_server(
            &*ctx.out,
            &ctx.hooks,
            Some(&parent),
            name,
            hops,
            boot,
            link,
            numeric,
            description,
        )
        .ok_or(HandlerError::Malformed("bad server numeric"))?
    } else {
        // This must be our uplink.
        let self_prefix = net.self_prefix.clone();
        let prefix = net
            .add_server(
                &*ctx.out,
                &ctx.hooks,
                Some(&self_prefix),
                name,
                hops,
                boot,
                link,
                numeric,
                description,
            )
            .ok_or(HandlerError::Malformed("bad server numeric"))?;
        net.uplink_prefix = Some(prefix.clone());
        burst::send_burst(ctx, net);
        ctx.burst_begin
            .store(ctx.clock.now(), std::sync::atomic::Ordering::Relaxed);
        prefix
    };

    if let Some(srv) = net.servers.get_mut(&prefix) {
        srv.self_burst = self_bursting;
        srv.burst = true;
    }

    // Clock fixups: ignore obviously-prehistoric claims, otherwise adopt an
    // older uplink's time unless configured to trust our own clock.
    if boot <= PREHISTORY {
        if hops == 1 {
            error!(server = name, boot, "server claims to have booted in the mists of time");
        }
    } else if !ctx.reliable_clock {
        let self_boot = net.self_server().boot;
        if boot <= self_boot {
            let self_prefix = net.self_prefix.clone();
            if let Some(me) = net.servers.get_mut(&self_prefix) {
                me.boot = boot;
            }
            ctx.clock.set_time(link);
        }
    }
    Ok(())
}

pub fn cmd_ping(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    let self_name = net.self_name().to_string();
    let who = match origin {
        Origin::Server(prefix) => prefix.clone(),
        Origin::User(numeric) => numeric.clone(),
        Origin::Unknown(token) => token.clone(),
        Origin::None => msg.arg(0).unwrap_or("*").to_string(),
    };
    ctx.out
        .send_line(send::pong(&net.self_prefix, &self_name, &who));
    ctx.uplink.mark_ping_activity();
    Ok(())
}

pub fn cmd_pong(ctx: &Context, net: &mut Network, msg: &RawMessage) -> HandlerResult {
    if msg.args.len() < 2 {
        return Err(HandlerError::NeedMoreParams);
    }
    if msg.arg(1) == Some(net.self_name()) || msg.arg(0) == Some(net.self_name()) {
        ctx.uplink.mark_ping_activity();
    }
    Ok(())
}

pub fn cmd_eob(ctx: &Context, net: &mut Network, origin: &Origin) -> HandlerResult {
    let sender = origin
        .server_prefix()
        .ok_or_else(|| HandlerError::UnknownOrigin(format!("{:?}", origin)))?
        .to_string();

    if net.uplink_prefix.as_deref() == Some(sender.as_str()) {
        ctx.uplink.set_state(LinkState::Connected);
        // Anything we did not burst yet goes out now, then the marker.
        let pending: Vec<String> = ctx
            .unbursted
            .lock()
            .take()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for key in pending {
            burst::burst_channel(ctx, net, &key);
        }
        let prefix = net.self_prefix.clone();
        ctx.out.send_line(send::eob(&prefix));
        ctx.out.send_line(send::eob_ack(&prefix));
    }

    if let Some(srv) = net.servers.get_mut(&sender) {
        srv.self_burst = false;
    }
    net.recalc_bursts(&sender);
    for hook in &ctx.hooks.server_link {
        hook(net, &*ctx.out, &sender);
    }
    Ok(())
}

pub fn cmd_eob_ack(ctx: &Context, net: &mut Network, origin: &Origin) -> HandlerResult {
    if origin.server_prefix() == net.uplink_prefix.as_deref() {
        let begin = ctx.burst_begin.load(std::sync::atomic::Ordering::Relaxed);
        ctx.burst_length.store(
            ctx.clock.now() - begin,
            std::sync::atomic::Ordering::Relaxed,
        );
        let prefix = net.self_prefix.clone();
        if let Some(me) = net.servers.get_mut(&prefix) {
            me.self_burst = false;
            me.burst = false;
        }
    }
    ctx.uplink.set_state(LinkState::Connected);
    Ok(())
}

pub fn cmd_error(ctx: &Context, msg: &RawMessage) -> HandlerResult {
    error!(message = msg.last().unwrap_or(""), "error from ircd, squitting");
    if ctx.uplink.state() != LinkState::Connected {
        // Pre-link errors mean a configuration problem; stop retrying.
        error!("disabling uplink");
        ctx.uplink.mark_unavailable();
    }
    ctx.uplink.set_state(LinkState::Disconnected);
    ctx.uplink.close();
    Ok(())
}

pub fn cmd_squit(ctx: &Context, net: &mut Network, msg: &RawMessage) -> HandlerResult {
    if msg.args.len() < 3 {
        return Err(HandlerError::NeedMoreParams);
    }
    let name = msg.arg(0).unwrap();
    let reason = msg.last().unwrap_or("");
    let Some(server) = net.server_by_name(name) else {
        return Err(HandlerError::NoSuchServer(name.to_string()));
    };
    let prefix = server.numeric.clone();

    if net.uplink_prefix.as_deref() == Some(prefix.as_str()) {
        // Losing our own uplink: force a prompt reconnect.
        warn!(reason, "squit for our uplink, reconnecting");
        ctx.uplink.reset_tries();
        ctx.uplink.set_state(LinkState::Disconnected);
        ctx.uplink.close();
        return Ok(());
    }

    net.del_server(&*ctx.out, &ctx.hooks, &prefix, false, Some(reason));
    Ok(())
}

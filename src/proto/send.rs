//! Outbound line formatting.
//!
//! One function per wire message, mirroring the parse table. Every function
//! returns a complete line (no terminator); the connection layer owns
//! framing and queueing.

use crate::numeric::{int_to_base64, ip_to_base64};
use crate::state::{Server, User};

/// `SERVER`/`S` introduction. `self_intro` selects the handshake form (no
/// origin, long command, `J10` marker).
pub fn server_intro(self_numeric: &str, srv: &Server, self_intro: bool) -> String {
    let extra_digits = if srv.numeric.len() > 1 || srv.num_mask >= 64 * 64 {
        3
    } else {
        2
    };
    let extranum = int_to_base64(srv.num_mask, extra_digits);
    if self_intro {
        // The +s6 flags mark us as a service that understands numerics.
        format!(
            "SERVER {} {} {} {} J10 {}{} +s6 :{}",
            srv.name,
            srv.hops + 1,
            srv.boot,
            srv.link,
            srv.numeric,
            extranum,
            srv.description
        )
    } else {
        format!(
            "{} S {} {} {} {} {}10 {}{} +s6 :{}",
            self_numeric,
            srv.name,
            srv.hops + 1,
            srv.boot,
            srv.link,
            if srv.self_burst { 'J' } else { 'P' },
            srv.numeric,
            extranum,
            srv.description
        )
    }
}

/// `NICK`/`N` user introduction from the owning server.
pub fn user_intro(server: &Server, user: &User) -> String {
    let b64ip = ip_to_base64(&user.ip);
    if user.modes.any() {
        format!(
            "{} N {} {} {} {} {} {} {} {} :{}",
            server.numeric,
            user.nick,
            server.hops + 1,
            user.timestamp,
            user.ident,
            user.hostname,
            user.modes.to_wire(),
            b64ip,
            user.numeric,
            user.info
        )
    } else {
        format!(
            "{} N {} {} {} {} {} {} {} :{}",
            server.numeric,
            user.nick,
            server.hops + 1,
            user.timestamp,
            user.ident,
            user.hostname,
            b64ip,
            user.numeric,
            user.info
        )
    }
}

pub fn nick_change(user_numeric: &str, new_nick: &str, now: i64) -> String {
    format!("{} N {} {}", user_numeric, new_nick, now)
}

pub fn quit(user_numeric: &str, message: &str) -> String {
    format!("{} Q :{}", user_numeric, message)
}

/// `KILL`/`D`. `from` is `(numeric, nick)` of the killing user when one
/// exists; otherwise the kill is attributed to the server.
pub fn kill(
    self_numeric: &str,
    self_name: &str,
    from: Option<(&str, &str)>,
    target_numeric: &str,
    message: &str,
) -> String {
    match from {
        Some((from_numeric, from_nick)) => format!(
            "{} D {} :{}!{} ({})",
            from_numeric, target_numeric, self_name, from_nick, message
        ),
        None => format!(
            "{} D {} :{} ({})",
            self_numeric, target_numeric, self_name, message
        ),
    }
}

pub fn squit(self_numeric: &str, server_name: &str, message: &str) -> String {
    format!("{} SQ {} 0 :{}", self_numeric, server_name, message)
}

#[allow(dead_code)] // Service-module send API.
pub fn join(user_numeric: &str, channel: &str, timestamp: i64) -> String {
    format!("{} J {} {}", user_numeric, channel, timestamp)
}

#[allow(dead_code)] // Service-module send API.
pub fn create(user_numeric: &str, channel: &str, timestamp: i64) -> String {
    format!("{} C {} {}", user_numeric, channel, timestamp)
}

pub fn part(user_numeric: &str, channel: &str, reason: Option<&str>) -> String {
    match reason {
        Some(text) => format!("{} L {} :{}", user_numeric, channel, text),
        None => format!("{} L {}", user_numeric, channel),
    }
}

pub fn kick(origin_numeric: &str, channel: &str, target_numeric: &str, message: &str) -> String {
    format!("{} K {} {} :{}", origin_numeric, channel, target_numeric, message)
}

pub fn topic(user_numeric: &str, channel: &str, text: &str) -> String {
    format!("{} T {} :{}", user_numeric, channel, text)
}

#[allow(dead_code)] // Service-module send API.
pub fn fetch_topic(user_numeric: &str, channel: &str) -> String {
    format!("{} T {}", user_numeric, channel)
}

#[allow(dead_code)] // Service-module send API.
pub fn privmsg(from_numeric: &str, target: &str, message: &str) -> String {
    format!("{} P {} :{}", from_numeric, target, message)
}

#[allow(dead_code)] // Service-module send API.
pub fn notice(from_numeric: &str, target: &str, message: &str) -> String {
    format!("{} O {} :{}", from_numeric, target, message)
}

pub fn pass(password: &str) -> String {
    format!("PASS :{}", password)
}

pub fn ping(self_numeric: &str, payload: &str) -> String {
    format!("{} G :{}", self_numeric, payload)
}

pub fn pong(self_numeric: &str, who: &str, payload: &str) -> String {
    format!("{} Z {} :{}", self_numeric, who, payload)
}

pub fn eob(self_numeric: &str) -> String {
    format!("{} EB", self_numeric)
}

pub fn eob_ack(self_numeric: &str) -> String {
    format!("{} EA", self_numeric)
}

pub fn account(self_numeric: &str, user_numeric: &str, stamp: &str) -> String {
    format!("{} AC {} {}", self_numeric, user_numeric, stamp)
}

pub fn fakehost(self_numeric: &str, user_numeric: &str, host: &str) -> String {
    format!("{} FA {} {}", self_numeric, user_numeric, host)
}

#[allow(dead_code)] // Service-module send API.
pub fn svsnick(server_numeric: &str, target_numeric: &str, new_nick: &str, now: i64) -> String {
    format!("{} SN {} {} {}", server_numeric, target_numeric, new_nick, now)
}

/// `GLINE` add with remaining lifetime. `lastmod` of zero selects the short
/// (four argument) form.
pub fn gline_add(
    self_numeric: &str,
    target_server: Option<&str>,
    mask: &str,
    remaining: i64,
    lastmod: i64,
    reason: &str,
) -> String {
    let target = target_server.unwrap_or("*");
    if lastmod != 0 {
        format!(
            "{} GL {} +{} {} {} :{}",
            self_numeric, target, mask, remaining, lastmod, reason
        )
    } else {
        format!(
            "{} GL {} +{} {} :{}",
            self_numeric, target, mask, remaining, reason
        )
    }
}

pub fn gline_remove(self_numeric: &str, mask: &str) -> String {
    format!("{} GL * -{}", self_numeric, mask)
}

/// RFC1459-numbered reply, addressed by nick from our server name.
pub fn numeric_reply(self_name: &str, num: u32, nick: &str, text: &str) -> String {
    format!(":{} {:03} {} {}", self_name, num, nick, text)
}

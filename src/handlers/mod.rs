//! Inbound command dispatch.
//!
//! One parsed line is handled to completion under a single state lock, so
//! every handler (and every hook it triggers) sees per-line atomicity. Users
//! killed mid-line stay parked on the dead-user list until the top-level
//! dispatch returns; recursive dispatch must not drain it.

mod burst;
mod channels;
mod link;
mod messages;
#[cfg(test)]
mod tests;
mod users;

pub use burst::send_burst;
pub use link::{introduce, send_ping, squit_self};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::clock::Clock;
use crate::error::{HandlerError, HandlerResult};
use crate::glines::GlineStore;
use crate::hooks::Hooks;
use crate::proto::{Command, RawMessage, parse_message};
use crate::state::Network;
use crate::uplink::Uplink;

/// Everything a handler can reach.
pub struct Context {
    pub net: Arc<RwLock<Network>>,
    pub hooks: Arc<Hooks>,
    pub glines: Arc<Mutex<GlineStore>>,
    /// Where handler output goes; the uplink in production, a capture in
    /// tests.
    pub out: Arc<dyn crate::uplink::Outbox>,
    pub uplink: Arc<Uplink>,
    pub clock: Clock,
    /// Password we require from the peer, when set.
    pub their_password: Option<String>,
    /// Keep our own clock rather than adopting the uplink's.
    pub reliable_clock: bool,
    /// Lines for the ADMIN reply.
    pub admin_info: Vec<String>,
    /// Suffix for account-based hidden hosts in WHOIS.
    pub hidden_host_suffix: Option<String>,
    /// Channels we have not yet sent in our own burst.
    pub unbursted: Mutex<Option<HashSet<String>>>,
    pub burst_begin: AtomicI64,
    pub burst_length: AtomicI64,
}

/// Resolved origin of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    None,
    /// Server numeric prefix.
    Server(String),
    /// Combined user numeric.
    User(String),
    /// Token that resolved to nothing (stale or pre-burst).
    Unknown(String),
}

impl Origin {
    pub fn user_numeric(&self) -> Option<&str> {
        match self {
            Origin::User(numeric) => Some(numeric),
            _ => None,
        }
    }

    pub fn server_prefix(&self) -> Option<&str> {
        match self {
            Origin::Server(prefix) => Some(prefix),
            _ => None,
        }
    }
}

fn resolve_origin(net: &Network, raw: Option<&str>, was_prefixed: bool) -> Origin {
    let Some(token) = raw else {
        return Origin::None;
    };
    if was_prefixed {
        // Handshake-phase full name: a server or one of our nicks.
        if let Some(srv) = net.server_by_name(token) {
            return Origin::Server(srv.numeric.clone());
        }
        if let Some(user) = net.user_by_nick(token) {
            return Origin::User(user.numeric.clone());
        }
        return Origin::Unknown(token.to_string());
    }
    if token.len() <= 2 {
        match net.server_by_token(token) {
            Some(srv) => Origin::Server(srv.numeric.clone()),
            None => Origin::Unknown(token.to_string()),
        }
    } else {
        match net.user_by_numeric(token) {
            Some(user) => Origin::User(user.numeric.clone()),
            None => Origin::Unknown(token.to_string()),
        }
    }
}

/// Parse and dispatch one inbound line.
pub fn parse_line(ctx: &Context, line: &str, recursive: bool) {
    let mut net = ctx.net.write();
    if let Err(err) = dispatch(ctx, &mut net, line) {
        error!(error_code = err.error_code(), line = %line, "PARSE ERROR on line");
    }
    if !recursive {
        net.drain_dead();
    }
}

fn dispatch(ctx: &Context, net: &mut Network, line: &str) -> HandlerResult {
    let linked = net.uplink_prefix.is_some();
    let was_prefixed = line.starts_with(':');
    let msg = match parse_message(line, linked) {
        Ok(msg) => msg,
        Err(_) => return Err(HandlerError::Malformed("tokenizer")),
    };
    let origin = resolve_origin(net, msg.origin.as_deref(), was_prefixed);

    // Topic/gline numerics and the erroneous-nick recovery arrive as
    // three-digit reply codes, outside the command table.
    if msg.command.len() == 3 && msg.command.chars().all(|c| c.is_ascii_digit()) {
        return dispatch_numeric(ctx, net, &origin, &msg);
    }

    let Some(command) = Command::lookup(&msg.command) else {
        // A handful of commands are deliberately ignored rather than
        // unknown: desyncs, wallops chatter, SETTIME, SILENCE.
        if matches!(
            msg.command.as_str(),
            "DESTRUCT" | "DE" | "DESYNCH" | "DS" | "WALLCHOPS" | "WC" | "WALLVOICES" | "WV"
                | "WALLOPS" | "WA" | "WALLUSERS" | "WU" | "SETTIME" | "SE" | "SILENCE" | "U"
        ) {
            return Ok(());
        }
        return Err(HandlerError::UnknownCommand(msg.command.clone()));
    };

    match command {
        Command::Pass => link::cmd_pass(ctx, net, &msg),
        Command::Server => link::cmd_server(ctx, net, &origin, &msg),
        Command::Ping => link::cmd_ping(ctx, net, &origin, &msg),
        Command::Pong => link::cmd_pong(ctx, net, &msg),
        Command::EndOfBurst => link::cmd_eob(ctx, net, &origin),
        Command::EobAck => link::cmd_eob_ack(ctx, net, &origin),
        Command::Error => link::cmd_error(ctx, &msg),
        Command::Squit => link::cmd_squit(ctx, net, &msg),
        Command::Nick => users::cmd_nick(ctx, net, &origin, &msg),
        Command::Quit => users::cmd_quit(ctx, net, &origin, &msg),
        Command::Kill => users::cmd_kill(ctx, net, &origin, &msg),
        Command::Account => users::cmd_account(ctx, net, &origin, &msg),
        Command::FakeHost => users::cmd_fakehost(ctx, net, &origin, &msg),
        Command::SvsNick => users::cmd_svsnick(ctx, net, &msg),
        Command::Away => users::cmd_away(net, &origin, &msg),
        Command::Mode => channels::cmd_mode(ctx, net, &origin, &msg),
        Command::OpMode => channels::cmd_opmode(ctx, net, &origin, &msg),
        Command::ClearMode => channels::cmd_clearmode(net, &origin, &msg),
        Command::Create => channels::cmd_create(ctx, net, &origin, &msg),
        Command::Join => channels::cmd_join(ctx, net, &origin, &msg),
        Command::Part => channels::cmd_part(ctx, net, &origin, &msg),
        Command::Kick => channels::cmd_kick(ctx, net, &origin, &msg),
        Command::Topic => channels::cmd_topic(ctx, net, &origin, &msg),
        Command::Burst => burst::cmd_burst(ctx, net, &origin, &msg),
        Command::Privmsg => messages::cmd_privmsg(ctx, net, &origin, &msg, false),
        Command::Notice => messages::cmd_privmsg(ctx, net, &origin, &msg, true),
        Command::Gline => users::cmd_gline(ctx, net, &origin, &msg),
        Command::Whois => messages::cmd_whois(ctx, net, &origin, &msg),
        Command::Stats => messages::cmd_stats(ctx, net, &origin, &msg),
        Command::Version => messages::cmd_version(ctx, net, &origin),
        Command::Admin => messages::cmd_admin(ctx, net, &origin),
        Command::Invite => Ok(()),
    }
}

fn dispatch_numeric(
    ctx: &Context,
    net: &mut Network,
    origin: &Origin,
    msg: &RawMessage,
) -> HandlerResult {
    match msg.command.as_str() {
        "331" | "332" | "333" => channels::cmd_num_topic(net, msg),
        "247" => users::cmd_num_gline(ctx, net, origin, msg),
        "432" => users::cmd_error_nick(ctx, net),
        // Benign replies: end-of-stats, invite confirmations, assorted
        // target errors after messages we relayed.
        "219" | "345" | "401" | "403" | "404" | "439" | "441" | "442" | "443" | "461" | "467" => {
            Ok(())
        }
        _ => Err(HandlerError::UnknownCommand(msg.command.clone())),
    }
}

/// Socket teardown: the server tree behind the uplink is gone.
pub fn handle_disconnect(ctx: &Context) {
    let mut net = ctx.net.write();
    if let Some(prefix) = net.uplink_prefix.clone() {
        net.del_server(&*ctx.out, &ctx.hooks, &prefix, false, None);
    }
    *ctx.unbursted.lock() = None;
    net.drain_dead();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::uplink::Outbox;

    /// Outbox capturing emitted lines; the uplink stand-in for handler
    /// tests.
    #[derive(Default)]
    pub struct CaptureOutbox(pub Mutex<Vec<String>>);

    impl Outbox for CaptureOutbox {
        fn send_line(&self, line: String) {
            self.0.lock().push(line);
        }
    }

    /// A context wired to a fixed clock and a capturing outbox.
    pub fn test_context() -> (Arc<Context>, Arc<CaptureOutbox>) {
        let clock = Clock::fixed(100_000);
        let net = Network::new(
            clock.clone(),
            "services.example.net",
            "ABAA]",
            "Network Services",
            90_000,
        );
        let uplink = Arc::new(Uplink::new("hub.example.net".into(), 4400));
        uplink.set_state(crate::uplink::LinkState::Bursting);
        let out = Arc::new(CaptureOutbox::default());
        let ctx = Arc::new(Context {
            net: Arc::new(RwLock::new(net)),
            hooks: Arc::new(Hooks::new()),
            glines: Arc::new(Mutex::new(GlineStore::new())),
            out: out.clone(),
            uplink,
            clock,
            their_password: Some("linkpass".into()),
            reliable_clock: true,
            admin_info: vec!["Example Admin".into()],
            hidden_host_suffix: Some("users.example.net".into()),
            unbursted: Mutex::new(None),
            burst_begin: AtomicI64::new(0),
            burst_length: AtomicI64::new(0),
        });
        (ctx, out)
    }
}

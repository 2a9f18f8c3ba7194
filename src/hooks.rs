//! Event hook registries.
//!
//! Modules register interest in state events at startup; lists are
//! append-only and iterated in registration order, except del-user which
//! runs in reverse so higher-layer services clean up presence before
//! lower-layer bindings vanish.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::state::{Channel, Membership, ModeChange, Network, User};
use crate::uplink::Outbox;

/// Server finished linking (fires at its end-of-burst, not introduction).
pub type ServerLinkFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str) + Send + Sync>;

/// New user introduced. Returning `true` stops the remaining hooks (the
/// user was consumed, e.g. killed by policy).
pub type NewUserFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str) -> bool + Send + Sync>;

/// User removed: `(net, out, user, killer numeric, reason)`.
pub type DelUserFn = Box<dyn Fn(&mut Network, &dyn Outbox, &User, Option<&str>, &str) + Send + Sync>;

/// `(net, out, numeric, old_nick)`.
pub type NickChangeFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync>;

/// `(net, out, numeric, stamp)`.
pub type AccountFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync>;

/// `(net, out, channel key)`.
pub type NewChannelFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str) + Send + Sync>;

/// Channel destroyed; receives the removed value.
pub type DelChannelFn = Box<dyn Fn(&mut Network, &dyn Outbox, &Channel) + Send + Sync>;

/// Join completed. Returning `true` vetoes: the join is undone with a part.
pub type JoinFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) -> bool + Send + Sync>;

/// `(net, out, membership, channel key, reason)`.
pub type PartFn = Box<dyn Fn(&mut Network, &dyn Outbox, &Membership, &str, &str) + Send + Sync>;

/// `(net, out, kicker numeric, victim numeric, channel key)`.
pub type KickFn =
    Box<dyn Fn(&mut Network, &dyn Outbox, Option<&str>, &str, &str) + Send + Sync>;

/// `(net, out, setter numeric, channel key, old topic)`.
pub type TopicFn =
    Box<dyn Fn(&mut Network, &dyn Outbox, Option<&str>, &str, &str) + Send + Sync>;

/// `(net, out, channel key, actor numeric, change)`.
pub type ModeChangeFn =
    Box<dyn Fn(&mut Network, &dyn Outbox, &str, Option<&str>, &ModeChange) + Send + Sync>;

/// User gained operator status (remote users only).
pub type OperFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str) + Send + Sync>;

/// Message delivered to one of our local service users:
/// `(net, out, from numeric, to numeric, text, qualified)`. Qualified means
/// the target was addressed as `user@server`.
pub type DeliveryFn =
    Arc<dyn Fn(&mut Network, &dyn Outbox, &str, &str, &str, bool) + Send + Sync>;

/// Account-layer events, consumed by the registration service:
/// auth gate `(net, out, user numeric, account) -> allowed`, ...
pub type AllowAuthFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) -> bool + Send + Sync>;

/// ... account merge/rename `(net, out, old name, new name)` ...
pub type HandleChangeFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync>;

/// ... and failed password attempts `(net, out, user numeric, account)`.
pub type FailPwFn = Box<dyn Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    pub server_link: Vec<ServerLinkFn>,
    pub new_user: Vec<NewUserFn>,
    pub del_user: Vec<DelUserFn>,
    pub nick_change: Vec<NickChangeFn>,
    pub account: Vec<AccountFn>,
    pub new_channel: Vec<NewChannelFn>,
    pub del_channel: Vec<DelChannelFn>,
    pub join: Vec<JoinFn>,
    pub part: Vec<PartFn>,
    pub kick: Vec<KickFn>,
    pub topic: Vec<TopicFn>,
    pub mode_change: Vec<ModeChangeFn>,
    pub oper: Vec<OperFn>,
    pub allow_auth: Vec<AllowAuthFn>,
    pub handle_merge: Vec<HandleChangeFn>,
    pub handle_rename: Vec<HandleChangeFn>,
    pub failpw: Vec<FailPwFn>,
    /// PRIVMSG handlers keyed by a local service's local numeric.
    pub privmsg: Mutex<HashMap<u32, DeliveryFn>>,
    /// NOTICE handlers keyed the same way.
    pub notice: Mutex<HashMap<u32, DeliveryFn>>,
}

#[allow(dead_code)] // Service modules register what they need at startup.
impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_server_link(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str) + Send + Sync + 'static,
    ) {
        self.server_link.push(Box::new(f));
    }

    pub fn on_new_user(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str) -> bool + Send + Sync + 'static,
    ) {
        self.new_user.push(Box::new(f));
    }

    pub fn on_del_user(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &User, Option<&str>, &str) + Send + Sync + 'static,
    ) {
        self.del_user.push(Box::new(f));
    }

    pub fn on_nick_change(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync + 'static,
    ) {
        self.nick_change.push(Box::new(f));
    }

    pub fn on_account(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync + 'static,
    ) {
        self.account.push(Box::new(f));
    }

    pub fn on_new_channel(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str) + Send + Sync + 'static,
    ) {
        self.new_channel.push(Box::new(f));
    }

    pub fn on_del_channel(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &Channel) + Send + Sync + 'static,
    ) {
        self.del_channel.push(Box::new(f));
    }

    pub fn on_join(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) -> bool + Send + Sync + 'static,
    ) {
        self.join.push(Box::new(f));
    }

    pub fn on_part(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &Membership, &str, &str) + Send + Sync + 'static,
    ) {
        self.part.push(Box::new(f));
    }

    pub fn on_kick(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, Option<&str>, &str, &str) + Send + Sync + 'static,
    ) {
        self.kick.push(Box::new(f));
    }

    pub fn on_topic(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, Option<&str>, &str, &str) + Send + Sync + 'static,
    ) {
        self.topic.push(Box::new(f));
    }

    pub fn on_mode_change(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, Option<&str>, &ModeChange)
        + Send
        + Sync
        + 'static,
    ) {
        self.mode_change.push(Box::new(f));
    }

    pub fn on_oper(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str) + Send + Sync + 'static,
    ) {
        self.oper.push(Box::new(f));
    }

    pub fn on_allow_auth(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) -> bool + Send + Sync + 'static,
    ) {
        self.allow_auth.push(Box::new(f));
    }

    pub fn on_handle_merge(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync + 'static,
    ) {
        self.handle_merge.push(Box::new(f));
    }

    pub fn on_handle_rename(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync + 'static,
    ) {
        self.handle_rename.push(Box::new(f));
    }

    pub fn on_failpw(
        &mut self,
        f: impl Fn(&mut Network, &dyn Outbox, &str, &str) + Send + Sync + 'static,
    ) {
        self.failpw.push(Box::new(f));
    }

    /// Register the PRIVMSG handler for a local service user.
    pub fn register_privmsg(&self, local_num: u32, f: DeliveryFn) {
        if self.privmsg.lock().insert(local_num, f).is_some() {
            tracing::warn!(local_num, "re-registering privmsg handler");
        }
    }

    pub fn register_notice(&self, local_num: u32, f: DeliveryFn) {
        if self.notice.lock().insert(local_num, f).is_some() {
            tracing::warn!(local_num, "re-registering notice handler");
        }
    }

    pub fn unregister_delivery(&self, local_num: u32) {
        self.privmsg.lock().remove(&local_num);
        self.notice.lock().remove(&local_num);
    }

    pub fn privmsg_handler(&self, local_num: u32) -> Option<DeliveryFn> {
        self.privmsg.lock().get(&local_num).cloned()
    }

    pub fn notice_handler(&self, local_num: u32) -> Option<DeliveryFn> {
        self.notice.lock().get(&local_num).cloned()
    }
}

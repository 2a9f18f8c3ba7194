//! End-to-end dispatcher tests: literal wire lines in, state and emitted
//! lines out.

use std::sync::Arc;

use super::testing::{CaptureOutbox, test_context};
use super::*;
use crate::state::ChannelModes;
use crate::uplink::LinkState;

fn feed(ctx: &Context, line: &str) {
    parse_line(ctx, line, false);
}

/// Complete the handshake: peer password, then the uplink's SERVER.
/// The uplink gets prefix `AA` with a 63-slot client table.
fn link(ctx: &Context) {
    feed(ctx, "PASS :linkpass");
    feed(ctx, "SERVER hub.example.net 2 90000 90500 J10 AAAA] +s6 :Test Hub");
}

fn lines(out: &CaptureOutbox) -> Vec<String> {
    out.0.lock().clone()
}

#[test]
fn handshake_accepts_good_password() {
    let (ctx, _out) = test_context();
    ctx.uplink.set_state(LinkState::Authenticating);
    feed(&ctx, "PASS :linkpass");
    assert_eq!(ctx.uplink.state(), LinkState::Bursting);
}

#[test]
fn handshake_rejects_bad_password() {
    let (ctx, out) = test_context();
    ctx.uplink.set_state(LinkState::Authenticating);
    feed(&ctx, "PASS :wrong");
    assert_eq!(ctx.uplink.state(), LinkState::Disconnected);
    assert!(
        lines(&out)
            .iter()
            .any(|l| l.contains("SQ services.example.net") && l.contains("Incorrect password"))
    );
}

#[test]
fn server_introduction_links_uplink() {
    let (ctx, _out) = test_context();
    link(&ctx);
    let net = ctx.net.read();
    assert_eq!(net.uplink_prefix.as_deref(), Some("AA"));
    let hub = net.server_by_name("hub.example.net").unwrap();
    assert!(hub.burst);
    assert!(hub.self_burst);
    assert_eq!(hub.num_mask, 63);
    drop(net);
    assert!(ctx.unbursted.lock().is_some(), "burst snapshot taken");
}

#[test]
fn nick_introduction_during_burst() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(
        &ctx,
        "AA N Alice 1 100 ~u host.example.com +oi AAAAAA AAAAB :Real Name",
    );
    let net = ctx.net.read();
    let user = net.user_by_nick("Alice").expect("introduced");
    assert_eq!(user.numeric, "AAAAB");
    assert_eq!(user.num_local, 1);
    assert!(user.modes.oper);
    assert!(user.modes.invisible);
    assert!(!crate::numeric::ip_is_valid(&user.ip), "ip zero");
    let hub = net.servers.get("AA").unwrap();
    assert_eq!(hub.users[1].as_deref(), Some("AAAAB"));
}

#[test]
fn nick_collision_lower_timestamp_wins() {
    let (ctx, out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N X 1 100 u h.example.com +i AAAAAA AAAAB :One");
    feed(&ctx, "AA N X 1 99 u h.example.com +i AAAAAA AAAAC :Two");
    let net = ctx.net.read();
    let survivor = net.user_by_nick("X").unwrap();
    assert_eq!(survivor.numeric, "AAAAC");
    assert!(net.users.get("AAAAB").is_none());
    // Dead-user parking drained at end of line.
    assert!(net.find_dead("AAAAB").is_none());
    drop(net);
    assert!(
        lines(&out)
            .iter()
            .any(|l| l.contains(" D AAAAB") && l.contains("Overruled by older nick"))
    );
}

#[test]
fn burst_reconciliation_older_incoming_wins() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N X 1 100 u h.example.com + AAAAAA AAAAB :X");
    feed(&ctx, "AA N Y 1 100 u h.example.com + AAAAAA AAAAC :Y");
    feed(&ctx, "AA B #a 200 +nt AAAAB:o");
    {
        let net = ctx.net.read();
        let chan = net.channel("#a").unwrap();
        assert_eq!(chan.timestamp, 200);
        assert!(chan.modes.contains(ChannelModes::NO_PRIVMSGS));
        assert!(chan.member("AAAAB").unwrap().modes.op);
    }

    feed(&ctx, "AA B #a 100 +im AAAAC:o");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.timestamp, 100);
    assert!(chan.modes.contains(ChannelModes::INVITE_ONLY));
    assert!(chan.modes.contains(ChannelModes::MODERATED));
    assert!(
        !chan.modes.contains(ChannelModes::NO_PRIVMSGS),
        "+nt cleared"
    );
    assert!(!chan.member("AAAAB").unwrap().modes.op, "X lost ops");
    assert!(chan.member("AAAAC").unwrap().modes.op, "Y gained ops");
}

#[test]
fn burst_reconciliation_newer_incoming_merges_bans_only() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N X 1 100 u h.example.com + AAAAAA AAAAB :X");
    feed(&ctx, "AA B #a 100 +nt AAAAB:o");
    feed(&ctx, "AA B #a 300 +i AAAAB:v :%*!*@spam.example.org");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.timestamp, 100);
    assert!(!chan.modes.contains(ChannelModes::INVITE_ONLY));
    assert!(chan.ban_exists("*!*@spam.example.org"));
    let member = chan.member("AAAAB").unwrap();
    assert!(member.modes.op, "existing op kept");
    assert!(!member.modes.voice, "incoming voice discarded");
}

#[test]
fn burst_member_grammar_oplevels() {
    let (ctx, _out) = test_context();
    link(&ctx);
    for (nick, numeric) in [("A1", "AAAAB"), ("A2", "AAAAC"), ("A3", "AAAAD")] {
        feed(
            &ctx,
            &format!("AA N {} 1 100 u h.example.com + AAAAAA {} :n", nick, numeric),
        );
    }
    // First op at absolute level 5; the next digit run accumulates; the
    // plain member inherits the sticky run.
    feed(&ctx, "AA B #lvl 50 AAAAB:5,AAAAC:3,AAAAD");
    let net = ctx.net.read();
    let chan = net.channel("#lvl").unwrap();
    let first = chan.member("AAAAB").unwrap();
    assert!(first.modes.op);
    assert_eq!(first.modes.oplevel, Some(5));
    let second = chan.member("AAAAC").unwrap();
    assert_eq!(second.modes.oplevel, Some(8), "5 then +3 accumulates");
    let third = chan.member("AAAAD").unwrap();
    assert!(third.modes.op, "sticky mode run carries to later entries");
    assert_eq!(third.modes.oplevel, Some(8));
}

#[test]
fn mode_change_applies_and_notifies() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA N Bob 1 100 u h.example.com + AAAAAA AAAAC :B");
    feed(&ctx, "AA B #a 100 AAAAB:o,AAAAC");
    // Bob's op and a ban arrive from Alice.
    feed(&ctx, "AAAAB M #a +o-b AAAAC *!*@bad.example.org");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert!(chan.member("AAAAC").unwrap().modes.op);
    assert!(!chan.ban_exists("*!*@bad.example.org"));
}

#[test]
fn server_mode_resets_timestamp() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA B #a 500 AAAAB");
    feed(&ctx, "AA M #a +nt 400");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.timestamp, 400);
    assert!(chan.modes.contains(ChannelModes::NO_PRIVMSGS));
}

#[test]
fn clearmode_requires_oper() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Op 1 100 u h.example.com +o AAAAAA AAAAB :O");
    feed(&ctx, "AA N Pleb 1 100 u h.example.com + AAAAAA AAAAC :P");
    feed(&ctx, "AA B #a 100 +ntk sesame AAAAB:o,AAAAC");
    feed(&ctx, "AAAAC CM #a ntk");
    {
        let net = ctx.net.read();
        assert!(net.channel("#a").unwrap().modes.contains(ChannelModes::NO_PRIVMSGS));
    }
    feed(&ctx, "AAAAB CM #a ntk");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert!(!chan.modes.contains(ChannelModes::NO_PRIVMSGS));
    assert!(!chan.modes.contains(ChannelModes::KEY));
    assert!(chan.key.is_empty());
}

#[test]
fn join_create_part_lifecycle() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AAAAB C #new 12345");
    {
        let net = ctx.net.read();
        let chan = net.channel("#new").unwrap();
        assert_eq!(chan.timestamp, 12345);
        assert_eq!(chan.members.len(), 1);
    }
    feed(&ctx, "AAAAB L #new :done here");
    let net = ctx.net.read();
    assert!(net.channel("#new").is_none(), "empty channel destroyed");
    assert!(net.users["AAAAB"].channels.is_empty());
}

#[test]
fn join_zero_parts_everything() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AAAAB C #one,#two 100");
    assert_eq!(ctx.net.read().users["AAAAB"].channels.len(), 2);
    feed(&ctx, "AAAAB J 0");
    assert!(ctx.net.read().users["AAAAB"].channels.is_empty());
}

#[test]
fn kick_and_kill_paths() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA N Bob 1 100 u h.example.com + AAAAAA AAAAC :B");
    feed(&ctx, "AA B #a 100 AAAAB:o,AAAAC");
    feed(&ctx, "AAAAB K #a AAAAC :begone");
    {
        let net = ctx.net.read();
        assert!(net.channel("#a").unwrap().member("AAAAC").is_none());
    }
    feed(&ctx, "AA D AAAAC :collision");
    let net = ctx.net.read();
    assert!(net.user_by_nick("Bob").is_none());
}

#[test]
fn quit_removes_user_and_memberships() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA N Bob 1 100 u h.example.com + AAAAAA AAAAC :B");
    feed(&ctx, "AA B #a 100 AAAAB,AAAAC");
    feed(&ctx, "AAAAB Q :leaving");
    let net = ctx.net.read();
    assert!(net.user_by_nick("Alice").is_none());
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.members.len(), 1);
}

#[test]
fn squit_drops_subtree() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA S leaf.example.net 3 90000 90600 J10 ACAA] +s6 :Leaf");
    feed(&ctx, "AC N Carol 2 100 u h.example.com + AAAAAA ACAAB :C");
    assert!(ctx.net.read().user_by_nick("Carol").is_some());
    feed(&ctx, "AA SQ leaf.example.net 0 :gone");
    let net = ctx.net.read();
    assert!(net.server_by_name("leaf.example.net").is_none());
    assert!(net.user_by_nick("Carol").is_none());
}

#[test]
fn eob_handshake() {
    let (ctx, out) = test_context();
    link(&ctx);
    feed(&ctx, "AA EB");
    assert_eq!(ctx.uplink.state(), LinkState::Connected);
    let sent = lines(&out);
    assert!(sent.iter().any(|l| l == "AB EB"), "our end-of-burst");
    assert!(sent.iter().any(|l| l == "AB EA"), "our acknowledgement");
    let net = ctx.net.read();
    assert!(!net.servers.get("AA").unwrap().self_burst);
    assert!(!net.servers.get("AA").unwrap().burst);
}

#[test]
fn eob_ack_finishes_our_burst() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA EA");
    let net = ctx.net.read();
    assert!(!net.self_server().self_burst);
    assert!(!net.self_server().burst);
    assert_eq!(ctx.uplink.state(), LinkState::Connected);
}

#[test]
fn incoming_burst_for_our_channel_answers_with_corrective_burst() {
    let (ctx, out) = test_context();
    // Seed a local channel before the link so send_burst snapshots it.
    {
        let mut net = ctx.net.write();
        let numeric = net
            .add_local_user(&*ctx.out, &ctx.hooks, "Svc", "svc", None, "Service", None)
            .unwrap();
        net.add_channel_user(&*ctx.out, &ctx.hooks, &numeric, "#keep", Some(100));
        if let Some(chan) = net.channel_mut("#keep") {
            chan.modes.insert(ChannelModes::NO_PRIVMSGS);
        }
    }
    link(&ctx);
    assert!(ctx.unbursted.lock().as_ref().unwrap().contains("#keep"));

    feed(&ctx, "AA B #keep 100 +t");
    let sent = lines(&out);
    assert!(
        sent.iter().any(|l| l.starts_with("AB B #keep 100 +n")),
        "corrective burst emitted: {:?}",
        sent
    );
    assert!(
        !ctx.unbursted.lock().as_ref().unwrap().contains("#keep"),
        "channel no longer pending"
    );
}

#[test]
fn gline_wire_add_and_remove() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA GL * +*@1.2.3.4 3600 100000 :open proxy");
    assert!(ctx.glines.lock().find("*@1.2.3.4").is_some());
    // Re-add with a shorter lifetime never shortens.
    feed(&ctx, "AA GL * +*@1.2.3.4 60 100001 :open proxy again");
    {
        let glines = ctx.glines.lock();
        let gline = glines.find("*@1.2.3.4").unwrap();
        assert_eq!(gline.expires, 100_000 + 3600);
    }
    feed(&ctx, "AA GL * -*@1.2.3.4");
    assert!(ctx.glines.lock().find("*@1.2.3.4").is_none());
}

#[test]
fn account_and_fakehost_stamping() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA AC AAAAB alice_acct");
    feed(&ctx, "AA FA AAAAB cloak.example.net");
    let net = ctx.net.read();
    let user = net.user_by_nick("Alice").unwrap();
    assert_eq!(user.account.as_deref(), Some("alice_acct"));
    assert_eq!(user.fakehost.as_deref(), Some("cloak.example.net"));
}

#[test]
fn account_stamp_via_usermode_burst() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(
        &ctx,
        "AA N Alice 1 100 u h.example.com +ir alice_acct AAAAAA AAAAB :A",
    );
    let net = ctx.net.read();
    let user = net.user_by_nick("Alice").unwrap();
    assert_eq!(user.account.as_deref(), Some("alice_acct"));
    assert!(user.modes.invisible);
}

#[test]
fn ping_gets_pong() {
    let (ctx, out) = test_context();
    link(&ctx);
    feed(&ctx, "AA G :hub.example.net");
    assert!(
        lines(&out)
            .iter()
            .any(|l| l.starts_with("AB Z services.example.net :AA"))
    );
}

#[test]
fn whois_reply_set() {
    let (ctx, out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA N Bob 1 100 u h.example.com +o AAAAAA AAAAC :B");
    feed(&ctx, "AA AC AAAAC bob_acct");
    feed(&ctx, "AAAAB W services.example.net Bob");
    let sent = lines(&out);
    let whois: Vec<&String> = sent.iter().filter(|l| l.contains(" Alice ")).collect();
    assert!(whois.iter().any(|l| l.contains(" 311 ") && l.contains("Bob u h.example.com")));
    assert!(whois.iter().any(|l| l.contains(" 313 ")));
    assert!(whois.iter().any(|l| l.contains(" 330 ") && l.contains("bob_acct")));
    assert!(whois.iter().any(|l| l.contains(" 318 ") && l.contains("End of /WHOIS list")));
}

#[test]
fn whois_unknown_nick_is_401() {
    let (ctx, out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AAAAB W services.example.net Ghost");
    assert!(lines(&out).iter().any(|l| l.contains(" 401 Alice Ghost@")));
}

#[test]
fn privmsg_delivery_to_local_service() {
    let (ctx, _out) = test_context();
    let svc_numeric = {
        let mut net = ctx.net.write();
        net.add_local_user(&*ctx.out, &ctx.hooks, "O3", "o3", None, "Oper Service", None)
            .unwrap()
    };
    let received = Arc::new(parking_lot::Mutex::new(Vec::<(String, String)>::new()));
    {
        let received = received.clone();
        let local_num = ctx.net.read().users[&svc_numeric].num_local;
        ctx.hooks.register_privmsg(
            local_num,
            Arc::new(move |_net, _out, from, _to, text, _qualified| {
                received.lock().push((from.to_string(), text.to_string()));
            }),
        );
    }
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, &format!("AAAAB P {} :help", svc_numeric));
    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "AAAAB");
    assert_eq!(received[0].1, "help");
}

#[test]
fn svsnick_renames_local_user() {
    let (ctx, _out) = test_context();
    let svc = {
        let mut net = ctx.net.write();
        net.add_local_user(&*ctx.out, &ctx.hooks, "O3", "o3", None, "Svc", None)
            .unwrap()
    };
    link(&ctx);
    feed(&ctx, &format!("AA SN {} Oper3 100000", svc));
    let net = ctx.net.read();
    assert!(net.user_by_nick("Oper3").is_some());
    assert!(net.user_by_nick("O3").is_none());
}

#[test]
fn unknown_command_is_dropped_quietly() {
    let (ctx, _out) = test_context();
    link(&ctx);
    // Must not panic or disconnect.
    feed(&ctx, "AA BOGUSCMD foo bar");
    assert_ne!(ctx.uplink.state(), LinkState::Disconnected);
}

#[test]
fn ignored_chatter_is_accepted() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA DS :desync notice");
    feed(&ctx, "AA WA :wallops chatter");
    feed(&ctx, "AA SE 100000");
    assert_ne!(ctx.uplink.state(), LinkState::Disconnected);
}

#[test]
fn topic_handling_with_burst_timestamps() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA B #a 100 AAAAB");
    feed(&ctx, "AAAAB T #a 100 99999 :the topic");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.topic, "the topic");
    assert_eq!(chan.topic_nick, "Alice");
    assert_eq!(chan.topic_time, 99999);
}

#[test]
fn numeric_topic_replies() {
    let (ctx, _out) = test_context();
    link(&ctx);
    feed(&ctx, "AA N Alice 1 100 u h.example.com + AAAAAA AAAAB :A");
    feed(&ctx, "AA B #a 100 AAAAB");
    feed(&ctx, ":hub.example.net 332 Svc #a :burst topic");
    feed(&ctx, ":hub.example.net 333 Svc #a Setter 4242");
    let net = ctx.net.read();
    let chan = net.channel("#a").unwrap();
    assert_eq!(chan.topic, "burst topic");
    assert_eq!(chan.topic_nick, "Setter");
    assert_eq!(chan.topic_time, 4242);
}

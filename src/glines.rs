//! Global-ban (gline) store.
//!
//! One entry per `user@host` target mask. Lifetimes only ever extend:
//! a propagated re-add never shortens an existing entry. A mask-keyed map
//! carries the authoritative entries; an expiry-ordered index drives the
//! periodic sweep and link-time refresh.

use std::collections::{BTreeSet, HashMap};

use tracing::info;

use crate::proto::send;
use crate::uplink::Outbox;
use crate::util::{irc_to_lower, match_ircglob, match_ircglobs, normalize_gline_target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gline {
    pub issuer: String,
    /// Normalized `user@host` mask.
    pub target: String,
    pub reason: String,
    pub issued: i64,
    pub expires: i64,
    /// Last modification time as propagated; zero for entries that never
    /// carried one.
    pub lastmod: i64,
}

/// Mask comparison mode for discriminator searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskType {
    /// Stored target must be covered by the search mask.
    #[default]
    Subset,
    Exact,
    /// Stored target must cover the search mask.
    Superset,
}

/// Parsed search criteria for iterating the store.
#[derive(Debug, Clone, Default)]
pub struct GlineDiscrim {
    pub limit: usize,
    pub mask_type: MaskType,
    pub issuer_mask: Option<String>,
    pub target_mask: Option<String>,
    pub alt_target_mask: Option<String>,
    pub reason_mask: Option<String>,
    pub max_issued: Option<i64>,
    pub min_expire: Option<i64>,
}

#[derive(Default)]
pub struct GlineStore {
    by_target: HashMap<String, Gline>,
    by_expiry: BTreeSet<(i64, String)>,
}

impl GlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)] // Bot command: stats glines.
    pub fn count(&self) -> usize {
        self.by_target.len()
    }

    pub fn find(&self, target: &str) -> Option<&Gline> {
        self.by_target
            .get(&irc_to_lower(&normalize_gline_target(target)))
    }

    /// Add or refresh a gline. Expiry extends monotonically; the reason and
    /// lastmod are refreshed from the newer information.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        out: &dyn Outbox,
        self_numeric: &str,
        issuer: &str,
        target: &str,
        duration: i64,
        reason: &str,
        issued: i64,
        lastmod: i64,
        announce: bool,
        now: i64,
    ) -> &Gline {
        let target = normalize_gline_target(target);
        let key = irc_to_lower(&target);
        let expires = issued + duration;

        let entry = self
            .by_target
            .entry(key.clone())
            .and_modify(|g| {
                self.by_expiry.remove(&(g.expires, key.clone()));
                if expires > g.expires {
                    g.expires = expires;
                }
                g.reason = reason.to_string();
                if lastmod > g.lastmod {
                    g.lastmod = lastmod;
                }
            })
            .or_insert_with(|| {
                info!(target = %target, issuer, reason, "adding gline");
                Gline {
                    issuer: issuer.to_string(),
                    target: target.clone(),
                    reason: reason.to_string(),
                    issued,
                    expires,
                    lastmod,
                }
            });
        self.by_expiry.insert((entry.expires, key.clone()));

        if announce {
            out.send_line(send::gline_add(
                self_numeric,
                None,
                &entry.target,
                entry.expires - now,
                entry.lastmod,
                &entry.reason,
            ));
        }
        self.by_target.get(&key).expect("just inserted")
    }

    /// Remove by exact target. Returns whether an entry existed.
    pub fn remove(
        &mut self,
        out: &dyn Outbox,
        self_numeric: &str,
        target: &str,
        announce: bool,
    ) -> bool {
        let target = normalize_gline_target(target);
        let key = irc_to_lower(&target);
        match self.by_target.remove(&key) {
            Some(gline) => {
                self.by_expiry.remove(&(gline.expires, key));
                if announce {
                    out.send_line(send::gline_remove(self_numeric, &gline.target));
                }
                true
            }
            None => false,
        }
    }

    /// Send every live entry to a newly-linked server, reaping expired
    /// entries along the way.
    pub fn refresh_server(
        &mut self,
        out: &dyn Outbox,
        self_numeric: &str,
        server_numeric: Option<&str>,
        now: i64,
    ) {
        self.reap(now);
        for gline in self.by_target.values() {
            out.send_line(send::gline_add(
                self_numeric,
                server_numeric,
                &gline.target,
                gline.expires - now,
                gline.lastmod,
                &gline.reason,
            ));
        }
    }

    /// Drop entries whose expiry has passed. Returns how many were removed.
    pub fn reap(&mut self, now: i64) -> usize {
        let mut removed = 0;
        while let Some((expires, key)) = self.by_expiry.first().cloned() {
            if expires > now {
                break;
            }
            self.by_expiry.remove(&(expires, key.clone()));
            if self.by_target.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Linear discriminator scan; matching entries go to `callback`, at most
    /// `discrim.limit` of them (zero meaning unlimited).
    #[allow(dead_code)] // Bot command: trace gline / gline search.
    pub fn search(&self, discrim: &GlineDiscrim, mut callback: impl FnMut(&Gline)) -> usize {
        let mut matched = 0;
        for gline in self.by_target.values() {
            if discrim.limit != 0 && matched >= discrim.limit {
                break;
            }
            if let Some(mask) = &discrim.issuer_mask {
                if !match_ircglob(&gline.issuer, mask) {
                    continue;
                }
            }
            if let Some(max) = discrim.max_issued {
                if gline.issued > max {
                    continue;
                }
            }
            if let Some(min) = discrim.min_expire {
                if gline.expires < min {
                    continue;
                }
            }
            if let Some(mask) = &discrim.reason_mask {
                if !match_ircglob(&gline.reason, mask) {
                    continue;
                }
            }
            let target_ok = |mask: &str| match discrim.mask_type {
                MaskType::Subset => match_ircglobs(mask, &gline.target),
                MaskType::Exact => irc_to_lower(mask) == irc_to_lower(&gline.target),
                MaskType::Superset => match_ircglobs(&gline.target, mask),
            };
            if let Some(mask) = &discrim.target_mask {
                let alt_ok = discrim
                    .alt_target_mask
                    .as_deref()
                    .map(target_ok)
                    .unwrap_or(false);
                if !target_ok(mask) && !alt_ok {
                    continue;
                }
            }
            callback(gline);
            matched += 1;
        }
        matched
    }
}

//! Channel entities: modes bitset, bans, memberships.

use crate::policer::Policer;
use crate::util::match_ircglobs;

use super::MAX_BANS;

/// Channel mode bitset.
///
/// `b` (bans), `o`/`v` (memberships), `l`/`k`/`A`/`U` values live in their
/// own fields on [`Channel`]; the bits here only record which are active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelModes(pub u32);

impl ChannelModes {
    pub const PRIVATE: Self = Self(0x0001); // +p
    pub const SECRET: Self = Self(0x0002); // +s
    pub const MODERATED: Self = Self(0x0004); // +m
    pub const TOPIC_LIMIT: Self = Self(0x0008); // +t
    pub const INVITE_ONLY: Self = Self(0x0010); // +i
    pub const NO_PRIVMSGS: Self = Self(0x0020); // +n
    pub const KEY: Self = Self(0x0040); // +k <key>
    pub const LIMIT: Self = Self(0x0080); // +l <limit>
    pub const DELAYED_JOINS: Self = Self(0x0100); // +D
    pub const REG_ONLY: Self = Self(0x0200); // +r
    pub const NO_COLORS: Self = Self(0x0400); // +c
    pub const NO_CTCPS: Self = Self(0x0800); // +C
    pub const REGISTERED: Self = Self(0x1000); // +z
    pub const APASS: Self = Self(0x2000); // +A <pass>
    pub const UPASS: Self = Self(0x4000); // +U <pass>
    /// Pseudo-bit for CLEARMODE's `b`.
    pub const BAN: Self = Self(0x8000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Simple-flag letters in announce order, paired with their bit.
    pub fn simple_letters() -> &'static [(char, ChannelModes)] {
        &[
            ('p', Self::PRIVATE),
            ('s', Self::SECRET),
            ('m', Self::MODERATED),
            ('t', Self::TOPIC_LIMIT),
            ('i', Self::INVITE_ONLY),
            ('n', Self::NO_PRIVMSGS),
            ('D', Self::DELAYED_JOINS),
            ('r', Self::REG_ONLY),
            ('c', Self::NO_COLORS),
            ('C', Self::NO_CTCPS),
            ('z', Self::REGISTERED),
        ]
    }
}

/// One entry on a channel's ban list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub mask: String,
    /// Nick of the setter.
    pub who: String,
    pub set: i64,
}

/// Per-membership mode bits plus the oplevel rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes {
    pub op: bool,
    pub voice: bool,
    /// 0-999, or absent.
    pub oplevel: Option<u16>,
}

/// The (user, channel) incidence record.
#[derive(Debug, Clone)]
pub struct Membership {
    /// Combined numeric of the member.
    pub user: String,
    pub modes: MemberModes,
    pub idle_since: i64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    /// Display name (case preserved; the index key is casefolded).
    pub name: String,
    pub modes: ChannelModes,
    pub limit: u32,
    pub key: String,
    pub upass: String,
    pub apass: String,
    /// Creation timestamp, the tiebreaker for burst reconciliation.
    pub timestamp: i64,
    pub topic: String,
    pub topic_nick: String,
    pub topic_time: i64,
    pub members: Vec<Membership>,
    pub bans: Vec<BanEntry>,
    /// While nonzero the channel survives losing its last member.
    pub locks: u32,
    pub join_policer: Policer,
    pub join_flooded: bool,
    pub bad_channel: bool,
}

impl Channel {
    pub fn new(name: String, timestamp: i64) -> Self {
        Self {
            name,
            modes: ChannelModes::default(),
            limit: 0,
            key: String::new(),
            upass: String::new(),
            apass: String::new(),
            timestamp,
            topic: String::new(),
            topic_nick: String::new(),
            topic_time: 0,
            members: Vec::new(),
            bans: Vec::new(),
            locks: 0,
            join_policer: Policer::new(),
            join_flooded: false,
            bad_channel: false,
        }
    }

    pub fn member(&self, numeric: &str) -> Option<&Membership> {
        self.members.iter().find(|m| m.user == numeric)
    }

    pub fn member_mut(&mut self, numeric: &str) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.user == numeric)
    }

    #[allow(dead_code)] // Service modules check before proposing bans.
    pub fn ban_exists(&self, mask: &str) -> bool {
        self.bans.iter().any(|b| b.mask == mask)
    }

    /// Add a ban, dropping existing bans the new mask covers.
    ///
    /// The list invariant is that no entry is a strict superset of another;
    /// a new, broader ban silently swallows the narrower ones.
    pub fn add_ban(&mut self, mask: &str, who: &str, now: i64) {
        self.bans.retain(|b| !match_ircglobs(mask, &b.mask));
        if self.bans.len() >= MAX_BANS {
            return;
        }
        self.bans.push(BanEntry {
            mask: mask.to_string(),
            who: who.to_string(),
            set: now,
        });
    }

    /// Remove a ban by exact string match.
    pub fn remove_ban(&mut self, mask: &str) {
        if let Some(pos) = self.bans.iter().position(|b| b.mask == mask) {
            self.bans.remove(pos);
        }
    }

    /// Strip all op/voice/oplevel state from every membership.
    pub fn clear_member_modes(&mut self) {
        for member in &mut self.members {
            member.modes = MemberModes::default();
        }
    }
}

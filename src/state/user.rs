//! User entities and user-mode handling.

use std::net::{IpAddr, Ipv4Addr};

use crate::policer::Policer;

/// A client somewhere on the network, ours or a peer's.
#[derive(Debug, Clone)]
pub struct User {
    /// Current nick (case preserved; the nick index is casefolded).
    pub nick: String,
    pub ident: String,
    /// Free-form real-name field.
    pub info: String,
    pub hostname: String,
    /// Cloak assigned with FAKE, if any.
    pub fakehost: Option<String>,
    /// Combined numeric (server prefix + local digits).
    pub numeric: String,
    /// Local numeric on the owning server, already masked.
    pub num_local: u32,
    pub ip: IpAddr,
    pub modes: UserModes,
    /// Time of introduction or last nick change.
    pub timestamp: i64,
    /// Owning server's numeric prefix.
    pub uplink: String,
    /// Channels this user is in (casefolded names). Kept consistent with
    /// each channel's member list.
    pub channels: Vec<String>,
    /// Account stamp, once authenticated.
    pub account: Option<String>,
    /// Set when the user has been removed from the indices but may still be
    /// referenced by handlers later in the same line.
    pub dead: bool,
    /// Dummy users are internal constructs that never hit the wire.
    pub dummy: bool,
    pub auth_policer: Policer,
}

impl User {
    pub fn unknown_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn has_fakehost(&self) -> bool {
        self.fakehost.is_some()
    }
}

/// User mode flags.
///
/// The account stamp and fakehost ride in on `+r`/`+f` arguments but are
/// stored on the [`User`] itself, not here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    pub oper: bool,        // +o
    pub invisible: bool,   // +i
    pub wallop: bool,      // +w
    pub service: bool,     // +k  cannot be kicked, killed or deopped
    pub deaf: bool,        // +d
    pub global: bool,      // +g
    pub no_chan: bool,     // +n  hides channels in WHOIS
    pub no_idle: bool,     // +I  hides idle time
    pub hidden_host: bool, // +x
    /// AWAY state; not a wire mode letter but carried with the flags.
    pub away: bool,
}

impl UserModes {
    /// Wire form used in user introductions, `+` included, empty string when
    /// no flags are set.
    pub fn to_wire(self) -> String {
        let mut s = String::from("+");
        if self.oper {
            s.push('o');
        }
        if self.invisible {
            s.push('i');
        }
        if self.wallop {
            s.push('w');
        }
        if self.service {
            s.push('k');
        }
        if self.deaf {
            s.push('d');
        }
        if self.global {
            s.push('g');
        }
        if self.no_chan {
            s.push('n');
        }
        if self.hidden_host {
            s.push('x');
        }
        if self.no_idle {
            s.push('I');
        }
        s
    }

    pub fn any(self) -> bool {
        self.to_wire().len() > 1
    }

    /// Flip one mode letter. Returns false for letters this type does not
    /// track (argument-carrying letters are the caller's problem).
    pub fn set(&mut self, letter: char, on: bool) -> bool {
        let slot = match letter {
            'o' => &mut self.oper,
            'i' => &mut self.invisible,
            'w' => &mut self.wallop,
            'k' => &mut self.service,
            'd' => &mut self.deaf,
            'g' => &mut self.global,
            'n' => &mut self.no_chan,
            'I' => &mut self.no_idle,
            'x' => &mut self.hidden_host,
            _ => return false,
        };
        *slot = on;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_order() {
        let mut modes = UserModes::default();
        modes.set('i', true);
        modes.set('o', true);
        modes.set('k', true);
        assert_eq!(modes.to_wire(), "+oik");
        assert!(modes.any());
    }

    #[test]
    fn default_is_empty() {
        let modes = UserModes::default();
        assert_eq!(modes.to_wire(), "+");
        assert!(!modes.any());
    }

    #[test]
    fn unknown_letters_are_rejected() {
        let mut modes = UserModes::default();
        assert!(!modes.set('r', true));
        assert!(!modes.set('f', true));
        assert!(modes.set('x', true));
        assert!(modes.hidden_host);
        modes.set('x', false);
        assert!(!modes.hidden_host);
    }
}

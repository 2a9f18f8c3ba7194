//! DNS blacklist checks for new connections.
//!
//! Each configured zone is queried with the reversed address labels; A
//! answers contribute their low octet to a reply bitmask and TXT answers
//! supply the `%txt%` expansion. A local host-list file provides static
//! entries keyed by IP text or hostname.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::glines::GlineStore;
use crate::resolver::{Resolver, wire};
use crate::state::Network;
use crate::uplink::Outbox;

/// One configured blacklist zone.
#[derive(Debug, Clone)]
pub struct DnsblZone {
    /// Zone suffix, e.g. `dnsbl.example.net`.
    pub zone: String,
    /// Which reply octet values we care about (bit N = last octet N).
    pub mask: u32,
    /// Per-octet reason templates.
    pub reasons: HashMap<u8, String>,
    /// Fallback reason template.
    pub reason: Option<String>,
    /// Gline lifetime for hits.
    pub duration: i64,
}

pub struct DnsblService {
    zones: Vec<DnsblZone>,
    /// Static entries: IP text or hostname -> reason.
    hosts: HashMap<String, String>,
    gline_duration: i64,
    resolver: Arc<Resolver>,
    glines: Arc<Mutex<GlineStore>>,
    out: Arc<dyn Outbox>,
    self_name: String,
    self_numeric: String,
    clock: Clock,
}

/// Substitute `%txt%` and `%ip%` in a reason template.
fn expand_reason(template: &str, txt: Option<&str>, ip: &str) -> String {
    template
        .replace("%txt%", txt.unwrap_or("(no-txt)"))
        .replace("%ip%", ip)
}

/// Reversed label prefix for an address: `d.c.b.a.` or 32 nibble labels.
fn reverse_labels(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(64);
            for byte in v6.octets().iter().rev() {
                out.push_str(&format!("{:x}.{:x}.", byte & 15, byte >> 4));
            }
            out
        }
    }
}

/// Load the static host list: one `pattern [reason]` per line.
pub fn load_host_file(path: &Path, default_reason: &str) -> HashMap<String, String> {
    let mut hosts = HashMap::new();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to open blacklist file");
            return hosts;
        }
    };
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (pattern, reason) = match line.split_once(' ') {
            Some((pattern, rest)) => {
                let rest = rest.trim_start();
                if rest.is_empty() {
                    (pattern, default_reason)
                } else {
                    (pattern, rest)
                }
            }
            None => (line, default_reason),
        };
        hosts.insert(pattern.to_string(), reason.to_string());
    }
    hosts
}

impl DnsblService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        zones: Vec<DnsblZone>,
        hosts: HashMap<String, String>,
        gline_duration: i64,
        resolver: Arc<Resolver>,
        glines: Arc<Mutex<GlineStore>>,
        out: Arc<dyn Outbox>,
        self_name: String,
        self_numeric: String,
        clock: Clock,
    ) -> Arc<DnsblService> {
        Arc::new(DnsblService {
            zones,
            hosts,
            gline_duration,
            resolver,
            glines,
            out,
            self_name,
            self_numeric,
            clock,
        })
    }

    fn add_gline(&self, host: &str, duration: i64, reason: &str) {
        let now = self.clock.now();
        self.glines.lock().add(
            &*self.out,
            &self.self_numeric,
            &self.self_name,
            &format!("*@{}", host),
            duration,
            reason,
            now,
            now,
            true,
            now,
        );
    }

    /// New-user hook body: static list, then one query per zone.
    pub fn check_user(self: &Arc<Self>, net: &Network, numeric: &str) {
        let Some(user) = net.users.get(numeric) else {
            return;
        };
        // Users with bogus IPs are probably service bots.
        if !crate::numeric::ip_is_valid(&user.ip) {
            return;
        }
        let ip_text = user.ip.to_string();

        let hit = self
            .hosts
            .get(&ip_text)
            .map(|reason| (ip_text.clone(), reason.clone()))
            .or_else(|| {
                self.hosts
                    .get(&user.hostname)
                    .map(|reason| (user.hostname.clone(), reason.clone()))
            });
        if let Some((host, reason)) = hit {
            self.add_gline(&host, self.gline_duration, &reason);
        }

        let base = reverse_labels(&user.ip);
        for (idx, zone) in self.zones.iter().enumerate() {
            let lookup = format!("{}{}", base, zone.zone);
            let this = self.clone();
            let ip_text = ip_text.clone();
            tokio::spawn(async move {
                this.check_zone(idx, lookup, ip_text).await;
            });
        }
    }

    async fn check_zone(self: Arc<Self>, zone_idx: usize, lookup: String, ip_text: String) {
        let Some(zone) = self.zones.get(zone_idx) else {
            return;
        };
        debug!(zone = %zone.zone, lookup = %lookup, "dnsbl query");
        let answer = match self.resolver.query(&[(&lookup, wire::QTYPE_ALL)]).await {
            Ok(answer) => answer,
            // NXDOMAIN and friends simply mean "not listed".
            Err(_) => return,
        };

        let mut mask: u32 = 0;
        let mut txt: Option<String> = None;
        for rr in answer
            .records
            .iter()
            .take(answer.header.ancount as usize)
        {
            match rr.rtype {
                wire::TYPE_A => {
                    if let Some(data) = rr.rdata(&answer.raw, 4) {
                        if data[3] < 32 {
                            mask |= 1 << data[3];
                        }
                    }
                }
                wire::TYPE_TXT => {
                    if let Some(len) = rr.rdata(&answer.raw, 1).map(|d| d[0] as usize) {
                        if let Some(data) = rr.rdata(&answer.raw, 1 + len) {
                            txt = Some(String::from_utf8_lossy(&data[1..]).into_owned());
                        }
                    }
                }
                _ => {}
            }
        }

        if mask & zone.mask == 0 {
            return;
        }
        // Lowest interesting octet with a configured reason wins; fall back
        // to the zone default.
        let mut message = None;
        let mut remaining = mask;
        let mut octet: u8 = 0;
        while remaining != 0 {
            if remaining & 1 != 0 {
                if let Some(reason) = zone.reasons.get(&octet) {
                    message = Some(reason.clone());
                    break;
                }
            }
            remaining >>= 1;
            octet += 1;
        }
        let template = message
            .or_else(|| zone.reason.clone())
            .unwrap_or_else(|| "client is blacklisted".to_string());
        let reason = expand_reason(&template, txt.as_deref(), &ip_text);
        self.add_gline(&ip_text, zone.duration, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reason_expansion() {
        assert_eq!(
            expand_reason("listed: %txt% (%ip%)", Some("spam source"), "1.2.3.4"),
            "listed: spam source (1.2.3.4)"
        );
        assert_eq!(
            expand_reason("listed: %txt%", None, "1.2.3.4"),
            "listed: (no-txt)"
        );
    }

    #[test]
    fn reverse_label_shapes() {
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(reverse_labels(&v4), "4.3.2.1.");
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let labels = reverse_labels(&v6);
        assert!(labels.starts_with("1.0.0.0."));
        assert_eq!(labels.matches('.').count(), 32);
        assert!(labels.ends_with("0.2."));
    }

    #[test]
    fn host_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.2.3.4 known abuse source").unwrap();
        writeln!(file, "bad.example.org").unwrap();
        writeln!(file).unwrap();
        let hosts = load_host_file(file.path(), "client is blacklisted");
        assert_eq!(hosts.get("1.2.3.4").map(String::as_str), Some("known abuse source"));
        assert_eq!(
            hosts.get("bad.example.org").map(String::as_str),
            Some("client is blacklisted")
        );
    }

    #[test]
    fn reply_mask_example() {
        // Replies 127.0.0.2 and 127.0.0.4 produce mask 0x14; with a zone
        // mask of 0x0E the intersection is bit 2.
        let mut mask = 0u32;
        for last_octet in [2u8, 4u8] {
            mask |= 1 << last_octet;
        }
        assert_eq!(mask, 0x14);
        assert_eq!(mask & 0x0E, 0x04);
    }
}

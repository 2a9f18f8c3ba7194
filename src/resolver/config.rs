//! Resolver configuration sources: `resolv.conf` and the services table.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use tracing::warn;

/// Parsed `resolv.conf`-style settings, after any overrides.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    pub nameservers: Vec<SocketAddr>,
    pub search: Vec<String>,
    /// Dots needed in a name before the search list is skipped.
    pub ndots: usize,
    /// Base retransmit timeout in seconds.
    pub timeout: u64,
    /// Retransmissions before giving up.
    pub attempts: u8,
    /// EDNS0 advertised payload size; zero disables the OPT record.
    pub edns0: u16,
    pub bind_address: Option<SocketAddr>,
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            search: Vec::new(),
            ndots: 1,
            timeout: 3,
            attempts: 3,
            edns0: 0,
            bind_address: None,
        }
    }
}

impl ResolvConf {
    /// Parse a `resolv.conf` file. A missing file yields the BIND default
    /// of localhost.
    pub fn load(path: &Path) -> Self {
        let mut conf = Self::default();
        let mut domain = None;
        match std::fs::read_to_string(path) {
            Ok(content) => {
                for line in content.lines() {
                    let mut words = line.split_whitespace();
                    match words.next() {
                        Some("nameserver") => {
                            for ns in words {
                                conf.push_nameserver(ns);
                            }
                        }
                        Some("domain") => {
                            domain = words.next().map(str::to_string);
                        }
                        Some("search") => {
                            conf.search = words.map(str::to_string).collect();
                        }
                        Some("options") => {
                            for opt in words {
                                conf.apply_option(opt);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to read resolver config");
                conf.push_nameserver("127.0.0.1");
            }
        }
        if conf.search.is_empty() {
            if let Some(domain) = domain {
                conf.search.push(domain);
            }
        }
        if conf.nameservers.is_empty() {
            conf.push_nameserver("127.0.0.1");
        }
        conf
    }

    pub fn push_nameserver(&mut self, text: &str) {
        match text.parse::<IpAddr>() {
            Ok(ip) => self.nameservers.push(SocketAddr::new(ip, 53)),
            Err(_) => match text.parse::<SocketAddr>() {
                Ok(addr) => self.nameservers.push(addr),
                Err(_) => warn!(nameserver = text, "ignoring unparsable nameserver"),
            },
        }
    }

    fn apply_option(&mut self, opt: &str) {
        match opt.split_once(':') {
            Some(("timeout", v)) => self.timeout = v.parse().unwrap_or(self.timeout),
            Some(("attempts", v)) => self.attempts = v.parse().unwrap_or(self.attempts),
            Some(("ndots", v)) => self.ndots = v.parse().unwrap_or(self.ndots),
            Some(("edns0", v)) => self.edns0 = v.parse().unwrap_or(1440),
            None if opt == "edns0" => self.edns0 = 1440,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Default)]
struct ServiceEntry {
    port: Option<u16>,
    /// Known to publish DNS-SD SRV records.
    srv: bool,
}

/// Service name/port mappings from `/etc/services` plus the DNS-SD SRV
/// whitelist.
#[derive(Debug, Default)]
pub struct Services {
    by_name: HashMap<(String, Proto), ServiceEntry>,
    by_port: HashMap<(u16, Proto), String>,
}

/// TCP services known to publish SRV records (a portion of the dns-sd.org
/// registry).
const TCP_SRV: &[&str] = &[
    "cvspserver", "distcc", "ftp", "http", "imap", "ipp", "irc", "ldap", "login", "nfs", "pop3",
    "postgresql", "rsync", "sftp-ssh", "soap", "ssh", "telnet", "webdav", "xmpp-client",
    "xmpp-server", "xul-http",
];

const UDP_SRV: &[&str] = &["bootps", "dns-update", "domain", "nfs", "ntp", "tftp"];

impl Services {
    /// Load the services file and mark the SRV-capable names.
    pub fn load(path: &Path) -> Self {
        let mut services = Self::default();
        if let Ok(content) = std::fs::read_to_string(path) {
            for line in content.lines() {
                let line = line.split('#').next().unwrap_or("");
                let mut words = line.split_whitespace();
                let Some(name) = words.next() else { continue };
                let Some(portproto) = words.next() else { continue };
                let Some((port, proto)) = portproto.split_once('/') else {
                    continue;
                };
                let Ok(port) = port.parse::<u16>() else { continue };
                let proto = match proto {
                    "tcp" => Proto::Tcp,
                    "udp" => Proto::Udp,
                    _ => continue,
                };
                services.insert(name, port, proto, true);
                for alias in words {
                    services.insert(alias, port, proto, false);
                }
            }
        }
        for name in TCP_SRV {
            services
                .by_name
                .entry((name.to_string(), Proto::Tcp))
                .or_default()
                .srv = true;
        }
        for name in UDP_SRV {
            services
                .by_name
                .entry((name.to_string(), Proto::Udp))
                .or_default()
                .srv = true;
        }
        services
    }

    fn insert(&mut self, name: &str, port: u16, proto: Proto, canonical: bool) {
        let entry = self
            .by_name
            .entry((name.to_ascii_lowercase(), proto))
            .or_default();
        // First binding wins; aliases frequently duplicate.
        if entry.port.is_none() {
            entry.port = Some(port);
        }
        if canonical {
            self.by_port.entry((port, proto)).or_insert_with(|| name.to_string());
        }
    }

    pub fn port_by_name(&self, name: &str, proto: Proto) -> Option<u16> {
        self.by_name
            .get(&(name.to_ascii_lowercase(), proto))
            .and_then(|e| e.port)
    }

    pub fn name_by_port(&self, port: u16, proto: Proto) -> Option<&str> {
        self.by_port.get(&(port, proto)).map(String::as_str)
    }

    pub fn wants_srv(&self, name: &str, proto: Proto) -> bool {
        self.by_name
            .get(&(name.to_ascii_lowercase(), proto))
            .map(|e| e.srv)
            .unwrap_or(false)
    }
}

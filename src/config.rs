//! Configuration loading and management.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Our own server identity.
    pub server: ServerConfig,
    /// The hub we link to.
    pub uplink: UplinkConfig,
    /// Stub resolver settings.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Proxy scanner settings.
    #[serde(default)]
    pub sockcheck: SockcheckConfig,
    /// DNS blacklist settings.
    #[serde(default)]
    pub dnsbl: DnsblConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name shown on the network.
    pub name: String,
    pub description: String,
    /// Server numnick (the numeric prefix, as an integer).
    pub numeric: u32,
    /// Sizes the local-numeric mask (rounded up to a power of two).
    #[serde(default = "default_max_users")]
    pub max_users: u32,
    /// Always use the wide (2+3 digit) numeric form.
    #[serde(default = "default_true")]
    pub force_n2k: bool,
    /// Keep our clock instead of adopting an older uplink's.
    #[serde(default)]
    pub reliable_clock: bool,
    /// Seconds of idle before we ping the uplink.
    #[serde(default = "default_ping_freq")]
    pub ping_freq: u64,
    /// Seconds to wait for the reply before squitting.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    /// WHOIS server masking for non-opers.
    pub his_servername: Option<String>,
    pub his_servercomment: Option<String>,
    /// Suffix for account-based hidden hosts.
    pub hidden_host: Option<String>,
    /// ADMIN reply lines (up to three are shown).
    #[serde(default)]
    pub admin: Vec<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    pub host: String,
    pub port: u16,
    /// Password we send.
    pub password: String,
    /// Password we require back; unset accepts anything.
    pub their_password: Option<String>,
    /// Reconnect attempts per cycle; zero retries forever.
    #[serde(default)]
    pub max_tries: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResolverConfig {
    /// Path to a resolv.conf-format file.
    pub resolv_conf: Option<String>,
    /// Path to a services file.
    pub services: Option<String>,
    /// Overrides the file's nameserver list.
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Overrides the file's search list.
    pub search: Option<Vec<String>>,
    pub timeout: Option<u64>,
    pub attempts: Option<u8>,
    pub ndots: Option<usize>,
    pub edns0: Option<u16>,
    pub bind_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SockcheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Test definition file in the nested record format.
    #[serde(default = "default_sockcheck_file")]
    pub file: String,
    #[serde(default = "default_sockcheck_clients")]
    pub max_clients: usize,
    #[serde(default = "default_sockcheck_read")]
    pub max_read: usize,
    /// Seconds a rejection (and its gline) stays valid.
    #[serde(default = "default_gline_duration")]
    pub gline_duration: i64,
    /// Seconds an accept verdict is cached.
    #[serde(default = "default_cache_age")]
    pub max_cache_age: i64,
    /// Source address for probe connections.
    pub address: Option<String>,
}

impl Default for SockcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_sockcheck_file(),
            max_clients: default_sockcheck_clients(),
            max_read: default_sockcheck_read(),
            gline_duration: default_gline_duration(),
            max_cache_age: default_cache_age(),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DnsblConfig {
    #[serde(default)]
    pub zones: Vec<DnsblZoneConfig>,
    /// Static host list file (`pattern [reason]` lines).
    pub file: Option<String>,
    pub file_reason: Option<String>,
    #[serde(default = "default_gline_duration")]
    pub gline_duration: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsblZoneConfig {
    pub zone: String,
    /// Interesting reply-octet bits; defaults to everything.
    #[serde(default = "default_zone_mask")]
    pub mask: u32,
    #[serde(default = "default_gline_duration")]
    pub duration: i64,
    pub reason: Option<String>,
    /// Per-octet reasons keyed by the octet value ("2" = 127.0.0.2).
    #[serde(default)]
    pub reasons: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_max_users() -> u32 {
    4096
}

fn default_ping_freq() -> u64 {
    120
}

fn default_ping_timeout() -> u64 {
    30
}

fn default_sockcheck_file() -> String {
    "sockcheck.conf".to_string()
}

fn default_sockcheck_clients() -> usize {
    32
}

fn default_sockcheck_read() -> usize {
    1024
}

fn default_gline_duration() -> i64 {
    3600
}

fn default_cache_age() -> i64 {
    60
}

fn default_zone_mask() -> u32 {
    !0
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(Path::new(path))?;
        Ok(toml::from_str(&content)?)
    }
}

impl ServerConfig {
    /// Combined wire numeric: prefix digits plus the client mask.
    ///
    /// The mask is the smallest power-of-two-minus-one that covers
    /// `max_users`.
    pub fn wire_numeric(&self) -> String {
        let mut usermask: u32 = 4;
        while usermask < self.max_users {
            usermask <<= 1;
        }
        usermask -= 1;
        if self.numeric < 64 && usermask < 4096 && !self.force_n2k {
            crate::numeric::int_to_base64((self.numeric << 12) + (usermask & 0x0fff), 3)
        } else {
            crate::numeric::int_to_base64((self.numeric << 18) + (usermask & 0x3ffff), 5)
        }
    }
}

/// Validate the configuration; errors are fatal at startup.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if config.server.name.is_empty() || !config.server.name.contains('.') {
        errors.push("server.name must be a dotted server name".to_string());
    }
    if config.server.description.is_empty() {
        errors.push("server.description must not be empty".to_string());
    }
    if config.server.numeric >= 4096 {
        errors.push("server.numeric must fit in two base64 digits".to_string());
    }
    if config.server.ping_freq == 0 || config.server.ping_timeout == 0 {
        errors.push("server ping intervals must be nonzero".to_string());
    }
    if config.uplink.host.is_empty() {
        errors.push("uplink.host must not be empty".to_string());
    }
    if config.uplink.port == 0 {
        errors.push("uplink.port must not be zero".to_string());
    }
    if config.uplink.password.is_empty() {
        errors.push("uplink.password must not be empty".to_string());
    }
    if let Some(addr) = &config.sockcheck.address {
        if addr.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("sockcheck.address {:?} is not an IP address", addr));
        }
    }
    for zone in &config.dnsbl.zones {
        if zone.zone.is_empty() {
            errors.push("dnsbl zone with empty suffix".to_string());
        }
        for key in zone.reasons.keys() {
            if key.parse::<u8>().is_err() {
                errors.push(format!(
                    "dnsbl zone {}: reason key {:?} is not an octet value",
                    zone.zone, key
                ));
            }
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

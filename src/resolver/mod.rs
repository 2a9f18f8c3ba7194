//! Asynchronous stub resolver.
//!
//! A single UDP socket carries every outstanding query. Requests are keyed
//! by a 16-bit id unique among outstanding requests; each send goes to all
//! configured nameservers and re-arms an exponential retransmit deadline.
//! Replies are matched by id and source address; anything else is counted
//! against the nameserver and dropped. Cancellation is dropping the query
//! future: the request leaves the table and a late reply becomes an orphan.

pub mod config;
pub mod wire;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use config::{Proto, ResolvConf, Services};
use wire::{Header, Rr};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("the requested address family is not supported")]
    Family,
    #[error("unknown name or service")]
    NoName,
    #[error("the service is unavailable for that socket type")]
    Service,
    #[error("the host has no addresses at all")]
    NoData,
    #[error("the nameserver indicated an error (rcode {0})")]
    Rcode(u16),
    #[error("request timed out")]
    TimedOut,
    #[error("mismatch between reverse and forward resolution")]
    Mismatch,
    #[error("query could not be encoded")]
    BadQuery,
    #[error("resolver socket failure: {0}")]
    Socket(#[from] std::io::Error),
}

/// A parsed response: header, records, and the raw datagram for rdata
/// extraction.
pub struct Answer {
    pub header: Header,
    pub records: Vec<Rr>,
    pub raw: Vec<u8>,
}

struct Pending {
    body: Vec<u8>,
    tx: Option<oneshot::Sender<Result<Answer, ResolveError>>>,
    retries: u8,
    deadline: Instant,
}

#[derive(Default, Debug)]
#[allow(dead_code)] // Surfaced by the stats service command.
struct NsStats {
    req_sent: u64,
    resp_used: u64,
    resp_ignored: u64,
    resp_scrambled: u64,
}

pub struct Resolver {
    socket: UdpSocket,
    conf: ResolvConf,
    services: Services,
    pending: DashMap<u16, Pending>,
    stats: DashMap<SocketAddr, NsStats>,
}

impl Resolver {
    /// Bind the resolver socket and start its driver tasks.
    pub async fn start(conf: ResolvConf, services: Services) -> std::io::Result<Arc<Resolver>> {
        let bind = conf.bind_address.unwrap_or_else(|| {
            let v6 = conf
                .nameservers
                .first()
                .map(|ns| ns.is_ipv6())
                .unwrap_or(false);
            if v6 {
                "[::]:0".parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            }
        });
        let socket = UdpSocket::bind(bind).await?;
        let resolver = Arc::new(Resolver {
            socket,
            conf,
            services,
            pending: DashMap::new(),
            stats: DashMap::new(),
        });
        tokio::spawn(recv_loop(resolver.clone()));
        tokio::spawn(retry_loop(resolver.clone()));
        Ok(resolver)
    }

    fn timeout_for(&self, retries: u8) -> Duration {
        Duration::from_secs(self.conf.timeout << retries.min(6))
    }

    async fn send_to_all(&self, body: &[u8]) {
        for ns in &self.conf.nameservers {
            match self.socket.send_to(body, ns).await {
                Ok(sent) => {
                    self.stats.entry(*ns).or_default().req_sent += 1;
                    debug!(bytes = sent, nameserver = %ns, "sent query");
                }
                Err(err) => {
                    warn!(nameserver = %ns, error = %err, "unable to send query");
                }
            }
        }
    }

    /// Issue one DNS query and await the matching response.
    pub async fn query(self: &Arc<Self>, questions: &[(&str, u16)]) -> Result<Answer, ResolveError> {
        let (tx, rx) = oneshot::channel();
        // Ids must not collide with outstanding requests.
        let id = loop {
            let candidate = rand::random::<u16>();
            if let dashmap::Entry::Vacant(slot) = self.pending.entry(candidate) {
                slot.insert(Pending {
                    body: Vec::new(),
                    tx: Some(tx),
                    retries: 1,
                    deadline: Instant::now() + self.timeout_for(1),
                });
                break candidate;
            }
        };
        let body = match wire::build_query(id, questions, self.conf.edns0) {
            Some(body) => body,
            None => {
                self.pending.remove(&id);
                return Err(ResolveError::BadQuery);
            }
        };
        if let Some(mut entry) = self.pending.get_mut(&id) {
            entry.body = body.clone();
        }
        self.send_to_all(&body).await;

        let guard = AbortGuard {
            resolver: self.clone(),
            id,
        };
        let result = rx.await.map_err(|_| ResolveError::TimedOut)?;
        drop(guard);
        result
    }

    // ------------------------------------------------------------------
    // getaddr

    /// Forward resolution with service and search-list handling.
    #[allow(dead_code)] // Service modules resolve through this.
    pub async fn getaddr(
        self: &Arc<Self>,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrHints,
    ) -> Result<Vec<AddrInfo>, ResolveError> {
        if node.is_none() && service.is_none() {
            return Err(ResolveError::NoName);
        }
        let proto = hints.socktype;
        let family = hints.family.unwrap_or(Family::V4);

        let port = match service {
            None => 0,
            Some(text) => match text.parse::<u16>() {
                Ok(port) => port,
                Err(_) => self
                    .services
                    .port_by_name(text, proto)
                    .ok_or(ResolveError::Service)?,
            },
        };

        let node = node.unwrap_or(match (hints.passive, family) {
            (true, Family::V4) => "0.0.0.0",
            (true, Family::V6) => "::",
            (false, Family::V4) => "127.0.0.1",
            (false, Family::V6) => "::1",
        });

        // Numeric fast path.
        if let Ok(ip) = node.parse::<IpAddr>() {
            return Ok(vec![AddrInfo {
                addr: SocketAddr::new(ip, port),
                canonname: hints.canonname.then(|| ip.to_string()),
            }]);
        }
        if hints.numeric_host {
            return Err(ResolveError::NoName);
        }

        // Optional DNS-SD SRV prefix.
        let srv_prefix = if hints.nosrv || service.is_none() {
            None
        } else {
            let svc = service.unwrap();
            let proto_label = if proto == Proto::Udp { "udp" } else { "tcp" };
            if self.services.wants_srv(svc, proto) || hints.forcesrv {
                Some(format!("_{}._{}.", svc, proto_label))
            } else {
                None
            }
        };

        // Names with enough dots skip the search list entirely.
        let dots = node.chars().filter(|&c| c == '.').count();
        let start = if dots >= self.conf.ndots {
            self.conf.search.len()
        } else {
            0
        };

        for search_pos in start..=self.conf.search.len() {
            let plain = if search_pos < self.conf.search.len() {
                format!("{}.{}", node, self.conf.search[search_pos])
            } else {
                node.to_string()
            };
            let srv_name = srv_prefix.as_ref().map(|p| format!("{}{}", p, plain));

            let mut questions: Vec<(&str, u16)> = Vec::new();
            if hints.all {
                questions.push((&plain, wire::QTYPE_ALL));
            } else {
                match family {
                    Family::V4 => questions.push((&plain, wire::TYPE_A)),
                    Family::V6 => {
                        questions.push((&plain, wire::TYPE_AAAA));
                        if hints.v4mapped {
                            questions.push((&plain, wire::TYPE_A));
                        }
                    }
                }
                if let Some(srv) = &srv_name {
                    questions.push((srv.as_str(), wire::TYPE_SRV));
                }
            }

            let answer = self.query(&questions).await?;
            let mut results = Vec::new();
            for idx in 0..answer.header.ancount as usize {
                decode_addr(&answer, idx, family, hints, port, &mut results, 0);
            }
            if !results.is_empty() {
                return Ok(results);
            }
            // No usable answers: fall through to the next search suffix.
        }
        Err(ResolveError::NoName)
    }

    // ------------------------------------------------------------------
    // getname

    /// Reverse resolution, optionally paranoid (forward-confirmed).
    #[allow(dead_code)] // Service modules resolve through this.
    pub async fn getname(
        self: &Arc<Self>,
        addr: &SocketAddr,
        flags: &NameFlags,
    ) -> Result<(String, String), ResolveError> {
        let proto = if flags.dgram { Proto::Udp } else { Proto::Tcp };
        let service = if flags.numeric_serv {
            addr.port().to_string()
        } else {
            self.services
                .name_by_port(addr.port(), proto)
                .map(str::to_string)
                .unwrap_or_else(|| addr.port().to_string())
        };
        if flags.numeric_host {
            return Ok((addr.ip().to_string(), service));
        }

        let ptr_names: Vec<String> = match addr.ip() {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                vec![format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])]
            }
            IpAddr::V6(v6) => {
                let mut labels = String::new();
                for byte in v6.octets().iter().rev() {
                    labels.push_str(&format!("{:x}.{:x}.", byte & 15, byte >> 4));
                }
                // ip6.int is the legacy fallback when ip6.arpa fails.
                vec![format!("{}ip6.arpa", labels), format!("{}ip6.int", labels)]
            }
        };

        let mut hostname = None;
        let mut last_err = ResolveError::NoName;
        for ptr_name in &ptr_names {
            match self.query(&[(ptr_name.as_str(), wire::TYPE_PTR)]).await {
                Ok(answer) => {
                    for rr in answer.records.iter().take(answer.header.ancount as usize) {
                        if rr.rtype == wire::TYPE_PTR
                            && rr.class == wire::CLASS_IN
                            && rr.name.eq_ignore_ascii_case(ptr_name)
                        {
                            let mut pos = rr.rd_start;
                            hostname = wire::extract_name(&answer.raw, &mut pos);
                            break;
                        }
                    }
                    if hostname.is_some() {
                        break;
                    }
                    return Err(ResolveError::NoName);
                }
                Err(err) => last_err = err,
            }
        }
        let Some(hostname) = hostname else {
            return Err(last_err);
        };

        if flags.paranoid {
            // The claimed name must resolve back to the address it named.
            let qtype = if addr.is_ipv4() {
                wire::TYPE_A
            } else {
                wire::TYPE_AAAA
            };
            let answer = self.query(&[(&hostname, qtype)]).await?;
            let original: Vec<u8> = match addr.ip() {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            let confirmed = answer
                .records
                .iter()
                .take(answer.header.ancount as usize)
                .filter(|rr| rr.class == wire::CLASS_IN && rr.name.eq_ignore_ascii_case(&hostname))
                .any(|rr| rr.rdata(&answer.raw, original.len()) == Some(original.as_slice()));
            if !confirmed {
                return Err(ResolveError::Mismatch);
            }
        }
        Ok((hostname, service))
    }
}

/// Removes the request from the table when a query future is dropped.
struct AbortGuard {
    resolver: Arc<Resolver>,
    id: u16,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.resolver.pending.remove(&self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Family {
    V4,
    V6,
}

/// Hints for [`Resolver::getaddr`].
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct AddrHints {
    pub family: Option<Family>,
    pub socktype: Proto,
    /// Only translate a numeric address, never query.
    pub numeric_host: bool,
    /// Fill in canonical names.
    pub canonname: bool,
    /// Use the unspecified address when no node is given.
    pub passive: bool,
    /// Accept v4-mapped answers for V6 requests.
    pub v4mapped: bool,
    /// Ask for every record type at once.
    pub all: bool,
    /// Never prepend a `_service._proto.` SRV label.
    pub nosrv: bool,
    /// Always prepend one, even for unknown services.
    pub forcesrv: bool,
}

impl Default for AddrHints {
    fn default() -> Self {
        Self {
            family: None,
            socktype: Proto::Tcp,
            numeric_host: false,
            canonname: false,
            passive: false,
            v4mapped: false,
            all: false,
            nosrv: false,
            forcesrv: false,
        }
    }
}

/// Flags for [`Resolver::getname`].
#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct NameFlags {
    pub numeric_host: bool,
    pub numeric_serv: bool,
    pub dgram: bool,
    /// Forward-confirm the PTR result.
    pub paranoid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub struct AddrInfo {
    pub addr: SocketAddr,
    pub canonname: Option<String>,
}

/// Decode one answer record into socket addresses, following CNAME
/// indirection within the same packet.
fn decode_addr(
    answer: &Answer,
    idx: usize,
    family: Family,
    hints: &AddrHints,
    port: u16,
    results: &mut Vec<AddrInfo>,
    depth: u8,
) {
    if depth > 4 {
        return;
    }
    let Some(rr) = answer.records.get(idx) else {
        return;
    };
    match rr.rtype {
        wire::TYPE_A => {
            let Some(data) = rr.rdata(&answer.raw, 4) else {
                return;
            };
            let v4 = std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let ip = if family == Family::V6 && hints.v4mapped && !hints.all {
                IpAddr::V6(v4.to_ipv6_mapped())
            } else {
                IpAddr::V4(v4)
            };
            results.push(AddrInfo {
                addr: SocketAddr::new(ip, port),
                canonname: hints.canonname.then(|| rr.name.clone()),
            });
        }
        wire::TYPE_AAAA => {
            if family == Family::V4 && !hints.all {
                return;
            }
            let Some(data) = rr.rdata(&answer.raw, 16) else {
                return;
            };
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            results.push(AddrInfo {
                addr: SocketAddr::new(IpAddr::V6(octets.into()), port),
                canonname: hints.canonname.then(|| rr.name.clone()),
            });
        }
        wire::TYPE_CNAME => {
            // The canonical target should appear among the other answers in
            // the same packet; a missing indirect target is tolerated.
            let mut pos = rr.rd_start;
            let Some(target) = wire::extract_name(&answer.raw, &mut pos) else {
                return;
            };
            for (other_idx, other) in answer
                .records
                .iter()
                .enumerate()
                .take(answer.header.ancount as usize)
            {
                if other.name.eq_ignore_ascii_case(&target) {
                    decode_addr(answer, other_idx, family, hints, port, results, depth + 1);
                }
            }
        }
        _ => {}
    }
}

async fn recv_loop(resolver: Arc<Resolver>) {
    let buf_len = std::cmp::max(512, resolver.conf.edns0 as usize);
    let mut buf = vec![0u8; buf_len];
    loop {
        let (len, src) = match resolver.socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "resolver socket receive failed");
                continue;
            }
        };
        // Replies must come from one of our nameservers.
        if !resolver.conf.nameservers.contains(&src) {
            continue;
        }
        let Some(hdr) = Header::parse(&buf[..len]) else {
            resolver.stats.entry(src).or_default().resp_ignored += 1;
            continue;
        };
        if !hdr.is_response() {
            resolver.stats.entry(src).or_default().resp_ignored += 1;
            continue;
        }
        let Some((_, mut pending)) = resolver.pending.remove(&hdr.id) else {
            // Orphaned: the request finished, timed out, or was aborted.
            resolver.stats.entry(src).or_default().resp_ignored += 1;
            continue;
        };
        let raw = buf[..len].to_vec();
        let result = if hdr.rcode() != 0 {
            Err(ResolveError::Rcode(hdr.rcode()))
        } else {
            match wire::parse_records(&raw, &hdr) {
                Some(records) => {
                    resolver.stats.entry(src).or_default().resp_used += 1;
                    Ok(Answer {
                        header: hdr,
                        records,
                        raw,
                    })
                }
                None => {
                    resolver.stats.entry(src).or_default().resp_scrambled += 1;
                    Err(ResolveError::Rcode(1))
                }
            }
        };
        if let Some(tx) = pending.tx.take() {
            let _ = tx.send(result);
        }
    }
}

async fn retry_loop(resolver: Arc<Resolver>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let now = Instant::now();
        let expired: Vec<u16> = resolver
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for id in expired {
            let give_up = match resolver.pending.get(&id) {
                Some(entry) => entry.retries >= resolver.conf.attempts,
                None => continue,
            };
            if give_up {
                if let Some((_, mut pending)) = resolver.pending.remove(&id) {
                    debug!(id, "request timed out");
                    if let Some(tx) = pending.tx.take() {
                        let _ = tx.send(Err(ResolveError::TimedOut));
                    }
                }
            } else {
                let body = match resolver.pending.get_mut(&id) {
                    Some(mut entry) => {
                        entry.retries += 1;
                        entry.deadline = now + resolver.timeout_for(entry.retries);
                        entry.body.clone()
                    }
                    None => continue,
                };
                resolver.send_to_all(&body).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_from(raw: Vec<u8>) -> Answer {
        let header = Header::parse(&raw).unwrap();
        let records = wire::parse_records(&raw, &header).unwrap();
        Answer {
            header,
            records,
            raw,
        }
    }

    fn fake_response(questions: &[(&str, u16)], answers: &[(&str, u16, Vec<u8>)]) -> Answer {
        let mut pkt = wire::build_query(1, questions, 0).unwrap();
        pkt[2] |= 0x80; // QR
        pkt[6] = (answers.len() >> 8) as u8;
        pkt[7] = (answers.len() & 0xff) as u8;
        for (name, rtype, rdata) in answers {
            // Names in answers are written uncompressed for simplicity.
            for label in name.split('.') {
                pkt.push(label.len() as u8);
                pkt.extend_from_slice(label.as_bytes());
            }
            pkt.push(0);
            pkt.extend_from_slice(&rtype.to_be_bytes());
            pkt.extend_from_slice(&wire::CLASS_IN.to_be_bytes());
            pkt.extend_from_slice(&60u32.to_be_bytes());
            pkt.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            pkt.extend_from_slice(rdata);
        }
        answer_from(pkt)
    }

    #[test]
    fn decode_a_record() {
        let answer = fake_response(
            &[("host.example.com", wire::TYPE_A)],
            &[("host.example.com", wire::TYPE_A, vec![10, 1, 2, 3])],
        );
        let mut results = Vec::new();
        decode_addr(
            &answer,
            0,
            Family::V4,
            &AddrHints::default(),
            6667,
            &mut results,
            0,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].addr, "10.1.2.3:6667".parse().unwrap());
    }

    #[test]
    fn decode_follows_cname() {
        let mut cname_rdata = Vec::new();
        for label in "real.example.com".split('.') {
            cname_rdata.push(label.len() as u8);
            cname_rdata.extend_from_slice(label.as_bytes());
        }
        cname_rdata.push(0);
        let answer = fake_response(
            &[("alias.example.com", wire::TYPE_A)],
            &[
                ("alias.example.com", wire::TYPE_CNAME, cname_rdata),
                ("real.example.com", wire::TYPE_A, vec![192, 0, 2, 7]),
            ],
        );
        let mut results = Vec::new();
        decode_addr(
            &answer,
            0,
            Family::V4,
            &AddrHints::default(),
            80,
            &mut results,
            0,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].addr.ip().to_string(), "192.0.2.7");
    }

    #[test]
    fn decode_missing_cname_target_is_tolerated() {
        let mut cname_rdata = Vec::new();
        for label in "gone.example.com".split('.') {
            cname_rdata.push(label.len() as u8);
            cname_rdata.extend_from_slice(label.as_bytes());
        }
        cname_rdata.push(0);
        let answer = fake_response(
            &[("alias.example.com", wire::TYPE_A)],
            &[("alias.example.com", wire::TYPE_CNAME, cname_rdata)],
        );
        let mut results = Vec::new();
        decode_addr(
            &answer,
            0,
            Family::V4,
            &AddrHints::default(),
            80,
            &mut results,
            0,
        );
        assert!(results.is_empty());
    }

    #[test]
    fn v4_mapped_answers() {
        let answer = fake_response(
            &[("host.example.com", wire::TYPE_A)],
            &[("host.example.com", wire::TYPE_A, vec![10, 0, 0, 1])],
        );
        let hints = AddrHints {
            family: Some(Family::V6),
            v4mapped: true,
            ..Default::default()
        };
        let mut results = Vec::new();
        decode_addr(&answer, 0, Family::V6, &hints, 0, &mut results, 0);
        assert_eq!(results[0].addr.ip().to_string(), "::ffff:10.0.0.1");
    }

    #[tokio::test]
    async fn numeric_fast_path_and_service_lookup() {
        let mut conf = ResolvConf::default();
        conf.push_nameserver("127.0.0.1");
        let resolver = Resolver::start(conf, Services::default()).await.unwrap();

        let got = resolver
            .getaddr(Some("192.0.2.1"), Some("6667"), &AddrHints::default())
            .await
            .unwrap();
        assert_eq!(got[0].addr, "192.0.2.1:6667".parse().unwrap());

        // Unknown service names fail synchronously.
        let err = resolver
            .getaddr(Some("192.0.2.1"), Some("no-such-svc"), &AddrHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Service));

        // Numeric-only mode refuses real names.
        let hints = AddrHints {
            numeric_host: true,
            ..Default::default()
        };
        let err = resolver
            .getaddr(Some("host.example.com"), None, &hints)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoName));
    }

    #[tokio::test]
    async fn numeric_getname() {
        let mut conf = ResolvConf::default();
        conf.push_nameserver("127.0.0.1");
        let resolver = Resolver::start(conf, Services::default()).await.unwrap();
        let flags = NameFlags {
            numeric_host: true,
            numeric_serv: true,
            ..Default::default()
        };
        let (host, serv) = resolver
            .getname(&"10.2.3.4:6667".parse().unwrap(), &flags)
            .await
            .unwrap();
        assert_eq!(host, "10.2.3.4");
        assert_eq!(serv, "6667");
    }

    #[test]
    fn reverse_name_shapes() {
        // The PTR label construction is inlined in getname; verify the v4
        // form via a quick reimplementation guard.
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        if let IpAddr::V4(v4) = v4 {
            let o = v4.octets();
            assert_eq!(
                format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0]),
                "4.3.2.1.in-addr.arpa"
            );
        }
    }
}

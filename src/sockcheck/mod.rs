//! Insecure-proxy scanner.
//!
//! New connections are probed with a configured battery of TCP tests, each
//! a small Mealy machine: send a template, race the configured responses
//! against the reply bytes, follow the matching arm. Rejection glines the
//! address and promotes the winning test to the head of the list so future
//! targets hit it first. Results are cached per presentation IP.

pub mod parser;
pub mod template;

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::glines::GlineStore;
use crate::state::Network;
use crate::uplink::Outbox;

use parser::{Decision, Test, TestList, TestState};
use template::{Cursor, CursorStatus, ExpandCtx};

#[derive(Debug, Clone)]
pub struct SockcheckConf {
    pub max_clients: usize,
    pub max_read: usize,
    pub gline_duration: i64,
    pub max_cache_age: i64,
    pub bind_address: Option<IpAddr>,
}

impl Default for SockcheckConf {
    fn default() -> Self {
        Self {
            max_clients: 32,
            max_read: 1024,
            gline_duration: 3600,
            max_cache_age: 60,
            bind_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Checking,
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub addr: IpAddr,
    pub decision: CacheDecision,
    pub reason: Option<String>,
    pub last_touched: i64,
}

pub struct Scanner {
    conf: SockcheckConf,
    /// Current test list; cloned-and-swapped on mutation so in-flight
    /// clients keep their own snapshot.
    tests: Mutex<Arc<TestList>>,
    /// Keyed by presentation IP.
    cache: DashMap<String, CacheEntry>,
    pending: Mutex<VecDeque<IpAddr>>,
    /// IPs with a live client working on them.
    active: Mutex<HashSet<String>>,
    num_clients: AtomicUsize,
    checked: AtomicU64,
    detected: AtomicU64,
    glines: Arc<Mutex<GlineStore>>,
    out: Arc<dyn Outbox>,
    self_numeric: String,
    clock: Clock,
    uplink_host: String,
}

enum Attempt {
    Accept,
    Reject(String),
}

impl Scanner {
    pub fn new(
        conf: SockcheckConf,
        tests: TestList,
        glines: Arc<Mutex<GlineStore>>,
        out: Arc<dyn Outbox>,
        self_numeric: String,
        clock: Clock,
        uplink_host: String,
    ) -> Arc<Scanner> {
        Arc::new(Scanner {
            conf,
            tests: Mutex::new(Arc::new(tests)),
            cache: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashSet::new()),
            num_clients: AtomicUsize::new(0),
            checked: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            glines,
            out,
            self_numeric,
            clock,
            uplink_host,
        })
    }

    /// Replace the whole test list (a fresh definition file was issued).
    #[allow(dead_code)] // Bot command: defproxy.
    pub fn replace_tests(&self, tests: TestList) {
        *self.tests.lock() = Arc::new(tests);
    }

    #[allow(dead_code)] // Bot command: stats proxycheck.
    pub fn test_count(&self) -> usize {
        self.tests.lock().len()
    }

    /// New-user hook body: queue scannable addresses.
    pub fn check_user(self: &Arc<Self>, net: &Network, numeric: &str) {
        let Some(user) = net.users.get(numeric) else {
            return;
        };
        if !crate::numeric::ip_is_valid(&user.ip) || user.ip.is_loopback() {
            return;
        }
        // Users arriving in a burst were already connected; don't rescan
        // the whole network at every netjoin.
        if net
            .servers
            .get(&user.uplink)
            .map(|srv| srv.burst)
            .unwrap_or(true)
        {
            return;
        }
        self.queue_address(user.ip);
    }

    /// Queue one address for scanning, honoring the cache.
    pub fn queue_address(self: &Arc<Self>, addr: IpAddr) {
        let ip_text = addr.to_string();
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(&ip_text) {
            match entry.decision {
                CacheDecision::Checking => return,
                CacheDecision::Accept => {
                    if entry.last_touched + self.conf.max_cache_age >= now {
                        return;
                    }
                }
                CacheDecision::Reject => {
                    if entry.last_touched + self.conf.gline_duration >= now {
                        let reason = entry
                            .reason
                            .clone()
                            .unwrap_or_else(|| "insecure proxy".to_string());
                        drop(entry);
                        self.issue_gline(&ip_text, &reason);
                        return;
                    }
                }
            }
            drop(entry);
            self.cache.remove(&ip_text);
        }
        self.cache.insert(
            ip_text,
            CacheEntry {
                addr,
                decision: CacheDecision::Checking,
                reason: None,
                last_touched: now,
            },
        );
        self.pending.lock().push_back(addr);
        self.start_pending();
    }

    /// Remove a cached decision. Fails while the target is being checked.
    #[allow(dead_code)] // Bot command: clearhost.
    pub fn uncache_host(&self, name: &str) -> Result<bool, ()> {
        if let Some(entry) = self.cache.get(name) {
            if entry.decision == CacheDecision::Checking {
                return Err(());
            }
        }
        Ok(self.cache.remove(name).is_some())
    }

    pub fn cache_entry(&self, name: &str) -> Option<CacheEntry> {
        self.cache.get(name).map(|e| e.value().clone())
    }

    fn start_pending(self: &Arc<Self>) {
        loop {
            if self.num_clients.load(Ordering::Relaxed) >= self.conf.max_clients {
                return;
            }
            let Some(addr) = self.pending.lock().pop_front() else {
                return;
            };
            if self.tests.lock().is_empty() {
                return;
            }
            self.num_clients.fetch_add(1, Ordering::Relaxed);
            let scanner = self.clone();
            tokio::spawn(async move {
                run_client(scanner, addr).await;
            });
        }
    }

    fn issue_gline(&self, ip_text: &str, reason: &str) {
        let now = self.clock.now();
        info!(ip = ip_text, reason, "issuing gline for client");
        self.glines.lock().add(
            &*self.out,
            &self.self_numeric,
            "ProxyCheck",
            &format!("*@{}", ip_text),
            self.conf.gline_duration,
            reason,
            now,
            now,
            true,
            now,
        );
    }

    fn finish(self: &Arc<Self>, addr: IpAddr, outcome: Attempt, snapshot: &TestList, winner: usize) {
        let ip_text = addr.to_string();
        let now = self.clock.now();
        self.checked.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Attempt::Accept => {
                debug!(ip = %ip_text, "proxy check passed");
                self.cache.insert(
                    ip_text.clone(),
                    CacheEntry {
                        addr,
                        decision: CacheDecision::Accept,
                        reason: None,
                        last_touched: now,
                    },
                );
            }
            Attempt::Reject(reason) => {
                self.detected.fetch_add(1, Ordering::Relaxed);
                self.cache.insert(
                    ip_text.clone(),
                    CacheEntry {
                        addr,
                        decision: CacheDecision::Reject,
                        reason: Some(reason.clone()),
                        last_touched: now,
                    },
                );
                self.issue_gline(&ip_text, &reason);
                self.promote_test(snapshot, winner);
            }
        }
        self.active.lock().remove(&ip_text);
        self.num_clients.fetch_sub(1, Ordering::Relaxed);
        self.start_pending();
    }

    /// Move the winning test to the head so the hot proxy type is probed
    /// first. The shared list is cloned; running clients keep iterating
    /// their snapshot.
    fn promote_test(&self, snapshot: &TestList, winner: usize) {
        let Some(winner) = snapshot.get(winner) else {
            return;
        };
        let mut current = self.tests.lock();
        if current
            .first()
            .map(|head| Arc::ptr_eq(head, winner))
            .unwrap_or(false)
        {
            return;
        }
        let mut reordered: TestList = (**current).clone();
        if let Some(pos) = reordered.iter().position(|t| Arc::ptr_eq(t, winner)) {
            reordered.remove(pos);
        }
        reordered.insert(0, winner.clone());
        *current = Arc::new(reordered);
    }

    /// Expire cache entries past their TTL unless a client holds them.
    pub fn clean_cache(&self) {
        let now = self.clock.now();
        let active = self.active.lock().clone();
        self.cache.retain(|ip, entry| {
            let max_age = if entry.decision == CacheDecision::Reject {
                self.conf.gline_duration
            } else {
                self.conf.max_cache_age
            };
            entry.last_touched + max_age >= now || active.contains(ip)
        });
    }

    /// Spawn the periodic cache sweep.
    pub fn start_sweeper(self: &Arc<Self>) {
        let scanner = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(scanner.conf.max_cache_age.max(1) as u64);
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                scanner.clean_cache();
            }
        });
    }

    #[allow(dead_code)] // Bot command: stats proxycheck.
    pub fn stats(&self) -> ScannerStats {
        ScannerStats {
            checked: self.checked.load(Ordering::Relaxed),
            detected: self.detected.load(Ordering::Relaxed),
            clients: self.num_clients.load(Ordering::Relaxed),
            pending: self.pending.lock().len(),
            cached: self.cache.len(),
            tests: self.tests.lock().len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub struct ScannerStats {
    pub checked: u64,
    pub detected: u64,
    pub clients: usize,
    pub pending: usize,
    pub cached: usize,
    pub tests: usize,
}

async fn run_client(scanner: Arc<Scanner>, addr: IpAddr) {
    let ip_text = addr.to_string();
    scanner.active.lock().insert(ip_text.clone());
    let tests = scanner.tests.lock().clone();
    info!(ip = %ip_text, "proxy-checking client");

    for (test_index, test) in tests.iter().enumerate() {
        let mut rep = 0;
        while rep < test.reps {
            match run_attempt(&scanner, addr, test).await {
                Attempt::Accept => rep += 1,
                reject @ Attempt::Reject(_) => {
                    scanner.finish(addr, reject, &tests, test_index);
                    return;
                }
            }
        }
    }
    scanner.finish(addr, Attempt::Accept, &tests, 0);
}

async fn connect(scanner: &Scanner, target: SocketAddr, timeout: Duration) -> Option<TcpStream> {
    let attempt = async {
        match scanner.conf.bind_address {
            Some(local) => {
                let socket = if target.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .ok()?;
                socket.bind(SocketAddr::new(local, 0)).ok()?;
                socket.connect(target).await.ok()
            }
            None => TcpStream::connect(target).await.ok(),
        }
    };
    tokio::time::timeout(timeout, attempt).await.ok().flatten()
}

/// One connection attempt: drive the test's state machine to a decision.
async fn run_attempt(scanner: &Arc<Scanner>, addr: IpAddr, test: &Arc<Test>) -> Attempt {
    let ctx = ExpandCtx {
        client_ip: addr,
        port: test.port,
        uplink_host: scanner.uplink_host.clone(),
    };
    let timeout = Duration::from_secs(test.timeout);
    let target = SocketAddr::new(addr, test.port);

    // Connection refusals, unreachable hosts, and timeouts all funnel into
    // the entry state's catch-all path.
    let mut stream = connect(scanner, target, timeout).await;
    if stream.is_some() {
        debug!(ip = %addr, port = test.port, "connected for proxy check");
    }
    let mut state: Arc<TestState> = test.entry.clone();
    let mut buf: Vec<u8> = Vec::new();
    let mut consumed = 0usize;

    loop {
        match state.kind {
            Decision::Accept => return Attempt::Accept,
            Decision::Reject => return Attempt::Reject(state.reason.clone()),
            Decision::Checking => {}
        }
        let Some(fallback) = state.responses.last().map(|r| r.next.clone()) else {
            warn!("sockcheck state with no responses; accepting");
            return Attempt::Accept;
        };
        let Some(conn) = stream.as_mut() else {
            state = fallback;
            continue;
        };

        let payload = ctx.render(&state.send);
        if !payload.is_empty() && conn.write_all(&payload).await.is_err() {
            stream = None;
            state = fallback;
            continue;
        }

        // One cursor per explicit response, all advanced in parallel.
        let arm_count = state.responses.len() - 1;
        let mut cursors: Vec<Option<Cursor>> = state.responses[..arm_count]
            .iter()
            .map(|r| r.pattern.as_ref().map(|p| Cursor::new(p.clone(), consumed)))
            .collect();

        let deadline = Instant::now() + timeout;
        let selected = 'read: loop {
            for (idx, slot) in cursors.iter_mut().enumerate() {
                if let Some(cursor) = slot {
                    match cursor.advance(&buf, &ctx) {
                        CursorStatus::Matched => break 'read Some(idx),
                        CursorStatus::Dead => *slot = None,
                        CursorStatus::Waiting => {}
                    }
                }
            }
            if buf.len() >= scanner.conf.max_read {
                // More data than any pattern expected.
                break 'read None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break 'read None;
            }
            let mut chunk = [0u8; 512];
            match tokio::time::timeout(remaining, conn.read(&mut chunk)).await {
                Ok(Ok(0)) => break 'read None,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break 'read None,
                Err(_) => break 'read None,
            }
        };

        state = match selected {
            Some(idx) => {
                consumed = cursors[idx]
                    .as_ref()
                    .map(|c| c.buf_pos)
                    .unwrap_or(consumed);
                state.responses[idx].next.clone()
            }
            None => fallback,
        };
    }
}

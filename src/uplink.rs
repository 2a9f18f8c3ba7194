//! Uplink connection management.
//!
//! One outbound TCP link to the configured hub. The writer drains an
//! unbounded queue so handlers never block; the reader frames lines and
//! hands them to the dispatcher. A self-rearming ping timer watches link
//! health, and the whole cycle reconnects with bounded backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::handlers::{self, Context};
use crate::proto::codec::LineCodec;

/// Sink for outbound wire lines.
///
/// Implemented by [`Uplink`] for the real link and by test captures.
pub trait Outbox: Send + Sync {
    fn send_line(&self, line: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Authenticating,
    Bursting,
    Connected,
}

/// Shared handle to the current uplink connection.
pub struct Uplink {
    pub host: String,
    pub port: u16,
    state: RwLock<LinkState>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Set by the PING/PONG handlers; consumed by the ping timer.
    ping_activity: AtomicBool,
    close: tokio::sync::Notify,
    /// Marked when the peer disabled us (bad password, pre-link ERROR).
    unavailable: AtomicBool,
    tries: AtomicU32,
}

impl Uplink {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            state: RwLock::new(LinkState::Disconnected),
            sender: Mutex::new(None),
            ping_activity: AtomicBool::new(false),
            close: tokio::sync::Notify::new(),
            unavailable: AtomicBool::new(false),
            tries: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    /// Request a disconnect; the connection task notices and tears down.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Force the next reconnect to happen promptly.
    pub fn reset_tries(&self) {
        self.tries.store(0, Ordering::Relaxed);
    }

    pub fn mark_unavailable(&self) {
        self.unavailable.store(true, Ordering::Relaxed);
    }

    pub fn mark_ping_activity(&self) {
        self.ping_activity.store(true, Ordering::Relaxed);
    }

    fn take_ping_activity(&self) -> bool {
        self.ping_activity.swap(false, Ordering::Relaxed)
    }
}

impl Outbox for Uplink {
    fn send_line(&self, line: String) {
        if self.state() == LinkState::Disconnected {
            return;
        }
        if let Some(tx) = self.sender.lock().as_ref() {
            debug!(line = %line, "send");
            let _ = tx.send(line);
        }
    }
}

/// Connection settings carried over from the config.
#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub password: String,
    pub ping_freq: u64,
    pub ping_timeout: u64,
    pub max_tries: u32,
}

/// Drive the uplink: connect, introduce ourselves, dispatch inbound lines,
/// keep the link alive, reconnect on loss. Runs until shutdown.
pub async fn run(ctx: Arc<Context>, settings: UplinkSettings) {
    loop {
        if ctx.uplink.unavailable.load(Ordering::Relaxed) {
            error!("uplink marked unavailable, not reconnecting");
            return;
        }
        let tries = ctx.uplink.tries.fetch_add(1, Ordering::Relaxed);
        if settings.max_tries != 0 && tries >= settings.max_tries {
            error!(tries, "uplink retry budget exhausted");
            return;
        }
        if tries > 0 {
            let delay = Duration::from_secs((5 * tries as u64).min(300));
            info!(delay_secs = delay.as_secs(), "waiting before reconnect");
            tokio::time::sleep(delay).await;
        }

        info!(host = %ctx.uplink.host, port = ctx.uplink.port, "connecting to uplink");
        let stream = match tokio::time::timeout(
            Duration::from_secs(30),
            TcpStream::connect((ctx.uplink.host.as_str(), ctx.uplink.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                error!(error = %err, "connection to uplink failed");
                continue;
            }
            Err(_) => {
                error!("connection to uplink timed out");
                continue;
            }
        };
        info!("connection to uplink established");
        ctx.uplink.reset_tries();

        run_connection(&ctx, &settings, stream).await;

        // Connection over: drop the replica of everything behind the link.
        ctx.uplink.set_state(LinkState::Disconnected);
        *ctx.uplink.sender.lock() = None;
        handlers::handle_disconnect(&ctx);
        info!("connection to uplink lost");
    }
}

async fn run_connection(ctx: &Arc<Context>, settings: &UplinkSettings, stream: TcpStream) {
    let framed = Framed::new(stream, LineCodec);
    let (mut sink, mut lines) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *ctx.uplink.sender.lock() = Some(tx);
    ctx.uplink.set_state(LinkState::Authenticating);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    // PASS + SERVER; the peer answers symmetrically and we burst from
    // its SERVER handler.
    handlers::introduce(ctx, &settings.password);

    let mut ping_sent = false;
    loop {
        let idle = Duration::from_secs(if ping_sent {
            settings.ping_timeout
        } else {
            settings.ping_freq
        });
        tokio::select! {
            maybe_line = lines.next() => {
                match maybe_line {
                    Some(Ok(line)) => {
                        debug!(line = %line, "recv");
                        handlers::parse_line(ctx, &line, false);
                        if ctx.uplink.take_ping_activity() {
                            ping_sent = false;
                        }
                        if ctx.uplink.state() == LinkState::Disconnected {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "uplink read error");
                        break;
                    }
                    None => break,
                }
            }
            _ = ctx.uplink.close.notified() => {
                break;
            }
            _ = tokio::time::sleep(idle) => {
                if ping_sent {
                    warn!("uplink ping timeout");
                    handlers::squit_self(ctx, "Ping timeout.");
                    break;
                }
                handlers::send_ping(ctx);
                ping_sent = true;
            }
        }
    }

    writer.abort();
}

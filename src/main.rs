//! slsvcd - Straylight IRC Network Services (Next Generation)
//!
//! Links to an ircd as a P10 peer, replicates global network state, and
//! polices abusive connections with the proxy scanner and DNSBL modules.

mod clock;
mod config;
mod dnsbl;
mod error;
mod glines;
mod handlers;
mod hooks;
mod numeric;
mod policer;
mod proto;
mod resolver;
mod sockcheck;
mod state;
mod uplink;
mod util;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::glines::GlineStore;
use crate::handlers::Context;
use crate::hooks::Hooks;
use crate::resolver::Resolver;
use crate::resolver::config::{ResolvConf, Services};
use crate::sockcheck::{Scanner, SockcheckConf};
use crate::state::Network;
use crate::uplink::{Uplink, UplinkSettings};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `slsvc.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "slsvc.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

fn build_resolv_conf(config: &Config) -> ResolvConf {
    let path = config
        .resolver
        .resolv_conf
        .clone()
        .unwrap_or_else(|| "/etc/resolv.conf".to_string());
    let mut conf = ResolvConf::load(Path::new(&path));
    if !config.resolver.nameservers.is_empty() {
        conf.nameservers.clear();
        for ns in &config.resolver.nameservers {
            conf.push_nameserver(ns);
        }
    }
    if let Some(search) = &config.resolver.search {
        conf.search = search.clone();
    }
    if let Some(timeout) = config.resolver.timeout {
        conf.timeout = timeout;
    }
    if let Some(attempts) = config.resolver.attempts {
        conf.attempts = attempts;
    }
    if let Some(ndots) = config.resolver.ndots {
        conf.ndots = ndots;
    }
    if let Some(edns0) = config.resolver.edns0 {
        conf.edns0 = edns0;
    }
    if let Some(bind) = &config.resolver.bind_address {
        match bind.parse() {
            Ok(addr) => conf.bind_address = Some(addr),
            Err(_) => warn!(bind_address = %bind, "ignoring unparsable resolver bind address"),
        }
    }
    conf
}

fn build_dnsbl_zones(config: &Config) -> Vec<dnsbl::DnsblZone> {
    config
        .dnsbl
        .zones
        .iter()
        .map(|zone| dnsbl::DnsblZone {
            zone: zone.zone.clone(),
            mask: zone.mask,
            reasons: zone
                .reasons
                .iter()
                .filter_map(|(key, value)| key.parse::<u8>().ok().map(|k| (k, value.clone())))
                .collect(),
            reason: zone.reason.clone(),
            duration: zone.duration,
        })
        .collect()
}

// The runtime is single-threaded by design: every handler runs to
// completion between suspension points, so state mutation needs no finer
// locking than the per-line lock.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    info!(
        server = %config.server.name,
        numeric = config.server.numeric,
        uplink = %config.uplink.host,
        "Starting slsvcd"
    );

    let clock = Clock::system();
    let boot = clock.now();
    let wire_numeric = config.server.wire_numeric();
    let mut net = Network::new(
        clock.clone(),
        &config.server.name,
        &wire_numeric,
        &config.server.description,
        boot,
    );
    net.force_n2k = config.server.force_n2k;
    net.his_servername = config.server.his_servername.clone();
    net.his_servercomment = config.server.his_servercomment.clone();
    let net = Arc::new(RwLock::new(net));

    let glines = Arc::new(Mutex::new(GlineStore::new()));
    let uplink = Arc::new(Uplink::new(config.uplink.host.clone(), config.uplink.port));
    let out: Arc<dyn uplink::Outbox> = uplink.clone();
    let mut hooks = Hooks::new();

    // Newly-linked servers get the full gline store replayed at them.
    {
        let glines = glines.clone();
        let clock = clock.clone();
        hooks.on_server_link(move |net, out, prefix| {
            let self_prefix = net.self_prefix.clone();
            glines
                .lock()
                .refresh_server(out, &self_prefix, Some(prefix), clock.now());
        });
    }

    // Resolver (shared by the scanner and the DNSBL module).
    let resolv_conf = build_resolv_conf(&config);
    let services_path = config
        .resolver
        .services
        .clone()
        .unwrap_or_else(|| "/etc/services".to_string());
    let services = Services::load(Path::new(&services_path));
    let resolver = Resolver::start(resolv_conf, services).await?;
    info!("Resolver initialized");

    // Proxy scanner.
    if config.sockcheck.enabled {
        let tests = match std::fs::read_to_string(&config.sockcheck.file) {
            Ok(text) => sockcheck::parser::compile_tests(&text)
                .map_err(|e| anyhow::anyhow!("sockcheck test database {}: {}", config.sockcheck.file, e))?,
            Err(err) => {
                warn!(file = %config.sockcheck.file, error = %err, "no sockcheck tests loaded");
                Vec::new()
            }
        };
        info!(tests = tests.len(), "Sockcheck tests loaded");
        let scanner = Scanner::new(
            SockcheckConf {
                max_clients: config.sockcheck.max_clients,
                max_read: config.sockcheck.max_read,
                gline_duration: config.sockcheck.gline_duration,
                max_cache_age: config.sockcheck.max_cache_age,
                bind_address: config
                    .sockcheck
                    .address
                    .as_ref()
                    .and_then(|a| a.parse().ok()),
            },
            tests,
            glines.clone(),
            out.clone(),
            net.read().self_prefix.clone(),
            clock.clone(),
            config.uplink.host.clone(),
        );
        scanner.start_sweeper();
        let scanner_hook = scanner.clone();
        hooks.on_new_user(move |net, _out, numeric| {
            scanner_hook.check_user(net, numeric);
            false
        });
        info!("Sockcheck initialized");
    }

    // DNSBL module.
    if !config.dnsbl.zones.is_empty() || config.dnsbl.file.is_some() {
        let hosts = match &config.dnsbl.file {
            Some(path) => dnsbl::load_host_file(
                Path::new(path),
                config
                    .dnsbl
                    .file_reason
                    .as_deref()
                    .unwrap_or("client is blacklisted"),
            ),
            None => Default::default(),
        };
        let dnsbl_service = dnsbl::DnsblService::new(
            build_dnsbl_zones(&config),
            hosts,
            config.dnsbl.gline_duration,
            resolver.clone(),
            glines.clone(),
            out.clone(),
            config.server.name.clone(),
            net.read().self_prefix.clone(),
            clock.clone(),
        );
        let dnsbl_hook = dnsbl_service.clone();
        hooks.on_new_user(move |net, _out, numeric| {
            dnsbl_hook.check_user(net, numeric);
            false
        });
        info!(zones = config.dnsbl.zones.len(), "DNSBL initialized");
    }

    let ctx = Arc::new(Context {
        net,
        hooks: Arc::new(hooks),
        glines: glines.clone(),
        out,
        uplink: uplink.clone(),
        clock: clock.clone(),
        their_password: config.uplink.their_password.clone(),
        reliable_clock: config.server.reliable_clock,
        admin_info: config.server.admin.clone(),
        hidden_host_suffix: config.server.hidden_host.clone(),
        unbursted: Mutex::new(None),
        burst_begin: AtomicI64::new(0),
        burst_length: AtomicI64::new(0),
    });

    // Periodic gline expiry sweep.
    {
        let glines = glines.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let removed = glines.lock().reap(clock.now());
                if removed > 0 {
                    info!(removed, "Expired glines removed");
                }
            }
        });
    }

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let uplink = uplink.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM - shutting down"),
            }
            uplink.mark_unavailable();
            uplink.close();
        });
    }

    let settings = UplinkSettings {
        password: config.uplink.password.clone(),
        ping_freq: config.server.ping_freq,
        ping_timeout: config.server.ping_timeout,
        max_tries: config.uplink.max_tries,
    };
    uplink::run(ctx, settings).await;

    info!("Uplink loop finished, exiting");
    Ok(())
}

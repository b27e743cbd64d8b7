//! Weaver vector timestamper daemon.
//!
//! ```doc
//! ❯ weaver-vtd --listen 127.0.0.1 --listen-port 5200 --config-file ./weaver.yaml
//! ```
//!
//! One process per VT. The endpoint id (and therefore the VT id) is the
//! offset of the listen port above the cluster port base: the VT at
//! port 5200 is VT 0, the shard at 5200 + ShardIdIncr + i is shard i.

mod server;
mod trace;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use std::{env, panic, thread};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

use weaver::config::WeaverConfig;
use weaver::coordinator::{CoordStub, Timestamper};
use weaver::kvstore::Memory;
use weaver::membership::{local_roster, Membership, ServerState, StaticMembership};
use weaver::order::OrderOracle;

use server::NetTransport;

/// Port of endpoint 0; endpoint i listens at PORT_BASE + i.
const PORT_BASE: u16 = 5200;

#[derive(Debug, Parser, PartialEq)]
#[command(version, author, about)]
pub struct Args {
    /// listen on a specific IP address
    #[clap(short = 'l', long = "listen", default_value = "127.0.0.1")]
    listen: String,

    /// listen on an alternative port
    #[clap(short = 'p', long = "listen-port", default_value_t = PORT_BASE)]
    listen_port: u16,

    /// make this a backup timestamper
    #[clap(short = 'b', long = "backup-vt")]
    backup_vt: bool,

    /// full path of the weaver.yaml configuration file
    #[clap(long = "config-file", default_value = "./weaver.yaml")]
    config_file: String,

    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();

    let log_dir =
        format!("{}/.weaver", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;
    info!("weaver-vtd start args: {:?}", &args);

    let config = match WeaverConfig::load(&args.config_file) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!("could not read {} ({}), using defaults", args.config_file, err);
            WeaverConfig::default()
        }
    };
    info!("weaver-vtd start config: {:?}", &config);

    if args.listen_port < PORT_BASE {
        bail!("listen port {} below the cluster port base {}", args.listen_port, PORT_BASE);
    }
    let vt_id = (args.listen_port - PORT_BASE) as u64;
    if vt_id >= config.num_vts {
        bail!("port {} maps to VT {} but the cluster has {} VTs", args.listen_port, vt_id, config.num_vts);
    }

    let membership = Arc::new(StaticMembership::new(local_roster(
        1,
        config.num_vts,
        config.num_shards,
    )));
    let transport = Arc::new(NetTransport::new(
        args.listen.clone(),
        PORT_BASE,
        Handle::current(),
    ));
    let kv = Memory::new();
    let ts = Arc::new(Timestamper::new(
        vt_id,
        config.clone(),
        transport.clone(),
        membership.clone(),
    ));
    ts.reconfigure(membership.config()?)?;

    if args.backup_vt {
        info!("backup VT {}: restoring durable state", vt_id);
        let stub = CoordStub::new(vt_id, config.num_shards, kv.clone());
        ts.begin_restore()?;
        ts.restore_backup(&stub)?;
        // nothing can be parked this early; leave the restoring state
        let _ = ts.handle_restore_done()?;
    }

    // graceful exit on SIGINT/SIGHUP/SIGTERM
    let mut signals = Signals::new([SIGINT, SIGHUP, SIGTERM]).context("installing signal handlers")?;
    let signal_ts = ts.clone();
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("ending program, signal = {}", signal);
            if let Err(err) = signal_ts.request_exit() {
                error!("shutdown request failed: {}", err);
            }
        }
    });

    // worker pool, one stub and oracle each
    let (inbound_tx, inbound_rx) = mpsc::channel();
    let inbound_rx = Arc::new(Mutex::new(inbound_rx));
    let mut workers = Vec::new();
    for _ in 0..config.get_num_vt_threads() {
        let rx = inbound_rx.clone();
        let worker_ts = ts.clone();
        let stub = CoordStub::new(vt_id, config.num_shards, kv.clone());
        workers.push(thread::spawn(move || {
            let oracle = OrderOracle::new();
            server::worker_loop(rx, |sender, msg| {
                worker_ts.handle_message(&stub, &oracle, sender, &msg)
            });
        }));
    }

    // membership link: pick up roster changes, die on a cluster change
    let link_ts = ts.clone();
    let link_membership = membership.clone();
    thread::spawn(move || {
        let mut seen_version = 0;
        while !link_ts.should_exit() {
            thread::sleep(Duration::from_secs(1));
            let cfg = match link_membership.config() {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!("membership link: {}", err);
                    continue;
                }
            };
            if cfg.version <= seen_version {
                continue;
            }
            seen_version = cfg.version;
            if let Err(err) = link_ts.reconfigure(cfg) {
                error!("exiting: {}", err);
                let _ = link_ts.request_exit();
            }
        }
    });

    // periodic nop worker
    let nop_ts = ts.clone();
    let nop_stub = CoordStub::new(vt_id, config.num_shards, kv.clone());
    let nop_period = Duration::from_nanos(config.get_vt_timeout_nano());
    thread::spawn(move || {
        while !nop_ts.should_exit() {
            thread::sleep(nop_period);
            if let Err(err) = nop_ts.nop_tick(&nop_stub) {
                error!("nop tick failed: {}", err);
            }
        }
    });

    // clock gossip to peer VTs
    if config.num_vts > 1 {
        let gossip_ts = ts.clone();
        let gossip_period = Duration::from_nanos(config.get_vt_clk_timeout_nano());
        let num_vts = config.num_vts as usize;
        thread::spawn(move || {
            let mut snapshot_version = 0;
            let mut vts_state = vec![ServerState::NotAvailable; num_vts];
            while !gossip_ts.should_exit() {
                thread::sleep(gossip_period);
                if let Err(err) = gossip_ts.gossip_tick(&mut snapshot_version, &mut vts_state) {
                    error!("clock gossip failed: {}", err);
                }
            }
        });
    }

    let listener = TcpListener::bind((args.listen.as_str(), args.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", args.listen, args.listen_port))?;
    println!("Vector timestamper {}", vt_id);
    let accept = tokio::spawn(server::accept_loop(listener, transport.clone(), inbound_tx));

    while !ts.should_exit() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    accept.abort();

    let (_, _, clk_updates) = ts.clock_snapshot()?;
    info!("num vclk updates {}", clk_updates);
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            // First call the default hook that prints to standard error.
            default_hook(info);

            // Then call human_panic.
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}

//! ventlink: command-line entry point for the ventilator bridge.
//!
//! # Usage
//!
//! ```text
//! ventlink run --config bridge.yaml
//! ventlink run --socket /tmp/vent.sock -vv
//! ventlink peer --socket /tmp/vent.sock --frames 500
//! ```
//!
//! `run` prints one JSON object per bridge event on stdout and reads
//! operator changes (`fio2=40 peep=6`) from stdin.

mod operator;
mod peer;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use serde_json::json;

use ventlink_core::daemon::{Bridge, BridgeEvent, BridgeHandle};
use ventlink_core::error::Result;
use ventlink_core::settings;
use ventlink_core::types::config::BridgeConfig;


/// Set from the SIGINT/SIGTERM handler; never cleared.
pub(crate) static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}


#[derive(Parser)]
#[command(name = "ventlink", version, about = "Bridge between a ventilator controller and its operator console")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}


#[derive(Subcommand)]
enum Command {
    /// Listen for the controller and bridge it to stdin/stdout
    Run(RunArgs),
    /// Simulate a controller against a running bridge
    Peer(peer::PeerArgs),
}


#[derive(Args)]
struct RunArgs {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket path, overriding the configuration file
    #[arg(long, env = "VENTLINK_SOCKET")]
    socket: Option<PathBuf>,

    /// Treat `reset_conf` as a full store reset
    #[arg(long)]
    reset_clears_store: bool,
}


fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }

    let exit_code = match cli.command {
        Command::Run(args) => run_bridge(&args),
        Command::Peer(args) => peer::execute(&args),
    };
    process::exit(exit_code);
}


fn run_bridge(args: &RunArgs) -> i32 {
    let config = match resolve_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ventlink: {}", e);
            return 2;
        }
    };

    let (tx, rx) = mpsc::channel();
    let bridge = match Bridge::bind(config, tx) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("ventlink: cannot start bridge: {}", e);
            return 1;
        }
    };
    let handle = bridge.handle();

    std::thread::spawn(move || {
        for event in rx {
            println!("{}", event_json(&event));
        }
    });
    watch_for_signals(handle.clone());
    operator::spawn_stdin_reader(handle);

    match bridge.run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ventlink: {}", e);
            1
        }
    }
}


/// File settings first, then command-line overrides.
fn resolve_config(args: &RunArgs) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => settings::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if args.reset_clears_store {
        config.reset_clears_store = true;
    }
    config.validate()?;
    Ok(config)
}


fn watch_for_signals(handle: BridgeHandle) {
    std::thread::spawn(move || {
        while !SHUTDOWN.load(Ordering::Relaxed) {
            if handle.is_shutting_down() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        info!("signal received, shutting down");
        handle.shutdown();
    });
}


fn event_json(event: &BridgeEvent) -> serde_json::Value {
    debug!("bridge event {:?}", event);
    match event {
        BridgeEvent::StoreReady(snapshot) => json!({ "event": "store_ready", "params": snapshot.params }),
        BridgeEvent::ValuesChanged(snapshot) => json!({ "event": "values_changed", "params": snapshot.params }),
        BridgeEvent::StoreReset => json!({ "event": "store_reset" }),
        BridgeEvent::PeerConnected => json!({ "event": "peer_connected" }),
        BridgeEvent::PeerDisconnected => json!({ "event": "peer_disconnected" }),
    }
}

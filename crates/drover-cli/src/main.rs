//! Drover CLI - The `drover` command.
//!
//! A thin front end over `drover-core`: `monitor` keeps a live mirror of
//! the backend's session and prints it as it changes; the remaining
//! subcommands fire single commands at the backend and exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_core::{
    BackendClient, Command, MirrorDelegate, MirrorService, OscLink, SyncConfig, Update,
};

/// Drover - session controller for a live looper backend
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mirror and control a sequencer backend", long_about = None)]
struct Args {
    #[command(flatten)]
    conn: ConnArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct ConnArgs {
    /// Backend OSC command port ("host:port")
    #[arg(long, default_value = "127.0.0.1:9003")]
    osc_send: String,

    /// Local OSC listen address ("host:port")
    #[arg(long, default_value = "0.0.0.0:9004")]
    osc_bind: String,

    /// Backend reliable channel ("host:port")
    #[arg(long, default_value = "127.0.0.1:8125")]
    stream: String,

    /// Use OSC only, no reliable channel
    #[arg(long)]
    no_stream: bool,
}

impl ConnArgs {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            osc_send_addr: self.osc_send.clone(),
            osc_bind_addr: self.osc_bind.clone(),
            stream_addr: if self.no_stream {
                None
            } else {
                Some(self.stream.clone())
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror the backend session and print it as it changes
    Monitor {
        /// Also print node attributes
        #[arg(short, long)]
        attributes: bool,
    },

    /// Toggle the global transport
    PlayStop,

    /// Start the global transport
    Play,

    /// Stop the global transport
    Stop,

    /// Set the session tempo
    SetBpm { bpm: f64 },

    /// Set the session meter (beats per bar)
    SetMeter { meter: i64 },

    /// Toggle the metronome
    Metronome,

    /// Play a scene by number
    ScenePlay { scene: i64 },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match args.command {
        Commands::Monitor { attributes } => monitor(&args.conn, attributes),
        Commands::PlayStop => send_one(&args.conn, Command::transport_play_stop()),
        Commands::Play => send_one(&args.conn, Command::transport_play()),
        Commands::Stop => send_one(&args.conn, Command::transport_stop()),
        Commands::SetBpm { bpm } => send_one(&args.conn, Command::set_bpm(bpm)),
        Commands::SetMeter { meter } => send_one(&args.conn, Command::set_meter(meter)),
        Commands::Metronome => send_one(&args.conn, Command::metronome_on_off()),
        Commands::ScenePlay { scene } => send_one(&args.conn, Command::scene_play(scene)),
        Commands::Version => {
            println!("drover {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Bumps a counter whenever the mirror changes, so the monitor loop knows
/// when to re-render.
#[derive(Default)]
struct MonitorDelegate {
    dirty: AtomicU64,
}

impl MonitorDelegate {
    fn generation(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }
}

impl MirrorDelegate for MonitorDelegate {
    fn on_backend_started(&self) {
        log::info!("backend is up");
    }

    fn on_backend_connection_lost(&self) {
        log::warn!("backend connection lost, reconnecting");
    }

    fn on_full_state_received(&self) {
        self.dirty.fetch_add(1, Ordering::SeqCst);
    }

    fn on_state_update(&self, _update: &Update) {
        self.dirty.fetch_add(1, Ordering::SeqCst);
    }
}

fn monitor(conn: &ConnArgs, attributes: bool) -> Result<()> {
    let delegate = Arc::new(MonitorDelegate::default());
    let service = MirrorService::start(&conn.sync_config(), delegate.clone())
        .context("failed to start mirror service")?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    log::info!("monitoring backend (ctrl-c to exit)");
    let mut seen = 0;
    while !term.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
        let generation = delegate.generation();
        if generation != seen {
            seen = generation;
            let text = service.with_mirror_read(|graph| graph.render(attributes));
            println!("{}", text);
        }
    }

    log::info!("shutting down");
    service.shutdown();
    Ok(())
}

/// Fire one command over OSC and exit.
fn send_one(conn: &ConnArgs, cmd: Command) -> Result<()> {
    let link = OscLink::new(conn.osc_send.clone())?;
    let client = BackendClient::new(link, None);
    cmd.send_via(&client)
        .with_context(|| format!("failed to send {}", cmd.address))?;
    log::info!("sent {}", cmd.address);
    Ok(())
}

mod config;
mod host;

use clap::Parser;
use directories::ProjectDirs;
use host::{LoggingDelegate, LoopbackLink};
use krtr_mesh::clock::SystemTimeProvider;
use krtr_mesh::engine::MeshEngine;
use krtr_mesh::transport::{Delegate, LinkLayer};
use krtr_proto::Recipient;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reference host for the krtr mesh core: wires a `MeshEngine` to a
/// loopback link layer and a log-only delegate. Not a chat client --
/// it exists to smoke-test the core against a live terminal.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Nickname advertised in this node's `announce` packets.
    #[arg(short, long)]
    nickname: Option<String>,

    /// Overrides the persisted power mode.
    #[arg(long, value_parser = config::power_mode_from_str)]
    power_mode: Option<krtr_mesh::PowerMode>,

    /// Overrides whether cover traffic is emitted.
    #[arg(long)]
    cover_traffic: Option<bool>,

    /// Caps concurrent connections (meaningless for the loopback link, kept
    /// for parity with the real adapter's config surface).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Overrides the fragmenter's target frame size in bytes.
    #[arg(long)]
    fragment_size: Option<usize>,

    /// Store-and-forward retention, in seconds.
    #[arg(long)]
    store_ttl_secs: Option<u64>,

    /// Base PeerId rotation interval, in seconds.
    #[arg(long)]
    rotation_interval_secs: Option<u64>,

    /// Override the config/identity directory (defaults to the platform's
    /// project data dir).
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

fn config_dir(args: &Args) -> PathBuf {
    args.config_dir.clone().unwrap_or_else(|| {
        ProjectDirs::from("", "", "krtr")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let dir = config_dir(&args);

    let mut host_config = config::load_config(&dir);
    if args.nickname.is_some() {
        host_config.nickname = args.nickname.clone();
    }
    config::apply_overrides(&mut host_config.mesh, &args);

    let identity = config::load_or_create_identity(&dir)?;
    let link = Arc::new(LoopbackLink::default());
    let clock = Arc::new(SystemTimeProvider);

    let mut engine = MeshEngine::new(identity, host_config.mesh.clone(), clock, now_millis());
    engine.set_nickname(host_config.nickname.clone());
    engine.set_favorites(config::load_favorites(&dir));
    let delegate = LoggingDelegate::new(host_config.nickname.clone(), engine.peer_id());

    tracing::info!(peer_id = %engine.peer_id().to_hex(), "starting krtr-cli");
    run_effects(&engine.start_services(), &link, &delegate);

    println!("peer id: {}", engine.peer_id().to_hex());
    println!("type a message and press enter to broadcast it; ctrl-d to quit");

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let effects = engine.send_message(Recipient::Broadcast, &line, None);
        run_effects(&effects, &link, &delegate);

        // The privacy shaper may have queued the frame rather than sending
        // it immediately; a loopback link has no real peers to echo it to,
        // so this demo only proves the engine accepted the send.
        for (_, frame) in link.drain() {
            run_effects(&engine.handle_inbound_frame(0, &frame), &link, &delegate);
        }
    }

    run_effects(&engine.shutdown(), &link, &delegate);
    config::save_config(&dir, &host_config)?;
    Ok(())
}

fn run_effects(effects: &[krtr_mesh::engine::Effect], link: &Arc<LoopbackLink>, delegate: &dyn Delegate) {
    use krtr_mesh::engine::Effect;
    for effect in effects {
        match effect {
            Effect::SendFrame { connection, frame } => {
                let _ = link.send_frame(*connection, frame);
            }
            Effect::BroadcastFrame { frame, except } => {
                let _ = link.broadcast_frame(frame, *except);
            }
            Effect::Emit(event) => delegate.on_event(event.clone()),
            Effect::ScheduleWakeup { task, after } => {
                tracing::trace!(?task, ?after, "wakeup scheduled (no-op in this single-shot host)");
            }
        }
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use relayplay_core::{Button, ChannelMessage, PeerId, RoomId};
use relayplay_session::{
    ConnectionState, EmulatorControl, LocalRelay, NoopEmulator, PrimitiveFactory, RoomSpec, RoomStatus,
    RtcPrimitiveFactory, SessionConfig, SessionEvent, SessionRegistry, SignalingTransport,
    Termination,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relayplay")]
#[command(about = "Peer-to-peer netplay session tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a host and its guests in one process over an in-memory relay
    Simulate {
        #[arg(long, default_value_t = 2)]
        guests: usize,

        #[arg(long, default_value = "living-room")]
        room: String,

        /// JSON session config; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        grace_ms: Option<u64>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Dispose the first guest right after its offer goes out
        #[arg(long)]
        dispose_early: bool,

        #[arg(long, default_value_t = 0)]
        relay_latency_ms: u64,
    },
    /// Prints which remote-input keys drive which button
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            guests,
            room,
            config,
            grace_ms,
            timeout_ms,
            dispose_early,
            relay_latency_ms,
        } => {
            let config = load_config(config, grace_ms, timeout_ms)?;
            let options = Simulation {
                guests,
                room: RoomId::new(room),
                dispose_early,
                relay_latency: Duration::from_millis(relay_latency_ms),
            };
            simulate(config, options).await?;
        }
        Commands::Keys => print_keys(),
    }

    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
    grace_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(ms) = grace_ms {
        config = config.with_grace_period(Duration::from_millis(ms));
    }
    if let Some(ms) = timeout_ms {
        config = config.with_connection_timeout(Duration::from_millis(ms));
    }
    config.validate().context("Invalid session config")?;
    Ok(config)
}

struct Simulation {
    guests: usize,
    room: RoomId,
    dispose_early: bool,
    relay_latency: Duration,
}

/// Prints every button press the guests send to the host.
struct ConsoleEmulator;

impl EmulatorControl for ConsoleEmulator {
    fn button(&self, player: PeerId, button: Button, pressed: bool) {
        let edge = if pressed { "down" } else { "up" };
        println!("   {} {} {:?} {}", "input".magenta(), player, button, edge);
    }

    fn set_mute(&self, muted: bool, volume: Option<f32>) {
        println!("   {} muted={} volume={:?}", "emulator".magenta(), muted, volume);
    }

    fn pause(&self) {
        println!("   {} paused", "emulator".magenta());
    }

    fn resume(&self) {
        println!("   {} resumed", "emulator".magenta());
    }

    fn reset(&self) {
        println!("   {} reset", "emulator".magenta());
    }
}

async fn simulate(config: SessionConfig, options: Simulation) -> Result<()> {
    println!("{}", "🚀 Starting relayplay simulation...".green().bold());

    let relay: Arc<dyn SignalingTransport> = if options.relay_latency.is_zero() {
        Arc::new(LocalRelay::new())
    } else {
        Arc::new(LocalRelay::with_latency(options.relay_latency))
    };
    let primitives: Arc<dyn PrimitiveFactory> =
        Arc::new(RtcPrimitiveFactory::new(config.transport.clone()));
    let settle_within = config.connection_timeout + Duration::from_secs(5);

    let host_id = PeerId::new();
    let host = SessionRegistry::new(host_id, config.clone(), relay.clone(), primitives.clone());
    let mut events = host.subscribe_events();

    host.open_room(
        RoomSpec::host(options.room.clone(), host_id, options.guests),
        Arc::new(ConsoleEmulator),
    )
    .context("Failed to open host room")?;
    host.listen(&options.room)?;
    println!("   🏠 Host {} opened room {}", host_id, options.room);

    let mut guests = Vec::with_capacity(options.guests);
    for _ in 0..options.guests {
        let guest_id = PeerId::new();
        let guest =
            SessionRegistry::new(guest_id, config.clone(), relay.clone(), primitives.clone());
        guest
            .open_room(
                RoomSpec::guest(options.room.clone(), host_id),
                Arc::new(NoopEmulator),
            )
            .context("Failed to open guest room")?;
        guest.listen(&options.room)?;
        guests.push(guest);
    }

    println!("{}", "📨 Inviting guests...".cyan());
    for guest in &guests {
        host.invite_guest(&options.room, guest.local_id())
            .await
            .with_context(|| format!("Failed to invite {}", guest.local_id()))?;
    }

    if options.dispose_early
        && let Some(first) = guests.first()
    {
        println!("   🗑  Disposing {} before it answers", first.local_id());
        host.dispose_guest(&options.room, first.local_id())?;
    }

    let status = tokio::time::timeout(settle_within, wait_until_settled(&mut events, &options.room))
        .await
        .context("Room did not settle before the connection timeout")??;

    if status == RoomStatus::Ready {
        println!("{}", "💬 Exchanging messages...".cyan());
        for (i, guest) in guests.iter().enumerate() {
            if let Some(link) = guest.handle(&options.room, host_id) {
                link.wait_for(|s| s.state == ConnectionState::Connected || s.state.is_terminal())
                    .await;
            }
            guest.broadcast(&options.room, &ChannelMessage::chat(format!("hello from guest {i}")))?;
            guest.broadcast(&options.room, &ChannelMessage::remote_input("ArrowUp", true))?;
            guest.broadcast(&options.room, &ChannelMessage::remote_input("ArrowUp", false))?;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        for message in host.transcript(&options.room).unwrap_or_default() {
            println!("   {} {}: {}", "chat".blue(), message.from, message.text);
        }
    }

    let colour = match status {
        RoomStatus::Ready => "✨ Room is ready".green().bold(),
        _ => format!("❌ Room settled as {status}").red().bold(),
    };
    println!("{colour}");

    for guest in &guests {
        guest.close_room(&options.room)?;
    }
    host.close_room(&options.room)?;
    Ok(())
}

async fn wait_until_settled(
    events: &mut broadcast::Receiver<SessionEvent>,
    room: &RoomId,
) -> Result<RoomStatus> {
    loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event);
                if let SessionEvent::RoomStatus { room: r, status } = event
                    && &r == room
                    && matches!(status, RoomStatus::Ready | RoomStatus::Error)
                {
                    return Ok(status);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} session events", skipped),
            Err(RecvError::Closed) => anyhow::bail!("Session event stream closed"),
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Slot(snapshot) => println!(
            "   {} {} {}",
            "slot".dimmed(),
            snapshot.remote_id,
            snapshot.state.to_string().cyan()
        ),
        SessionEvent::SlotRemoved {
            remote,
            termination,
            ..
        } => {
            let how = match termination {
                Termination::Closed(reason) => format!("closed ({reason:?})"),
                Termination::Failed(reason) => format!("failed ({reason})"),
            };
            println!("   {} {} {}", "removed".yellow(), remote, how);
        }
        SessionEvent::RoomStatus { room, status } => {
            println!("{} {} {}", "room".bold(), room, status.to_string().bold())
        }
        SessionEvent::Dropped { from, reason, .. } => {
            println!("   {} from {}: {}", "dropped".red(), from, reason)
        }
    }
}

fn print_keys() {
    println!("{}", "🎮 Remote input keys".green().bold());
    for button in Button::ALL {
        let name = format!("{button:?}").to_lowercase();
        println!("   {:<8} {}", name.cyan(), button.keys().join(", "));
    }
}

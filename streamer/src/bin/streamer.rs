//! RAOP streamer - CLI binary.
//!
//! Finds receivers on the network, decodes an Ogg Opus file and streams it
//! to one of them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use decoder::OpusDecoder;
use discovery::{Device, Discovery};
use raop_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use streamer::{
    cleanup_stale_lock, CancellationToken, SessionState, Settings, StreamingSession,
    DEFAULT_RAOP_PORT,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// RAOP Streamer - play Ogg Opus files on AirPlay receivers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Settings file (TOML). Defaults to $RAOP_CONFIG_PATH or
    /// $XDG_CONFIG_HOME/raop-streamer/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Prometheus metrics bind address (serves `GET /metrics`)
    #[arg(long, global = true)]
    metrics_bind: Option<String>,

    /// Coloring; overrides the settings file
    #[arg(long, value_enum, global = true)]
    color: Option<ColorArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Browse for receivers and list them
    Discover {
        /// How long to browse
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },

    /// Decode a file and stream it to a receiver
    Play {
        /// Ogg Opus file
        input: PathBuf,

        /// Receiver address or name; browses the network when omitted
        #[arg(short, long)]
        receiver: Option<String>,

        /// RAOP port, used with an explicit address
        #[arg(short, long, default_value_t = DEFAULT_RAOP_PORT)]
        port: u16,

        /// Gain in dB; defaults to the track's replay gain tag
        #[arg(short, long, allow_hyphen_values = true)]
        gain_db: Option<f32>,

        /// Browse time when looking a receiver up by name
        #[arg(long, default_value = "3")]
        discover_seconds: u64,

        /// Send a DACP play command once streaming
        #[arg(long)]
        play_command: bool,

        /// Also write the streamed audio to a WAV file in this directory
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },

    /// Remove the lock artifact and the discovered-devices record
    Cleanup,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if let Some(color) = args.color {
        settings.color = color.into();
    }
    if args.metrics_bind.is_some() {
        settings.metrics_bind = args.metrics_bind.clone();
    }

    init_tracing(settings.color)?;
    info!("Starting RAOP streamer v{VERSION}");

    let metrics = MetricsContext::new("streamer")?;
    if let Some(bind) = &settings.metrics_bind {
        info!("Metrics bind: {}", bind);
        let bind = bind.parse().context("invalid metrics bind")?;
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
    }

    match args.command {
        Command::Discover { seconds } => discover(&settings, &metrics, seconds).await,
        Command::Play {
            input,
            receiver,
            port,
            gain_db,
            discover_seconds,
            play_command,
            capture_dir,
        } => {
            if capture_dir.is_some() {
                settings.session.capture_dir = capture_dir;
            }
            let device = resolve_receiver(&settings, &metrics, receiver, port, discover_seconds)
                .await?;
            play(&settings, &metrics, input, device, gain_db, play_command).await
        }
        Command::Cleanup => cleanup(&settings),
    }
}

async fn discover(settings: &Settings, metrics: &MetricsContext, seconds: u64) -> Result<()> {
    // ---
    let discovery = browse(settings, metrics, seconds).await?;
    let devices = discovery.devices();

    if devices.is_empty() {
        println!("No receivers found");
    }
    for device in devices {
        println!("{}\t{}:{}", device.name, device.address, device.port);
    }
    Ok(())
}

async fn browse(settings: &Settings, metrics: &MetricsContext, seconds: u64) -> Result<Discovery> {
    // ---
    let discovery = Discovery::with_metrics(settings.discovery.clone(), metrics.clone());
    discovery.start().context("failed to start discovery")?;

    info!("Browsing for {}s...", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    discovery.stop();

    Ok(discovery)
}

async fn resolve_receiver(
    settings: &Settings,
    metrics: &MetricsContext,
    receiver: Option<String>,
    port: u16,
    discover_seconds: u64,
) -> Result<Device> {
    // ---
    if let Some(addr) = receiver.as_deref().and_then(|r| r.parse::<IpAddr>().ok()) {
        return Ok(Device::new(addr, port, addr.to_string()));
    }

    let discovery = browse(settings, metrics, discover_seconds).await?;
    let device = match receiver.as_deref() {
        Some(name) => discovery.find(name),
        None => discovery.devices().into_iter().next(),
    };

    match device {
        Some(device) => {
            info!("Using receiver {}", device);
            Ok(device)
        }
        None => bail!(
            "no receiver {} found in {}s",
            receiver.as_deref().unwrap_or("at all"),
            discover_seconds
        ),
    }
}

async fn play(
    settings: &Settings,
    metrics: &MetricsContext,
    input: PathBuf,
    device: Device,
    gain_db: Option<f32>,
    play_command: bool,
) -> Result<()> {
    // ---
    // Decode in blocking task
    info!("Decoding {}...", input.display());
    let began = Instant::now();
    let mut decoder = tokio::task::spawn_blocking(move || {
        let mut decoder = OpusDecoder::from_path(&input)?;
        if !decoder.decode() {
            if let Some(e) = decoder.last_error() {
                return Err(e.clone());
            }
        }
        Ok(decoder)
    })
    .await
    .context("decoding task failed")?
    .context("failed to decode input")?;
    metrics
        .decode_seconds
        .observe(began.elapsed().as_secs_f64());

    let track = decoder.track()?;
    info!(
        "Loaded \"{}\" by \"{}\" ({}), track {}, {:.2}s",
        track.title,
        track.artist,
        track.album,
        track.track_number,
        track.duration.as_secs_f64()
    );
    if let Some(art) = &track.album_art {
        info!(
            "Album art: {}x{} {} {:?}",
            art.width(),
            art.height(),
            art.mime_type,
            art.description
        );
    }

    let session = Arc::new(
        StreamingSession::with_config(device.address, device.port, 0.0, settings.session.clone())
            .with_metrics(metrics.clone()),
    );
    decoder.attach_session(session.link());
    decoder.set_replay_gain_db(gain_db.or(decoder.tag_replay_gain_db()).unwrap_or(0.0));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    session
        .start(track.pcm, cancel.clone())
        .await
        .with_context(|| format!("failed to start streaming to {}", device))?;

    if play_command {
        if let Err(e) = session.send_play_command().await {
            warn!("Receiver did not take the play command: {}", e);
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Interrupted, stopping");
            session.stop().await;
        }
        _ = session.wait_for_state(SessionState::Idle, track.duration + Duration::from_secs(10)) => {
            session.stop().await;
        }
    }

    decoder.detach_session();
    match session.last_error() {
        Some(e) => Err(e).context("stream ended with an error"),
        None => {
            info!("Done: {} packets sent", session.packets_sent());
            if let Some(dir) = &settings.session.capture_dir {
                println!("Captured audio under {}", dir.display());
            }
            Ok(())
        }
    }
}

fn cleanup(settings: &Settings) -> Result<()> {
    // ---
    let lock = settings.session.resolved_lock_path();
    if cleanup_stale_lock(&lock).with_context(|| format!("failed to remove {}", lock.display()))? {
        println!("Removed {}", lock.display());
    }

    let discovery = Discovery::new(settings.discovery.clone());
    discovery
        .cleanup_record_file()
        .context("failed to remove record file")?;
    if let Some(path) = discovery.record_path() {
        println!("Cleared {}", path.display());
    }
    Ok(())
}

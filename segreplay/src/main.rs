//! segreplay - replay a route through the merge pipeline
//!
//! Loads a synthetic route into the in-memory provider, completes its
//! segments out of order, and logs the merged stream as it converges.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use segreplay::provider::{MemoryProviderFactory, MemoryRoute};
use segreplay::ReplayStream;
use segreplay_common::config::{resolve_data_dir, ReplayConfig};
use segreplay_common::events::ReplayEvent;
use segreplay_common::{ReplayFlags, Settings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for segreplay
#[derive(Parser, Debug)]
#[command(name = "segreplay")]
#[command(about = "Replay a segmented route log as one ordered stream")]
#[command(version)]
struct Args {
    /// Route identifier, or a path ending in one
    #[arg(short, long, default_value = "a2a0ccea32023010|2023-07-27--13-01-19")]
    route: String,

    /// Directory holding locally recorded routes
    #[arg(short, long, env = "SEGREPLAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Camera stream: none, road-camera, wide-road-camera, driver-camera, low-res-camera
    #[arg(long)]
    camera: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of synthetic segments
    #[arg(long, default_value = "6")]
    segments: u32,

    /// Events per synthetic segment
    #[arg(long, default_value = "100")]
    events_per_segment: usize,

    /// Segment completion order, comma separated (default: rotated by one)
    #[arg(long, value_delimiter = ',')]
    load_order: Option<Vec<u32>>,

    /// Delay before each segment completes, in milliseconds
    #[arg(long, default_value = "50")]
    load_interval_ms: u64,

    /// Cache limit in minutes to switch to halfway through the replay
    #[arg(long)]
    cache_minutes: Option<u32>,

    /// Print the known settings and exit
    #[arg(long)]
    list_settings: bool,
}

fn print_settings() {
    for meta in Settings::metadata() {
        println!("{}", meta);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segreplay=info,segreplay_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.list_settings {
        print_settings();
        return Ok(());
    }

    let config = ReplayConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let settings = Settings::global();
    config
        .apply_to(&settings)
        .context("Invalid cache limit in config")?;

    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &config);
    let camera = match &args.camera {
        Some(name) => ReplayFlags::from_name(name).context("Invalid --camera")?,
        None => config.camera,
    };

    info!("Data directory: {}", data_dir.display());
    info!(
        "Synthetic route: {} segments x {} events, cache limit {} min",
        args.segments,
        args.events_per_segment,
        settings.max_cached_minutes()
    );

    let order = args
        .load_order
        .clone()
        .unwrap_or_else(|| (1..args.segments).chain(0..args.segments.min(1)).collect());
    let factory = MemoryProviderFactory::new(MemoryRoute::synthetic(
        args.segments,
        args.events_per_segment,
    ))
    .with_load_order(order, Duration::from_millis(args.load_interval_ms));

    let mut stream = ReplayStream::new(factory);
    let mut events = stream.subscribe();
    stream
        .load_route(&args.route, Some(data_dir), camera)
        .context("Failed to load route")?;

    let mut pending_limit = args.cache_minutes;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let merged = stream.processed_segments().await.len() as u32;
        if merged >= args.segments {
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, stopping replay");
                break;
            }
            event = events.recv() => match event {
                Ok(ReplayEvent::EventsMerged { segments, appended, forwarded, .. }) => {
                    info!(
                        "Merged segments {:?} ({}): {} events",
                        segments,
                        if appended { "append" } else { "insert" },
                        forwarded
                    );
                    if merged + segments.len() as u32 >= args.segments / 2 {
                        if let Some(minutes) = pending_limit.take() {
                            settings
                                .set_max_cached_minutes(minutes)
                                .context("Invalid --cache-minutes")?;
                        }
                    }
                }
                Ok(ReplayEvent::StreamStarted { .. }) => info!("Stream started"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} replay events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    stream.pause(true).context("Failed to pause")?;
    stream.seek_to(0.0).context("Failed to seek")?;

    {
        let merged = stream.stream();
        let merged = merged.read().await;
        info!(
            "Merged stream: {} events, ordered={}, {} bus messages tracked",
            merged.len(),
            merged.is_ordered(),
            merged.last_values().messages().count()
        );
        if let (Some(first), Some(last)) = (merged.first_mono_time(), merged.events().last()) {
            info!(
                "Stream covers {:.1}s, {} events in the first second",
                last.event.seconds_since(first),
                merged.range(first, first.saturating_add(1_000_000_000)).len()
            );
        }
    }

    stream.stop();
    info!("Replay finished");
    Ok(())
}

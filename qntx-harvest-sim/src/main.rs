//! QNTX harvest simulator
//!
//! Runs one acquisition session against the in-memory producer: a
//! producer thread emits Mono8 frames at a fixed rate while a blocking
//! consumer fetches, decodes and requeues them. Statistics are printed as
//! JSON when the session ends.
//!
//! Usage:
//!     qntx-harvest-sim --fps 60 --width 640 --height 480
//!     qntx-harvest-sim --frames 100 --num-buffers 8 --hold 2

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use qntx_harvest::features::names;
use qntx_harvest::logging::{self, prefix};
use qntx_harvest::sim::{SimConfig, SimFrame, SimNodeMap, SimTransport};
use qntx_harvest::{
    AcquisitionConfig, AcquisitionEngine, CancellationToken, Event, EventKind, FeatureValue,
    HarvestError,
};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qntx-harvest-sim")]
#[command(about = "Acquisition engine driven by a simulated producer")]
#[command(version)]
struct Args {
    /// Frames per second emitted by the producer
    #[arg(long, default_value = "30")]
    fps: u32,

    #[arg(long, default_value = "320")]
    width: usize,

    #[arg(long, default_value = "240")]
    height: usize,

    /// Stop after this many frames (MultiFrame mode); 0 runs until interrupted
    #[arg(long, default_value = "0")]
    frames: u64,

    /// Engine settings as JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    num_buffers: Option<usize>,

    /// Filled buffers held before backpressure applies
    #[arg(long)]
    hold: Option<usize>,

    /// Drop the newest frame instead of the oldest when the hold is full
    #[arg(long)]
    keep_oldest: bool,

    /// Log level filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<AcquisitionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => AcquisitionConfig::default(),
    };
    if let Some(n) = args.num_buffers {
        config.num_buffers = n;
    }
    if let Some(n) = args.hold {
        config.num_filled_buffers_to_hold = n;
    }
    if args.keep_oldest {
        config.keep_latest = false;
    }
    config.validate()?;
    Ok(config)
}

fn node_map(args: &Args) -> SimNodeMap {
    let mode = if args.frames > 0 { "MultiFrame" } else { "Continuous" };
    SimNodeMap::new()
        .with(names::ACQUISITION_MODE, FeatureValue::Enumeration(mode.into()))
        .with(
            names::ACQUISITION_FRAME_COUNT,
            FeatureValue::Integer(i64::try_from(args.frames).unwrap_or(i64::MAX)),
        )
        .with(names::WIDTH, FeatureValue::Integer(args.width as i64))
        .with(names::HEIGHT, FeatureValue::Integer(args.height as i64))
        .with(names::TL_PARAMS_LOCKED, FeatureValue::Integer(0))
        .with_command(names::ACQUISITION_START)
        .with_command(names::ACQUISITION_STOP)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("{} Received Ctrl+C, shutting down", prefix::SESSION_CLOSE),
        _ = terminate => info!("{} Received terminate signal, shutting down", prefix::SESSION_CLOSE),
    }
}

/// Emits frames at `fps` until the token is cancelled.
fn spawn_producer(
    sim: Arc<SimTransport>,
    args: &Args,
    token: CancellationToken,
) -> thread::JoinHandle<u64> {
    let period = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
    let (width, height) = (args.width, args.height);
    thread::spawn(move || {
        let started = Instant::now();
        let mut frame_id = 0u64;
        while !token.is_cancelled() {
            frame_id += 1;
            let ts = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            if !sim.deliver(SimFrame::mono8(frame_id, width, height).with_timestamp(ts)) {
                debug!(frame_id, "no queued buffer, frame lost");
            }
            thread::sleep(period);
        }
        frame_id
    })
}

/// Fetches until the session ends; returns the number of frames consumed.
fn consume(engine: &AcquisitionEngine) -> u64 {
    let mut consumed = 0u64;
    loop {
        match engine.fetch(Duration::from_secs(1)) {
            Ok(buffer) => {
                let payload = buffer.payload();
                let pixels = payload
                    .components()
                    .first()
                    .map_or(0, |component| component.element_count());
                debug!(frame_id = buffer.frame_id(), pixels, "{} fetched", prefix::BUFFER);
                drop(payload);
                if let Err(e) = buffer.queue() {
                    debug!("requeue after stop: {}", e);
                }
                consumed += 1;
            }
            Err(HarvestError::Timeout(_)) => continue,
            Err(HarvestError::NotAcquiring) => return consumed,
            Err(e) => {
                warn!("fetch failed: {}", e);
                return consumed;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init_with_filter(&args.log_level);

    info!("Initializing QNTX harvest simulator");
    info!("  Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let payload_size = args.width * args.height;
    let sim = Arc::new(SimTransport::new(SimConfig {
        payload_size: Some(payload_size),
        timestamp_frequency: Some(1_000_000_000),
        ..Default::default()
    }));

    let shutdown = CancellationToken::new();
    let engine = Arc::new(
        AcquisitionEngine::builder(sim.clone())
            .node_map(Arc::new(node_map(&args)))
            .config(config)
            .cancellation(&shutdown)
            .name("sim")
            .build()?,
    );

    {
        let shutdown = shutdown.clone();
        engine.add_callback(EventKind::ReadyToStop, move |_: &Event| {
            info!("frame budget reached");
            shutdown.cancel();
        });
    }

    engine.start()?;
    let producer = spawn_producer(sim.clone(), &args, shutdown.clone());
    let consumer = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || consume(&engine))
    };

    tokio::select! {
        _ = shutdown_signal() => shutdown.cancel(),
        _ = shutdown.cancelled() => {}
    }

    engine.stop();
    let consumed = consumer.await?;
    let produced = producer
        .join()
        .map_err(|_| "producer thread panicked")?;

    let stats = engine.statistics();
    info!(
        produced,
        consumed,
        lost = sim.frames_lost(),
        "{} session finished",
        prefix::SESSION_CLOSE
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

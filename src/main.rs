//! Camera MJPEG streaming server

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use picam_mjpeg::camera::{CameraProvider, TestPatternProvider};
use picam_mjpeg::encoder::JpegEncoder;
use picam_mjpeg::web::{self, AppState};
use picam_mjpeg::{CaptureSupervisor, Config, LatestFrameSlot, ShutdownSignal, StreamBroadcaster};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "picam-mjpeg")]
#[command(about = "Self-healing MJPEG-over-HTTP camera streaming for Raspberry Pi")]
#[command(version)]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Stream generated colour bars instead of a real camera
    #[arg(long)]
    test_pattern: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

enum Exit {
    Signal(std::io::Result<()>),
    CaptureEnded(Result<Result<()>, JoinError>),
    ServerEnded(Result<Result<()>, JoinError>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Camera MJPEG streamer starting");

    let config = load_config(&cli)?;
    let addr = config.server.bind_addr()?;

    info!(
        bind = %addr,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        fps = %config.camera.fps,
        quality = %config.encoder.quality,
        "Configuration loaded"
    );

    let provider = camera_provider(&config)?;

    let slot = Arc::new(LatestFrameSlot::new());
    let shutdown = Arc::new(ShutdownSignal::new());

    let supervisor = CaptureSupervisor::new(
        config.supervisor_config(),
        config.camera_settings(),
        provider,
        Box::new(JpegEncoder),
        Arc::clone(&slot),
        Arc::clone(&shutdown),
    );
    let stats = supervisor.stats();
    let handle = supervisor.spawn()?;
    let mut capture = tokio::task::spawn_blocking(move || match handle.join() {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => Err(anyhow!("capture thread panicked")),
    });

    let broadcaster = Arc::new(StreamBroadcaster::new(
        Arc::clone(&slot),
        config.stream_settings(),
    ));
    let state = AppState::new(slot, Arc::clone(&broadcaster), stats);

    // Streams never finish on their own, so they are closed as soon as the
    // server starts its graceful shutdown
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(web::run_server(addr, state, async move {
        let _ = stop_rx.await;
        broadcaster.close();
    }));

    info!("Streaming started, press Ctrl+C to stop");

    let exit = tokio::select! {
        res = tokio::signal::ctrl_c() => Exit::Signal(res),
        joined = &mut capture => Exit::CaptureEnded(joined),
        served = &mut server => Exit::ServerEnded(served),
    };

    match exit {
        Exit::Signal(res) => {
            res.context("failed to listen for Ctrl+C")?;
            info!("Shutting down");

            let _ = stop_tx.send(());
            let served = server.await?;
            shutdown.trigger();
            let captured = capture.await?;

            served?;
            captured?;
        }
        Exit::CaptureEnded(joined) => {
            let _ = stop_tx.send(());
            let _ = server.await;

            let captured = joined?;
            if let Err(e) = &captured {
                error!(error = %e, "Capture supervisor exited");
            }
            captured?;
        }
        Exit::ServerEnded(served) => {
            shutdown.trigger();
            let _ = capture.await;
            served?.context("web server failed")?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Config::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    if let Some(bind) = &cli.bind {
        config.server.bind_ip = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.test_pattern {
        config.camera.test_pattern = true;
    }

    config.validate()?;
    Ok(config)
}

fn camera_provider(config: &Config) -> Result<Box<dyn CameraProvider>> {
    if config.camera.test_pattern {
        info!("Using built-in test pattern camera");
        return Ok(Box::new(TestPatternProvider));
    }

    hardware_provider()
}

#[cfg(feature = "gstreamer")]
fn hardware_provider() -> Result<Box<dyn CameraProvider>> {
    let provider = picam_mjpeg::camera::GstCameraProvider::new()
        .context("failed to initialise GStreamer")?;
    Ok(Box::new(provider))
}

#[cfg(not(feature = "gstreamer"))]
fn hardware_provider() -> Result<Box<dyn CameraProvider>> {
    anyhow::bail!(
        "built without the `gstreamer` feature: run with --test-pattern or rebuild with --features gstreamer"
    )
}

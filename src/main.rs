//! camloop: capture from a virtual camera for a bounded time

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use camloop::capture::CameraManager;
use camloop::session::CaptureSession;
use camloop::{utils, Config};
use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camloop")]
#[command(about = "Capture request loop on a virtual camera")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture duration in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Camera id (default: first enumerated camera)
    #[arg(long)]
    camera: Option<String>,
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(timeout) = cli.timeout {
        config.session.timeout_secs = timeout;
    }
    if cli.camera.is_some() {
        config.capture.camera = cli.camera;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camloop launching...");

    let manager = CameraManager::new(&config.sensors)?;
    for camera in manager.cameras() {
        info!(" - {}", utils::camera_name(camera));
    }
    let device = utils::select_camera(&manager, config.capture.camera.as_deref())?;

    let mut session = CaptureSession::open(&device, &config.capture)?;

    let handle = session.loop_handle();
    manager.runtime().spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, stopping capture");
                handle.cancel();
            }
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let report = session.run(Duration::from_secs(config.session.timeout_secs));
    // Release on every path, including a failed run
    let closed = session.close();
    let report = report?;
    closed?;

    info!(
        completed = report.completed,
        cancelled = report.cancelled,
        requeue_failures = report.requeue_failures,
        "Capture loop stopped with exit status: {}",
        report.exit_code()
    );
    Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
}

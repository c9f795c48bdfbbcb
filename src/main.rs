//! CLI entry point for csi-capture
//!
//! Drives the capture layer against simulated hardware:
//! - `run`: probe every configured sensor, stream a number of frames through
//!   a simulated sensor, stop, close and print per-instance statistics
//! - `check`: load and validate a configuration file
//!
//! # Usage
//!
//! ```bash
//! csi-capture run --config config/capture.toml --frames 30
//! csi-capture check config/capture.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use csi_capture::config::{CaptureConfig, SensorConfig};
use csi_capture::sim::{RecordingFrameManager, RecordingRoutingGroup, SimPlatform, SimSensor};
use csi_capture::{logging, Binding, CaptureDevice, FrameCountPublisher, SoftwareChecks};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "csi-capture")]
#[command(about = "CSI capture synchronization layer on simulated hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream frames from every configured sensor
    Run {
        /// Configuration file; a single 1080p sensor on CSI0 if omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Frames to capture per sensor
        #[arg(long, default_value = "30")]
        frames: u64,

        /// Simulated frame period in milliseconds
        #[arg(long, default_value = "5")]
        period_ms: u64,

        /// Re-validate state flags after every deferred work item
        #[arg(long)]
        verify: bool,
    },

    /// Validate a configuration file
    Check {
        /// Configuration file
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            frames,
            period_ms,
            verify,
        } => run(config, frames, Duration::from_millis(period_ms.max(1)), verify),
        Commands::Check { config } => check(config),
    }
}

fn load(path: Option<PathBuf>) -> Result<CaptureConfig> {
    let mut config = match path {
        Some(path) => CaptureConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CaptureConfig::default(),
    };
    if config.sensors.is_empty() {
        config.sensors.push(SensorConfig::new("sim0", 0, 1920, 1080));
    }
    config.validate()?;
    Ok(config)
}

fn check(path: PathBuf) -> Result<()> {
    let config = load(Some(path))?;
    println!("✅ Configuration valid");
    for sensor in &config.sensors {
        println!(
            "   csi{} {:<12} {}x{} lanes={} phy={} fmt={:#04x}{}",
            sensor.instance,
            sensor.name,
            sensor.width,
            sensor.height,
            sensor.data_lanes,
            sensor.phy_lane(),
            sensor.pixel_format.0,
            sensor
                .otf_group
                .map(|group| format!(" otf->{group}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// Time allowed for `frames` frames at `period`: four periods per frame plus
/// one second, saturating for huge frame counts.
fn run_budget(frames: u64, period: Duration) -> Duration {
    let periods = u32::try_from(frames.saturating_mul(4)).unwrap_or(u32::MAX);
    period
        .checked_mul(periods)
        .unwrap_or(Duration::MAX)
        .saturating_add(Duration::from_secs(1))
}

fn run(path: Option<PathBuf>, frames: u64, period: Duration, verify: bool) -> Result<()> {
    let config = load(path)?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let publisher = FrameCountPublisher::global();
    let sim = SimPlatform::with_publisher(config.capture.clone(), publisher.clone());

    let mut devices = Vec::new();
    let mut sensors = Vec::new();
    for sensor in &config.sensors {
        let device = CaptureDevice::probe(sensor.clone(), sensor.instance, &sim.platform)?;
        if verify {
            device.set_software_checks(SoftwareChecks::VERIFY_FLAGS);
        }

        let binding = match sensor.otf_group {
            Some(group) => Binding::OnTheFly {
                group,
                target: Arc::new(RecordingRoutingGroup::new()),
            },
            None => Binding::Local(Arc::new(RecordingFrameManager::new())),
        };
        device.open(binding)?;

        let regs = sim
            .map
            .registers(sensor.instance)
            .ok_or_else(|| anyhow!("no register window for csi{}", sensor.instance))?;
        sensors.push(SimSensor::spawn(regs, device.irq_handle(), period)?);
        devices.push(device);
    }

    for device in &devices {
        device.start()?;
    }

    let deadline = Instant::now().checked_add(run_budget(frames, period));
    while devices.iter().any(|d| d.published_frame_count() < frames) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!("Deadline reached before every sensor delivered {frames} frames");
            break;
        }
        thread::sleep(period);
    }

    let stop_timeout = config.capture.stop_timeout();
    let mut failed = false;
    for device in &devices {
        if let Err(e) = device.stop(stop_timeout) {
            warn!(instance = device.instance(), error = %e, "Stop failed");
            failed = true;
        }
    }
    for sensor in &mut sensors {
        sensor.stop();
    }

    println!();
    for device in &devices {
        println!("{}", device.stats());
    }
    println!("published: {:?}", publisher.snapshot());

    for device in &devices {
        device.close()?;
    }
    info!(devices = devices.len(), "All capture devices closed");

    if failed {
        bail!("one or more devices failed to drain");
    }
    Ok(())
}

use std::{
    fs::OpenOptions,
    io::{LineWriter, Write},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, Context};
use chrono::Local;
use clap::Parser;
use cnc_capture::{
    capture::{Camera, DirectoryCamera, SyntheticCamera},
    cnc::grbl::controller::MotionController,
    config::{FailurePolicy, RigConfig},
    plan::expand_visits,
    sequencer::{CaptureSequencer, Hardware, RunPlan},
    RigResult,
};
use common::api::{LogLevel, RunEvent, RunOutcome};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Move a CNC camera rig over every target and photograph it.", long_about = None)]
struct Args {
    /// JSON rig configuration.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
    /// Serial device of the controller; overrides the configuration.
    #[arg(short, long)]
    port: Option<String>,
    /// Root folder for session directories; overrides the configuration.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Replay the images of this folder instead of a live camera.
    #[arg(long, required_unless_present_any = ["synthetic_camera", "dry_plan"])]
    camera_dir: Option<PathBuf>,
    /// Generate test frames instead of reading a camera.
    #[arg(long, conflicts_with = "camera_dir")]
    synthetic_camera: bool,
    /// Append every event to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    abort_on_failure: bool,
    /// Skip the homing cycle; the machine must already be homed.
    #[arg(long)]
    no_home: bool,
    /// Print the target plan and exit without touching the hardware.
    #[arg(long)]
    dry_plan: bool,
}

enum CameraSource {
    Directory(PathBuf),
    Synthetic(u32, u32),
}

impl CameraSource {
    fn open(self) -> RigResult<Box<dyn Camera>> {
        let camera: Box<dyn Camera> = match self {
            CameraSource::Directory(dir) => Box::new(DirectoryCamera::open(dir)?),
            CameraSource::Synthetic(width, height) => Box::new(SyntheticCamera::new(width, height)),
        };
        Ok(camera)
    }
}

fn print_plan(config: &RigConfig) {
    let visits = expand_visits(&config.resolved_targets(), config.repetitions);
    println!("{} visits:", visits.len());
    for visit in visits {
        println!(
            "{:>4}  {:<14} X={:<10} Y={:<10} pass {}",
            visit.sequence, visit.target.id, visit.target.x, visit.target.y, visit.pass
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = RigConfig::load(&args.config)
        .with_context(|| format!("Loading configuration from {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.serial_port = port;
    }
    if let Some(output) = args.output {
        config.output_directory = output;
    }
    if args.abort_on_failure {
        config.failure_policy = FailurePolicy::Abort;
    }
    if args.no_home {
        config.home_on_start = false;
    }
    config.validate().context("Invalid configuration")?;

    if args.dry_plan {
        print_plan(&config);
        return Ok(());
    }

    let camera = match args.camera_dir {
        Some(dir) => CameraSource::Directory(dir),
        None => CameraSource::Synthetic(config.camera_tuning.capture_width, config.camera_tuning.capture_height),
    };
    let session_dir = config
        .output_directory
        .join(Local::now().format("%Y%m%d_%H%M%S").to_string());
    let plan = RunPlan::from_config(&config, session_dir);
    let port = config.serial_port.clone();
    let baud_rate = config.baud_rate;
    let settle = config.settle_delay();
    let timeouts = config.controller_timeouts();

    let mut log_file = match &args.log_file {
        Some(path) => Some(LineWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Opening log file {}", path.display()))?,
        )),
        None => None,
    };

    info!("Opening {} at {} baud", port, baud_rate);
    let sequencer = CaptureSequencer::new();
    let handle = sequencer.start(plan, move || async move {
        // Camera first: there is no point homing a rig that cannot take pictures.
        let camera = camera.open()?;
        Hardware::acquire(camera, MotionController::connect(&port, baud_rate, settle, timeouts)).await
    })?;
    let (mut events, worker) = handle.into_stream();

    let cancel = worker.cancel_handle();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if !interrupted.swap(true, Ordering::SeqCst) {
            println!("Stopping after the current target; press Ctrl-C again to quit immediately.");
            cancel.cancel();
        } else {
            std::process::exit(130);
        }
    })?;

    let mut last_status = None;
    while let Some(event) = events.next().await {
        let write_line = match &event {
            RunEvent::Log { level: LogLevel::Debug, .. } => false,
            // Logs already reach the terminal through tracing.
            RunEvent::Log { .. } => true,
            RunEvent::Status { status, .. } => {
                let changed = last_status != Some(*status);
                last_status = Some(*status);
                changed
            }
            other => {
                println!("{}", other.describe());
                true
            }
        };
        if write_line {
            if let Some(file) = log_file.as_mut() {
                if let Err(e) = writeln!(file, "[{}] {}", Local::now().format("%d/%m/%Y %H:%M:%S"), event.describe()) {
                    warn!("Could not write to log file: {}", e);
                }
            }
        }
        if matches!(event, RunEvent::Finished(_)) {
            break;
        }
    }

    let summary = tokio::task::spawn_blocking(move || worker.join()).await??;
    match summary.outcome {
        RunOutcome::Completed if summary.failed == 0 => Ok(()),
        RunOutcome::Completed => Err(anyhow!("{} of {} captures failed", summary.failed, summary.attempted)),
        RunOutcome::Cancelled => {
            println!("Run cancelled after {} captures.", summary.attempted);
            Ok(())
        }
        RunOutcome::Aborted(reason) => Err(anyhow!("Run aborted: {}", reason)),
        RunOutcome::Failed(reason) => Err(anyhow!("Run failed: {}", reason)),
    }
}

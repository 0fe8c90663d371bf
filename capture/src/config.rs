use std::{path::{Path, PathBuf}, time::Duration};

use common::api::Target;
use serde::{Deserialize, Serialize};

use crate::{
    cnc::grbl::controller::ControllerTimeouts,
    error::{RigError, RigResult},
    plan::{check_targets, DenseScan},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraTuning {
    pub capture_width: u32,
    pub capture_height: u32,
    /// Frames are resized only when both are set.
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    pub rotate_180: bool,
    pub stabilization_ms: u64,
    pub jpeg_quality: u8,
    pub embed_position: bool,
    /// Decimal places kept for x/y in the embedded metadata.
    pub position_precision: usize,
    /// Resolution recorded in the image metadata.
    pub dpi: u32,
}

impl Default for CameraTuning {
    fn default() -> Self {
        CameraTuning {
            capture_width: 1920,
            capture_height: 1080,
            output_width: None,
            output_height: None,
            rotate_180: false,
            stabilization_ms: 100,
            jpeg_quality: 90,
            embed_position: true,
            position_precision: 2,
            dpi: 96,
        }
    }
}

impl CameraTuning {
    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.output_width.zip(self.output_height)
    }
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamingScheme {
    #[default]
    TargetId,
    TimestampTarget,
    TargetTimestamp,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failed target and move on.
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    #[serde(alias = "port")]
    pub serial_port: String,
    #[serde(alias = "baudrate")]
    pub baud_rate: u32,
    pub feed_rate: f64,
    pub move_timeout_secs: f64,
    pub home_timeout_secs: f64,
    pub ack_timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub settle_delay_secs: f64,
    #[serde(alias = "plants")]
    pub targets: Vec<Target>,
    /// Used only when `targets` is empty.
    pub dense_scan: Option<DenseScan>,
    pub output_directory: PathBuf,
    pub camera_tuning: CameraTuning,
    pub naming: NamingScheme,
    pub failure_policy: FailurePolicy,
    pub home_on_start: bool,
    pub repetitions: u32,
}

impl Default for RigConfig {
    fn default() -> Self {
        RigConfig {
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: 115200,
            feed_rate: 14000.0,
            move_timeout_secs: 30.0,
            home_timeout_secs: 120.0,
            ack_timeout_secs: 10.0,
            poll_interval_ms: 100,
            settle_delay_secs: 2.0,
            targets: Vec::new(),
            dense_scan: None,
            output_directory: PathBuf::from("output_images"),
            camera_tuning: CameraTuning::default(),
            naming: NamingScheme::default(),
            failure_policy: FailurePolicy::default(),
            home_on_start: true,
            repetitions: 1,
        }
    }
}

/// Longest wait any timeout may ask for; deadlines are computed from `Instant::now()`.
const MAX_WAIT_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn checked_secs(name: &str, value: f64, allow_zero: bool) -> RigResult<Duration> {
    let in_range = value.is_finite() && value <= MAX_WAIT_SECS && (value > 0.0 || (allow_zero && value == 0.0));
    if !in_range {
        let lower = if allow_zero { "0" } else { "above 0" };
        return Err(RigError::Config(format!(
            "{} must be {} and at most {} seconds, got {}",
            name, lower, MAX_WAIT_SECS, value
        )));
    }
    Duration::try_from_secs_f64(value).map_err(|e| RigError::Config(format!("{}: {}", name, e)))
}

/// Clamped conversion for values that already passed `validate`.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_WAIT_SECS)).unwrap_or_default()
}

impl RigConfig {
    pub fn load(path: impl AsRef<Path>) -> RigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RigError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
    pub fn from_json(text: &str) -> RigResult<Self> {
        serde_json::from_str(text).map_err(|e| RigError::Config(e.to_string()))
    }
    /// Explicit targets in file order, or the dense row when none are listed.
    pub fn resolved_targets(&self) -> Vec<Target> {
        match (&self.targets[..], &self.dense_scan) {
            ([], Some(scan)) => scan.targets(),
            (targets, _) => targets.to_vec(),
        }
    }
    pub fn move_timeout(&self) -> Duration {
        secs(self.move_timeout_secs)
    }
    pub fn home_timeout(&self) -> Duration {
        secs(self.home_timeout_secs)
    }
    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }
    pub fn controller_timeouts(&self) -> ControllerTimeouts {
        ControllerTimeouts {
            ack: secs(self.ack_timeout_secs),
            home: self.home_timeout(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
    pub fn validate(&self) -> RigResult<()> {
        if self.targets.is_empty() {
            if let Some(scan) = &self.dense_scan {
                scan.validate()?;
            }
        }
        check_targets(&self.resolved_targets())?;
        if !(self.feed_rate.is_finite() && self.feed_rate > 0.0) {
            return Err(RigError::Config(format!("feed rate must be positive, got {}", self.feed_rate)));
        }
        checked_secs("move_timeout_secs", self.move_timeout_secs, false)?;
        checked_secs("home_timeout_secs", self.home_timeout_secs, false)?;
        checked_secs("ack_timeout_secs", self.ack_timeout_secs, false)?;
        checked_secs("settle_delay_secs", self.settle_delay_secs, true)?;
        if self.poll_interval_ms == 0 || self.poll_interval_ms as f64 > MAX_WAIT_SECS * 1000.0 {
            return Err(RigError::Config(format!("poll_interval_ms out of range: {}", self.poll_interval_ms)));
        }
        if self.baud_rate == 0 {
            return Err(RigError::Config("baud rate must be positive".into()));
        }
        if self.repetitions == 0 {
            return Err(RigError::Config("repetitions must be at least 1".into()));
        }
        if !(1..=100).contains(&self.camera_tuning.jpeg_quality) {
            return Err(RigError::Config("jpeg_quality must be between 1 and 100".into()));
        }
        Ok(())
    }
}

use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Serialize, Deserialize};

use crate::grbl::MachineStatus;

/// A position to photograph, in machine coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    #[serde(alias = "X")]
    pub x: f64,
    #[serde(alias = "Y")]
    pub y: f64,
}

impl Target {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Target { id: id.into(), x, y }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub target_id: String,
    pub file_path: Option<PathBuf>,
    pub timestamp: DateTime<Local>,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn success(target_id: impl Into<String>, file_path: PathBuf) -> Self {
        CaptureResult {
            target_id: target_id.into(),
            file_path: Some(file_path),
            timestamp: Local::now(),
            succeeded: true,
            error: None,
        }
    }
    pub fn failure(target_id: impl Into<String>, error: impl Into<String>) -> Self {
        CaptureResult {
            target_id: target_id.into(),
            file_path: None,
            timestamp: Local::now(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Aborted(String),
    Failed(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub session_dir: PathBuf,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

// Everything a capture run reports back to whoever is watching it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RunEvent {
    Log {
        time: DateTime<Local>,
        level: LogLevel,
        message: String,
    },
    Status {
        status: MachineStatus,
        raw: String,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    Image {
        target_id: String,
        path: PathBuf,
    },
    Result(CaptureResult),
    Finished(RunSummary),
}

impl RunEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        RunEvent::Log { time: Local::now(), level, message: message.into() }
    }
    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }
    pub fn warning(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warning, message)
    }
    pub fn error(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Error, message)
    }
    pub fn debug(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Debug, message)
    }
    /// One-line rendering for terminals and log files.
    pub fn describe(&self) -> String {
        match self {
            RunEvent::Log { message, .. } => message.clone(),
            RunEvent::Status { status, raw } => format!("Status: {} ({})", status, raw),
            RunEvent::Progress { completed, total } => {
                let percent = if *total > 0 { *completed as f64 / *total as f64 * 100.0 } else { 0.0 };
                format!("Progress: {:.1}% ({}/{})", percent, completed, total)
            }
            RunEvent::Image { target_id, path } => format!("Image for {} saved as {}", target_id, path.display()),
            RunEvent::Result(result) => match (&result.file_path, &result.error) {
                (Some(path), _) => format!("{}: ok ({})", result.target_id, path.display()),
                (None, Some(error)) => format!("{}: failed ({})", result.target_id, error),
                (None, None) => format!("{}: failed", result.target_id),
            },
            RunEvent::Finished(summary) => format!(
                "Run finished: {:?}, {} attempted, {} succeeded, {} failed",
                summary.outcome, summary.attempted, summary.succeeded, summary.failed
            ),
        }
    }
}

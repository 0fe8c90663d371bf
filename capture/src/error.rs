use std::time::Duration;

use thiserror::Error;

pub type RigResult<T> = Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    /// Serial port or camera could not be acquired. Ends the run before it starts.
    #[error("cannot open {device}: {reason}")]
    Connection { device: String, reason: String },

    /// The firmware answered a command with `error`.
    #[error("controller rejected {command:?}: {response} ({description})")]
    Controller {
        command: String,
        response: String,
        code: Option<u64>,
        description: String,
    },

    #[error("machine not idle {waited:?} after {command:?} (last status: {last_status})")]
    MotionTimeout {
        command: String,
        waited: Duration,
        last_status: String,
    },

    #[error("capture failed for {target_id}: {reason}")]
    Capture { target_id: String, reason: String },

    #[error("could not embed position metadata: {0}")]
    MetadataEmbed(String),

    /// The link went away while a run was using it.
    #[error("serial transport failed: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a capture run is already active on this rig")]
    Busy,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RigError {
    pub fn connection(device: impl Into<String>, reason: impl ToString) -> Self {
        RigError::Connection { device: device.into(), reason: reason.to_string() }
    }
    pub fn capture(target_id: impl Into<String>, reason: impl ToString) -> Self {
        RigError::Capture { target_id: target_id.into(), reason: reason.to_string() }
    }
    /// Errors after which the hardware can no longer be trusted for this run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RigError::Connection { .. } | RigError::Transport(_) | RigError::Io(_) | RigError::Busy
        )
    }
}

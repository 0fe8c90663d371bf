use serde::{Serialize, Deserialize};

// See: the Real-time Status Reports section at:  https://github.com/gnea/grbl/blob/master/doc/markdown/interface.md
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrblState {
    Idle,
    Run,
    Hold(i64),
    Jog,
    Alarm,
    Door(i64),
    Check,
    Home,
    Sleep,
}

/// Coarse machine state as seen by the capture sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    Unknown,
    Unlocking,
    Homing,
    Idle,
    Moving,
    Error,
}

impl From<&GrblState> for MachineStatus {
    fn from(state: &GrblState) -> Self {
        match state {
            GrblState::Idle => MachineStatus::Idle,
            GrblState::Run | GrblState::Jog => MachineStatus::Moving,
            GrblState::Home => MachineStatus::Homing,
            GrblState::Alarm | GrblState::Door(_) => MachineStatus::Error,
            GrblState::Hold(_) | GrblState::Check | GrblState::Sleep => MachineStatus::Unknown,
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            MachineStatus::Unknown => "unknown",
            MachineStatus::Unlocking => "unlocking",
            MachineStatus::Homing => "homing",
            MachineStatus::Idle => "idle",
            MachineStatus::Moving => "moving",
            MachineStatus::Error => "error",
        };
        f.write_str(text)
    }
}

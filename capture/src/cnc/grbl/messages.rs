use std::borrow::Cow;

use ndarray::Array1;
pub use common::grbl::GrblState;

#[derive(Debug, Clone, PartialEq)]
pub enum GrblPosition {
    Machine(Array1<f64>),
    Work(Array1<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrblStatus {
    pub state: GrblState,
    pub position: Option<GrblPosition>,
    pub work_coordinate_offset: Option<Array1<f64>>,
    pub current_feed: Option<f64>,
    pub current_spindle: Option<f64>,
    pub planner: Option<u64>,
    pub rx_bytes: Option<u64>,
    pub line_number: Option<u64>,
    pub pins: Option<String>,
    pub unknown_terms: Vec<String>,
}
impl GrblStatus {
    pub fn new(state: GrblState) -> Self {
        GrblStatus {
            state,
            position: None,
            work_coordinate_offset: None,
            current_feed: None,
            current_spindle: None,
            planner: None,
            rx_bytes: None,
            line_number: None,
            pins: None,
            unknown_terms: Vec::new(),
        }
    }
    /// Machine position, if it was reported directly or can be derived from WPos + WCO.
    pub fn machine_position(&self) -> Option<Array1<f64>> {
        match (&self.position, &self.work_coordinate_offset) {
            (Some(GrblPosition::Machine(pos)), _) => Some(pos.clone()),
            (Some(GrblPosition::Work(pos)), Some(wco)) if pos.len() == wco.len() => Some(pos + wco),
            _ => None,
        }
    }
    pub fn work_position(&self) -> Option<Array1<f64>> {
        match (&self.position, &self.work_coordinate_offset) {
            (Some(GrblPosition::Work(pos)), _) => Some(pos.clone()),
            (Some(GrblPosition::Machine(pos)), Some(wco)) if pos.len() == wco.len() => Some(pos - wco),
            (Some(GrblPosition::Machine(pos)), None) => Some(pos.clone()),
            _ => None,
        }
    }
    pub fn xy(&self) -> Option<(f64, f64)> {
        self.work_position()
            .filter(|pos| pos.len() >= 2)
            .map(|pos| (pos[0], pos[1]))
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum GrblMessage {
    StatusEvent(GrblStatus),
    GrblOk,
    GrblError(u64),
    GrblAlarm(u64),
    GrblGreeting(String),
    Feedback(String),
    Setting { index: u64, value: String },
    Unrecognized(String),
}
impl GrblMessage {
    pub fn get_alarm_text(index: u64) -> Cow<'static, str> {
        match index {
            1 => "Hard limit triggered. Machine position is likely lost due to sudden and immediate halt. Re-homing is highly recommended.".into(),
            2 => "G-code motion target exceeds machine travel. Machine position safely retained. Alarm may be unlocked.".into(),
            3 => "Reset while in motion. Grbl cannot guarantee position. Lost steps are likely. Re-homing is highly recommended.".into(),
            4 | 5 => "Probe fail.".into(),
            6 => "Homing fail. Reset during active homing cycle.".into(),
            7 => "Homing fail. Safety door was opened during active homing cycle.".into(),
            8 => "Homing fail. Cycle failed to clear limit switch when pulling off. Try increasing pull-off setting or check wiring.".into(),
            9 => "Homing fail. Could not find limit switch within search distance.".into(),
            _ => Cow::Owned(format!("Unknown ALARM:{}", index)),
        }
    }
    pub fn get_error_text(index: u64) -> Cow<'static, str> {
        match index {
            1 => "G-code words consist of a letter and a value. Letter was not found.".into(),
            2 => "Numeric value format is not valid or missing an expected value.".into(),
            3 => "Grbl '$' system command was not recognized or supported.".into(),
            4 => "Negative value received for an expected positive value.".into(),
            5 => "Homing cycle is not enabled via settings.".into(),
            8 => "Grbl '$' command cannot be used unless Grbl is IDLE.".into(),
            9 => "G-code locked out during alarm or jog state.".into(),
            11 => "Max characters per line exceeded. Line was not processed and executed.".into(),
            15 => "Jog target exceeds machine travel. Command ignored.".into(),
            20 => "Unsupported or invalid g-code command found in block.".into(),
            21 => "More than one g-code command from same modal group found in block.".into(),
            22 => "Feed rate has not yet been set or is undefined.".into(),
            24 => "Two G-code commands that both require the use of the XYZ axis words were detected in the block.".into(),
            25 => "A G-code word was repeated in the block.".into(),
            26 => "A G-code command implicitly or explicitly requires XYZ axis words in the block, but none were detected.".into(),
            33 => "The motion command has an invalid target.".into(),
            36 => "There are unused, leftover G-code words that aren't used by any command in the block.".into(),
            _ => Cow::Owned(format!("Unknown error:{}", index))
        }
    }
}

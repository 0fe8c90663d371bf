pub mod grbl_sim;
#[cfg(feature = "socat")]
pub mod socat_port;

pub use grbl_sim::{GrblSimulator, Journal, SimulatorSettings};

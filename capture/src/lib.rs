pub mod capture;
pub mod cnc;
pub mod config;
pub mod error;
pub mod plan;
pub mod sequencer;

pub use error::{RigError, RigResult};

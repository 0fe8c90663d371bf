use std::collections::HashMap;

use common::api::Target;
use serde::{Deserialize, Serialize};

use crate::error::{RigError, RigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAxis {
    X,
    Y,
}

/// A single row of heavily overlapping shots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseScan {
    pub origin_x: f64,
    pub origin_y: f64,
    pub axis: ScanAxis,
    pub count: usize,
    pub field_of_view_mm: f64,
    /// Fraction of each frame shared with the next one.
    pub overlap: f64,
}

impl Default for DenseScan {
    fn default() -> Self {
        DenseScan {
            origin_x: 0.0,
            origin_y: 0.0,
            axis: ScanAxis::X,
            count: 10,
            field_of_view_mm: 10.0,
            overlap: 0.9,
        }
    }
}

impl DenseScan {
    pub fn step(&self) -> f64 {
        self.field_of_view_mm * (1.0 - self.overlap)
    }
    pub fn validate(&self) -> RigResult<()> {
        if self.count == 0 {
            return Err(RigError::Config("dense scan needs at least one shot".into()));
        }
        if !(self.field_of_view_mm.is_finite() && self.field_of_view_mm > 0.0) {
            return Err(RigError::Config(format!("field of view must be positive, got {}", self.field_of_view_mm)));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(RigError::Config(format!("overlap must be in [0, 1), got {}", self.overlap)));
        }
        Ok(())
    }
    pub fn targets(&self) -> Vec<Target> {
        let step = self.step();
        (0..self.count)
            .map(|i| {
                let offset = step * i as f64;
                let (x, y) = match self.axis {
                    ScanAxis::X => (self.origin_x + offset, self.origin_y),
                    ScanAxis::Y => (self.origin_x, self.origin_y + offset),
                };
                Target::new(format!("imagem_{:03}", i + 1), x, y)
            })
            .collect()
    }
}

/// One stop of a run: which target, on which pass, and its position in the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub target: Target,
    /// 1-based.
    pub pass: u32,
    /// 1-based over every pass.
    pub sequence: usize,
}

pub fn expand_visits(targets: &[Target], repetitions: u32) -> Vec<Visit> {
    (1..=repetitions)
        .flat_map(|pass| targets.iter().map(move |target| (pass, target)))
        .enumerate()
        .map(|(i, (pass, target))| Visit { target: target.clone(), pass, sequence: i + 1 })
        .collect()
}

/// A target id as it appears in file names.
pub fn file_safe_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

pub fn check_targets(targets: &[Target]) -> RigResult<()> {
    if targets.is_empty() {
        return Err(RigError::Config("no targets to visit".into()));
    }
    let mut stems: HashMap<String, &str> = HashMap::new();
    for target in targets {
        if !(target.x.is_finite() && target.y.is_finite()) {
            return Err(RigError::Config(format!("target {} has a non-finite coordinate", target.id)));
        }
        if let Some(earlier) = stems.insert(file_safe_id(&target.id), &target.id) {
            return Err(RigError::Config(if earlier == target.id {
                format!("duplicate target id {}", target.id)
            } else {
                format!("target ids {} and {} would be saved under the same file name", earlier, target.id)
            }));
        }
    }
    Ok(())
}

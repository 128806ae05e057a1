// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Simulation configuration: grid bounds, step range, seed, replicates,
//! export bindings.

use std::fmt;

use crate::entity::Substep;
use crate::error::EngineError;
use crate::value::Scalar;

/// Export target URI template supporting a `{replicate}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExportTemplate(String);

impl ExportTemplate {
    /// Wraps a template string such as `file:///tmp/out_{replicate}.jsonl`.
    #[must_use]
    pub fn new(template: &str) -> Self {
        Self(template.to_string())
    }

    /// Substitutes the replicate number into the template.
    #[must_use]
    pub fn resolve(&self, replicate: u32) -> String {
        self.0.replace("{replicate}", &replicate.to_string())
    }
}

impl fmt::Display for ExportTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One export binding: a simulation attribute pushed to the sink after the
/// named substep completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBinding {
    /// Simulation attribute to export.
    pub attribute: String,
    /// Substep after which the value is observed.
    pub substep: Substep,
}

/// Validated simulation-level configuration.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Inclusive low corner of the patch grid, in cells.
    pub grid_low: (i64, i64),
    /// Inclusive high corner of the patch grid, in cells.
    pub grid_high: (i64, i64),
    /// Physical edge length of one grid cell (e.g. `1000 m`). Spatial query
    /// radii are converted into cell units through this scalar.
    pub cell_size: Scalar,
    /// First tick executed (the init tick).
    pub steps_low: u64,
    /// Last tick executed, inclusive.
    pub steps_high: u64,
    /// Base random seed; replicate streams derive from it.
    pub seed: u64,
    /// Number of replicates to run.
    pub replicates: u32,
    /// Export target template, when exports leave the process.
    pub export_template: Option<ExportTemplate>,
    /// Attribute/substep pairs streamed to the export sink.
    pub exports: Vec<ExportBinding>,
}

impl SimulationConfig {
    /// Minimal valid configuration over the given grid and step range.
    #[must_use]
    pub fn new(grid_low: (i64, i64), grid_high: (i64, i64), steps_low: u64, steps_high: u64) -> Self {
        Self {
            grid_low,
            grid_high,
            cell_size: Scalar::with_unit(1.0, "m"),
            steps_low,
            steps_high,
            seed: 0,
            replicates: 1,
            export_template: None,
            exports: Vec::new(),
        }
    }

    /// Grid width in cells.
    #[must_use]
    pub fn grid_width(&self) -> usize {
        (self.grid_high.0 - self.grid_low.0 + 1).max(0) as usize
    }

    /// Grid height in cells.
    #[must_use]
    pub fn grid_height(&self) -> usize {
        (self.grid_high.1 - self.grid_low.1 + 1).max(0) as usize
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.grid_high.0 < self.grid_low.0 || self.grid_high.1 < self.grid_low.1 {
            return Err(EngineError::invalid_config(format!(
                "grid high corner {:?} is below low corner {:?}",
                self.grid_high, self.grid_low
            )));
        }
        if self.steps_high < self.steps_low {
            return Err(EngineError::invalid_config(format!(
                "steps.high {} is below steps.low {}",
                self.steps_high, self.steps_low
            )));
        }
        if self.replicates == 0 {
            return Err(EngineError::invalid_config("replicates must be at least 1"));
        }
        if !self.cell_size.value.is_finite() || self.cell_size.value <= 0.0 {
            return Err(EngineError::invalid_config(format!(
                "cell size must be positive, found {}",
                self.cell_size
            )));
        }
        Ok(())
    }
}

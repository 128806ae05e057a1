// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! External geospatial resource collaborators.
//!
//! The core treats a resource as a `(point) → value` provider behind this
//! trait; opening and decoding raster files happens outside. Readers are
//! opened once per simulation and dropped at the end of the run. A missing
//! value is not an error: it surfaces as an empty distribution so tolerant
//! handlers can branch on emptiness instead of failing the tick.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::EngineError;
use crate::geom::{GridPoint, GridShape};
use crate::units::Units;
use crate::value::{RealizedDistribution, Scalar, Value};

/// A `(point) → value` provider over an external geospatial source.
pub trait ExternalResource: Send + Sync {
    /// Samples the source at one point.
    ///
    /// A point with no coverage returns an empty realized distribution.
    fn sample_at(&self, point: GridPoint) -> Result<Value, EngineError>;

    /// Samples the source across a shape, returning every covered value.
    fn bulk_sample(&self, shape: &GridShape) -> Result<RealizedDistribution, EngineError>;
}

/// In-memory grid-backed resource used by tests and embedders.
///
/// Values are keyed by rounded integer cell; lookups outside the table yield
/// an empty distribution, mirroring a raster's nodata cells.
pub struct GridResource {
    units: Units,
    cells: FxHashMap<(i64, i64), f64>,
}

impl GridResource {
    /// Creates an empty resource producing values in `units`.
    #[must_use]
    pub fn new(units: Units) -> Self {
        Self {
            units,
            cells: FxHashMap::default(),
        }
    }

    /// Sets the value of one cell.
    pub fn set(&mut self, cell: (i64, i64), value: f64) {
        self.cells.insert(cell, value);
    }
}

impl ExternalResource for GridResource {
    fn sample_at(&self, point: GridPoint) -> Result<Value, EngineError> {
        let cell = (libm::round(point.x) as i64, libm::round(point.y) as i64);
        match self.cells.get(&cell) {
            Some(value) => Ok(Value::Scalar(Scalar::new(*value, self.units.clone()))),
            None => Ok(Value::Realized(RealizedDistribution::empty(
                self.units.clone(),
            ))),
        }
    }

    fn bulk_sample(&self, shape: &GridShape) -> Result<RealizedDistribution, EngineError> {
        let (min_x, min_y, max_x, max_y) = shape.cell_bounds();
        let mut scalars = Vec::new();
        for cell_y in min_y..=max_y {
            for cell_x in min_x..=max_x {
                if !shape.intersects_cell(cell_x, cell_y) {
                    continue;
                }
                if let Some(value) = self.cells.get(&(cell_x, cell_y)) {
                    scalars.push(Scalar::new(*value, self.units.clone()));
                }
            }
        }
        RealizedDistribution::of_scalars(scalars, self.units.clone())
    }
}

impl fmt::Debug for GridResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridResource")
            .field("units", &self.units)
            .field("cell_count", &self.cells.len())
            .finish()
    }
}

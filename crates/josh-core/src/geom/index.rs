// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dense 2-D index over patch entities.
//!
//! One `Option<EntityId>` per integer grid cell, anchored at the grid's low
//! corner; built once per time step. Circle queries take the cached-offset
//! fast path when the centre is cell-aligned (the universal case — queries
//! anchor at patch coordinates) and fall back to an exact bounding-box scan
//! otherwise. Both paths re-check exact intersection against the actual
//! query shape, so results contain zero false positives and no duplicates.
//! Result order follows the scan and is unspecified; callers needing
//! determinism sort.

use crate::entity::EntityId;
use crate::error::EngineError;

use super::{circle_offsets, GridPoint, GridShape};

/// Dense spatial index over the patch grid.
#[derive(Debug, Clone)]
pub struct PatchIndex {
    low_x: i64,
    low_y: i64,
    width: usize,
    height: usize,
    cells: Vec<Option<EntityId>>,
}

impl PatchIndex {
    /// Builds the index for the inclusive cell range `low..=high`.
    ///
    /// Every patch must sit (within rounding) on a distinct in-bounds cell.
    pub fn build(
        low: (i64, i64),
        high: (i64, i64),
        patches: impl IntoIterator<Item = (EntityId, GridPoint)>,
    ) -> Result<Self, EngineError> {
        if high.0 < low.0 || high.1 < low.1 {
            return Err(EngineError::invalid_config(format!(
                "grid high corner {high:?} is below low corner {low:?}"
            )));
        }
        let width = (high.0 - low.0 + 1) as usize;
        let height = (high.1 - low.1 + 1) as usize;
        let mut index = Self {
            low_x: low.0,
            low_y: low.1,
            width,
            height,
            cells: vec![None; width * height],
        };
        for (id, position) in patches {
            let cell_x = libm::round(position.x) as i64;
            let cell_y = libm::round(position.y) as i64;
            let Some(slot) = index.cell_slot(cell_x, cell_y) else {
                return Err(EngineError::invalid_config(format!(
                    "patch at ({}, {}) lies outside the grid",
                    position.x, position.y
                )));
            };
            if index.cells[slot].is_some() {
                return Err(EngineError::invalid_config(format!(
                    "two patches share cell ({cell_x}, {cell_y})"
                )));
            }
            index.cells[slot] = Some(id);
        }
        Ok(index)
    }

    /// Grid width in cells.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    fn cell_slot(&self, cell_x: i64, cell_y: i64) -> Option<usize> {
        let col = cell_x.checked_sub(self.low_x)?;
        let row = cell_y.checked_sub(self.low_y)?;
        if col < 0 || row < 0 || col as usize >= self.width || row as usize >= self.height {
            return None;
        }
        Some(row as usize * self.width + col as usize)
    }

    /// The patch occupying the cell at integer coordinates, if any.
    #[must_use]
    pub fn at(&self, cell_x: i64, cell_y: i64) -> Option<EntityId> {
        self.cell_slot(cell_x, cell_y)
            .and_then(|slot| self.cells[slot])
    }

    /// Every patch whose cell intersects the given circle.
    #[must_use]
    pub fn query_circle(&self, center: GridPoint, radius: f64) -> Vec<EntityId> {
        let shape = GridShape::Circle { center, radius };
        if center.is_cell_aligned() && radius > 0.0 {
            let anchor_x = libm::round(center.x) as i64;
            let anchor_y = libm::round(center.y) as i64;
            let key = libm::ceil(radius).max(1.0) as u32;
            let mut result = Vec::new();
            for (dx, dy) in circle_offsets(key).iter() {
                let cell_x = anchor_x + i64::from(*dx);
                let cell_y = anchor_y + i64::from(*dy);
                if let Some(id) = self.at(cell_x, cell_y) {
                    if shape.intersects_cell(cell_x, cell_y) {
                        result.push(id);
                    }
                }
            }
            return result;
        }
        self.scan(&shape)
    }

    /// Every patch whose cell intersects the given square.
    #[must_use]
    pub fn query_square(&self, center: GridPoint, width: f64) -> Vec<EntityId> {
        self.scan(&GridShape::Square { center, width })
    }

    /// The patch whose cell contains the point, if any.
    #[must_use]
    pub fn query_point(&self, point: GridPoint) -> Option<EntityId> {
        self.at(libm::round(point.x) as i64, libm::round(point.y) as i64)
    }

    /// Every patch whose cell intersects the shape.
    #[must_use]
    pub fn query_shape(&self, shape: &GridShape) -> Vec<EntityId> {
        match shape {
            GridShape::Circle { center, radius } => self.query_circle(*center, *radius),
            GridShape::Square { center, width } => self.query_square(*center, *width),
            GridShape::Point(p) => self.query_point(*p).into_iter().collect(),
        }
    }

    /// Bounding-box candidate selection followed by exact intersection.
    fn scan(&self, shape: &GridShape) -> Vec<EntityId> {
        let (min_x, min_y, max_x, max_y) = shape.cell_bounds();
        let min_x = min_x.max(self.low_x);
        let min_y = min_y.max(self.low_y);
        let max_x = max_x.min(self.low_x + self.width as i64 - 1);
        let max_y = max_y.min(self.low_y + self.height as i64 - 1);
        let mut result = Vec::new();
        for cell_y in min_y..=max_y {
            for cell_x in min_x..=max_x {
                if let Some(id) = self.at(cell_x, cell_y) {
                    if shape.intersects_cell(cell_x, cell_y) {
                        result.push(id);
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn grid_3x3() -> PatchIndex {
        let patches = (0..9).map(|i| {
            (
                EntityId::new(i),
                GridPoint::new(f64::from(i % 3), f64::from(i / 3)),
            )
        });
        PatchIndex::build((0, 0), (2, 2), patches).unwrap()
    }

    #[test]
    fn point_query_hits_the_containing_cell() {
        let index = grid_3x3();
        assert_eq!(index.query_point(GridPoint::new(1.2, 0.9)), Some(EntityId::new(4)));
        assert_eq!(index.query_point(GridPoint::new(-3.0, 0.0)), None);
    }

    #[test]
    fn circle_query_from_center_covers_intersecting_cells() {
        let index = grid_3x3();
        // Radius 1 from the centre cell touches every unit square of the
        // Moore neighbourhood (diagonal corners are ~0.707 away).
        let hit = index.query_circle(GridPoint::new(1.0, 1.0), 1.0);
        assert_eq!(hit.len(), 9);
        // Radius 0.4 reaches no neighbouring square.
        let hit = index.query_circle(GridPoint::new(1.0, 1.0), 0.4);
        assert_eq!(hit.len(), 1);
    }

    #[test]
    fn cached_path_matches_brute_force() {
        let index = grid_3x3();
        for radius in [0.5, 1.0, 1.2, 1.5, 2.0, 2.5] {
            let center = GridPoint::new(1.0, 1.0);
            let shape = GridShape::Circle { center, radius };
            let mut fast = index.query_circle(center, radius);
            let mut brute: Vec<EntityId> = (0..3)
                .flat_map(|y| (0..3).map(move |x| (x, y)))
                .filter(|(x, y)| shape.intersects_cell(*x, *y))
                .filter_map(|(x, y)| index.at(x, y))
                .collect();
            fast.sort_unstable();
            brute.sort_unstable();
            assert_eq!(fast, brute, "radius {radius}");
        }
    }

    #[test]
    fn unaligned_circle_takes_the_exact_path() {
        let index = grid_3x3();
        let mut hits = index.query_circle(GridPoint::new(0.9, 0.9), 0.15);
        hits.sort_unstable();
        assert_eq!(hits, vec![EntityId::new(4)]);
    }

    #[test]
    fn square_query_uses_exact_overlap() {
        let index = grid_3x3();
        let hits = index.query_square(GridPoint::new(1.0, 1.0), 1.0);
        assert_eq!(hits.len(), 9);
        let hits = index.query_square(GridPoint::new(1.0, 1.0), 0.9);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn duplicate_cells_are_rejected_at_build() {
        let err = PatchIndex::build(
            (0, 0),
            (1, 1),
            [
                (EntityId::new(0), GridPoint::new(0.0, 0.0)),
                (EntityId::new(1), GridPoint::new(0.1, -0.1)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    }
}

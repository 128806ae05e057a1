// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Planar grid geometry: points, squares, circles, exact cell intersection.
//!
//! All geometry is planar-grid approximate by design; no geodesy in the hot
//! path. A grid cell is the unit square centred on its integer coordinate.
//! Intersection predicates are exact (clamped-distance for circles, AABB
//! overlap for squares) with boundary contact counting as intersection.
//! Shape equality uses a `1e-5` tolerance on centres and extents.

mod index;
mod offsets;

pub use index::PatchIndex;
pub(crate) use offsets::circle_offsets;

/// Tolerance applied to shape equality and integer alignment checks.
pub const GEOM_TOLERANCE: f64 = 1e-5;

/// A position on the patch grid, in cell units.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GridPoint {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

impl GridPoint {
    /// Creates a point.
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        libm::sqrt(dx * dx + dy * dy)
    }

    /// Tolerance-based equality on both coordinates.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.x - other.x).abs() <= GEOM_TOLERANCE && (self.y - other.y).abs() <= GEOM_TOLERANCE
    }

    /// Returns `true` when both coordinates sit on integers (within
    /// tolerance) — the anchored case the offset cache serves.
    #[must_use]
    pub(crate) fn is_cell_aligned(&self) -> bool {
        (self.x - libm::round(self.x)).abs() <= GEOM_TOLERANCE
            && (self.y - libm::round(self.y)).abs() <= GEOM_TOLERANCE
    }
}

/// A query shape on the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GridShape {
    /// A single point.
    Point(GridPoint),
    /// An axis-aligned square described by centre and edge width.
    Square {
        /// Centre of the square.
        center: GridPoint,
        /// Edge length.
        width: f64,
    },
    /// A circle described by centre and radius.
    Circle {
        /// Centre of the circle.
        center: GridPoint,
        /// Radius.
        radius: f64,
    },
}

impl GridShape {
    /// Centre of the shape.
    #[must_use]
    pub fn center(&self) -> GridPoint {
        match self {
            Self::Point(p) => *p,
            Self::Square { center, .. } | Self::Circle { center, .. } => *center,
        }
    }

    /// Tolerance-based equality: same variant, centres and extents within
    /// [`GEOM_TOLERANCE`].
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Point(a), Self::Point(b)) => a.approx_eq(b),
            (
                Self::Square {
                    center: ca,
                    width: wa,
                },
                Self::Square {
                    center: cb,
                    width: wb,
                },
            ) => ca.approx_eq(cb) && (wa - wb).abs() <= GEOM_TOLERANCE,
            (
                Self::Circle {
                    center: ca,
                    radius: ra,
                },
                Self::Circle {
                    center: cb,
                    radius: rb,
                },
            ) => ca.approx_eq(cb) && (ra - rb).abs() <= GEOM_TOLERANCE,
            _ => false,
        }
    }

    /// Exact intersection against the unit cell centred at `(cell_x, cell_y)`.
    #[must_use]
    pub fn intersects_cell(&self, cell_x: i64, cell_y: i64) -> bool {
        match self {
            Self::Point(p) => point_in_unit_cell(*p, cell_x, cell_y),
            Self::Square { center, width } => {
                square_intersects_unit_cell(*center, *width, cell_x, cell_y)
            }
            Self::Circle { center, radius } => {
                circle_intersects_unit_cell(*center, *radius, cell_x, cell_y)
            }
        }
    }

    /// Inclusive integer-cell bounding range `(min_x, min_y, max_x, max_y)`
    /// guaranteed to cover every cell the shape can touch.
    #[must_use]
    pub fn cell_bounds(&self) -> (i64, i64, i64, i64) {
        let (center, half_extent) = match self {
            Self::Point(p) => (*p, 0.0),
            Self::Square { center, width } => (*center, width / 2.0),
            Self::Circle { center, radius } => (*center, *radius),
        };
        // Cells are unit squares around integers, so pad by half a cell.
        let min_x = libm::floor(center.x - half_extent - 0.5) as i64;
        let max_x = libm::ceil(center.x + half_extent + 0.5) as i64;
        let min_y = libm::floor(center.y - half_extent - 0.5) as i64;
        let max_y = libm::ceil(center.y + half_extent + 0.5) as i64;
        (min_x, min_y, max_x, max_y)
    }
}

/// A circle intersects a unit cell iff the centre clamped to the cell lies
/// within the radius.
#[must_use]
pub(crate) fn circle_intersects_unit_cell(
    center: GridPoint,
    radius: f64,
    cell_x: i64,
    cell_y: i64,
) -> bool {
    let clamped_x = center.x.clamp(cell_x as f64 - 0.5, cell_x as f64 + 0.5);
    let clamped_y = center.y.clamp(cell_y as f64 - 0.5, cell_y as f64 + 0.5);
    center.distance_to(&GridPoint::new(clamped_x, clamped_y)) <= radius
}

fn square_intersects_unit_cell(center: GridPoint, width: f64, cell_x: i64, cell_y: i64) -> bool {
    let half = width / 2.0;
    (center.x - cell_x as f64).abs() <= half + 0.5 && (center.y - cell_y as f64).abs() <= half + 0.5
}

fn point_in_unit_cell(p: GridPoint, cell_x: i64, cell_y: i64) -> bool {
    (p.x - cell_x as f64).abs() <= 0.5 && (p.y - cell_y as f64).abs() <= 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_cell_intersection_uses_clamped_distance() {
        let origin = GridPoint::new(0.0, 0.0);
        // Diagonal neighbour: nearest corner at (0.5, 0.5), distance ~0.707.
        assert!(circle_intersects_unit_cell(origin, 1.0, 1, 1));
        assert!(!circle_intersects_unit_cell(origin, 0.7, 1, 1));
        // Two cells out: nearest edge at x = 1.5.
        assert!(!circle_intersects_unit_cell(origin, 1.49, 2, 0));
        assert!(circle_intersects_unit_cell(origin, 1.5, 2, 0));
    }

    #[test]
    fn shape_equality_tolerates_small_drift() {
        let a = GridShape::Circle {
            center: GridPoint::new(1.0, 2.0),
            radius: 3.0,
        };
        let b = GridShape::Circle {
            center: GridPoint::new(1.0 + 5e-6, 2.0),
            radius: 3.0 - 5e-6,
        };
        let c = GridShape::Circle {
            center: GridPoint::new(1.0, 2.0),
            radius: 3.1,
        };
        assert!(a.approx_eq(&b));
        assert!(!a.approx_eq(&c));
        assert!(!a.approx_eq(&GridShape::Point(GridPoint::new(1.0, 2.0))));
    }

    #[test]
    fn square_intersection_counts_edge_contact() {
        let center = GridPoint::new(0.0, 0.0);
        assert!(square_intersects_unit_cell(center, 1.0, 1, 0));
        assert!(!square_intersects_unit_cell(center, 0.9, 1, 0));
    }

    #[test]
    fn cell_bounds_cover_the_shape() {
        let circle = GridShape::Circle {
            center: GridPoint::new(0.2, -0.3),
            radius: 2.0,
        };
        let (min_x, min_y, max_x, max_y) = circle.cell_bounds();
        for cy in min_y..=max_y {
            for cx in min_x..=max_x {
                let _ = circle.intersects_cell(cx, cy);
            }
        }
        assert!(min_x <= -2 && max_x >= 2);
        assert!(min_y <= -2 && max_y >= 2);
    }

    #[test]
    fn alignment_detection_is_tolerant() {
        assert!(GridPoint::new(3.0, -2.0).is_cell_aligned());
        assert!(GridPoint::new(3.000001, -2.0).is_cell_aligned());
        assert!(!GridPoint::new(3.4, -2.0).is_cell_aligned());
    }
}

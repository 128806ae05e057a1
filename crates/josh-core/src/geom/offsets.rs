// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-global cache of circle-query cell offsets.
//!
//! Keyed by `⌈R⌉`, each entry enumerates exactly the integer cells whose unit
//! square intersects a circle of that radius centred at the origin. The cache
//! is lazy and append-only (the key space is a few hundred radii in
//! practice). Concurrent readers observe either absence or a fully built
//! list; racing writers compute value-equal lists, so first-write-wins
//! publication is safe. Enumeration order within a list is fixed (row-major
//! over the scan box) but callers must not rely on it.

use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use super::{circle_intersects_unit_cell, GridPoint};

/// A cell offset relative to the query anchor.
pub(crate) type CellOffset = (i32, i32);

static OFFSET_CACHE: LazyLock<RwLock<FxHashMap<u32, Arc<[CellOffset]>>>> =
    LazyLock::new(|| RwLock::new(FxHashMap::default()));

/// Returns the offsets of every cell whose unit square intersects an
/// origin-centred circle of radius `radius_ceil`.
pub(crate) fn circle_offsets(radius_ceil: u32) -> Arc<[CellOffset]> {
    if let Some(hit) = OFFSET_CACHE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&radius_ceil)
    {
        return Arc::clone(hit);
    }
    let computed = compute_offsets(radius_ceil);
    let mut cache = OFFSET_CACHE.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(cache.entry(radius_ceil).or_insert(computed))
}

/// Exhaustive scan of the bounding box `[-k, +k]²` keeping intersecting cells.
fn compute_offsets(radius_ceil: u32) -> Arc<[CellOffset]> {
    let k = i64::from(radius_ceil);
    let radius = f64::from(radius_ceil);
    let origin = GridPoint::new(0.0, 0.0);
    let mut offsets = Vec::new();
    for dy in -k..=k {
        for dx in -k..=k {
            if circle_intersects_unit_cell(origin, radius, dx, dy) {
                offsets.push((dx as i32, dy as i32));
            }
        }
    }
    offsets.into()
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unit interning, canonical unit monomials, and the conversion graph.
//!
//! Units are interned process-wide into dense [`UnitId`]s; the table is
//! append-only and never evicts (its key space is dozens of names in
//! practice). A [`Units`] value is a canonical sorted exponent monomial over
//! unit ids — `m2 / s` is `[(m, 2), (s, -1)]` — so unit equality is plain
//! slice equality and the symbolic algebra of `mul`/`div`/`pow` is exponent
//! arithmetic.
//!
//! Conversions are unidirectional compiled mappings between single base
//! units. Path lookup over the conversion graph is cached, including
//! negative results; the cache tolerates racing writers because competing
//! computations of the same key produce the same path (BFS over a frozen
//! adjacency list is deterministic).

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use crate::error::EngineError;

/// Dense process-wide identifier for an interned unit name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId(u32);

impl UnitId {
    /// Returns the dense table index of this unit.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct InternTable {
    names: Vec<Arc<str>>,
    lookup: FxHashMap<Arc<str>, UnitId>,
}

static INTERNS: LazyLock<RwLock<InternTable>> = LazyLock::new(|| {
    RwLock::new(InternTable {
        names: Vec::new(),
        lookup: FxHashMap::default(),
    })
});

/// Process-wide unit name interner.
///
/// Append-only: ids are stable for the lifetime of the process and shared
/// across programs and replicates.
pub struct UnitRegistry;

impl UnitRegistry {
    /// Interns `name`, returning its id (existing or fresh).
    pub fn intern(name: &str) -> UnitId {
        {
            let table = INTERNS.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = table.lookup.get(name) {
                return *id;
            }
        }
        let mut table = INTERNS.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = table.lookup.get(name) {
            return *id;
        }
        let id = UnitId(table.names.len() as u32);
        let interned: Arc<str> = Arc::from(name);
        table.names.push(Arc::clone(&interned));
        table.lookup.insert(interned, id);
        id
    }

    /// Registers `alias` as another spelling of `canonical`.
    ///
    /// Re-declaring an existing alias for the same canonical unit is a no-op;
    /// re-binding it to a different unit is rejected (the table is
    /// append-only and shared process-wide).
    pub fn alias(alias: &str, canonical: &str) -> Result<(), EngineError> {
        let canonical_id = Self::intern(canonical);
        let mut table = INTERNS.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.lookup.get(alias) {
            if *existing == canonical_id {
                return Ok(());
            }
            return Err(EngineError::invalid_config(format!(
                "alias '{alias}' is already bound to '{}'",
                table.names[existing.index()]
            )));
        }
        table.lookup.insert(Arc::from(alias), canonical_id);
        Ok(())
    }

    /// Returns the canonical name for `id`.
    #[must_use]
    pub fn name(id: UnitId) -> Arc<str> {
        let table = INTERNS.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&table.names[id.index()])
    }
}

/// Canonical unit monomial attached to scalars and distributions.
///
/// Factors are sorted by [`UnitId`] and never contain zero exponents, so
/// derived equality and hashing are canonical. The empty monomial is
/// dimensionless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Units {
    factors: Arc<[(UnitId, i32)]>,
}

impl Units {
    /// The dimensionless (empty) monomial.
    #[must_use]
    pub fn dimensionless() -> Self {
        Self {
            factors: Arc::from([]),
        }
    }

    /// A single base unit with exponent one, e.g. `Units::base("m")`.
    #[must_use]
    pub fn base(name: &str) -> Self {
        Self {
            factors: Arc::from([(UnitRegistry::intern(name), 1)]),
        }
    }

    fn from_factors(mut factors: Vec<(UnitId, i32)>) -> Self {
        factors.retain(|(_, exp)| *exp != 0);
        factors.sort_unstable_by_key(|(id, _)| *id);
        Self {
            factors: factors.into(),
        }
    }

    /// Returns `true` when no units are attached.
    #[must_use]
    pub fn is_dimensionless(&self) -> bool {
        self.factors.is_empty()
    }

    /// Returns the single base unit id when this is a plain `unit^1` monomial.
    #[must_use]
    pub fn single_base(&self) -> Option<UnitId> {
        match &*self.factors {
            [(id, 1)] => Some(*id),
            _ => None,
        }
    }

    /// Iterates the canonical `(unit, exponent)` factors.
    pub fn factors(&self) -> impl Iterator<Item = (UnitId, i32)> + '_ {
        self.factors.iter().copied()
    }

    /// Symbolic product of two monomials.
    #[must_use]
    pub fn multiply(&self, rhs: &Self) -> Self {
        let mut merged: FxHashMap<UnitId, i32> = FxHashMap::default();
        for (id, exp) in self.factors() {
            *merged.entry(id).or_insert(0) += exp;
        }
        for (id, exp) in rhs.factors() {
            *merged.entry(id).or_insert(0) += exp;
        }
        Self::from_factors(merged.into_iter().collect())
    }

    /// Symbolic quotient of two monomials.
    #[must_use]
    pub fn divide(&self, rhs: &Self) -> Self {
        self.multiply(&rhs.powi(-1))
    }

    /// Raises every exponent by the integer power `n`.
    #[must_use]
    pub fn powi(&self, n: i32) -> Self {
        Self::from_factors(self.factors().map(|(id, exp)| (id, exp * n)).collect())
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return f.write_str("1");
        }
        let mut numerator = String::new();
        let mut denominator = String::new();
        for (id, exp) in self.factors() {
            let name = UnitRegistry::name(id);
            let (target, magnitude) = if exp > 0 {
                (&mut numerator, exp)
            } else {
                (&mut denominator, -exp)
            };
            if !target.is_empty() {
                target.push(' ');
            }
            target.push_str(&name);
            if magnitude != 1 {
                let _ = write!(target, "{magnitude}");
            }
        }
        match (numerator.is_empty(), denominator.is_empty()) {
            (false, true) => f.write_str(&numerator),
            (false, false) => write!(f, "{numerator} / {denominator}"),
            (true, false) => write!(f, "1 / {denominator}"),
            (true, true) => f.write_str("1"),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Units {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let named: Vec<(String, i32)> = self
            .factors()
            .map(|(id, exp)| (UnitRegistry::name(id).to_string(), exp))
            .collect();
        named.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Units {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let named = Vec::<(String, i32)>::deserialize(deserializer)?;
        Ok(Self::from_factors(
            named
                .into_iter()
                .map(|(name, exp)| (UnitRegistry::intern(&name), exp))
                .collect(),
        ))
    }
}

/// Compiled scalar mapping applied along a conversion edge.
pub type ConvertFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// A unidirectional compiled conversion between two base units.
pub struct Conversion {
    /// Source unit.
    pub from: UnitId,
    /// Target unit.
    pub to: UnitId,
    /// The compiled mapping. Must be a pure function of its argument.
    pub apply: ConvertFn,
}

impl Conversion {
    /// Builds a conversion between two unit names.
    pub fn new(from: &str, to: &str, apply: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            from: UnitRegistry::intern(from),
            to: UnitRegistry::intern(to),
            apply: Arc::new(apply),
        }
    }
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversion")
            .field("from", &UnitRegistry::name(self.from))
            .field("to", &UnitRegistry::name(self.to))
            .finish_non_exhaustive()
    }
}

/// Directed conversion graph with a cached path lookup.
///
/// The graph is frozen once program construction finishes; only the path
/// cache mutates afterwards, and it tolerates concurrent readers and racing
/// writers (competing writes are value-equal).
#[derive(Default)]
pub struct UnitConverter {
    edges: FxHashMap<UnitId, Vec<(UnitId, ConvertFn)>>,
    paths: RwLock<FxHashMap<(UnitId, UnitId), Option<Arc<[ConvertFn]>>>>,
}

impl UnitConverter {
    /// Creates an empty converter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a conversion edge.
    pub fn register(&mut self, conversion: Conversion) {
        self.edges
            .entry(conversion.from)
            .or_default()
            .push((conversion.to, conversion.apply));
    }

    /// Returns the composed conversion chain `from → to`, if one exists.
    ///
    /// The identity path is the empty chain. Results (including misses) are
    /// cached per `(from, to)` pair.
    pub fn path(&self, from: UnitId, to: UnitId) -> Option<Arc<[ConvertFn]>> {
        if let Some(cached) = self
            .paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(from, to))
        {
            return cached.clone();
        }
        let computed = self.search(from, to);
        let mut cache = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry((from, to))
            .or_insert_with(|| computed.clone())
            .clone()
    }

    fn search(&self, from: UnitId, to: UnitId) -> Option<Arc<[ConvertFn]>> {
        if from == to {
            return Some(Arc::from([]));
        }
        let mut parents: FxHashMap<UnitId, (UnitId, ConvertFn)> = FxHashMap::default();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            let Some(outgoing) = self.edges.get(&node) else {
                continue;
            };
            for (next, apply) in outgoing {
                if *next == from || parents.contains_key(next) {
                    continue;
                }
                parents.insert(*next, (node, Arc::clone(apply)));
                if *next == to {
                    let mut chain = Vec::new();
                    let mut cursor = to;
                    while cursor != from {
                        let (prev, step) = &parents[&cursor];
                        chain.push(Arc::clone(step));
                        cursor = *prev;
                    }
                    chain.reverse();
                    return Some(chain.into());
                }
                queue.push_back(*next);
            }
        }
        None
    }

    /// Converts `value` from one monomial to another.
    ///
    /// Identity when the monomials are equal. Otherwise both sides must be
    /// single base units with a registered path; anything else is
    /// [`EngineError::NoConversion`].
    pub fn convert(&self, value: f64, from: &Units, to: &Units) -> Result<f64, EngineError> {
        if from == to {
            return Ok(value);
        }
        let no_conversion = || EngineError::NoConversion {
            from: from.to_string(),
            to: to.to_string(),
        };
        let from_id = from.single_base().ok_or_else(no_conversion)?;
        let to_id = to.single_base().ok_or_else(no_conversion)?;
        let chain = self.path(from_id, to_id).ok_or_else(no_conversion)?;
        Ok(chain.iter().fold(value, |acc, step| step(acc)))
    }
}

impl fmt::Debug for UnitConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitConverter")
            .field("edge_count", &self.edges.values().map(Vec::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

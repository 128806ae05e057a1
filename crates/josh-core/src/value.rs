// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unit-tagged runtime values: scalars, distributions, references.
//!
//! Arithmetic is unit-checked and never coerces: `add`/`sub` demand equal
//! canonical monomials, `mul`/`div` combine monomials symbolically, `pow`
//! demands a dimensionless integer exponent. Operand kinds are scalar/scalar
//! or scalar/distribution (broadcast); distribution/distribution arithmetic
//! is a type error.
//!
//! Distributions preserve insertion order. Realized distributions share their
//! element storage (`Arc<[Value]>`) so freezing a snapshot clones cheaply;
//! every transforming operation builds a fresh bag. Virtual distributions
//! stay lazy under broadcast arithmetic by composing the sampler.

use std::fmt;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::error::EngineError;
use crate::math::DeterministicRng;
use crate::units::Units;

/// Absolute tolerance used when demanding an integer-valued scalar.
const INTEGER_EPSILON: f64 = 1e-9;

/// The five arithmetic operations values support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// A decimal magnitude tagged with a canonical unit monomial.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    /// Numeric magnitude.
    pub value: f64,
    /// Canonical unit monomial.
    pub units: Units,
}

impl Scalar {
    /// Creates a scalar with explicit units.
    #[must_use]
    pub fn new(value: f64, units: Units) -> Self {
        Self { value, units }
    }

    /// Creates a unitless scalar.
    #[must_use]
    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Units::dimensionless())
    }

    /// Creates a scalar in a single named base unit, e.g. `Scalar::with_unit(1.0, "year")`.
    #[must_use]
    pub fn with_unit(value: f64, unit: &str) -> Self {
        Self::new(value, Units::base(unit))
    }

    /// Returns the magnitude as an integer when it is one (within 1e-9).
    pub fn as_integer(&self) -> Result<i64, EngineError> {
        let rounded = libm::round(self.value);
        if (self.value - rounded).abs() <= INTEGER_EPSILON {
            Ok(rounded as i64)
        } else {
            Err(EngineError::type_error(format!(
                "expected an integer, found {}",
                self.value
            )))
        }
    }

    fn demand_same_units(&self, rhs: &Self) -> Result<(), EngineError> {
        if self.units == rhs.units {
            Ok(())
        } else {
            Err(EngineError::UnitMismatch {
                left: self.units.to_string(),
                right: rhs.units.to_string(),
            })
        }
    }

    fn apply(&self, op: BinaryOp, rhs: &Self) -> Result<Self, EngineError> {
        match op {
            BinaryOp::Add => {
                self.demand_same_units(rhs)?;
                Ok(Self::new(self.value + rhs.value, self.units.clone()))
            }
            BinaryOp::Sub => {
                self.demand_same_units(rhs)?;
                Ok(Self::new(self.value - rhs.value, self.units.clone()))
            }
            BinaryOp::Mul => Ok(Self::new(
                self.value * rhs.value,
                self.units.multiply(&rhs.units),
            )),
            BinaryOp::Div => {
                if rhs.value == 0.0 {
                    return Err(EngineError::DivisionByZero);
                }
                Ok(Self::new(
                    self.value / rhs.value,
                    self.units.divide(&rhs.units),
                ))
            }
            BinaryOp::Pow => {
                if !rhs.units.is_dimensionless() {
                    return Err(EngineError::InvalidExponent {
                        found: format!("{rhs}"),
                    });
                }
                let exponent = rhs.as_integer().map_err(|_| EngineError::InvalidExponent {
                    found: format!("{rhs}"),
                })?;
                let exponent_i32 =
                    i32::try_from(exponent).map_err(|_| EngineError::InvalidExponent {
                        found: format!("{rhs}"),
                    })?;
                Ok(Self::new(
                    libm::pow(self.value, exponent as f64),
                    self.units.powi(exponent_i32),
                ))
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.units.is_dimensionless() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.units)
        }
    }
}

/// An ordered, materialised bag of values of one element kind.
#[derive(Debug, Clone)]
pub struct RealizedDistribution {
    values: Arc<[Value]>,
    units: Units,
}

impl RealizedDistribution {
    /// An empty bag with the given units.
    #[must_use]
    pub fn empty(units: Units) -> Self {
        Self {
            values: Arc::from([]),
            units,
        }
    }

    /// Builds a bag from scalars sharing one unit monomial.
    ///
    /// Elements keep insertion order. Every scalar must carry `units`.
    pub fn of_scalars(
        scalars: impl IntoIterator<Item = Scalar>,
        units: Units,
    ) -> Result<Self, EngineError> {
        let mut values = Vec::new();
        for scalar in scalars {
            if scalar.units != units {
                return Err(EngineError::UnitMismatch {
                    left: units.to_string(),
                    right: scalar.units.to_string(),
                });
            }
            values.push(Value::Scalar(scalar));
        }
        Ok(Self {
            values: values.into(),
            units,
        })
    }

    /// Builds a bag of entity references (dimensionless).
    #[must_use]
    pub fn of_refs(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            values: ids.into_iter().map(Value::EntityRef).collect(),
            units: Units::dimensionless(),
        }
    }

    /// Wraps an already-ordered element vector. Callers uphold kind
    /// homogeneity (scalars of `units`, or entity references).
    #[must_use]
    pub(crate) fn from_values(values: Vec<Value>, units: Units) -> Self {
        Self {
            values: values.into(),
            units,
        }
    }

    /// Element count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` for an empty bag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Elements in insertion order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Shared unit monomial of the elements.
    #[must_use]
    pub fn units(&self) -> &Units {
        &self.units
    }

    /// Maps the bag element-wise through a scalar operation.
    fn map_scalars(
        &self,
        units: Units,
        mut f: impl FnMut(&Scalar) -> Result<Scalar, EngineError>,
    ) -> Result<Self, EngineError> {
        let mut values = Vec::with_capacity(self.values.len());
        for element in &*self.values {
            let scalar = element.as_scalar()?;
            values.push(Value::Scalar(f(scalar)?));
        }
        Ok(Self {
            values: values.into(),
            units,
        })
    }

    /// Draws one element uniformly. The bag must contain scalars.
    pub fn sample(&self, rng: &mut DeterministicRng) -> Result<Scalar, EngineError> {
        if self.values.is_empty() {
            return Err(EngineError::type_error(
                "cannot sample from an empty distribution",
            ));
        }
        let index = rng.next_below(self.values.len() as u64) as usize;
        self.values[index].as_scalar().cloned()
    }

    /// Materialises `n` elements, with or without replacement.
    ///
    /// Without replacement the result is a uniformly chosen sub-bag that
    /// preserves element order; asking for more than the bag holds is a type
    /// error.
    pub fn contents(
        &self,
        n: usize,
        with_replacement: bool,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<Value>, EngineError> {
        if with_replacement {
            if self.values.is_empty() && n > 0 {
                return Err(EngineError::type_error(
                    "cannot draw from an empty distribution",
                ));
            }
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                let index = rng.next_below(self.values.len() as u64) as usize;
                out.push(self.values[index].clone());
            }
            return Ok(out);
        }
        if n > self.values.len() {
            return Err(EngineError::type_error(format!(
                "cannot draw {n} elements without replacement from a bag of {}",
                self.values.len()
            )));
        }
        // Ordered uniform subset: keep each element with probability
        // (still needed) / (still available).
        let mut out = Vec::with_capacity(n);
        let mut needed = n;
        let total = self.values.len();
        for (position, element) in self.values.iter().enumerate() {
            if needed == 0 {
                break;
            }
            let available = (total - position) as u64;
            if rng.next_below(available) < needed as u64 {
                out.push(element.clone());
                needed -= 1;
            }
        }
        Ok(out)
    }

    /// Concatenates two bags, preserving order (`self` then `other`).
    ///
    /// Element kinds must match; scalar bags must also agree on units.
    pub fn concat(&self, other: &Self) -> Result<Self, EngineError> {
        let self_refs = self.values.first().is_some_and(|v| matches!(v, Value::EntityRef(_)));
        let other_refs = other.values.first().is_some_and(|v| matches!(v, Value::EntityRef(_)));
        if self_refs != other_refs && !self.is_empty() && !other.is_empty() {
            return Err(EngineError::type_error(
                "cannot concatenate distributions of different element kinds",
            ));
        }
        if !self_refs && !other_refs && self.units != other.units {
            return Err(EngineError::UnitMismatch {
                left: self.units.to_string(),
                right: other.units.to_string(),
            });
        }
        let mut values = Vec::with_capacity(self.values.len() + other.values.len());
        values.extend(self.values.iter().cloned());
        values.extend(other.values.iter().cloned());
        let units = if self.is_empty() {
            other.units.clone()
        } else {
            self.units.clone()
        };
        Ok(Self {
            values: values.into(),
            units,
        })
    }
}

/// Lazy scalar generator backing a [`VirtualDistribution`].
pub trait Sampler: Send + Sync {
    /// Draws the next magnitude.
    fn sample(&self, rng: &mut DeterministicRng) -> f64;

    /// Short human-readable identity, used in diagnostics and state digests.
    fn label(&self) -> &str;
}

/// Uniform sampler over `[low, high)`.
#[derive(Debug, Clone)]
pub struct UniformSampler {
    low: f64,
    high: f64,
}

impl UniformSampler {
    /// Creates a uniform sampler over `[low, high)`.
    #[must_use]
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

impl Sampler for UniformSampler {
    fn sample(&self, rng: &mut DeterministicRng) -> f64 {
        rng.uniform(self.low, self.high)
    }

    fn label(&self) -> &str {
        "uniform"
    }
}

/// Normal sampler (Box–Muller).
#[derive(Debug, Clone)]
pub struct NormalSampler {
    mean: f64,
    std_dev: f64,
}

impl NormalSampler {
    /// Creates a normal sampler with the given mean and standard deviation.
    #[must_use]
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }
}

impl Sampler for NormalSampler {
    fn sample(&self, rng: &mut DeterministicRng) -> f64 {
        rng.normal(self.mean, self.std_dev)
    }

    fn label(&self) -> &str {
        "normal"
    }
}

/// Sampler wrapping another sampler through a pure scalar map.
///
/// Keeps virtual distributions lazy under broadcast arithmetic.
struct ComposedSampler {
    inner: Arc<dyn Sampler>,
    map: Box<dyn Fn(f64) -> f64 + Send + Sync>,
    label: String,
}

impl Sampler for ComposedSampler {
    fn sample(&self, rng: &mut DeterministicRng) -> f64 {
        (self.map)(self.inner.sample(rng))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// A lazy distribution: sampler, units, and an optional finite size.
///
/// `size == None` iff the distribution is unbounded.
#[derive(Clone)]
pub struct VirtualDistribution {
    sampler: Arc<dyn Sampler>,
    units: Units,
    size: Option<usize>,
}

impl VirtualDistribution {
    /// Creates a sized virtual distribution.
    #[must_use]
    pub fn sized(sampler: Arc<dyn Sampler>, units: Units, size: usize) -> Self {
        Self {
            sampler,
            units,
            size: Some(size),
        }
    }

    /// Creates an unbounded virtual distribution.
    #[must_use]
    pub fn unbounded(sampler: Arc<dyn Sampler>, units: Units) -> Self {
        Self {
            sampler,
            units,
            size: None,
        }
    }

    /// Declared size; `None` means unbounded.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Shared unit monomial of the generated scalars.
    #[must_use]
    pub fn units(&self) -> &Units {
        &self.units
    }

    /// Sampler identity label.
    #[must_use]
    pub fn label(&self) -> &str {
        self.sampler.label()
    }

    /// Draws one scalar.
    pub fn sample(&self, rng: &mut DeterministicRng) -> Scalar {
        Scalar::new(self.sampler.sample(rng), self.units.clone())
    }

    /// Materialises `n` elements.
    ///
    /// Without replacement the distribution must be sized: the whole
    /// generator output is materialised and an ordered sub-bag is drawn.
    /// Unbounded generators cannot be rewound.
    pub fn contents(
        &self,
        n: usize,
        with_replacement: bool,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<Value>, EngineError> {
        if with_replacement {
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                out.push(Value::Scalar(self.sample(rng)));
            }
            return Ok(out);
        }
        let Some(size) = self.size else {
            return Err(EngineError::NotRewindable);
        };
        let mut scalars = Vec::with_capacity(size);
        for _ in 0..size {
            scalars.push(self.sample(rng));
        }
        let realized = RealizedDistribution::of_scalars(scalars, self.units.clone())?;
        realized.contents(n, false, rng)
    }

    /// Applies a pure scalar map lazily, producing a new virtual
    /// distribution with the given units.
    fn compose(&self, units: Units, map: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            sampler: Arc::new(ComposedSampler {
                inner: Arc::clone(&self.sampler),
                map: Box::new(map),
                label: format!("{}'", self.sampler.label()),
            }),
            units,
            size: self.size,
        }
    }
}

impl fmt::Debug for VirtualDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDistribution")
            .field("sampler", &self.sampler.label())
            .field("units", &self.units)
            .field("size", &self.size)
            .finish()
    }
}

/// A runtime value flowing between handlers, slots, and exports.
#[derive(Debug, Clone)]
pub enum Value {
    /// A unit-tagged decimal.
    Scalar(Scalar),
    /// A materialised ordered bag.
    Realized(RealizedDistribution),
    /// A lazy generator-backed distribution.
    Virtual(VirtualDistribution),
    /// Reference to another entity in the same replicate arena.
    EntityRef(EntityId),
    /// A boolean.
    Bool(bool),
    /// An interned string (state tags, labels).
    Str(Arc<str>),
}

impl Value {
    /// Short kind label for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Realized(_) => "realized distribution",
            Self::Virtual(_) => "virtual distribution",
            Self::EntityRef(_) => "entity reference",
            Self::Bool(_) => "boolean",
            Self::Str(_) => "string",
        }
    }

    /// Convenience constructor for a string value.
    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    /// Borrows the scalar inside, or fails with a kind mismatch.
    pub fn as_scalar(&self) -> Result<&Scalar, EngineError> {
        match self {
            Self::Scalar(s) => Ok(s),
            other => Err(EngineError::type_error(format!(
                "expected a scalar, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Borrows the boolean inside, or fails with a kind mismatch.
    pub fn as_bool(&self) -> Result<bool, EngineError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(EngineError::type_error(format!(
                "expected a boolean, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Borrows the string inside, or fails with a kind mismatch.
    pub fn as_str(&self) -> Result<&Arc<str>, EngineError> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(EngineError::type_error(format!(
                "expected a string, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns the referenced entity id, or fails with a kind mismatch.
    pub fn as_entity_ref(&self) -> Result<EntityId, EngineError> {
        match self {
            Self::EntityRef(id) => Ok(*id),
            other => Err(EngineError::type_error(format!(
                "expected an entity reference, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Borrows the realized distribution inside, or fails with a kind mismatch.
    pub fn as_realized(&self) -> Result<&RealizedDistribution, EngineError> {
        match self {
            Self::Realized(d) => Ok(d),
            other => Err(EngineError::type_error(format!(
                "expected a realized distribution, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Unit monomial carried by this value, when it has one.
    #[must_use]
    pub fn units(&self) -> Option<&Units> {
        match self {
            Self::Scalar(s) => Some(&s.units),
            Self::Realized(d) => Some(d.units()),
            Self::Virtual(d) => Some(d.units()),
            _ => None,
        }
    }

    /// Unit-checked addition.
    pub fn add(&self, rhs: &Self) -> Result<Self, EngineError> {
        self.binary(BinaryOp::Add, rhs)
    }

    /// Unit-checked subtraction.
    pub fn sub(&self, rhs: &Self) -> Result<Self, EngineError> {
        self.binary(BinaryOp::Sub, rhs)
    }

    /// Unit-combining multiplication.
    pub fn mul(&self, rhs: &Self) -> Result<Self, EngineError> {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// Unit-combining division.
    pub fn div(&self, rhs: &Self) -> Result<Self, EngineError> {
        self.binary(BinaryOp::Div, rhs)
    }

    /// Integer exponentiation.
    pub fn pow(&self, rhs: &Self) -> Result<Self, EngineError> {
        self.binary(BinaryOp::Pow, rhs)
    }

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self, EngineError> {
        match (self, rhs) {
            (Self::Scalar(a), Self::Scalar(b)) => Ok(Self::Scalar(a.apply(op, b)?)),
            (Self::Realized(dist), Self::Scalar(s)) => {
                let units = Self::result_units(op, dist.units(), &s.units, s)?;
                Ok(Self::Realized(
                    dist.map_scalars(units, |element| element.apply(op, s))?,
                ))
            }
            (Self::Scalar(s), Self::Realized(dist)) => {
                if op == BinaryOp::Pow {
                    return Err(EngineError::type_error(
                        "exponent must be a scalar, found a distribution",
                    ));
                }
                let units = Self::result_units(op, &s.units, dist.units(), s)?;
                Ok(Self::Realized(
                    dist.map_scalars(units, |element| s.apply(op, element))?,
                ))
            }
            (Self::Virtual(dist), Self::Scalar(s)) => {
                // Probe the unit algebra once, then compose lazily.
                let probe = Scalar::new(1.0, dist.units().clone()).apply(op, s)?;
                let operand = s.value;
                let mapped = match op {
                    BinaryOp::Add => dist.compose(probe.units, move |v| v + operand),
                    BinaryOp::Sub => dist.compose(probe.units, move |v| v - operand),
                    BinaryOp::Mul => dist.compose(probe.units, move |v| v * operand),
                    BinaryOp::Div => dist.compose(probe.units, move |v| v / operand),
                    BinaryOp::Pow => {
                        dist.compose(probe.units, move |v| libm::pow(v, operand))
                    }
                };
                Ok(Self::Virtual(mapped))
            }
            (Self::Scalar(s), Self::Virtual(dist)) => {
                if op == BinaryOp::Pow {
                    return Err(EngineError::type_error(
                        "exponent must be a scalar, found a distribution",
                    ));
                }
                let probe = s.apply(op, &Scalar::new(1.0, dist.units().clone()))?;
                let operand = s.value;
                let mapped = match op {
                    BinaryOp::Add => dist.compose(probe.units, move |v| operand + v),
                    BinaryOp::Sub => dist.compose(probe.units, move |v| operand - v),
                    BinaryOp::Mul => dist.compose(probe.units, move |v| operand * v),
                    BinaryOp::Div => dist.compose(probe.units, move |v| operand / v),
                    BinaryOp::Pow => {
                        dist.compose(probe.units, move |v| libm::pow(operand, v))
                    }
                };
                Ok(Self::Virtual(mapped))
            }
            (a, b) => Err(EngineError::type_error(format!(
                "cannot apply arithmetic between {} and {}",
                a.kind_name(),
                b.kind_name()
            ))),
        }
    }

    fn result_units(
        op: BinaryOp,
        left: &Units,
        right: &Units,
        exponent: &Scalar,
    ) -> Result<Units, EngineError> {
        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                if left == right {
                    Ok(left.clone())
                } else {
                    Err(EngineError::UnitMismatch {
                        left: left.to_string(),
                        right: right.to_string(),
                    })
                }
            }
            BinaryOp::Mul => Ok(left.multiply(right)),
            BinaryOp::Div => Ok(left.divide(right)),
            BinaryOp::Pow => {
                if !right.is_dimensionless() {
                    return Err(EngineError::InvalidExponent {
                        found: format!("{exponent}"),
                    });
                }
                let exp = exponent.as_integer().map_err(|_| EngineError::InvalidExponent {
                    found: format!("{exponent}"),
                })?;
                let exp = i32::try_from(exp).map_err(|_| EngineError::InvalidExponent {
                    found: format!("{exponent}"),
                })?;
                Ok(left.powi(exp))
            }
        }
    }

    /// Draws one scalar from a distribution (identity on a scalar).
    pub fn sample(&self, rng: &mut DeterministicRng) -> Result<Scalar, EngineError> {
        match self {
            Self::Scalar(s) => Ok(s.clone()),
            Self::Realized(d) => d.sample(rng),
            Self::Virtual(d) => Ok(d.sample(rng)),
            other => Err(EngineError::type_error(format!(
                "cannot sample from {}",
                other.kind_name()
            ))),
        }
    }

    /// Materialises `n` ordered elements from a distribution.
    pub fn contents(
        &self,
        n: usize,
        with_replacement: bool,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<Self>, EngineError> {
        match self {
            Self::Realized(d) => d.contents(n, with_replacement, rng),
            Self::Virtual(d) => d.contents(n, with_replacement, rng),
            other => Err(EngineError::type_error(format!(
                "cannot materialise contents of {}",
                other.kind_name()
            ))),
        }
    }

    /// Concatenates two realized distributions (`self` then `rhs`).
    pub fn concat(&self, rhs: &Self) -> Result<Self, EngineError> {
        let left = self.as_realized()?;
        let right = rhs.as_realized()?;
        Ok(Self::Realized(left.concat(right)?))
    }

    /// Visits every entity reference held (transitively) by this value.
    pub(crate) fn for_each_entity_ref(&self, visit: &mut impl FnMut(EntityId)) {
        match self {
            Self::EntityRef(id) => visit(*id),
            Self::Realized(d) => {
                for element in d.values() {
                    element.for_each_entity_ref(visit);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => f.write_str(s),
            Self::EntityRef(id) => write!(f, "entity:{}", id.index()),
            Self::Realized(d) => {
                f.write_str("[")?;
                for (i, v) in d.values().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Self::Virtual(d) => match d.size() {
                Some(size) => write!(f, "~{}({size}) {}", d.label(), d.units()),
                None => write!(f, "~{} {}", d.label(), d.units()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::units::UnitRegistry;

    fn metres(v: f64) -> Value {
        Value::Scalar(Scalar::with_unit(v, "m"))
    }

    #[test]
    fn addition_demands_identical_units() {
        let err = metres(1.0)
            .add(&Value::Scalar(Scalar::with_unit(1.0, "kg")))
            .unwrap_err();
        let EngineError::UnitMismatch { left, right } = err else {
            unreachable!("expected a unit mismatch, got {err:?}");
        };
        assert_eq!(left, "m");
        assert_eq!(right, "kg");
    }

    #[test]
    fn multiplication_combines_monomials() {
        let area = metres(3.0).mul(&metres(2.0)).unwrap();
        let scalar = area.as_scalar().unwrap();
        assert!((scalar.value - 6.0).abs() < 1e-12);
        assert_eq!(scalar.units, Units::base("m").powi(2));

        let speed = metres(10.0)
            .div(&Value::Scalar(Scalar::with_unit(2.0, "s")))
            .unwrap();
        assert_eq!(
            speed.as_scalar().unwrap().units,
            Units::base("m").divide(&Units::base("s"))
        );
    }

    #[test]
    fn division_by_zero_is_its_own_error() {
        let err = metres(1.0)
            .div(&Value::Scalar(Scalar::dimensionless(0.0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::DivisionByZero));
    }

    #[test]
    fn pow_demands_dimensionless_integer_exponent() {
        let squared = metres(3.0)
            .pow(&Value::Scalar(Scalar::dimensionless(2.0)))
            .unwrap();
        assert_eq!(squared.as_scalar().unwrap().units, Units::base("m").powi(2));

        let err = metres(3.0)
            .pow(&Value::Scalar(Scalar::dimensionless(0.5)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidExponent { .. }));

        let err = metres(3.0).pow(&metres(2.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidExponent { .. }));
    }

    #[test]
    fn broadcast_add_maps_every_element() {
        let units = Units::base("m");
        let dist = RealizedDistribution::of_scalars(
            [1.0, 2.0, 3.0].map(|v| Scalar::new(v, units.clone())),
            units.clone(),
        )
        .unwrap();
        let shifted = Value::Realized(dist).add(&metres(10.0)).unwrap();
        let shifted = shifted.as_realized().unwrap();
        let got: Vec<f64> = shifted
            .values()
            .iter()
            .map(|v| v.as_scalar().unwrap().value)
            .collect();
        assert_eq!(got, vec![11.0, 12.0, 13.0]);
    }

    #[test]
    fn distribution_pairs_do_not_combine() {
        let units = Units::base("m");
        let d = RealizedDistribution::of_scalars([Scalar::new(1.0, units.clone())], units.clone())
            .unwrap();
        let err = Value::Realized(d.clone())
            .add(&Value::Realized(d))
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeError { .. }));
    }

    #[test]
    fn realized_contents_without_replacement_preserves_order() {
        let units = Units::dimensionless();
        let dist = RealizedDistribution::of_scalars(
            (0..10).map(|v| Scalar::dimensionless(f64::from(v))),
            units,
        )
        .unwrap();
        let mut rng = DeterministicRng::from_seed(11);
        let drawn = dist.contents(4, false, &mut rng).unwrap();
        assert_eq!(drawn.len(), 4);
        let magnitudes: Vec<f64> = drawn
            .iter()
            .map(|v| v.as_scalar().unwrap().value)
            .collect();
        let mut sorted = magnitudes.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(magnitudes, sorted, "survivors must keep bag order");

        let err = dist.contents(11, false, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::TypeError { .. }));
    }

    #[test]
    fn unbounded_virtual_without_replacement_is_not_rewindable() {
        let dist = VirtualDistribution::unbounded(
            Arc::new(UniformSampler::new(0.0, 1.0)),
            Units::dimensionless(),
        );
        let mut rng = DeterministicRng::from_seed(3);
        let err = dist.contents(2, false, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::NotRewindable));
        assert!(dist.contents(5, true, &mut rng).unwrap().len() == 5);
        assert!(dist.size().is_none());
    }

    #[test]
    fn sized_virtual_draws_without_replacement() {
        let dist = VirtualDistribution::sized(
            Arc::new(UniformSampler::new(0.0, 1.0)),
            Units::dimensionless(),
            6,
        );
        let mut rng = DeterministicRng::from_seed(4);
        assert_eq!(dist.contents(6, false, &mut rng).unwrap().len(), 6);
    }

    #[test]
    fn virtual_broadcast_stays_lazy_and_checks_units() {
        let years = Units::base("year");
        let dist = VirtualDistribution::unbounded(
            Arc::new(UniformSampler::new(0.0, 1.0)),
            years.clone(),
        );
        let shifted = Value::Virtual(dist.clone())
            .add(&Value::Scalar(Scalar::new(5.0, years)))
            .unwrap();
        let Value::Virtual(shifted) = shifted else {
            unreachable!("broadcast over a virtual distribution must stay lazy");
        };
        let mut rng = DeterministicRng::from_seed(5);
        let drawn = shifted.sample(&mut rng);
        assert!((5.0..6.0).contains(&drawn.value));

        let err = Value::Virtual(dist)
            .add(&Value::Scalar(Scalar::with_unit(1.0, "kg")))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnitMismatch { .. }));
    }

    #[test]
    fn concat_preserves_order_and_flags_unit_mismatch() {
        let m = Units::base("m");
        let a = RealizedDistribution::of_scalars(
            [1.0, 2.0].map(|v| Scalar::new(v, m.clone())),
            m.clone(),
        )
        .unwrap();
        let b = RealizedDistribution::of_scalars([Scalar::new(3.0, m.clone())], m.clone()).unwrap();
        let joined = Value::Realized(a.clone()).concat(&Value::Realized(b)).unwrap();
        let joined = joined.as_realized().unwrap();
        let got: Vec<f64> = joined
            .values()
            .iter()
            .map(|v| v.as_scalar().unwrap().value)
            .collect();
        assert_eq!(got, vec![1.0, 2.0, 3.0]);

        let kg = Units::base("kg");
        let c = RealizedDistribution::of_scalars([Scalar::new(9.0, kg.clone())], kg).unwrap();
        let err = Value::Realized(a).concat(&Value::Realized(c)).unwrap_err();
        assert!(matches!(err, EngineError::UnitMismatch { .. }));
    }

    #[test]
    fn sampling_a_scalar_is_the_identity() {
        let mut rng = DeterministicRng::from_seed(1);
        let v = metres(2.5).sample(&mut rng).unwrap();
        assert!((v.value - 2.5).abs() < f64::EPSILON);
        assert_eq!(&*UnitRegistry::name(v.units.single_base().unwrap()), "m");
    }

    #[test]
    fn display_renders_scalars_with_units() {
        assert_eq!(metres(10.0).to_string(), "10 m");
        assert_eq!(Value::Scalar(Scalar::dimensionless(0.5)).to_string(), "0.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }
}

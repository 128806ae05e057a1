// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine error taxonomy and the context-carrying runtime error record.
//!
//! Two layers:
//! - [`EngineError`] is the flat taxonomy every fallible core operation
//!   returns. Variants carry the data needed to render a precise message
//!   (both unit strings on a mismatch, the full attribute chain on a cycle).
//! - [`RuntimeError`] wraps an [`EngineError`] with the originating entity,
//!   attribute, substep, and tick. The resolver stamps this context exactly
//!   once, at the innermost failing resolution; outer frames propagate the
//!   record unchanged so the origin survives to the caller.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::entity::{EntityId, EntityKind, Substep};

/// Location of a handler in the original model source, when the front end
/// provided one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceLocation {
    /// 1-based line in the model source.
    pub line: u32,
    /// 1-based column in the model source.
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors emitted by the simulation core.
///
/// `ParseError` is deliberately absent: parsing happens in the front end and
/// never reaches this crate.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Arithmetic between values whose canonical unit monomials differ.
    #[error("unit mismatch: '{left}' vs '{right}'")]
    UnitMismatch {
        /// Rendered units of the left operand.
        left: String,
        /// Rendered units of the right operand.
        right: String,
    },
    /// No registered conversion path between two units.
    #[error("no conversion from '{from}' to '{to}'")]
    NoConversion {
        /// Rendered source units.
        from: String,
        /// Rendered target units.
        to: String,
    },
    /// An attribute's value depends on itself within a single substep.
    #[error("circular attribute dependency: {}", .chain.join(" -> "))]
    CircularDependency {
        /// Attribute names along the dependency chain, ending at the repeat.
        chain: Vec<String>,
    },
    /// A referenced attribute is not declared on the prototype in scope,
    /// though it exists elsewhere in the program.
    #[error("attribute '{name}' is not declared on prototype '{prototype}'")]
    MissingAttribute {
        /// The attribute that was referenced.
        name: String,
        /// The prototype it was looked up on.
        prototype: String,
    },
    /// A referenced attribute exists on no prototype anywhere in the program.
    #[error("attribute '{name}' exists on no prototype in the program")]
    MissingHandler {
        /// The attribute that was referenced.
        name: String,
    },
    /// A value had the wrong kind for the requested operation.
    #[error("type error: {message}")]
    TypeError {
        /// Human-readable description of the kind mismatch.
        message: String,
    },
    /// A handler guard failed while being evaluated.
    #[error("guard failed for attribute '{attribute}'")]
    GuardError {
        /// Attribute whose handler's guard failed.
        attribute: String,
        /// The underlying failure.
        #[source]
        source: Box<EngineError>,
    },
    /// Scalar division by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// `pow` exponent was not a dimensionless integer.
    #[error("invalid exponent: {found}")]
    InvalidExponent {
        /// Rendered offending exponent.
        found: String,
    },
    /// Draw without replacement from a distribution that cannot be rewound.
    #[error("distribution of unknown size cannot be drawn without replacement")]
    NotRewindable,
    /// An external resource read failed.
    #[error("external resource '{resource}' failed: {message}")]
    ExternalIo {
        /// Name the resource is bound under.
        resource: String,
        /// Reader-supplied failure description.
        message: String,
    },
    /// An export sink write, flush, or close failed. Aborts the replicate.
    #[error("export failed: {message}")]
    Export {
        /// Sink-supplied failure description.
        message: String,
    },
    /// Program or simulation configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// What the validator rejected.
        message: String,
    },
}

impl EngineError {
    /// Builds a [`EngineError::TypeError`] from anything displayable.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError {
            message: message.into(),
        }
    }

    /// Builds an [`EngineError::InvalidConfiguration`] from anything displayable.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Structured failure record surfaced to the embedding application.
///
/// Context fields are `None` until the resolver stamps them; a record that
/// crossed the resolver always names at least the entity kind, attribute,
/// substep, and tick of the innermost failing resolution.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    /// The underlying taxonomy error.
    pub kind: EngineError,
    /// Kind of the entity being resolved when the failure originated.
    pub entity_kind: Option<EntityKind>,
    /// Arena id of that entity.
    pub entity: Option<EntityId>,
    /// Attribute being resolved when the failure originated.
    pub attribute: Option<Arc<str>>,
    /// Substep in which the failure originated.
    pub substep: Option<Substep>,
    /// Tick in which the failure originated.
    pub tick: Option<u64>,
    /// Model source location of the failing handler, when known.
    pub location: Option<SourceLocation>,
}

impl RuntimeError {
    /// Wraps a bare taxonomy error with no context attached yet.
    #[must_use]
    pub fn bare(kind: EngineError) -> Self {
        Self {
            kind,
            entity_kind: None,
            entity: None,
            attribute: None,
            substep: None,
            tick: None,
            location: None,
        }
    }

    /// Stamps origin context onto fields that are still unset.
    ///
    /// Called by the resolver at every frame; only the innermost (first)
    /// call takes effect, so the record keeps pointing at the true origin
    /// as it propagates outward.
    #[must_use]
    pub(crate) fn with_origin(
        mut self,
        entity_kind: EntityKind,
        entity: EntityId,
        attribute: &Arc<str>,
        substep: Substep,
        tick: u64,
        location: Option<SourceLocation>,
    ) -> Self {
        if self.attribute.is_none() {
            self.entity_kind = Some(entity_kind);
            self.entity = Some(entity);
            self.attribute = Some(Arc::clone(attribute));
            self.substep = Some(substep);
            self.tick = Some(tick);
            self.location = location;
        }
        self
    }
}

impl From<EngineError> for RuntimeError {
    fn from(kind: EngineError) -> Self {
        Self::bare(kind)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let (Some(kind), Some(attr)) = (self.entity_kind, self.attribute.as_ref()) {
            write!(f, " (in {kind} attribute '{attr}'")?;
            if let Some(entity) = self.entity {
                write!(f, ", entity {}", entity.index())?;
            }
            if let (Some(substep), Some(tick)) = (self.substep, self.tick) {
                write!(f, ", substep {substep}, tick {tick}")?;
            }
            if let Some(loc) = self.location {
                write!(f, ", at {loc}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

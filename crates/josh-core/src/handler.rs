// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Compiled handler callables and their grouping by event key.
//!
//! A handler is the compiled form of one attribute-assignment rule: an
//! optional guard plus a body, both closures produced by the front-end
//! compiler (or written natively in tests). Handlers are grouped per
//! `(attribute, substep, optional state)` event key in declaration order;
//! the resolver evaluates guards in that order and the first that holds (or
//! is absent) supplies the value.

use std::fmt;
use std::sync::Arc;

use crate::entity::{AttrId, Substep};
use crate::error::{EngineError, RuntimeError, SourceLocation};
use crate::resolver::Scope;
use crate::value::Value;

/// Compiled handler body: produces the attribute's new value within a scope.
pub type BodyFn = Arc<dyn Fn(&mut Scope<'_, '_>) -> Result<Value, RuntimeError> + Send + Sync>;

/// Compiled handler guard: decides whether the body applies.
pub type GuardFn = Arc<dyn Fn(&mut Scope<'_, '_>) -> Result<bool, RuntimeError> + Send + Sync>;

/// Compiled element predicate used by distribution filters.
pub type PredicateFn = Arc<dyn Fn(&mut Scope<'_, '_>) -> Result<bool, RuntimeError> + Send + Sync>;

/// Event a handler is registered for: `(attribute, substep, optional state)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Attribute the handler assigns.
    pub attribute: Arc<str>,
    /// Substep the handler fires in.
    pub substep: Substep,
    /// State qualification; `None` is the unqualified group.
    pub state: Option<Arc<str>>,
}

/// A handler as declared to the prototype builder, before attribute names
/// are resolved to dense indices.
pub struct HandlerDecl {
    pub(crate) key: EventKey,
    pub(crate) guard: Option<GuardFn>,
    pub(crate) body: BodyFn,
    pub(crate) location: Option<SourceLocation>,
}

impl HandlerDecl {
    /// Declares an unconditional handler for `attribute` at `substep`.
    #[must_use]
    pub fn new(attribute: &str, substep: Substep, body: BodyFn) -> Self {
        Self {
            key: EventKey {
                attribute: Arc::from(attribute),
                substep,
                state: None,
            },
            guard: None,
            body,
            location: None,
        }
    }

    /// Attaches a guard. The body only fires when the guard holds.
    #[must_use]
    pub fn with_guard(mut self, guard: GuardFn) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Qualifies the handler to apply only while `state` matches.
    #[must_use]
    pub fn for_state(mut self, state: &str) -> Self {
        self.key.state = Some(Arc::from(state));
        self
    }

    /// Records the model source location for error reports.
    #[must_use]
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Debug for HandlerDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDecl")
            .field("key", &self.key)
            .field("guarded", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

/// A compiled handler bound to its prototype's dense attribute index.
pub struct Handler {
    /// Attribute this handler assigns.
    pub attribute: AttrId,
    /// Substep this handler fires in.
    pub substep: Substep,
    /// Optional guard, evaluated before the body.
    pub guard: Option<GuardFn>,
    /// The body producing the new value.
    pub body: BodyFn,
    /// Model source location, when the front end provided one.
    pub location: Option<SourceLocation>,
}

impl Handler {
    /// Evaluates the guard within `scope`.
    ///
    /// An absent guard always holds. A failing guard is wrapped as
    /// [`EngineError::GuardError`] naming the guarded attribute.
    pub fn guard_holds(
        &self,
        scope: &mut Scope<'_, '_>,
        attribute_name: &str,
    ) -> Result<bool, RuntimeError> {
        match &self.guard {
            None => Ok(true),
            Some(guard) => guard(scope).map_err(|mut err| {
                let inner = Box::new(err.kind);
                err.kind = EngineError::GuardError {
                    attribute: attribute_name.to_string(),
                    source: inner,
                };
                err
            }),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("attribute", &self.attribute)
            .field("substep", &self.substep)
            .field("guarded", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

/// Ordered list of handlers sharing one event key.
#[derive(Debug)]
pub struct HandlerGroup {
    state: Option<Arc<str>>,
    handlers: Vec<Handler>,
}

impl HandlerGroup {
    /// Creates an empty unqualified group.
    #[must_use]
    pub fn stateless() -> Self {
        Self {
            state: None,
            handlers: Vec::new(),
        }
    }

    /// Creates an empty group qualified by `state`.
    #[must_use]
    pub fn for_state(state: Arc<str>) -> Self {
        Self {
            state: Some(state),
            handlers: Vec::new(),
        }
    }

    /// State tag this group is qualified by, if any.
    #[must_use]
    pub fn state(&self) -> Option<&Arc<str>> {
        self.state.as_ref()
    }

    /// Handlers in declaration order.
    #[must_use]
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub(crate) fn push(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }
}

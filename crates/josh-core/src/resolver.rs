// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The attribute-resolution state machine.
//!
//! Resolution is lazy: asking for an attribute pulls in exactly the values it
//! depends on, memoised per `(entity, attribute)` for the current substep.
//! Each entity's frame carries a `resolved` slot cache and a `resolving` bit
//! array; re-entering an attribute mid-resolution is a circular dependency
//! and fails with the full attribute chain.
//!
//! Ordering guarantees:
//! - Guards evaluate in declaration order; the first that holds supplies the
//!   value; none firing propagates the prior value unchanged.
//! - A state-qualified group strictly shadows the stateless group when the
//!   entity's state matches. `state` itself is resolved before state-qualified
//!   selection within the same substep; the `state` attribute's own handlers
//!   select against the carried pre-substep state.
//! - `prior.*` reads the frozen snapshot of the previous substep and never
//!   observes writes from the current substep, even transitively.
//!
//! The resolver is recursively reentrant through `current.*`; recursion depth
//! is bounded by the deepest attribute-dependency chain.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::entity::{AttrId, Entity, EntityArena, EntityId, EntityKind, EntityPrototype, Substep};
use crate::error::{EngineError, RuntimeError};
use crate::geom::{GridShape, PatchIndex};
use crate::handler::PredicateFn;
use crate::math::DeterministicRng;
use crate::program::Program;
use crate::snapshot::FrozenArena;
use crate::units::Units;
use crate::value::{RealizedDistribution, Scalar, Value};

/// Neighbourhood shape selector for `within` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborhoodShape {
    /// Patches whose centre lies within the radius.
    Radial,
    /// Patches whose centre lies within the axis-aligned square of
    /// half-width equal to the radius.
    Square,
}

/// Which arena a neighbourhood query is answered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeView {
    /// The frozen prior-substep view.
    Prior,
    /// The live current-substep view.
    Current,
}

/// Per-entity memoisation frame for one substep.
struct ResolveFrame {
    resolved: Vec<Option<Value>>,
    resolving: Vec<bool>,
}

impl ResolveFrame {
    fn sized(attr_count: usize) -> Self {
        Self {
            resolved: vec![None; attr_count],
            resolving: vec![false; attr_count],
        }
    }
}

/// Shared evaluation state for one substep of one replicate.
///
/// Owns the per-entity resolver frames; borrows the live arena, the frozen
/// prior view, the spatial index, the program, and the replicate RNG.
pub struct StepContext<'a> {
    live: &'a mut EntityArena,
    prior: &'a FrozenArena,
    index: &'a PatchIndex,
    program: &'a Program,
    rng: &'a mut DeterministicRng,
    meta: EntityId,
    substep: Substep,
    tick: u64,
    frames: FxHashMap<EntityId, ResolveFrame>,
    stack: Vec<(EntityId, Arc<str>)>,
}

impl<'a> StepContext<'a> {
    /// Creates the context for one substep.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        live: &'a mut EntityArena,
        prior: &'a FrozenArena,
        index: &'a PatchIndex,
        program: &'a Program,
        rng: &'a mut DeterministicRng,
        meta: EntityId,
        substep: Substep,
        tick: u64,
    ) -> Self {
        Self {
            live,
            prior,
            index,
            program,
            rng,
            meta,
            substep,
            tick,
            frames: FxHashMap::default(),
            stack: Vec::new(),
        }
    }

    /// The substep this context evaluates.
    #[must_use]
    pub fn substep(&self) -> Substep {
        self.substep
    }

    /// The tick this context evaluates.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Resolves one attribute of one entity to a value.
    ///
    /// Implements the resolution contract: memo hit, cycle check, no-handler
    /// passthrough, then guard-ordered handler evaluation with the result
    /// memoised and written to the live slot array.
    pub fn resolve(&mut self, entity_id: EntityId, attr: AttrId) -> Result<Value, RuntimeError> {
        let Some(entity) = self.live.get(entity_id) else {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "entity {} is not alive",
                entity_id.index()
            ))));
        };
        let proto = Arc::clone(entity.prototype());
        let kind = proto.kind();
        let attr_name = Arc::clone(proto.attribute_name(attr));

        let (memo, cycling) = {
            let frame = self
                .frames
                .entry(entity_id)
                .or_insert_with(|| ResolveFrame::sized(proto.attribute_count()));
            (
                frame.resolved[attr.index()].clone(),
                frame.resolving[attr.index()],
            )
        };
        if let Some(value) = memo {
            return Ok(value);
        }
        if cycling {
            let chain = self.cycle_chain(entity_id, &attr_name);
            return Err(RuntimeError::bare(EngineError::CircularDependency { chain })
                .with_origin(kind, entity_id, &attr_name, self.substep, self.tick, None));
        }

        if !proto.has_handler(attr, self.substep) {
            let value = self.carried_value(entity_id, attr).ok_or_else(|| {
                RuntimeError::bare(self.unavailable(&proto, &attr_name)).with_origin(
                    kind,
                    entity_id,
                    &attr_name,
                    self.substep,
                    self.tick,
                    None,
                )
            })?;
            self.memoise(entity_id, attr, &value);
            return Ok(value);
        }

        self.set_resolving(entity_id, attr, true);
        self.stack.push((entity_id, Arc::clone(&attr_name)));
        let outcome = self.run_handlers(entity_id, &proto, attr, &attr_name);
        self.stack.pop();
        self.set_resolving(entity_id, attr, false);

        let value = outcome.map_err(|err| {
            err.with_origin(kind, entity_id, &attr_name, self.substep, self.tick, None)
        })?;
        self.memoise(entity_id, attr, &value);
        if let Some(entity) = self.live.get_mut(entity_id) {
            entity.set_slot(attr, value.clone());
        }
        Ok(value)
    }

    /// Resolves an attribute by name, distinguishing wrong-prototype misses
    /// from program-wide misses.
    pub fn resolve_name(&mut self, entity_id: EntityId, name: &str) -> Result<Value, RuntimeError> {
        let Some(entity) = self.live.get(entity_id) else {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "entity {} is not alive",
                entity_id.index()
            ))));
        };
        let proto = Arc::clone(entity.prototype());
        match proto.attr_id(name) {
            Some(attr) => self.resolve(entity_id, attr),
            None => Err(RuntimeError::bare(self.unknown_attribute(&proto, name))),
        }
    }

    /// Resolves every attribute of an entity that has a handler for the
    /// running substep. Dependencies pull in further attributes transitively.
    pub fn resolve_handled(&mut self, entity_id: EntityId) -> Result<(), RuntimeError> {
        let Some(entity) = self.live.get(entity_id) else {
            return Ok(());
        };
        let proto = Arc::clone(entity.prototype());
        let substep = self.substep;
        proto
            .attr_ids()
            .filter(|attr| proto.has_handler(*attr, substep))
            .try_for_each(|attr| self.resolve(entity_id, attr).map(|_| ()))
    }

    /// Runs every `init` handler of a freshly created entity, then restores
    /// the running substep.
    pub(crate) fn run_init(
        &mut self,
        entity_id: EntityId,
        proto: &Arc<EntityPrototype>,
    ) -> Result<(), RuntimeError> {
        let previous = self.substep;
        self.substep = Substep::Init;
        let result = proto
            .attr_ids()
            .filter(|attr| proto.has_handler(*attr, Substep::Init))
            .try_for_each(|attr| self.resolve(entity_id, attr).map(|_| ()));
        self.substep = previous;
        result
    }

    fn run_handlers(
        &mut self,
        entity_id: EntityId,
        proto: &Arc<EntityPrototype>,
        attr: AttrId,
        attr_name: &Arc<str>,
    ) -> Result<Value, RuntimeError> {
        let substep = self.substep;
        let group = if proto.has_state_handler(attr, substep) {
            match self.selector_state(entity_id, proto, attr)? {
                Some(state) => proto
                    .state_group(attr, substep, &state)
                    .or_else(|| proto.stateless_group(attr, substep))
                    .cloned(),
                None => proto.stateless_group(attr, substep).cloned(),
            }
        } else {
            proto.stateless_group(attr, substep).cloned()
        };

        if let Some(group) = group {
            for handler in group.handlers() {
                let fired = {
                    let mut scope = Scope::new(self, entity_id);
                    handler.guard_holds(&mut scope, attr_name)
                }
                .map_err(|err| {
                    err.with_origin(
                        proto.kind(),
                        entity_id,
                        attr_name,
                        substep,
                        self.tick,
                        handler.location,
                    )
                })?;
                if fired {
                    let mut scope = Scope::new(self, entity_id);
                    return (handler.body)(&mut scope).map_err(|err| {
                        err.with_origin(
                            proto.kind(),
                            entity_id,
                            attr_name,
                            substep,
                            self.tick,
                            handler.location,
                        )
                    });
                }
            }
        }

        // No group, or every guard declined: the attribute is unchanged.
        self.carried_value(entity_id, attr)
            .ok_or_else(|| RuntimeError::bare(self.unavailable(proto, attr_name)))
    }

    /// The state string used to select state-qualified groups.
    ///
    /// For every attribute except `state` itself, the state is resolved
    /// through the normal machinery first. The `state` attribute's own
    /// handlers select against the carried pre-substep value — transitions
    /// read the state they transition *from*.
    fn selector_state(
        &mut self,
        entity_id: EntityId,
        proto: &Arc<EntityPrototype>,
        attr: AttrId,
    ) -> Result<Option<Arc<str>>, RuntimeError> {
        let Some(state_attr) = proto.state_attr() else {
            return Ok(None);
        };
        if attr == state_attr {
            return match self.carried_value(entity_id, state_attr) {
                None => Ok(None),
                Some(value) => Ok(Some(Arc::clone(
                    value.as_str().map_err(RuntimeError::bare)?,
                ))),
            };
        }
        let value = self.resolve(entity_id, state_attr)?;
        Ok(Some(Arc::clone(
            value.as_str().map_err(RuntimeError::bare)?,
        )))
    }

    /// Reads `prior.<name>` for an entity: the frozen view, or the live slot
    /// for entities created after the last freeze.
    pub(crate) fn prior_value(
        &self,
        entity_id: EntityId,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        if let Some(frozen) = self.prior.get(entity_id) {
            let proto = Arc::clone(frozen.prototype());
            return match proto.attr_id(name) {
                Some(attr) => frozen.slot(attr).cloned().ok_or_else(|| {
                    RuntimeError::bare(self.unavailable(&proto, proto.attribute_name(attr)))
                }),
                None => Err(RuntimeError::bare(self.unknown_attribute(&proto, name))),
            };
        }
        // Created since the last freeze: its init values stand in for prior.
        let Some(entity) = self.live.get(entity_id) else {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "entity {} is not alive",
                entity_id.index()
            ))));
        };
        let proto = Arc::clone(entity.prototype());
        match proto.attr_id(name) {
            Some(attr) => entity.slot(attr).cloned().ok_or_else(|| {
                RuntimeError::bare(self.unavailable(&proto, proto.attribute_name(attr)))
            }),
            None => Err(RuntimeError::bare(self.unknown_attribute(&proto, name))),
        }
    }

    fn carried_value(&self, entity_id: EntityId, attr: AttrId) -> Option<Value> {
        if let Some(value) = self.live.get(entity_id).and_then(|e| e.slot(attr)) {
            return Some(value.clone());
        }
        self.prior.slot(entity_id, attr).cloned()
    }

    fn memoise(&mut self, entity_id: EntityId, attr: AttrId, value: &Value) {
        if let Some(frame) = self.frames.get_mut(&entity_id) {
            frame.resolved[attr.index()] = Some(value.clone());
        }
    }

    fn set_resolving(&mut self, entity_id: EntityId, attr: AttrId, on: bool) {
        if let Some(frame) = self.frames.get_mut(&entity_id) {
            frame.resolving[attr.index()] = on;
        }
    }

    fn cycle_chain(&self, entity_id: EntityId, attr_name: &Arc<str>) -> Vec<String> {
        let start = self
            .stack
            .iter()
            .position(|(e, n)| *e == entity_id && n == attr_name)
            .unwrap_or(0);
        let mut chain: Vec<String> = self.stack[start..]
            .iter()
            .map(|(_, n)| n.to_string())
            .collect();
        chain.push(attr_name.to_string());
        chain
    }

    fn unknown_attribute(&self, proto: &EntityPrototype, name: &str) -> EngineError {
        if self.program.attribute_exists(name) {
            EngineError::MissingAttribute {
                name: name.to_string(),
                prototype: proto.name().to_string(),
            }
        } else {
            EngineError::MissingHandler {
                name: name.to_string(),
            }
        }
    }

    fn unavailable(&self, proto: &EntityPrototype, attr_name: &str) -> EngineError {
        EngineError::MissingAttribute {
            name: attr_name.to_string(),
            prototype: proto.name().to_string(),
        }
    }

    fn containing_patch(&self, entity_id: EntityId) -> Result<EntityId, RuntimeError> {
        let Some(entity) = self.live.get(entity_id) else {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "entity {} is not alive",
                entity_id.index()
            ))));
        };
        if entity.kind() == EntityKind::Patch {
            return Ok(entity_id);
        }
        let Some(position) = entity.position() else {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "{} entity has no grid position",
                entity.kind()
            ))));
        };
        self.index.query_point(position).ok_or_else(|| {
            RuntimeError::bare(EngineError::type_error(
                "no patch contains this entity's position",
            ))
        })
    }

    /// Converts a query radius into grid-cell units through the configured
    /// cell size. Dimensionless radii are taken as cells directly.
    fn radius_in_cells(&self, radius: &Scalar) -> Result<f64, RuntimeError> {
        if radius.units.is_dimensionless() {
            return Ok(radius.value);
        }
        let cell = &self.program.config().cell_size;
        let magnitude = self
            .program
            .converter()
            .convert(radius.value, &radius.units, &cell.units)
            .map_err(RuntimeError::bare)?;
        Ok(magnitude / cell.value)
    }
}

/// The evaluation scope handed to compiled guards, bodies, and predicates.
///
/// Exposes exactly the references the language grants a handler:
/// `current.*`, `prior.*`, `here.*`, `meta.*`, `external`, `within`,
/// element filters, `create`, and the replicate RNG.
pub struct Scope<'c, 'a> {
    ctx: &'c mut StepContext<'a>,
    entity: EntityId,
    element: Option<Value>,
}

impl<'c, 'a> Scope<'c, 'a> {
    pub(crate) fn new(ctx: &'c mut StepContext<'a>, entity: EntityId) -> Self {
        Self {
            ctx,
            entity,
            element: None,
        }
    }

    /// The entity this scope evaluates for.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.ctx.tick
    }

    /// The running substep.
    #[must_use]
    pub fn substep(&self) -> Substep {
        self.ctx.substep
    }

    /// The replicate RNG.
    pub fn rng(&mut self) -> &mut DeterministicRng {
        self.ctx.rng
    }

    /// The element bound by an enclosing filter, when evaluating a
    /// predicate over a distribution of scalars.
    #[must_use]
    pub fn element(&self) -> Option<&Value> {
        self.element.as_ref()
    }

    /// `current.<name>`: recursive resolution on this entity.
    pub fn current(&mut self, name: &str) -> Result<Value, RuntimeError> {
        self.ctx.resolve_name(self.entity, name)
    }

    /// `prior.<name>`: direct read from the frozen prior view. Never
    /// recurses and never observes current-substep writes.
    pub fn prior(&self, name: &str) -> Result<Value, RuntimeError> {
        self.ctx.prior_value(self.entity, name)
    }

    /// `here.<name>`: resolution on the patch containing this entity.
    pub fn here(&mut self, name: &str) -> Result<Value, RuntimeError> {
        let patch = self.ctx.containing_patch(self.entity)?;
        self.ctx.resolve_name(patch, name)
    }

    /// `meta.<name>`: resolution on the simulation entity.
    pub fn meta(&mut self, name: &str) -> Result<Value, RuntimeError> {
        let meta = self.ctx.meta;
        self.ctx.resolve_name(meta, name)
    }

    /// `external <name>`: samples the bound resource at this entity's
    /// position. Missing coverage yields an empty distribution.
    pub fn external(&mut self, resource: &str) -> Result<Value, RuntimeError> {
        let reader =
            Arc::clone(self.ctx.program.external(resource).ok_or_else(|| {
                RuntimeError::bare(EngineError::ExternalIo {
                    resource: resource.to_string(),
                    message: "no such resource binding".to_string(),
                })
            })?);
        let Some(position) = self.ctx.live.get(self.entity).and_then(Entity::position) else {
            return Err(RuntimeError::bare(EngineError::type_error(
                "external reads require a grid position",
            )));
        };
        reader.sample_at(position).map_err(RuntimeError::bare)
    }

    /// Bulk-samples the bound resource over a shape.
    pub fn external_over(
        &mut self,
        resource: &str,
        shape: &GridShape,
    ) -> Result<Value, RuntimeError> {
        let reader =
            Arc::clone(self.ctx.program.external(resource).ok_or_else(|| {
                RuntimeError::bare(EngineError::ExternalIo {
                    resource: resource.to_string(),
                    message: "no such resource binding".to_string(),
                })
            })?);
        reader
            .bulk_sample(shape)
            .map(Value::Realized)
            .map_err(RuntimeError::bare)
    }

    /// `within R [radial|square] at (prior|current)`: the neighbourhood of
    /// patches whose centre lies within `R` of this entity's patch.
    ///
    /// Results are sorted by entity id so downstream RNG consumption is
    /// deterministic.
    pub fn within(
        &mut self,
        radius: &Value,
        shape: NeighborhoodShape,
        view: TimeView,
    ) -> Result<Value, RuntimeError> {
        let radius = radius.as_scalar().map_err(RuntimeError::bare)?;
        let cells = self.ctx.radius_in_cells(radius)?;
        let anchor = self.ctx.containing_patch(self.entity)?;
        let Some(center) = self.ctx.live.get(anchor).and_then(Entity::position) else {
            return Err(RuntimeError::bare(EngineError::type_error(
                "anchor patch has no grid position",
            )));
        };
        let candidates = match shape {
            NeighborhoodShape::Radial => self.ctx.index.query_circle(center, cells),
            NeighborhoodShape::Square => self.ctx.index.query_square(center, 2.0 * cells),
        };
        let mut ids: Vec<EntityId> = candidates
            .into_iter()
            .filter(|id| match view {
                TimeView::Current => self.ctx.live.get(*id).is_some(),
                TimeView::Prior => self.ctx.prior.get(*id).is_some(),
            })
            .filter(|id| {
                let Some(position) = self.ctx.live.get(*id).and_then(Entity::position) else {
                    return false;
                };
                match shape {
                    NeighborhoodShape::Radial => position.distance_to(&center) <= cells,
                    NeighborhoodShape::Square => {
                        (position.x - center.x).abs() <= cells
                            && (position.y - center.y).abs() <= cells
                    }
                }
            })
            .collect();
        ids.sort_unstable();
        Ok(Value::Realized(RealizedDistribution::of_refs(ids)))
    }

    /// `E[predicate]`: filters a realized distribution, evaluating the
    /// predicate in a scope rooted at each element. Survivor order is
    /// preserved.
    pub fn filter(
        &mut self,
        distribution: &Value,
        predicate: &PredicateFn,
    ) -> Result<Value, RuntimeError> {
        let realized = distribution.as_realized().map_err(RuntimeError::bare)?;
        let mut survivors = Vec::new();
        for element in realized.values() {
            let element_entity = match element {
                Value::EntityRef(id) => *id,
                _ => self.entity,
            };
            let keep = {
                let mut sub = Scope {
                    ctx: &mut *self.ctx,
                    entity: element_entity,
                    element: Some(element.clone()),
                };
                predicate(&mut sub)?
            };
            if keep {
                survivors.push(element.clone());
            }
        }
        Ok(Value::Realized(RealizedDistribution::from_values(
            survivors,
            realized.units().clone(),
        )))
    }

    /// `create N of T`: instantiates `N` fresh entities from prototype `T`
    /// at this entity's position, runs their `init` handlers immediately,
    /// and returns them as a distribution of references.
    pub fn create(&mut self, count: &Value, prototype_name: &str) -> Result<Value, RuntimeError> {
        let count = count
            .as_scalar()
            .and_then(Scalar::as_integer)
            .map_err(RuntimeError::bare)?;
        if count < 0 {
            return Err(RuntimeError::bare(EngineError::type_error(format!(
                "create count must be non-negative, found {count}"
            ))));
        }
        let proto = self
            .ctx
            .program
            .prototype(prototype_name)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::bare(EngineError::type_error(format!(
                    "unknown prototype '{prototype_name}'"
                )))
            })?;
        let position = self.ctx.live.get(self.entity).and_then(Entity::position);
        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.ctx.live.insert(Entity::new(Arc::clone(&proto), position));
            self.ctx.run_init(id, &proto)?;
            created.push(id);
        }
        Ok(Value::Realized(RealizedDistribution::of_refs(created)))
    }

    /// Resolves an attribute on a referenced entity (current view).
    pub fn attr_of(&mut self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        let id = target.as_entity_ref().map_err(RuntimeError::bare)?;
        self.ctx.resolve_name(id, name)
    }

    /// Reads an attribute of a referenced entity from the prior view.
    pub fn prior_of(&self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        let id = target.as_entity_ref().map_err(RuntimeError::bare)?;
        self.ctx.prior_value(id, name)
    }

    /// Draws one scalar from a value (identity for scalars).
    pub fn sample(&mut self, value: &Value) -> Result<Value, RuntimeError> {
        value
            .sample(self.ctx.rng)
            .map(Value::Scalar)
            .map_err(RuntimeError::bare)
    }

    /// Materialises `n` ordered elements of a distribution.
    pub fn contents(
        &mut self,
        value: &Value,
        n: usize,
        with_replacement: bool,
    ) -> Result<Value, RuntimeError> {
        let units = value
            .units()
            .cloned()
            .unwrap_or_else(Units::dimensionless);
        let elements = value
            .contents(n, with_replacement, self.ctx.rng)
            .map_err(RuntimeError::bare)?;
        Ok(Value::Realized(RealizedDistribution::from_values(
            elements, units,
        )))
    }

    /// Explicit unit conversion through the program's converter.
    pub fn convert(&mut self, value: &Value, to: &Units) -> Result<Value, RuntimeError> {
        let scalar = value.as_scalar().map_err(RuntimeError::bare)?;
        let magnitude = self
            .ctx
            .program
            .converter()
            .convert(scalar.value, &scalar.units, to)
            .map_err(RuntimeError::bare)?;
        Ok(Value::Scalar(Scalar::new(magnitude, to.clone())))
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Entity kinds, prototypes, instances, and the time-step arena.
//!
//! A prototype is the shared immutable schema of every instance of one
//! declared entity type: its ordered attribute set, the dense name → index
//! table, and the handler groups keyed by `(attribute, substep, state)`.
//! Prototypes are built once during program construction, validated, and
//! frozen behind `Arc`; after that only instance slot arrays mutate.
//!
//! Instances live in an arena addressed by dense [`EntityId`]s. Ids are never
//! reused within a replicate — the frozen prior-step arena is indexed by the
//! same ids, so a recycled id would alias a dead entity's history.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::EngineError;
use crate::geom::GridPoint;
use crate::handler::{EventKey, Handler, HandlerDecl, HandlerGroup};
use crate::value::Value;

/// Name of the distinguished state attribute consulted by state-qualified
/// handler groups.
pub const STATE_ATTRIBUTE: &str = "state";

/// Discriminant over the five declarable entity kinds.
///
/// Kind-specific behaviour hangs off this tag plus side tables (geometry for
/// spatial kinds, configuration for simulations, readers for external
/// resources) instead of an inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EntityKind {
    /// The single root entity carrying simulation-wide attributes.
    Simulation,
    /// A fixed grid cell holding local state and contained agents.
    Patch,
    /// An organism living on a patch.
    Agent,
    /// A transient event entity (fire, storm, harvest).
    Disturbance,
    /// A named binding to an external geospatial data source.
    ExternalResource,
}

impl EntityKind {
    /// Returns `true` for kinds that carry a grid position.
    #[must_use]
    pub fn is_spatial(self) -> bool {
        matches!(self, Self::Patch | Self::Agent | Self::Disturbance)
    }

    /// Stable byte tag used in canonical state encoding.
    #[must_use]
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Simulation => 0,
            Self::Patch => 1,
            Self::Agent => 2,
            Self::Disturbance => 3,
            Self::ExternalResource => 4,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simulation => "simulation",
            Self::Patch => "patch",
            Self::Agent => "agent",
            Self::Disturbance => "disturbance",
            Self::ExternalResource => "external resource",
        })
    }
}

/// Number of substeps in a tick.
pub const SUBSTEP_COUNT: usize = 4;

/// One of the four phases of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Substep {
    /// Runs once, when an entity is created.
    Init,
    /// Opens every tick.
    Start,
    /// The main update phase of every tick.
    Step,
    /// Closes every tick.
    End,
}

impl Substep {
    /// All substeps in execution order.
    pub const ALL: [Self; SUBSTEP_COUNT] = [Self::Init, Self::Start, Self::Step, Self::End];

    /// Dense index into per-substep tables.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Init => 0,
            Self::Start => 1,
            Self::Step => 2,
            Self::End => 3,
        }
    }
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Step => "step",
            Self::End => "end",
        })
    }
}

/// Dense index of an attribute within its prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttrId(u32);

impl AttrId {
    /// Returns the dense slot index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Dense arena identifier of an entity instance within one replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityId(u32);

impl EntityId {
    /// Wraps a raw arena index.
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handler groups registered for one `(attribute, substep)` event.
#[derive(Default)]
struct EventGroups {
    stateless: Option<Arc<HandlerGroup>>,
    by_state: FxHashMap<Arc<str>, Arc<HandlerGroup>>,
}

/// Immutable shared schema of one declared entity type.
pub struct EntityPrototype {
    name: Arc<str>,
    kind: EntityKind,
    attribute_names: Vec<Arc<str>>,
    attribute_index: FxHashMap<Arc<str>, AttrId>,
    groups: FxHashMap<(AttrId, Substep), EventGroups>,
    has_handler: Vec<[bool; SUBSTEP_COUNT]>,
    has_state_handler: Vec<[bool; SUBSTEP_COUNT]>,
    state_attr: Option<AttrId>,
}

impl EntityPrototype {
    /// Starts a builder for a prototype of the given name and kind.
    #[must_use]
    pub fn builder(name: &str, kind: EntityKind) -> PrototypeBuilder {
        PrototypeBuilder {
            name: Arc::from(name),
            kind,
            attributes: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Prototype name as declared in the model.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Declared entity kind.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Number of declared attributes (slot array length).
    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.attribute_names.len()
    }

    /// Resolves an attribute name to its dense index.
    #[must_use]
    pub fn attr_id(&self, name: &str) -> Option<AttrId> {
        self.attribute_index.get(name).copied()
    }

    /// Reverse lookup from dense index to declared name.
    #[must_use]
    pub fn attribute_name(&self, attr: AttrId) -> &Arc<str> {
        &self.attribute_names[attr.index()]
    }

    /// Iterates declared attribute names in declaration order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.attribute_names.iter()
    }

    /// Iterates dense attribute ids in declaration order.
    pub fn attr_ids(&self) -> impl Iterator<Item = AttrId> {
        (0..self.attribute_names.len()).map(AttrId::from_index)
    }

    /// Returns `true` when any handler (stateless or state-qualified) exists
    /// for the event. `false` marks the attribute inert for that substep.
    #[must_use]
    pub fn has_handler(&self, attr: AttrId, substep: Substep) -> bool {
        self.has_handler[attr.index()][substep.index()]
    }

    /// Returns `true` when a state-qualified group exists for the event.
    #[must_use]
    pub fn has_state_handler(&self, attr: AttrId, substep: Substep) -> bool {
        self.has_state_handler[attr.index()][substep.index()]
    }

    /// The unqualified handler group for the event, if declared.
    #[must_use]
    pub fn stateless_group(&self, attr: AttrId, substep: Substep) -> Option<&Arc<HandlerGroup>> {
        self.groups
            .get(&(attr, substep))
            .and_then(|g| g.stateless.as_ref())
    }

    /// The group qualified by `state` for the event, if declared.
    #[must_use]
    pub fn state_group(
        &self,
        attr: AttrId,
        substep: Substep,
        state: &str,
    ) -> Option<&Arc<HandlerGroup>> {
        self.groups
            .get(&(attr, substep))
            .and_then(|g| g.by_state.get(state))
    }

    /// Dense index of the `state` attribute, when declared.
    #[must_use]
    pub fn state_attr(&self) -> Option<AttrId> {
        self.state_attr
    }
}

impl fmt::Debug for EntityPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityPrototype")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("attributes", &self.attribute_names)
            .finish_non_exhaustive()
    }
}

/// Handler groups accumulated per event key while the builder runs.
#[derive(Default)]
struct PendingGroups {
    stateless: Option<HandlerGroup>,
    by_state: FxHashMap<Arc<str>, HandlerGroup>,
}

/// Builder assembling and validating an [`EntityPrototype`].
pub struct PrototypeBuilder {
    name: Arc<str>,
    kind: EntityKind,
    attributes: Vec<Arc<str>>,
    handlers: Vec<HandlerDecl>,
}

impl PrototypeBuilder {
    /// Declares an attribute. Declaration order fixes the dense slot order.
    #[must_use]
    pub fn attribute(mut self, name: &str) -> Self {
        self.attributes.push(Arc::from(name));
        self
    }

    /// Declares several attributes at once, in order.
    #[must_use]
    pub fn attributes<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        for name in names {
            self.attributes.push(Arc::from(name));
        }
        self
    }

    /// Registers a handler declaration. Declaration order is preserved within
    /// each `(attribute, substep, state)` group and breaks guard ties.
    #[must_use]
    pub fn handler(mut self, decl: HandlerDecl) -> Self {
        self.handlers.push(decl);
        self
    }

    /// Validates and freezes the prototype.
    ///
    /// Rejects duplicate attribute declarations and handlers whose event key
    /// names an undeclared attribute.
    pub fn build(self) -> Result<Arc<EntityPrototype>, EngineError> {
        let mut attribute_index: FxHashMap<Arc<str>, AttrId> = FxHashMap::default();
        let mut seen: FxHashSet<Arc<str>> = FxHashSet::default();
        for (position, name) in self.attributes.iter().enumerate() {
            if !seen.insert(Arc::clone(name)) {
                return Err(EngineError::invalid_config(format!(
                    "attribute '{name}' declared twice on prototype '{}'",
                    self.name
                )));
            }
            attribute_index.insert(Arc::clone(name), AttrId(position as u32));
        }

        let attr_count = self.attributes.len();
        let mut pending: FxHashMap<(AttrId, Substep), PendingGroups> = FxHashMap::default();
        let mut has_handler = vec![[false; SUBSTEP_COUNT]; attr_count];
        let mut has_state_handler = vec![[false; SUBSTEP_COUNT]; attr_count];

        for decl in self.handlers {
            let EventKey {
                attribute,
                substep,
                state,
            } = decl.key;
            let Some(attr) = attribute_index.get(&attribute).copied() else {
                return Err(EngineError::MissingAttribute {
                    name: attribute.to_string(),
                    prototype: self.name.to_string(),
                });
            };
            has_handler[attr.index()][substep.index()] = true;
            let handler = Handler {
                attribute: attr,
                substep,
                guard: decl.guard,
                body: decl.body,
                location: decl.location,
            };
            let event = pending.entry((attr, substep)).or_default();
            match state {
                None => event
                    .stateless
                    .get_or_insert_with(HandlerGroup::stateless)
                    .push(handler),
                Some(state) => {
                    has_state_handler[attr.index()][substep.index()] = true;
                    event
                        .by_state
                        .entry(Arc::clone(&state))
                        .or_insert_with(|| HandlerGroup::for_state(state))
                        .push(handler);
                }
            }
        }

        let groups = pending
            .into_iter()
            .map(|(key, built)| {
                (
                    key,
                    EventGroups {
                        stateless: built.stateless.map(Arc::new),
                        by_state: built
                            .by_state
                            .into_iter()
                            .map(|(state, group)| (state, Arc::new(group)))
                            .collect(),
                    },
                )
            })
            .collect();

        let state_attr = attribute_index.get(STATE_ATTRIBUTE).copied();
        Ok(Arc::new(EntityPrototype {
            name: self.name,
            kind: self.kind,
            attribute_names: self.attributes,
            attribute_index,
            groups,
            has_handler,
            has_state_handler,
            state_attr,
        }))
    }
}

/// One live entity instance: prototype reference, dense slot array, and grid
/// position for spatial kinds.
#[derive(Debug, Clone)]
pub struct Entity {
    prototype: Arc<EntityPrototype>,
    slots: Vec<Option<Value>>,
    position: Option<GridPoint>,
}

impl Entity {
    /// Creates an instance with every slot unset.
    #[must_use]
    pub fn new(prototype: Arc<EntityPrototype>, position: Option<GridPoint>) -> Self {
        let slots = vec![None; prototype.attribute_count()];
        Self {
            prototype,
            slots,
            position,
        }
    }

    /// Shared prototype of this instance.
    #[must_use]
    pub fn prototype(&self) -> &Arc<EntityPrototype> {
        &self.prototype
    }

    /// Entity kind, from the prototype.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.prototype.kind()
    }

    /// Grid position, for spatial kinds.
    #[must_use]
    pub fn position(&self) -> Option<GridPoint> {
        self.position
    }

    /// Reads a slot by dense index. `None` means logically absent.
    #[must_use]
    pub fn slot(&self, attr: AttrId) -> Option<&Value> {
        self.slots[attr.index()].as_ref()
    }

    /// Reads a slot by declared attribute name (convenience for embedders).
    #[must_use]
    pub fn slot_by_name(&self, name: &str) -> Option<&Value> {
        self.prototype.attr_id(name).and_then(|attr| self.slot(attr))
    }

    /// Writes a slot by dense index.
    pub fn set_slot(&mut self, attr: AttrId, value: Value) {
        self.slots[attr.index()] = Some(value);
    }

    /// Iterates slots in dense order.
    pub(crate) fn slots(&self) -> &[Option<Value>] {
        &self.slots
    }
}

/// Dense arena of live entities for one replicate.
///
/// Slots of removed entities stay vacant; ids are never reused so the frozen
/// prior arena (indexed by the same ids) cannot alias.
#[derive(Debug, Default)]
pub struct EntityArena {
    entities: Vec<Option<Entity>>,
}

impl EntityArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entity, returning its id.
    pub fn insert(&mut self, entity: Entity) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(Some(entity));
        id
    }

    /// Borrows the entity at `id`, if it is alive.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.index()).and_then(Option::as_ref)
    }

    /// Mutably borrows the entity at `id`, if it is alive.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Removes the entity at `id`. The slot stays permanently vacant.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.get_mut(id.index()).and_then(Option::take)
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.iter().filter(|e| e.is_some()).count()
    }

    /// Returns `true` when no entity is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total id capacity, including vacant slots (exclusive upper bound of
    /// all ids ever issued).
    #[must_use]
    pub fn id_bound(&self) -> usize {
        self.entities.len()
    }

    /// Live entity ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| EntityId(i as u32)))
            .collect()
    }

    /// Iterates live `(id, entity)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|entity| (EntityId(i as u32), entity)))
    }
}

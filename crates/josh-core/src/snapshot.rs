// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Frozen entity snapshots and canonical state hashing.
//!
//! At the end of every substep the live arena is frozen into a write-once
//! [`FrozenArena`]; the next substep reads `prior.*` exclusively through it.
//! Frozen entities expose attribute reads only — there is no route back to
//! mutation.
//!
//! Determinism contract for [`FrozenArena::state_root`]:
//! - BLAKE3 over a canonical byte stream with a domain-separation prefix.
//! - Entities are encoded in ascending id order, including vacant ids (a
//!   one-byte presence tag), so arenas that differ only in holes differ.
//! - All integers are little-endian fixed width; floats are raw IEEE bits;
//!   units are encoded by interned *name* (ids are process-local).
//! - Virtual distributions commit to sampler label, units, and size; the
//!   closure itself has no canonical form.

use std::sync::Arc;

use blake3::Hasher;

use crate::entity::{AttrId, EntityArena, EntityId, EntityPrototype};
use crate::geom::GridPoint;
use crate::units::{UnitRegistry, Units};
use crate::value::Value;

/// Canonical 256-bit digest used for state roots.
pub type Hash = [u8; 32];

const STATE_ROOT_DOMAIN: &[u8] = b"josh:state-root:v1";

/// Read-only snapshot of one entity as of the end of a substep.
#[derive(Debug, Clone)]
pub struct FrozenEntity {
    prototype: Arc<EntityPrototype>,
    slots: Arc<[Option<Value>]>,
    position: Option<GridPoint>,
}

impl FrozenEntity {
    /// Shared prototype of the snapshotted entity.
    #[must_use]
    pub fn prototype(&self) -> &Arc<EntityPrototype> {
        &self.prototype
    }

    /// Grid position at freeze time.
    #[must_use]
    pub fn position(&self) -> Option<GridPoint> {
        self.position
    }

    /// Reads a slot by dense index.
    #[must_use]
    pub fn slot(&self, attr: AttrId) -> Option<&Value> {
        self.slots[attr.index()].as_ref()
    }

    /// Reads a slot by declared attribute name.
    #[must_use]
    pub fn slot_by_name(&self, name: &str) -> Option<&Value> {
        self.prototype.attr_id(name).and_then(|attr| self.slot(attr))
    }

    pub(crate) fn slots(&self) -> &[Option<Value>] {
        &self.slots
    }
}

/// Write-once arena of frozen entities, indexed by the live arena's ids.
#[derive(Debug, Clone, Default)]
pub struct FrozenArena {
    entities: Vec<Option<FrozenEntity>>,
}

impl FrozenArena {
    /// An arena with no entities (the prior view of the very first substep).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshots every live entity.
    #[must_use]
    pub fn freeze(arena: &EntityArena) -> Self {
        let entities = (0..arena.id_bound())
            .map(|i| {
                arena.get(EntityId::new(i as u32)).map(|entity| FrozenEntity {
                    prototype: Arc::clone(entity.prototype()),
                    slots: entity.slots().to_vec().into(),
                    position: entity.position(),
                })
            })
            .collect();
        Self { entities }
    }

    /// The frozen entity at `id`, when it was alive at freeze time.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&FrozenEntity> {
        self.entities.get(id.index()).and_then(Option::as_ref)
    }

    /// Reads one slot of one frozen entity.
    #[must_use]
    pub fn slot(&self, id: EntityId, attr: AttrId) -> Option<&Value> {
        self.get(id).and_then(|entity| entity.slot(attr))
    }

    /// Iterates frozen `(id, entity)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &FrozenEntity)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|entity| (EntityId::new(i as u32), entity)))
    }

    /// Canonical digest of the whole frozen state.
    #[must_use]
    pub fn state_root(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(STATE_ROOT_DOMAIN);
        hasher.update(&(self.entities.len() as u64).to_le_bytes());
        for entity in &self.entities {
            match entity {
                None => {
                    hasher.update(&[0u8]);
                }
                Some(entity) => {
                    hasher.update(&[1u8]);
                    hash_str(&mut hasher, entity.prototype.name());
                    hasher.update(&[entity.prototype.kind().tag()]);
                    match entity.position {
                        None => {
                            hasher.update(&[0u8]);
                        }
                        Some(p) => {
                            hasher.update(&[1u8]);
                            hasher.update(&p.x.to_bits().to_le_bytes());
                            hasher.update(&p.y.to_bits().to_le_bytes());
                        }
                    }
                    hasher.update(&(entity.slots.len() as u64).to_le_bytes());
                    for slot in entity.slots() {
                        match slot {
                            None => {
                                hasher.update(&[0u8]);
                            }
                            Some(value) => {
                                hasher.update(&[1u8]);
                                hash_value(&mut hasher, value);
                            }
                        }
                    }
                }
            }
        }
        hasher.finalize().into()
    }

    /// Lowercase hex rendering of [`Self::state_root`].
    #[must_use]
    pub fn state_root_hex(&self) -> String {
        hex::encode(self.state_root())
    }
}

fn hash_str(hasher: &mut Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_units(hasher: &mut Hasher, units: &Units) {
    let factors: Vec<_> = units.factors().collect();
    hasher.update(&(factors.len() as u64).to_le_bytes());
    for (id, exp) in factors {
        hash_str(hasher, &UnitRegistry::name(id));
        hasher.update(&exp.to_le_bytes());
    }
}

fn hash_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Scalar(s) => {
            hasher.update(&[0u8]);
            hasher.update(&s.value.to_bits().to_le_bytes());
            hash_units(hasher, &s.units);
        }
        Value::Realized(d) => {
            hasher.update(&[1u8]);
            hash_units(hasher, d.units());
            hasher.update(&(d.len() as u64).to_le_bytes());
            for element in d.values() {
                hash_value(hasher, element);
            }
        }
        Value::Virtual(d) => {
            hasher.update(&[2u8]);
            hash_units(hasher, d.units());
            match d.size() {
                None => {
                    hasher.update(&[0u8]);
                }
                Some(size) => {
                    hasher.update(&[1u8]);
                    hasher.update(&(size as u64).to_le_bytes());
                }
            }
            hash_str(hasher, d.label());
        }
        Value::EntityRef(id) => {
            hasher.update(&[3u8]);
            hasher.update(&(id.index() as u32).to_le_bytes());
        }
        Value::Bool(b) => {
            hasher.update(&[4u8, u8::from(*b)]);
        }
        Value::Str(s) => {
            hasher.update(&[5u8]);
            hash_str(hasher, s);
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The validated in-memory program the engine executes.
//!
//! A program is what the front-end compiler produces from model source:
//! frozen entity prototypes (with compiled handler callables), unit
//! declarations and conversions, external-resource bindings, and the
//! simulation configuration. Tests and embedders author programs directly
//! through [`ProgramBuilder`]; parsing never reaches this crate.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::SimulationConfig;
use crate::entity::{EntityKind, EntityPrototype};
use crate::error::EngineError;
use crate::external::ExternalResource;
use crate::units::{Conversion, UnitConverter, UnitRegistry};

/// A validated, frozen program.
pub struct Program {
    prototypes: FxHashMap<Arc<str>, Arc<EntityPrototype>>,
    simulation: Arc<EntityPrototype>,
    patch: Arc<EntityPrototype>,
    converter: Arc<UnitConverter>,
    externals: FxHashMap<Arc<str>, Arc<dyn ExternalResource>>,
    config: SimulationConfig,
    attribute_universe: FxHashSet<Arc<str>>,
}

impl Program {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> ProgramBuilder {
        ProgramBuilder {
            prototypes: Vec::new(),
            conversions: Vec::new(),
            aliases: Vec::new(),
            externals: Vec::new(),
            config: None,
        }
    }

    /// Looks up a prototype by declared name.
    #[must_use]
    pub fn prototype(&self, name: &str) -> Option<&Arc<EntityPrototype>> {
        self.prototypes.get(name)
    }

    /// The simulation prototype.
    #[must_use]
    pub fn simulation_prototype(&self) -> &Arc<EntityPrototype> {
        &self.simulation
    }

    /// The patch prototype.
    #[must_use]
    pub fn patch_prototype(&self) -> &Arc<EntityPrototype> {
        &self.patch
    }

    /// The program's unit conversion graph.
    #[must_use]
    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    /// The simulation configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Looks up an external resource binding.
    #[must_use]
    pub fn external(&self, name: &str) -> Option<&Arc<dyn ExternalResource>> {
        self.externals.get(name)
    }

    /// Returns `true` when any prototype in the program declares `name`.
    ///
    /// Distinguishes a wrong-prototype reference (missing attribute) from a
    /// reference to an attribute that exists nowhere (missing handler).
    #[must_use]
    pub fn attribute_exists(&self, name: &str) -> bool {
        self.attribute_universe.contains(name)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("prototypes", &self.prototypes.len())
            .field("externals", &self.externals.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Assembles and validates a [`Program`].
pub struct ProgramBuilder {
    prototypes: Vec<Arc<EntityPrototype>>,
    conversions: Vec<Conversion>,
    aliases: Vec<(String, String)>,
    externals: Vec<(Arc<str>, Arc<dyn ExternalResource>)>,
    config: Option<SimulationConfig>,
}

impl ProgramBuilder {
    /// Adds a frozen prototype.
    #[must_use]
    pub fn prototype(mut self, prototype: Arc<EntityPrototype>) -> Self {
        self.prototypes.push(prototype);
        self
    }

    /// Registers a unit conversion edge.
    #[must_use]
    pub fn conversion(mut self, conversion: Conversion) -> Self {
        self.conversions.push(conversion);
        self
    }

    /// Declares a unit alias.
    #[must_use]
    pub fn unit_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.aliases.push((alias.to_string(), canonical.to_string()));
        self
    }

    /// Binds an external resource under a name.
    #[must_use]
    pub fn external(mut self, name: &str, resource: Arc<dyn ExternalResource>) -> Self {
        self.externals.push((Arc::from(name), resource));
        self
    }

    /// Sets the simulation configuration.
    #[must_use]
    pub fn config(mut self, config: SimulationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validates and freezes the program.
    ///
    /// Requires a configuration, exactly one simulation prototype, and
    /// exactly one patch prototype; rejects duplicate prototype names and
    /// duplicate external bindings.
    pub fn build(self) -> Result<Program, EngineError> {
        let config = self
            .config
            .ok_or_else(|| EngineError::invalid_config("program has no simulation configuration"))?;
        config.validate()?;

        for (alias, canonical) in &self.aliases {
            UnitRegistry::alias(alias, canonical)?;
        }

        let mut prototypes: FxHashMap<Arc<str>, Arc<EntityPrototype>> = FxHashMap::default();
        let mut simulation = None;
        let mut patch = None;
        let mut attribute_universe = FxHashSet::default();
        for prototype in self.prototypes {
            for name in prototype.attribute_names() {
                attribute_universe.insert(Arc::clone(name));
            }
            match prototype.kind() {
                EntityKind::Simulation if simulation.is_some() => {
                    return Err(EngineError::invalid_config(
                        "program declares more than one simulation",
                    ));
                }
                EntityKind::Simulation => simulation = Some(Arc::clone(&prototype)),
                EntityKind::Patch if patch.is_some() => {
                    return Err(EngineError::invalid_config(
                        "program declares more than one patch prototype",
                    ));
                }
                EntityKind::Patch => patch = Some(Arc::clone(&prototype)),
                _ => {}
            }
            let name = Arc::clone(prototype.name());
            if prototypes.insert(name, prototype).is_some() {
                return Err(EngineError::invalid_config(
                    "program declares two prototypes with the same name",
                ));
            }
        }
        let simulation = simulation
            .ok_or_else(|| EngineError::invalid_config("program declares no simulation"))?;
        let patch =
            patch.ok_or_else(|| EngineError::invalid_config("program declares no patch prototype"))?;

        for binding in &config.exports {
            if simulation.attr_id(&binding.attribute).is_none() {
                return Err(EngineError::invalid_config(format!(
                    "export binding '{}' names no simulation attribute",
                    binding.attribute
                )));
            }
        }

        let mut converter = UnitConverter::new();
        for conversion in self.conversions {
            converter.register(conversion);
        }

        let mut externals: FxHashMap<Arc<str>, Arc<dyn ExternalResource>> = FxHashMap::default();
        for (name, resource) in self.externals {
            if externals.insert(Arc::clone(&name), resource).is_some() {
                return Err(EngineError::invalid_config(format!(
                    "external resource '{name}' bound twice"
                )));
            }
        }

        Ok(Program {
            prototypes,
            simulation,
            patch,
            converter: Arc::new(converter),
            externals,
            config,
            attribute_universe,
        })
    }
}

impl fmt::Debug for ProgramBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramBuilder")
            .field("prototypes", &self.prototypes.len())
            .field("conversions", &self.conversions.len())
            .finish_non_exhaustive()
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! josh-core: deterministic spatially explicit agent-based simulation engine.
//!
//! Executes validated model programs — entity prototypes with compiled
//! handler callables over a rectangular patch grid — tick by tick through
//! the fixed substep pipeline `init → start → step → end`, with lazy
//! cycle-checked attribute resolution, unit-checked value arithmetic, radial
//! neighbourhood queries over a cached-offset spatial index, and canonical
//! state-root digests for replicate reproducibility.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cognitive_complexity,
    clippy::option_if_let_else,
    clippy::significant_drop_tightening,
    clippy::doc_markdown,
    clippy::too_many_lines,
    clippy::too_long_first_doc_paragraph,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::trivially_copy_pass_by_ref,
    clippy::manual_let_else,
    clippy::needless_pass_by_value,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

/// Deterministic math subsystem (seeded PRNG).
pub mod math;

mod config;
mod engine;
mod entity;
mod error;
mod export;
mod external;
mod geom;
mod handler;
mod program;
mod resolver;
mod snapshot;
mod telemetry;
mod units;
mod value;

// Re-exports for a stable public API.
/// Simulation configuration and export bindings.
pub use config::{ExportBinding, ExportTemplate, SimulationConfig};
/// Replicate driver, cancellation, and run summaries.
pub use engine::{CancellationToken, Engine, EngineBuilder, ReplicateSummary};
/// Entity prototypes, instances, arenas, kinds, and substeps.
pub use entity::{
    AttrId, Entity, EntityArena, EntityId, EntityKind, EntityPrototype, PrototypeBuilder, Substep,
    STATE_ATTRIBUTE, SUBSTEP_COUNT,
};
/// Error taxonomy and contextual runtime errors.
pub use error::{EngineError, RuntimeError, SourceLocation};
/// Export sink collaborators and reference implementations.
pub use export::{ExportRecord, ExportSink, JsonlExportSink, MemoryExportSink};
/// External geospatial resource collaborators.
pub use external::{ExternalResource, GridResource};
/// Grid geometry and the patch spatial index.
pub use geom::{GridPoint, GridShape, PatchIndex, GEOM_TOLERANCE};
/// Compiled handler callables and event keys.
pub use handler::{BodyFn, EventKey, GuardFn, Handler, HandlerDecl, HandlerGroup, PredicateFn};
/// Deterministic PRNG.
pub use math::DeterministicRng;
/// The validated program IR and its builder.
pub use program::{Program, ProgramBuilder};
/// The attribute resolver and handler evaluation scope.
pub use resolver::{NeighborhoodShape, Scope, StepContext, TimeView};
/// Frozen snapshots and canonical state digests.
pub use snapshot::{FrozenArena, FrozenEntity, Hash};
/// Engine progress telemetry.
pub use telemetry::{JsonlTelemetrySink, NullTelemetrySink, TelemetrySink};
/// Unit interning, monomials, and conversion.
pub use units::{Conversion, ConvertFn, UnitConverter, UnitId, UnitRegistry, Units};
/// Unit-tagged values and distributions.
pub use value::{
    NormalSampler, RealizedDistribution, Sampler, Scalar, UniformSampler, Value,
    VirtualDistribution,
};

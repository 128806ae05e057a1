// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The replicate driver: bootstrap, tick loop, exports, cancellation.
//!
//! A replicate runs the fixed substep pipeline `init → start → step → end`
//! per tick (`init` only on the first tick; mid-tick creations run theirs
//! immediately). After every substep the live arena is frozen — the next
//! substep's `prior.*` view — unreferenced agents are swept, matching
//! exports are pushed, and the sink is flushed. Iteration order is
//! deterministic: the simulation entity first, patches row-major over the
//! grid, then agents in insertion order.
//!
//! The export sink is held in a close-on-drop guard, so it is released on
//! every exit path, including handler failure. Cancellation is cooperative:
//! the token is checked between ticks and between substeps, never inside a
//! substep.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::SimulationConfig;
use crate::entity::{Entity, EntityArena, EntityId, EntityKind, Substep};
use crate::error::{EngineError, RuntimeError};
use crate::export::ExportSink;
use crate::geom::{GridPoint, PatchIndex};
use crate::math::DeterministicRng;
use crate::program::Program;
use crate::resolver::StepContext;
use crate::snapshot::{FrozenArena, Hash};
use crate::telemetry::{NullTelemetrySink, TelemetrySink};

/// Cooperative cancellation signal shared with the embedding application.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Outcome of one replicate run.
#[derive(Debug, Clone)]
pub struct ReplicateSummary {
    /// Replicate number.
    pub replicate: u32,
    /// Ticks that ran to completion.
    pub ticks_completed: u64,
    /// Whether the run stopped on a cancellation request.
    pub cancelled: bool,
    /// Canonical state root after each completed tick, in tick order.
    pub tick_roots: Vec<Hash>,
}

impl ReplicateSummary {
    /// State root after the final completed tick, when any tick completed.
    #[must_use]
    pub fn final_state_root(&self) -> Option<Hash> {
        self.tick_roots.last().copied()
    }
}

/// Close-on-drop wrapper keeping the export sink released on every exit path.
struct SinkGuard {
    sink: Option<Box<dyn ExportSink>>,
}

impl SinkGuard {
    fn new(sink: Box<dyn ExportSink>) -> Self {
        Self { sink: Some(sink) }
    }

    fn active(&mut self) -> Result<&mut Box<dyn ExportSink>, EngineError> {
        self.sink.as_mut().ok_or_else(|| EngineError::Export {
            message: "sink already closed".to_string(),
        })
    }

    fn close(&mut self) -> Result<(), EngineError> {
        match self.sink.take() {
            Some(mut sink) => sink.close(),
            None => Ok(()),
        }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            // Failure-path release: close errors have nowhere to go.
            let _ = sink.close();
        }
    }
}

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
    program: Program,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl EngineBuilder {
    /// Injects a telemetry sink. Defaults to [`NullTelemetrySink`].
    #[must_use]
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            program: Arc::new(self.program),
            telemetry: self
                .telemetry
                .unwrap_or_else(|| Arc::new(NullTelemetrySink)),
        }
    }
}

/// The simulation engine: runs replicates of one validated program.
pub struct Engine {
    program: Arc<Program>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Engine {
    /// Creates an engine with default telemetry.
    #[must_use]
    pub fn new(program: Program) -> Self {
        Self::builder(program).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(program: Program) -> EngineBuilder {
        EngineBuilder {
            program,
            telemetry: None,
        }
    }

    /// The program this engine executes.
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Runs every configured replicate sequentially.
    ///
    /// `make_sink` opens the export sink for each replicate (embedders
    /// typically resolve the configured export template here).
    pub fn run_all(
        &self,
        mut make_sink: impl FnMut(u32) -> Box<dyn ExportSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReplicateSummary>, RuntimeError> {
        let replicates = self.program.config().replicates;
        let mut summaries = Vec::with_capacity(replicates as usize);
        for replicate in 0..replicates {
            let summary = self.run_replicate(replicate, make_sink(replicate), cancel)?;
            let stop = summary.cancelled;
            summaries.push(summary);
            if stop {
                break;
            }
        }
        Ok(summaries)
    }

    /// Runs one replicate to completion, cancellation, or failure.
    pub fn run_replicate(
        &self,
        replicate: u32,
        sink: Box<dyn ExportSink>,
        cancel: &CancellationToken,
    ) -> Result<ReplicateSummary, RuntimeError> {
        self.run_replicate_detailed(replicate, sink, cancel)
            .map(|(summary, _)| summary)
    }

    /// Runs one replicate and also returns the final frozen state, for
    /// embedders that inspect end-of-run entity values.
    pub fn run_replicate_detailed(
        &self,
        replicate: u32,
        sink: Box<dyn ExportSink>,
        cancel: &CancellationToken,
    ) -> Result<(ReplicateSummary, FrozenArena), RuntimeError> {
        let config = self.program.config();
        let mut rng = DeterministicRng::for_replicate(config.seed, replicate);
        let mut arena = EntityArena::new();
        let meta = self.bootstrap(&mut arena);
        let mut sink = SinkGuard::new(sink);
        let mut prior = FrozenArena::freeze(&arena);
        let mut tick_roots = Vec::new();
        let mut ticks_completed = 0u64;
        let mut cancelled = false;

        'ticks: for tick in config.steps_low..=config.steps_high {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.telemetry.tick_started(replicate, tick);
            let index = Self::build_index(config, &arena)?;
            for substep in Substep::ALL {
                if substep == Substep::Init && tick != config.steps_low {
                    continue;
                }
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'ticks;
                }
                self.run_substep(&mut arena, &prior, &index, &mut rng, meta, substep, tick)?;
                Self::sweep_unreferenced(&mut arena);
                prior = FrozenArena::freeze(&arena);
                self.push_exports(replicate, &prior, meta, substep, tick, &mut sink)?;
                self.telemetry.substep_completed(replicate, tick, substep);
            }
            tick_roots.push(prior.state_root());
            ticks_completed += 1;
        }

        sink.close().map_err(RuntimeError::bare)?;
        self.telemetry
            .replicate_finished(replicate, ticks_completed, cancelled);
        Ok((
            ReplicateSummary {
                replicate,
                ticks_completed,
                cancelled,
                tick_roots,
            },
            prior,
        ))
    }

    /// Creates the simulation entity and the patch grid (row-major).
    fn bootstrap(&self, arena: &mut EntityArena) -> EntityId {
        let meta = arena.insert(Entity::new(
            Arc::clone(self.program.simulation_prototype()),
            None,
        ));
        let config = self.program.config();
        let patch_proto = self.program.patch_prototype();
        for y in config.grid_low.1..=config.grid_high.1 {
            for x in config.grid_low.0..=config.grid_high.0 {
                arena.insert(Entity::new(
                    Arc::clone(patch_proto),
                    Some(GridPoint::new(x as f64, y as f64)),
                ));
            }
        }
        meta
    }

    fn build_index(
        config: &SimulationConfig,
        arena: &EntityArena,
    ) -> Result<PatchIndex, RuntimeError> {
        let patches = arena.iter().filter_map(|(id, entity)| {
            (entity.kind() == EntityKind::Patch)
                .then(|| entity.position().map(|p| (id, p)))
                .flatten()
        });
        PatchIndex::build(config.grid_low, config.grid_high, patches).map_err(RuntimeError::bare)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_substep(
        &self,
        arena: &mut EntityArena,
        prior: &FrozenArena,
        index: &PatchIndex,
        rng: &mut DeterministicRng,
        meta: EntityId,
        substep: Substep,
        tick: u64,
    ) -> Result<(), RuntimeError> {
        let ids = arena.ids();
        let mut ctx = StepContext::new(arena, prior, index, &self.program, rng, meta, substep, tick);
        for id in ids {
            ctx.resolve_handled(id)?;
        }
        Ok(())
    }

    fn push_exports(
        &self,
        replicate: u32,
        frozen: &FrozenArena,
        meta: EntityId,
        substep: Substep,
        tick: u64,
        sink: &mut SinkGuard,
    ) -> Result<(), RuntimeError> {
        let config = self.program.config();
        for binding in config
            .exports
            .iter()
            .filter(|binding| binding.substep == substep)
        {
            let value = frozen
                .get(meta)
                .and_then(|entity| entity.slot_by_name(&binding.attribute));
            // Unset at this point in the run: nothing to export yet.
            let Some(value) = value else {
                continue;
            };
            sink.active()
                .and_then(|sink| sink.write(substep, tick, &binding.attribute, value))
                .map_err(RuntimeError::bare)?;
            self.telemetry
                .export_written(replicate, tick, &binding.attribute);
        }
        sink.active()
            .and_then(|sink| sink.flush())
            .map_err(RuntimeError::bare)?;
        Ok(())
    }

    /// Removes agents and disturbances no live list attribute references.
    ///
    /// Roots are every simulation, patch, and external-resource entity;
    /// reachability follows entity references held in slot values.
    fn sweep_unreferenced(arena: &mut EntityArena) {
        let bound = arena.id_bound();
        let mut reachable = vec![false; bound];
        let mut queue: Vec<EntityId> = Vec::new();
        for (id, entity) in arena.iter() {
            if !matches!(entity.kind(), EntityKind::Agent | EntityKind::Disturbance) {
                reachable[id.index()] = true;
                queue.push(id);
            }
        }
        while let Some(id) = queue.pop() {
            let Some(entity) = arena.get(id) else {
                continue;
            };
            let mut found: Vec<EntityId> = Vec::new();
            for slot in entity.slots().iter().flatten() {
                slot.for_each_entity_ref(&mut |target| {
                    if target.index() < bound && !reachable[target.index()] {
                        reachable[target.index()] = true;
                        found.push(target);
                    }
                });
            }
            queue.extend(found);
        }
        let dead: Vec<EntityId> = arena
            .iter()
            .filter(|(id, _)| !reachable[id.index()])
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            arena.remove(id);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

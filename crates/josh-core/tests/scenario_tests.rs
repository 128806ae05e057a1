// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs, clippy::unwrap_used, clippy::expect_used)]
//! End-to-end model scenarios driven through the public engine API.

mod common;

use std::sync::Arc;

use common::{body, constant, guard, number, scalar, SharedSink};
use josh_core::{
    CancellationToken, Engine, EngineError, EntityKind, EntityPrototype, HandlerDecl,
    MemoryExportSink, Program, Scalar, Scope, SimulationConfig, Substep, Units, Value,
};

fn sim_proto() -> Arc<EntityPrototype> {
    EntityPrototype::builder("Main", EntityKind::Simulation)
        .build()
        .unwrap()
}

fn run_one(
    program: Program,
) -> Result<(josh_core::ReplicateSummary, josh_core::FrozenArena), josh_core::RuntimeError> {
    Engine::new(program).run_replicate_detailed(
        0,
        Box::new(MemoryExportSink::new()),
        &CancellationToken::new(),
    )
}

#[test]
fn forever_trees_age_one_year_per_tick() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("trees")
        .handler(HandlerDecl::new(
            "trees",
            Substep::Init,
            body(|scope: &mut Scope<'_, '_>| scope.create(&number(1.0), "ForeverTree")),
        ))
        .build()
        .unwrap();
    let tree = EntityPrototype::builder("ForeverTree", EntityKind::Agent)
        .attribute("age")
        .handler(HandlerDecl::new(
            "age",
            Substep::Init,
            constant(scalar(0.0, "year")),
        ))
        .handler(HandlerDecl::new(
            "age",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let age = scope.prior("age")?;
                Ok(age.add(&scalar(1.0, "year"))?)
            }),
        ))
        .build()
        .unwrap();
    let mut config = SimulationConfig::new((0, 0), (1, 1), 1, 10);
    config.cell_size = Scalar::with_unit(1000.0, "m");
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .prototype(tree)
        .config(config)
        .build()
        .unwrap();

    let (summary, final_state) = run_one(program).unwrap();
    assert_eq!(summary.ticks_completed, 10);
    assert!(!summary.cancelled);

    let trees: Vec<_> = final_state
        .iter()
        .filter(|(_, e)| &**e.prototype().name() == "ForeverTree")
        .collect();
    assert_eq!(trees.len(), 4, "one tree per patch of the 2x2 grid");
    for (_, tree) in trees {
        let age = tree.slot_by_name("age").unwrap().as_scalar().unwrap();
        assert!((age.value - 10.0).abs() < 1e-9);
        assert_eq!(age.units, Units::base("year"));
    }
}

#[test]
fn grass_cover_accumulates_over_five_ticks() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attributes(["grassCover", "onFire"])
        .handler(HandlerDecl::new(
            "grassCover",
            Substep::Init,
            constant(number(0.1)),
        ))
        .handler(HandlerDecl::new(
            "onFire",
            Substep::Step,
            constant(Value::Bool(false)),
        ))
        .handler(HandlerDecl::new(
            "grassCover",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let cover = scope.prior("grassCover")?;
                Ok(cover.add(&number(0.01))?)
            }),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 5))
        .build()
        .unwrap();

    let (_, final_state) = run_one(program).unwrap();
    let (_, patch) = final_state
        .iter()
        .find(|(_, e)| e.prototype().kind() == EntityKind::Patch)
        .unwrap();
    let cover = patch.slot_by_name("grassCover").unwrap().as_scalar().unwrap();
    assert!((cover.value - 0.15).abs() < 1e-9);
    assert!(!patch.slot_by_name("onFire").unwrap().as_bool().unwrap());
}

// The replicate-0 stream for this seed opens with a uniform draw of ~0.3003,
// so the transition guard below deterministically holds.
const SEED_FIRST_DRAW_BELOW_HALF: u64 = 0x9E37_79B9_7F4A_7C4B;

fn seedling_program(ticks: u64) -> Program {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("residents")
        .handler(HandlerDecl::new(
            "residents",
            Substep::Init,
            body(|scope: &mut Scope<'_, '_>| scope.create(&number(1.0), "Plant")),
        ))
        .build()
        .unwrap();
    let plant = EntityPrototype::builder("Plant", EntityKind::Agent)
        .attribute("state")
        .handler(HandlerDecl::new(
            "state",
            Substep::Init,
            constant(Value::string("seed")),
        ))
        .handler(
            HandlerDecl::new("state", Substep::Step, constant(Value::string("seedling")))
                .with_guard(guard(|scope: &mut Scope<'_, '_>| {
                    Ok(scope.rng().next_f64() < 0.5)
                }))
                .for_state("seed"),
        )
        .build()
        .unwrap();
    let mut config = SimulationConfig::new((0, 0), (0, 0), 1, ticks);
    config.seed = SEED_FIRST_DRAW_BELOW_HALF;
    Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .prototype(plant)
        .config(config)
        .build()
        .unwrap()
}

#[test]
fn seeded_guard_transitions_seed_to_seedling() {
    let (_, final_state) = run_one(seedling_program(1)).unwrap();
    let (_, plant) = final_state
        .iter()
        .find(|(_, e)| &**e.prototype().name() == "Plant")
        .unwrap();
    assert_eq!(&**plant.slot_by_name("state").unwrap().as_str().unwrap(), "seedling");
}

#[test]
fn state_qualified_group_stops_applying_after_transition() {
    // Tick 2 finds the plant in "seedling"; the "seed"-qualified group no
    // longer applies and the state carries over unchanged.
    let (_, final_state) = run_one(seedling_program(2)).unwrap();
    let (_, plant) = final_state
        .iter()
        .find(|(_, e)| &**e.prototype().name() == "Plant")
        .unwrap();
    assert_eq!(&**plant.slot_by_name("state").unwrap().as_str().unwrap(), "seedling");
}

#[test]
fn declaration_order_breaks_guard_ties() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("value")
        .handler(
            HandlerDecl::new("value", Substep::Step, constant(number(1.0)))
                .with_guard(guard(|_: &mut Scope<'_, '_>| Ok(true))),
        )
        .handler(
            HandlerDecl::new("value", Substep::Step, constant(number(2.0)))
                .with_guard(guard(|_: &mut Scope<'_, '_>| Ok(true))),
        )
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let (_, patch) = final_state
        .iter()
        .find(|(_, e)| e.prototype().kind() == EntityKind::Patch)
        .unwrap();
    let value = patch.slot_by_name("value").unwrap().as_scalar().unwrap();
    assert!((value.value - 1.0).abs() < f64::EPSILON);
}

#[test]
fn declined_guard_falls_through_to_the_next_handler() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("value")
        .handler(
            HandlerDecl::new("value", Substep::Step, constant(number(1.0)))
                .with_guard(guard(|_: &mut Scope<'_, '_>| Ok(false))),
        )
        .handler(HandlerDecl::new(
            "value",
            Substep::Step,
            constant(number(2.0)),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let (_, patch) = final_state
        .iter()
        .find(|(_, e)| e.prototype().kind() == EntityKind::Patch)
        .unwrap();
    let value = patch.slot_by_name("value").unwrap().as_scalar().unwrap();
    assert!((value.value - 2.0).abs() < f64::EPSILON);
}

#[test]
fn state_qualified_group_shadows_the_stateless_group() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attributes(["state", "spread"])
        .handler(HandlerDecl::new(
            "state",
            Substep::Init,
            constant(Value::string("burning")),
        ))
        .handler(HandlerDecl::new(
            "spread",
            Substep::Step,
            constant(number(1.0)),
        ))
        .handler(
            HandlerDecl::new("spread", Substep::Step, constant(number(2.0)))
                .for_state("burning"),
        )
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let (_, patch) = final_state
        .iter()
        .find(|(_, e)| e.prototype().kind() == EntityKind::Patch)
        .unwrap();
    let spread = patch.slot_by_name("spread").unwrap().as_scalar().unwrap();
    assert!((spread.value - 2.0).abs() < f64::EPSILON);
}

#[test]
fn create_runs_init_handlers_immediately() {
    // The creating body itself verifies the freshly created entities already
    // carry their init values, pinning immediate (not deferred) init.
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("spawned")
        .handler(HandlerDecl::new(
            "spawned",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let created = scope.create(&number(2.0), "Marker")?;
                let refs = created.as_realized()?.clone();
                for element in refs.values() {
                    let tag = scope.attr_of(element, "tag")?;
                    let tag = tag.as_scalar()?;
                    if (tag.value - 7.0).abs() > 1e-12 {
                        return Err(EngineError::type_error("init did not run immediately").into());
                    }
                }
                Ok(created)
            }),
        ))
        .build()
        .unwrap();
    let marker = EntityPrototype::builder("Marker", EntityKind::Agent)
        .attribute("tag")
        .handler(HandlerDecl::new(
            "tag",
            Substep::Init,
            constant(number(7.0)),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .prototype(marker)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let markers: Vec<_> = final_state
        .iter()
        .filter(|(_, e)| &**e.prototype().name() == "Marker")
        .collect();
    assert_eq!(markers.len(), 2);
    for (_, marker) in markers {
        let tag = marker.slot_by_name("tag").unwrap().as_scalar().unwrap();
        assert!((tag.value - 7.0).abs() < 1e-12);
    }
}

#[test]
fn unreferenced_agents_are_swept_after_the_substep() {
    // The body discards the created references, so the agents are
    // unreachable once the substep ends.
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("litter")
        .handler(HandlerDecl::new(
            "litter",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let _ = scope.create(&number(3.0), "Mayfly")?;
                Ok(number(0.0))
            }),
        ))
        .build()
        .unwrap();
    let mayfly = EntityPrototype::builder("Mayfly", EntityKind::Agent)
        .attribute("age")
        .handler(HandlerDecl::new(
            "age",
            Substep::Init,
            constant(number(0.0)),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .prototype(mayfly)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 2))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let mayflies = final_state
        .iter()
        .filter(|(_, e)| &**e.prototype().name() == "Mayfly")
        .count();
    assert_eq!(mayflies, 0);
}

#[test]
fn unit_mismatch_in_a_handler_carries_full_context() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("bad")
        .handler(HandlerDecl::new(
            "bad",
            Substep::Step,
            body(|_: &mut Scope<'_, '_>| Ok(scalar(1.0, "m").add(&scalar(1.0, "kg"))?)),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();

    let err = run_one(program).unwrap_err();
    let EngineError::UnitMismatch { left, right } = &err.kind else {
        unreachable!("expected a unit mismatch, got {:?}", err.kind);
    };
    assert_eq!(left, "m");
    assert_eq!(right, "kg");
    assert_eq!(err.attribute.as_deref(), Some("bad"));
    assert_eq!(err.substep, Some(Substep::Step));
    assert_eq!(err.tick, Some(1));
    assert_eq!(err.entity_kind, Some(EntityKind::Patch));
}

#[test]
fn unknown_names_distinguish_missing_attribute_from_missing_handler() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("x")
        .handler(HandlerDecl::new(
            "x",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| scope.current("nowhere")),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let err = run_one(program).unwrap_err();
    assert!(matches!(err.kind, EngineError::MissingHandler { .. }));

    // Same reference, but the name exists on another prototype: the error
    // names the wrong prototype instead.
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("x")
        .handler(HandlerDecl::new(
            "x",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| scope.current("age")),
        ))
        .build()
        .unwrap();
    let tree = EntityPrototype::builder("Tree", EntityKind::Agent)
        .attribute("age")
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .prototype(tree)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let err = run_one(program).unwrap_err();
    assert!(matches!(err.kind, EngineError::MissingAttribute { .. }));
}

#[test]
fn here_and_meta_reach_the_patch_and_the_simulation() {
    let sim = EntityPrototype::builder("Main", EntityKind::Simulation)
        .attribute("worldFactor")
        .handler(HandlerDecl::new(
            "worldFactor",
            Substep::Init,
            constant(number(10.0)),
        ))
        .build()
        .unwrap();
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attributes(["fertility", "residents"])
        .handler(HandlerDecl::new(
            "fertility",
            Substep::Init,
            constant(number(4.0)),
        ))
        .handler(HandlerDecl::new(
            "residents",
            Substep::Init,
            body(|scope: &mut Scope<'_, '_>| scope.create(&number(1.0), "Shrub")),
        ))
        .build()
        .unwrap();
    let shrub = EntityPrototype::builder("Shrub", EntityKind::Agent)
        .attribute("vigor")
        .handler(HandlerDecl::new(
            "vigor",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let local = scope.here("fertility")?;
                let global = scope.meta("worldFactor")?;
                Ok(local.mul(&global)?)
            }),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim)
        .prototype(patch)
        .prototype(shrub)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let (_, shrub) = final_state
        .iter()
        .find(|(_, e)| &**e.prototype().name() == "Shrub")
        .unwrap();
    let vigor = shrub.slot_by_name("vigor").unwrap().as_scalar().unwrap();
    assert!((vigor.value - 40.0).abs() < 1e-9);
}

#[test]
fn prior_never_observes_current_substep_writes() {
    // b.step reads both prior.a and current.a; a.step doubles prior.a.
    // prior.a must stay at the pre-substep value even after a resolves.
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attributes(["a", "b"])
        .handler(HandlerDecl::new("a", Substep::Init, constant(number(3.0))))
        .handler(HandlerDecl::new(
            "a",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let a = scope.prior("a")?;
                Ok(a.mul(&number(2.0))?)
            }),
        ))
        .handler(HandlerDecl::new(
            "b",
            Substep::Step,
            body(|scope: &mut Scope<'_, '_>| {
                let current = scope.current("a")?;
                let prior = scope.prior("a")?;
                Ok(current.sub(&prior)?)
            }),
        ))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 1))
        .build()
        .unwrap();
    let (_, final_state) = run_one(program).unwrap();
    let (_, patch) = final_state
        .iter()
        .find(|(_, e)| e.prototype().kind() == EntityKind::Patch)
        .unwrap();
    // current.a = 6, prior.a = 3 regardless of resolution order.
    let b = patch.slot_by_name("b").unwrap().as_scalar().unwrap();
    assert!((b.value - 3.0).abs() < 1e-9);
}

#[test]
fn cancellation_before_the_first_tick_yields_an_empty_cancelled_summary() {
    let patch = EntityPrototype::builder("Cell", EntityKind::Patch)
        .attribute("x")
        .handler(HandlerDecl::new("x", Substep::Init, constant(number(0.0))))
        .build()
        .unwrap();
    let program = Program::builder()
        .prototype(sim_proto())
        .prototype(patch)
        .config(SimulationConfig::new((0, 0), (0, 0), 1, 100))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let sink = SharedSink::new();
    let summary = Engine::new(program)
        .run_replicate(0, sink.boxed(), &cancel)
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.ticks_completed, 0);
    assert!(summary.tick_roots.is_empty());
    sink.with(|s| assert_eq!(s.close_count(), 1));
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic math subsystem.
//!
//! Everything under this module is pure and platform-stable: identical
//! inputs produce bit-identical outputs on every supported target. Float
//! transcendentals go through `libm` rather than the platform intrinsics so
//! replicate state roots stay comparable across machines.

pub mod rng;

pub use rng::DeterministicRng;

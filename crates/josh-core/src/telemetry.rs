// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Telemetry sink for engine progress events.
//!
//! Observability for the tick loop without pulling a logging framework into
//! the hot path: the engine calls the sink at tick, substep, export, and
//! replicate boundaries; the default sink is a no-op. The JSONL sink formats
//! records manually with fixed field order, so its output is deterministic
//! for a deterministic run.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use crate::entity::Substep;

/// Receiver for engine progress events. All methods default to no-ops.
pub trait TelemetrySink: Send + Sync {
    /// A tick is about to run.
    fn tick_started(&self, _replicate: u32, _tick: u64) {}

    /// A substep finished and its exports were pushed.
    fn substep_completed(&self, _replicate: u32, _tick: u64, _substep: Substep) {}

    /// One export record was written to the sink.
    fn export_written(&self, _replicate: u32, _tick: u64, _attribute: &str) {}

    /// A replicate finished (normally or cancelled).
    fn replicate_finished(&self, _replicate: u32, _ticks_completed: u64, _cancelled: bool) {}
}

/// Telemetry sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {}

/// Telemetry sink writing one manually formatted JSON line per event.
#[derive(Debug)]
pub struct JsonlTelemetrySink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlTelemetrySink<W> {
    /// Wraps a writer.
    #[must_use]
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Best-effort line emission; telemetry never fails the run.
    fn emit(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(out, "{line}");
    }
}

impl<W: Write + Send> TelemetrySink for JsonlTelemetrySink<W> {
    fn tick_started(&self, replicate: u32, tick: u64) {
        self.emit(&format!(
            r#"{{"event":"tick_started","replicate":{replicate},"tick":{tick}}}"#
        ));
    }

    fn substep_completed(&self, replicate: u32, tick: u64, substep: Substep) {
        self.emit(&format!(
            r#"{{"event":"substep_completed","replicate":{replicate},"tick":{tick},"substep":"{substep}"}}"#
        ));
    }

    fn export_written(&self, replicate: u32, tick: u64, attribute: &str) {
        self.emit(&format!(
            r#"{{"event":"export_written","replicate":{replicate},"tick":{tick},"attribute":"{attribute}"}}"#
        ));
    }

    fn replicate_finished(&self, replicate: u32, ticks_completed: u64, cancelled: bool) {
        self.emit(&format!(
            r#"{{"event":"replicate_finished","replicate":{replicate},"ticks":{ticks_completed},"cancelled":{cancelled}}}"#
        ));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_telemetry_renders_fixed_field_order() {
        let sink = JsonlTelemetrySink::new(Vec::new());
        sink.tick_started(0, 3);
        sink.substep_completed(0, 3, Substep::Step);
        let buffer = sink.out.into_inner().unwrap();
        let written = String::from_utf8(buffer).unwrap();
        assert_eq!(
            written,
            "{\"event\":\"tick_started\",\"replicate\":0,\"tick\":3}\n{\"event\":\"substep_completed\",\"replicate\":0,\"tick\":3,\"substep\":\"step\"}\n"
        );
    }
}

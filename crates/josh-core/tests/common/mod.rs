// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs, dead_code, clippy::unwrap_used, clippy::expect_used)]
//! Shared fixtures for integration tests: handler-callable shorthands and a
//! shareable in-memory export sink.

use std::sync::{Arc, Mutex, PoisonError};

use josh_core::{
    BodyFn, EngineError, ExportSink, GuardFn, MemoryExportSink, RuntimeError, Scalar, Scope,
    Substep, Value,
};

/// Wraps a closure as a compiled handler body.
pub fn body<F>(f: F) -> BodyFn
where
    F: Fn(&mut Scope<'_, '_>) -> Result<Value, RuntimeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as a compiled handler guard.
pub fn guard<F>(f: F) -> GuardFn
where
    F: Fn(&mut Scope<'_, '_>) -> Result<bool, RuntimeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A body returning a fixed value.
pub fn constant(value: Value) -> BodyFn {
    Arc::new(move |_| Ok(value.clone()))
}

/// A unit-tagged scalar value.
pub fn scalar(magnitude: f64, unit: &str) -> Value {
    Value::Scalar(Scalar::with_unit(magnitude, unit))
}

/// A dimensionless scalar value.
pub fn number(magnitude: f64) -> Value {
    Value::Scalar(Scalar::dimensionless(magnitude))
}

/// An export sink whose captured records stay observable after the engine
/// consumes the boxed sink.
#[derive(Clone, Default)]
pub struct SharedSink {
    inner: Arc<Mutex<MemoryExportSink>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(&self, f: impl FnOnce(&MemoryExportSink) -> T) -> T {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }

    pub fn boxed(&self) -> Box<dyn ExportSink> {
        Box::new(self.clone())
    }
}

impl ExportSink for SharedSink {
    fn write(
        &mut self,
        substep: Substep,
        tick: u64,
        attribute: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(substep, tick, attribute, value)
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close()
    }
}

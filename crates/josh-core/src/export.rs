// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Export sink collaborators.
//!
//! Sinks receive one record per exported attribute after each matching
//! substep, a `flush` after every substep that exported, and exactly one
//! `close` at replicate end — on every exit path, including failure (the
//! engine holds the sink in a close-on-drop guard). Rendering is the sink's
//! business; CSV, Avro, and network sinks live outside the core.

use std::io::Write;

use crate::entity::Substep;
use crate::error::EngineError;
use crate::value::Value;

/// Receiver for per-substep export records.
pub trait ExportSink: Send {
    /// Writes one exported attribute value.
    fn write(
        &mut self,
        substep: Substep,
        tick: u64,
        attribute: &str,
        value: &Value,
    ) -> Result<(), EngineError>;

    /// Flushes buffered records downstream.
    fn flush(&mut self) -> Result<(), EngineError>;

    /// Releases the sink. Called exactly once.
    fn close(&mut self) -> Result<(), EngineError>;
}

/// One captured export record.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    /// Substep the value was observed after.
    pub substep: Substep,
    /// Tick the value was observed in.
    pub tick: u64,
    /// Exported attribute name.
    pub attribute: String,
    /// The exported value.
    pub value: Value,
}

/// In-memory sink capturing records for tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryExportSink {
    records: Vec<ExportRecord>,
    flush_count: usize,
    close_count: usize,
}

impl MemoryExportSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured records in write order.
    #[must_use]
    pub fn records(&self) -> &[ExportRecord] {
        &self.records
    }

    /// Number of flushes received.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Number of closes received.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count
    }
}

impl ExportSink for MemoryExportSink {
    fn write(
        &mut self,
        substep: Substep,
        tick: u64,
        attribute: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        self.records.push(ExportRecord {
            substep,
            tick,
            attribute: attribute.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.flush_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.close_count += 1;
        Ok(())
    }
}

/// Line-oriented sink writing one manually formatted JSON object per record.
///
/// Field order is fixed, so output is byte-deterministic for a deterministic
/// run (no serde round-trip in the loop).
#[derive(Debug)]
pub struct JsonlExportSink<W: Write + Send> {
    out: Option<W>,
}

impl<W: Write + Send> JsonlExportSink<W> {
    /// Wraps a writer.
    #[must_use]
    pub fn new(out: W) -> Self {
        Self { out: Some(out) }
    }

    fn writer(&mut self) -> Result<&mut W, EngineError> {
        self.out.as_mut().ok_or_else(|| EngineError::Export {
            message: "sink is closed".to_string(),
        })
    }
}

fn escape_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

impl<W: Write + Send> ExportSink for JsonlExportSink<W> {
    fn write(
        &mut self,
        substep: Substep,
        tick: u64,
        attribute: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        let line = format!(
            r#"{{"tick":{tick},"substep":"{substep}","attribute":"{}","value":"{}"}}"#,
            escape_json(attribute),
            escape_json(&value.to_string()),
        );
        let out = self.writer()?;
        writeln!(out, "{line}").map_err(|err| EngineError::Export {
            message: err.to_string(),
        })
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.writer()?.flush().map_err(|err| EngineError::Export {
            message: err.to_string(),
        })
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|err| EngineError::Export {
                message: err.to_string(),
            })?;
        }
        Ok(())
    }
}

//! Machine-readable progress output for supervisor operations.
//!
//! A [`JsonLinesMonitor`] writes one JSON object per line:
//!
//! ```text
//! {"timestamp":"2026-01-01T00:00:00Z","kind":"start","format":"tgctl-monitor/1","operation":"start"}
//! {"timestamp":"...","kind":"progress","format":"tgctl-monitor/1","round":3}
//! {"timestamp":"...","kind":"finish","format":"tgctl-monitor/1","outcome":{...}}
//! ```
//!
//! Write failures are logged and otherwise ignored: monitor output never
//! changes an operation's outcome.

use super::outcome::Outcome;
use crate::error::{Result, TgError};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

pub const MONITOR_FORMAT: &str = "tgctl-monitor/1";

/// Receiver of supervisor progress events.
pub trait Monitor {
    fn start(&mut self, operation: &str);
    /// One polling round elapsed.
    fn progress(&mut self, round: u64);
    /// A data record, such as a status report or an admin listing.
    fn status(&mut self, data: Value);
    fn finish(&mut self, outcome: &Outcome);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn start(&mut self, _operation: &str) {}
    fn progress(&mut self, _round: u64) {}
    fn status(&mut self, _data: Value) {}
    fn finish(&mut self, _outcome: &Outcome) {}
}

/// Line-delimited JSON event records.
pub struct JsonLinesMonitor<W: Write> {
    out: W,
}

impl JsonLinesMonitor<BufWriter<File>> {
    /// Append to a monitor file, creating it if needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TgError::io_with_path(e, path))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesMonitor<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, kind: &str, fields: Value) {
        let mut record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "kind": kind,
            "format": MONITOR_FORMAT,
        });
        if let (Some(record), Value::Object(fields)) = (record.as_object_mut(), fields) {
            record.extend(fields);
        }

        if let Err(e) = self.write_line(&record) {
            warn!("Failed to write monitor record: {}", e);
        }
    }

    fn write_line(&mut self, record: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Monitor for JsonLinesMonitor<W> {
    fn start(&mut self, operation: &str) {
        self.emit("start", json!({ "operation": operation }));
    }

    fn progress(&mut self, round: u64) {
        self.emit("progress", json!({ "round": round }));
    }

    fn status(&mut self, data: Value) {
        self.emit("status", json!({ "data": data }));
    }

    fn finish(&mut self, outcome: &Outcome) {
        self.emit(
            "finish",
            json!({ "outcome": outcome, "exit_code": outcome.exit_code() }),
        );
    }
}

//! Map-reduce progress reporting.
//!
//! Reports what the map stage is doing while a run is in flight, so users
//! see how many documents are done and which ones failed. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunProgressEvent {
    /// Map stage started for `total` documents with `parallelism` workers.
    MapStarted {
        run_id: String,
        total: u64,
        parallelism: usize,
    },
    /// Document `n` of `total` finished (in completion order, not ID order).
    DocumentDone {
        run_id: String,
        n: u64,
        total: u64,
        document: String,
        success: bool,
        secs: f64,
    },
    /// Cancellation requested: no further documents will be dispatched.
    Cancelling { run_id: String },
    /// Reduce stage started over `records` usable answers.
    Reducing { run_id: String, records: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the dispatcher and the pipeline.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run 2026-10-19_0001  map  12 / 40  ok  空家/対策要綱 (31.2s)".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::MapStarted {
                run_id,
                total,
                parallelism,
            } => format!(
                "run {}  map  {} documents, {} parallel\n",
                run_id,
                format_number(*total),
                parallelism
            ),
            RunProgressEvent::DocumentDone {
                run_id,
                n,
                total,
                document,
                success,
                secs,
            } => format!(
                "run {}  map  {} / {}  {}  {} ({:.1}s)\n",
                run_id,
                format_number(*n),
                format_number(*total),
                if *success { "ok  " } else { "FAIL" },
                document,
                secs
            ),
            RunProgressEvent::Cancelling { run_id } => {
                format!("run {}  cancelling, waiting for in-flight documents...\n", run_id)
            }
            RunProgressEvent::Reducing { run_id, records } => format!(
                "run {}  reduce  {} answers\n",
                run_id,
                format_number(*records)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::MapStarted {
                run_id,
                total,
                parallelism,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "map_started",
                "total": total,
                "parallelism": parallelism
            }),
            RunProgressEvent::DocumentDone {
                run_id,
                n,
                total,
                document,
                success,
                secs,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "mapping",
                "n": n,
                "total": total,
                "document": document,
                "success": success,
                "secs": secs
            }),
            RunProgressEvent::Cancelling { run_id } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "cancelling"
            }),
            RunProgressEvent::Reducing { run_id, records } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "reducing",
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}': expected human, json, or off",
                other
            )),
        }
    }
}

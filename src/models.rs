//! Core data models shared by the indexer, workers, run storage, and aggregator.
//!
//! Everything persisted under a run directory is one of these types
//! serialized as JSON.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{QaError, Result};

/// A document found by the indexer.
///
/// The text itself is not held here; [`Document::load_text`] reads it on
/// demand so a worker only keeps it for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// 1-based position in the sorted index of one indexing pass.
    pub id: u32,
    pub path: PathBuf,
    /// Path relative to the corpus root, `/`-separated.
    pub relative_path: String,
    /// Parent directory name, or `root` for files directly under the corpus root.
    pub category: String,
    /// File name without extension.
    pub name: String,
    pub size: u64,
    /// First 8 hex digits of the content sha256.
    pub hash: String,
}

impl Document {
    /// Zero-padded ID used in file names and listings.
    pub fn display_id(&self) -> String {
        format!("{:03}", self.id)
    }

    /// `category/name` label used in aggregate prompts and reports.
    pub fn label(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Read the document text. A leading UTF-8 BOM is dropped.
    pub fn load_text(&self) -> Result<String> {
        let bytes = std::fs::read(&self.path).map_err(|e| QaError::storage(&self.path, e))?;
        let text = String::from_utf8(bytes).map_err(|e| {
            QaError::storage(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        Ok(text.strip_prefix('\u{feff}').unwrap_or(&text).to_string())
    }
}

/// How the map-stage answer is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw model text.
    #[default]
    Text,
    /// Model text must contain a JSON object, parsed into `structured`.
    Structured,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => f.write_str("text"),
            OutputFormat::Structured => f.write_str("structured"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "structured" | "json" => Ok(OutputFormat::Structured),
            other => Err(format!(
                "unknown output format '{}': expected text or structured",
                other
            )),
        }
    }
}

/// Wall-clock timings of one map-stage call, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub load_secs: f64,
    pub render_secs: f64,
    pub model_secs: f64,
    pub total_secs: f64,
}

/// Execution details attached to an [`AnswerRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetrics {
    pub document_chars: usize,
    pub prompt_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    /// Context window the call was made with.
    #[serde(default)]
    pub num_ctx: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// `num_ctx - total_tokens`. Negative when the endpoint truncated the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage_percent: Option<f64>,
    pub attempts: u32,
    pub timing: Timing,
}

impl RecordMetrics {
    /// Fill token counts and derive context-window usage from them.
    ///
    /// Usage is only derived when both counts are known and `num_ctx > 0`.
    pub fn set_token_usage(&mut self, prompt: Option<u64>, completion: Option<u64>, num_ctx: u32) {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self.num_ctx = num_ctx;
        self.total_tokens = None;
        self.remaining_tokens = None;
        self.context_usage_percent = None;

        if let (Some(p), Some(c)) = (prompt, completion) {
            let total = p + c;
            self.total_tokens = Some(total);
            if num_ctx > 0 {
                self.remaining_tokens = Some(i64::from(num_ctx) - total as i64);
                let percent = total as f64 / f64::from(num_ctx) * 100.0;
                self.context_usage_percent = Some((percent * 100.0).round() / 100.0);
            }
        }
    }
}

/// Durable result (or failure) of one map-stage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub document_id: u32,
    pub document_path: String,
    pub category: String,
    pub document_name: String,
    pub question: String,
    pub template: String,
    pub format: OutputFormat,
    pub model: String,
    /// Raw model output. Kept even when structured parsing fails.
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: RecordMetrics,
    pub created_at: DateTime<Local>,
}

impl AnswerRecord {
    /// `category/name` label of the answered document.
    pub fn label(&self) -> String {
        format!("{}/{}", self.category, self.document_name)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Mapping,
    Reducing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Mapping => "mapping",
            RunStatus::Reducing => "reducing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// There is no way back to `created`: retrying from scratch needs a new run.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Mapping)
                | (Mapping, Reducing)
                | (Mapping, Failed)
                | (Mapping, Cancelled)
                | (Reducing, Completed)
                | (Reducing, Failed)
                // aggregate-only re-execution
                | (Reducing, Reducing)
                | (Completed, Reducing)
                | (Failed, Reducing)
                | (Cancelled, Reducing)
        )
    }

    /// Whether an aggregate-only pass may start from this status without `--force`.
    pub fn allows_reaggregation(&self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Mapping)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Parameters a run was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub question: String,
    pub single_template: String,
    pub aggregate_template: String,
    pub parallelism: usize,
    pub format: OutputFormat,
    pub model: String,
    #[serde(default)]
    pub subdirs: Vec<String>,
}

/// Document list entry stored in run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDocument {
    pub id: u32,
    pub path: String,
}

/// One failed document in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub document_id: u32,
    pub label: String,
    pub kind: String,
    pub message: String,
}

/// Map-stage bookkeeping kept in run metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSummary {
    pub total_documents: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub failures: Vec<FailureSummary>,
}

/// Pointer to an aggregate artifact, kept in run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub sequence: u32,
    pub template: String,
    pub file: String,
    pub used_records: usize,
    pub omitted_records: usize,
    pub created_at: DateTime<Local>,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<RunParameters>,
    #[serde(default)]
    pub documents: Vec<RunDocument>,
    #[serde(default)]
    pub map: MapSummary,
    #[serde(default)]
    pub aggregates: Vec<AggregateEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMetadata {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Created,
            created_at: now,
            updated_at: now,
            parameters: None,
            documents: Vec::new(),
            map: MapSummary::default(),
            aggregates: Vec::new(),
            error: None,
        }
    }

    pub fn question(&self) -> Option<&str> {
        self.parameters.as_ref().map(|p| p.question.as_str())
    }

    /// Move to `next`, or fail with [`QaError::InvalidRunState`].
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(QaError::InvalidRunState {
                run_id: self.run_id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Local::now();
        Ok(())
    }
}

/// The consolidated answer of one reduce pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub run_id: String,
    pub sequence: u32,
    pub template: String,
    pub model: String,
    pub question: String,
    pub answer: String,
    /// Document IDs whose answers were fed to the reduce prompt, in order.
    pub input_document_ids: Vec<u32>,
    /// Failed records left out of the reduce input.
    pub omitted_document_ids: Vec<u32>,
    pub omitted_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    pub created_at: DateTime<Local>,
}

/// Short summary of a run for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Local>,
    pub question: Option<String>,
    pub record_count: usize,
    pub aggregate_count: usize,
}

pub(crate) fn path_to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

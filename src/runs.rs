//! Run storage.
//!
//! A run lives in one directory under the runs root:
//!
//! ```text
//! <root>/<YYYY-MM-DD>_<NNNN>/
//!   metadata.json
//!   single_qa/<ID>_<category>_<stem>.json
//!   single_qa/<ID>_<category>_<stem>.txt
//!   aggregates/<SEQ>_<template>.json
//!   aggregates/<SEQ>_<template>.txt
//! ```
//!
//! Category, stem, and template parts of file names are cut to a byte
//! budget so the name (and its `.tmp` sibling) stays under the 255-byte
//! filesystem limit. The numeric prefix keeps shortened names unique.
//!
//! Run IDs are allocated by scanning the root for today's prefix and
//! claiming the next sequence number with a non-recursive `create_dir`,
//! which fails if another process got there first. The loser moves on to
//! the following number, so there is no in-memory counter to go stale.
//!
//! Every file is written to a hidden temporary sibling, fsynced, and
//! renamed into place, then the directory is fsynced. Readers never see a
//! half-written record.

use chrono::{Local, NaiveDate};
use std::fmt::Write as _;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{QaError, Result};
use crate::models::{AggregateResult, AnswerRecord, RunMetadata, RunSummary};

const METADATA_FILE: &str = "metadata.json";
const RECORDS_DIR: &str = "single_qa";
const AGGREGATES_DIR: &str = "aggregates";
const MAX_ALLOCATION_ATTEMPTS: u32 = 1000;
const MAX_CATEGORY_BYTES: usize = 60;
const MAX_NAME_BYTES: usize = 150;

/// Allocates, resolves, and lists runs under one root directory.
#[derive(Debug, Clone)]
pub struct RunManager {
    root: PathBuf,
}

/// Handle to an existing run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    id: String,
    dir: PathBuf,
}

impl RunManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh run for today's date.
    pub fn allocate_run(&self) -> Result<Run> {
        self.allocate_run_on(Local::now().date_naive())
    }

    /// Allocate a fresh run ID of the form `YYYY-MM-DD_NNNN` for `date`.
    pub fn allocate_run_on(&self, date: NaiveDate) -> Result<Run> {
        fs::create_dir_all(&self.root).map_err(|e| QaError::storage(&self.root, e))?;

        let prefix = format!("{}_", date.format("%Y-%m-%d"));
        let mut next = self.max_sequence(&prefix)? + 1;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = format!("{}{:04}", prefix, next);
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let run = Run { id, dir };
                    run.create_layout()?;
                    info!(run_id = %run.id, "allocated run");
                    return Ok(run);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(run_id = %id, "run id taken, trying next");
                    next += 1;
                }
                Err(e) => return Err(QaError::storage(dir, e)),
            }
        }

        Err(QaError::storage(
            &self.root,
            std::io::Error::new(
                ErrorKind::Other,
                format!("could not allocate a run id for {}", date),
            ),
        ))
    }

    /// Create a run with a caller-chosen ID. Fails if it already exists.
    pub fn create_run(&self, run_id: &str) -> Result<Run> {
        validate_run_id(run_id)?;
        fs::create_dir_all(&self.root).map_err(|e| QaError::storage(&self.root, e))?;
        let dir = self.root.join(run_id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(QaError::RunExists {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => return Err(QaError::storage(dir, e)),
        }
        let run = Run {
            id: run_id.to_string(),
            dir,
        };
        run.create_layout()?;
        info!(run_id, "created run");
        Ok(run)
    }

    /// Find an existing run, or fail with [`QaError::RunNotFound`].
    pub fn resolve_run(&self, run_id: &str) -> Result<Run> {
        validate_run_id(run_id)?;
        let dir = self.root.join(run_id);
        if !dir.join(METADATA_FILE).is_file() {
            return Err(QaError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(Run {
            id: run_id.to_string(),
            dir,
        })
    }

    /// Summaries of every run, most recent (highest ID) first.
    ///
    /// Directories without readable metadata are skipped with a warning.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for id in self.run_ids()? {
            let run = Run {
                dir: self.root.join(&id),
                id,
            };
            let meta = match run.read_metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(run_id = %run.id, "skipping run: {}", e);
                    continue;
                }
            };
            summaries.push(RunSummary {
                record_count: run.record_count()?,
                aggregate_count: meta.aggregates.len(),
                question: meta.question().map(str::to_string),
                status: meta.status,
                created_at: meta.created_at,
                run_id: run.id,
            });
        }
        summaries.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(summaries)
    }

    fn run_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QaError::storage(&self.root, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QaError::storage(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_run_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn max_sequence(&self, prefix: &str) -> Result<u32> {
        Ok(self
            .run_ids()?
            .iter()
            .filter_map(|id| id.strip_prefix(prefix))
            .filter_map(|seq| seq.parse::<u32>().ok())
            .max()
            .unwrap_or(0))
    }
}

impl Run {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn records_dir(&self) -> PathBuf {
        self.dir.join(RECORDS_DIR)
    }

    pub fn aggregates_dir(&self) -> PathBuf {
        self.dir.join(AGGREGATES_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn create_layout(&self) -> Result<()> {
        for dir in [self.records_dir(), self.aggregates_dir()] {
            fs::create_dir_all(&dir).map_err(|e| QaError::storage(&dir, e))?;
        }
        Ok(())
    }

    pub fn read_metadata(&self) -> Result<RunMetadata> {
        read_json(&self.metadata_path())
    }

    pub fn write_metadata(&self, meta: &RunMetadata) -> Result<()> {
        write_json(&self.metadata_path(), meta)
    }

    /// File name of the record for one document: `007_category_stem.json`.
    pub fn record_file_name(record: &AnswerRecord) -> String {
        format!("{}.json", record_stem(record))
    }

    /// Durably write a per-document record, then its `.txt` report.
    /// Records are written once; an existing record for the same document
    /// is a storage failure.
    pub fn write_record(&self, record: &AnswerRecord) -> Result<PathBuf> {
        let stem = record_stem(record);
        let path = self.records_dir().join(format!("{}.json", stem));
        if path.exists() {
            return Err(QaError::storage(
                &path,
                std::io::Error::new(ErrorKind::AlreadyExists, "record already written"),
            ));
        }
        write_json(&path, record)?;
        write_atomic(
            &self.records_dir().join(format!("{}.txt", stem)),
            render_record_report(record).as_bytes(),
        )?;
        debug!(run_id = %self.id, document_id = record.document_id, "wrote record");
        Ok(path)
    }

    /// All per-document records, ordered by document ID.
    pub fn load_records(&self) -> Result<Vec<AnswerRecord>> {
        let mut records: Vec<AnswerRecord> = self
            .json_files(&self.records_dir())?
            .iter()
            .map(|p| read_json(p))
            .collect::<Result<_>>()?;
        records.sort_by_key(|r| r.document_id);
        Ok(records)
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.json_files(&self.records_dir())?.len())
    }

    /// Aggregate results in sequence order.
    pub fn load_aggregates(&self) -> Result<Vec<AggregateResult>> {
        let mut aggregates: Vec<AggregateResult> = self
            .json_files(&self.aggregates_dir())?
            .iter()
            .map(|p| read_json(p))
            .collect::<Result<_>>()?;
        aggregates.sort_by_key(|a| a.sequence);
        Ok(aggregates)
    }

    /// Sequence number the next aggregate artifact will get.
    pub fn next_aggregate_sequence(&self) -> Result<u32> {
        let max = self
            .json_files(&self.aggregates_dir())?
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.split('_').next()?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Write an aggregate artifact (`.json` plus a `.txt` report). Returns the
    /// JSON file name relative to the aggregates directory.
    ///
    /// An artifact that already exists is never overwritten unless
    /// `replace` is set.
    pub fn write_aggregate(
        &self,
        result: &AggregateResult,
        report: &str,
        replace: bool,
    ) -> Result<String> {
        let stem = format!(
            "{:03}_{}",
            result.sequence,
            truncate_bytes(&sanitize(&result.template), MAX_NAME_BYTES)
        );
        let json_name = format!("{}.json", stem);
        let json_path = self.aggregates_dir().join(&json_name);
        if json_path.exists() && !replace {
            return Err(QaError::storage(
                &json_path,
                std::io::Error::new(ErrorKind::AlreadyExists, "aggregate artifact exists"),
            ));
        }
        write_json(&json_path, result)?;
        write_atomic(
            &self.aggregates_dir().join(format!("{}.txt", stem)),
            report.as_bytes(),
        )?;
        info!(run_id = %self.id, file = %json_name, "wrote aggregate");
        Ok(json_name)
    }

    fn json_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QaError::storage(dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| QaError::storage(dir, e))?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }
}

/// Run IDs are directory names: ASCII letters, digits, `-` and `_` only.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let ok = !run_id.is_empty()
        && run_id.len() <= 64
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(QaError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}

fn record_stem(record: &AnswerRecord) -> String {
    format!(
        "{:03}_{}_{}",
        record.document_id,
        truncate_bytes(&sanitize(&record.category), MAX_CATEGORY_BYTES),
        truncate_bytes(&sanitize(&record.document_name), MAX_NAME_BYTES)
    )
}

/// Longest prefix of `s` that fits in `max` bytes, cut on a char boundary.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Plain-text view of one record, stored next to its JSON.
pub fn render_record_report(record: &AnswerRecord) -> String {
    let m = &record.metrics;
    let mut out = String::new();
    let _ = writeln!(out, "Run:        {}", record.run_id.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "Document:   {:03} {}", record.document_id, record.label());
    let _ = writeln!(out, "Path:       {}", record.document_path);
    let _ = writeln!(out, "Question:   {}", record.question);
    let _ = writeln!(out, "Template:   {} ({})", record.template, record.format);
    let _ = writeln!(out, "Model:      {}", record.model);
    let _ = writeln!(out, "Created:    {}", record.created_at.to_rfc3339());
    if record.success {
        let _ = writeln!(out, "Status:     ok");
    } else {
        let _ = writeln!(
            out,
            "Status:     FAIL [{}] {}",
            record.error_kind.as_deref().unwrap_or("unknown"),
            record.error.as_deref().unwrap_or("")
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Document chars:  {}", m.document_chars);
    let _ = writeln!(out, "Prompt chars:    {}", m.prompt_chars);
    let _ = writeln!(out, "Attempts:        {}", m.attempts);
    if let Some(total) = m.total_tokens {
        let _ = writeln!(
            out,
            "Tokens:          {} prompt + {} completion = {}",
            m.prompt_tokens.unwrap_or(0),
            m.completion_tokens.unwrap_or(0),
            total
        );
    }
    if let (Some(percent), Some(remaining)) = (m.context_usage_percent, m.remaining_tokens) {
        let _ = writeln!(
            out,
            "Context:         {:.2}% of {} ({} remaining)",
            percent, m.num_ctx, remaining
        );
    }
    let _ = writeln!(
        out,
        "Timing:          load {:.2}s, render {:.2}s, model {:.2}s, total {:.2}s",
        m.timing.load_secs, m.timing.render_secs, m.timing.model_secs, m.timing.total_secs
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "== Answer ==");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", record.answer.trim_end());
    out
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| QaError::storage(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| QaError::corrupt(path, e))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| QaError::corrupt(path, e))?;
    write_atomic(path, &json)
}

/// Write to `.<name>.tmp`, fsync, rename over `path`, then fsync the
/// directory. The temporary file is removed if any step fails.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", name));

    if let Err(e) = write_and_rename(&tmp, path, bytes) {
        match fs::remove_file(&tmp) {
            Err(rm) if rm.kind() != ErrorKind::NotFound => {
                warn!(path = %tmp.display(), "could not remove temporary file: {}", rm);
            }
            _ => {}
        }
        return Err(e);
    }
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(tmp).map_err(|e| QaError::storage(tmp, e))?;
    file.write_all(bytes).map_err(|e| QaError::storage(tmp, e))?;
    file.sync_all().map_err(|e| QaError::storage(tmp, e))?;
    drop(file);
    fs::rename(tmp, path).map_err(|e| QaError::storage(path, e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| QaError::storage(dir, e))
}

// Directories cannot be opened as files here; the rename is as durable as it gets.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutputFormat, RecordMetrics, RunStatus};
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn record(id: u32, success: bool) -> AnswerRecord {
        AnswerRecord {
            run_id: None,
            document_id: id,
            document_path: format!("/corpus/空家/doc{}.txt", id),
            category: "空家".into(),
            document_name: format!("doc{}", id),
            question: "q".into(),
            template: "baseline".into(),
            format: OutputFormat::Text,
            model: "m".into(),
            answer: format!("answer {}", id),
            structured: None,
            success,
            error_kind: None,
            error: None,
            metrics: RecordMetrics::default(),
            created_at: Local::now(),
        }
    }

    fn new_run(manager: &RunManager) -> Run {
        let run = manager.allocate_run_on(date()).unwrap();
        run.write_metadata(&RunMetadata::new(run.id())).unwrap();
        run
    }

    #[test]
    fn test_sequential_allocation() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path().join("run"));
        let first = manager.allocate_run_on(date()).unwrap();
        let second = manager.allocate_run_on(date()).unwrap();
        assert_eq!(first.id(), "2026-10-19_0001");
        assert_eq!(second.id(), "2026-10-19_0002");
        assert!(first.records_dir().is_dir());
        assert!(second.aggregates_dir().is_dir());
    }

    #[test]
    fn test_allocation_continues_after_gap() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("2026-10-19_0007")).unwrap();
        std::fs::create_dir_all(tmp.path().join("2026-10-18_0042")).unwrap();
        let manager = RunManager::new(tmp.path());
        assert_eq!(manager.allocate_run_on(date()).unwrap().id(), "2026-10-19_0008");
        let next_day = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        assert_eq!(manager.allocate_run_on(next_day).unwrap().id(), "2026-10-20_0001");
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.allocate_run_on(date()).unwrap().id().to_string())
            })
            .collect();
        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_explicit_run_id() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        manager.create_run("baseline-eval").unwrap();
        let err = manager.create_run("baseline-eval").unwrap_err();
        assert_eq!(err.kind(), "run_exists");
        assert_eq!(manager.create_run("../escape").unwrap_err().kind(), "invalid_run_id");
    }

    #[test]
    fn test_resolve_missing_run() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let err = manager.resolve_run("2026-01-01_0001").unwrap_err();
        assert_eq!(err.kind(), "run_not_found");
    }

    #[test]
    fn test_records_written_once_and_loaded_in_order() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        for id in [3, 1, 2] {
            run.write_record(&record(id, id != 2)).unwrap();
        }
        assert!(run.write_record(&record(1, true)).is_err());

        let records = run.load_records().unwrap();
        let ids: Vec<u32> = records.iter().map(|r| r.document_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!records[1].success);
        assert!(run.records_dir().join("001_空家_doc1.json").is_file());
    }

    #[test]
    fn test_record_writes_text_report() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        let mut ok = record(1, true);
        ok.metrics.set_token_usage(Some(900), Some(100), 8_000);
        run.write_record(&ok).unwrap();
        let mut failed = record(2, false);
        failed.error_kind = Some("model_timeout".into());
        run.write_record(&failed).unwrap();

        let report = std::fs::read_to_string(run.records_dir().join("001_空家_doc1.txt")).unwrap();
        assert!(report.contains("Status:     ok"));
        assert!(report.contains("900 prompt + 100 completion = 1000"));
        assert!(report.contains("12.50% of 8000 (7000 remaining)"));
        assert!(report.contains("answer 1"));
        let report = std::fs::read_to_string(run.records_dir().join("002_空家_doc2.txt")).unwrap();
        assert!(report.contains("FAIL [model_timeout]"));
        assert_eq!(run.record_count().unwrap(), 2);
    }

    #[test]
    fn test_long_document_name_is_shortened() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        let long_name = format!("{}施行細則運用", "空家等対策の推進に関する特別措置法".repeat(4));
        assert!(long_name.len() > 200);

        for id in [1, 2] {
            let mut r = record(id, true);
            r.category = "空家等対策関係要綱".repeat(3);
            r.document_name = long_name.clone();
            let path = run.write_record(&r).unwrap();
            let file_name = path.file_name().unwrap().to_str().unwrap();
            assert!(file_name.len() + ".tmp".len() + 1 <= 255, "{} bytes", file_name.len());
            assert!(file_name.starts_with(&format!("{:03}_", id)));
        }

        let records = run.load_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].document_name, long_name);
    }

    #[test]
    fn test_truncate_bytes_on_char_boundary() {
        assert_eq!(truncate_bytes("abc", 10), "abc");
        // 3 bytes per char
        assert_eq!(truncate_bytes("空家等", 7), "空家");
        assert_eq!(truncate_bytes("空家等", 6), "空家");
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        // a non-empty directory where the file should go makes the rename fail
        let target = tmp.path().join("metadata.json");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let err = write_atomic(&target, b"{}").unwrap_err();
        assert_eq!(err.kind(), "storage_failure");
        assert!(!tmp.path().join(".metadata.json.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn test_corrupt_record_is_storage_failure() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        std::fs::write(run.records_dir().join("001_x_y.json"), "{not json").unwrap();
        let err = run.load_records().unwrap_err();
        assert_eq!(err.kind(), "storage_failure");
    }

    #[test]
    fn test_temp_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        run.write_record(&record(1, true)).unwrap();
        std::fs::write(run.records_dir().join(".002_x_y.json.tmp"), "partial").unwrap();
        assert_eq!(run.record_count().unwrap(), 1);
    }

    #[test]
    fn test_list_runs_newest_first() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let first = new_run(&manager);
        let second = new_run(&manager);
        second.write_record(&record(1, true)).unwrap();
        // no metadata: skipped
        std::fs::create_dir_all(tmp.path().join("2026-10-19_0099")).unwrap();

        let runs = manager.list_runs().unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec![second.id(), first.id()]);
        assert_eq!(runs[0].record_count, 1);
        assert_eq!(runs[0].status, RunStatus::Created);
    }

    #[test]
    fn test_aggregate_never_overwritten_without_replace() {
        let tmp = TempDir::new().unwrap();
        let manager = RunManager::new(tmp.path());
        let run = new_run(&manager);
        assert_eq!(run.next_aggregate_sequence().unwrap(), 1);

        let result = AggregateResult {
            run_id: run.id().to_string(),
            sequence: 1,
            template: "consensus".into(),
            model: "m".into(),
            question: "q".into(),
            answer: "統合回答".into(),
            input_document_ids: vec![1],
            omitted_document_ids: vec![],
            omitted_count: 0,
            prompt_tokens: None,
            completion_tokens: None,
            created_at: Local::now(),
        };
        let name = run.write_aggregate(&result, "report", false).unwrap();
        assert_eq!(name, "001_consensus.json");
        assert!(run.aggregates_dir().join("001_consensus.txt").is_file());
        assert_eq!(run.next_aggregate_sequence().unwrap(), 2);
        assert!(run.write_aggregate(&result, "report", false).is_err());
        assert!(run.write_aggregate(&result, "report v2", true).is_ok());
        assert_eq!(run.load_aggregates().unwrap().len(), 1);
    }
}

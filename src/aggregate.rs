//! Reduce stage.
//!
//! [`Aggregator::aggregate`] reads a run's records, keeps the successful
//! ones in document order, renders the aggregate template, and makes one
//! model call. The same entry point serves aggregate-only re-execution:
//! it never writes per-document records, and every call produces a new
//! numbered artifact unless `replace` is requested.
//!
//! Status handling:
//!
//! - `reducing -> completed` on success
//! - `reducing -> failed` when no record is usable
//! - a model failure leaves the run in `reducing` with the error recorded,
//!   so a later aggregate-only call can pick it up

use chrono::Local;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{QaError, Result};
use crate::model_client::{GenerateOptions, ModelClient};
use crate::models::{AggregateEntry, AggregateResult, AnswerRecord, RunMetadata, RunStatus};
use crate::runs::Run;
use crate::templates::{Role, TemplateRegistry, Variables};

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Overwrite the latest artifact made with the same template.
    pub replace: bool,
    /// Allow aggregation of a run still marked `created` or `mapping`.
    pub force: bool,
}

pub struct Aggregator {
    client: Arc<dyn ModelClient>,
    templates: Arc<TemplateRegistry>,
    model: String,
    options: GenerateOptions,
}

impl Aggregator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        templates: Arc<TemplateRegistry>,
        model: impl Into<String>,
        options: GenerateOptions,
    ) -> Self {
        Self {
            client,
            templates,
            model: model.into(),
            options,
        }
    }

    pub fn aggregate(
        &self,
        run: &Run,
        template: &str,
        options: &AggregateOptions,
    ) -> Result<AggregateResult> {
        self.templates.ensure(Role::Aggregate, template)?;

        let mut meta = run.read_metadata()?;
        enter_reducing(&mut meta, options.force)?;
        run.write_metadata(&meta)?;

        let records = run.load_records()?;
        let question = meta
            .question()
            .map(str::to_string)
            .or_else(|| records.first().map(|r| r.question.clone()))
            .unwrap_or_default();

        let (usable, omitted): (Vec<&AnswerRecord>, Vec<&AnswerRecord>) =
            records.iter().partition(|r| r.success);

        if usable.is_empty() {
            let err = QaError::NoUsableRecords {
                run_id: run.id().to_string(),
                failed: omitted.len(),
            };
            warn!(run_id = run.id(), "{}", err);
            meta.transition(RunStatus::Failed)?;
            meta.error = Some(err.to_string());
            run.write_metadata(&meta)?;
            return Err(err);
        }
        if !omitted.is_empty() {
            warn!(
                run_id = run.id(),
                omitted = omitted.len(),
                "failed records left out of the reduce input"
            );
        }

        let vars = Variables::new()
            .set("question", question.as_str())
            .set("answers", format_answers(&usable))
            .set("answer_count", usable.len().to_string());
        let prompt = self.templates.render(Role::Aggregate, template, &vars)?;

        info!(
            run_id = run.id(),
            template,
            inputs = usable.len(),
            prompt_chars = prompt.chars().count(),
            "reduce stage started"
        );
        let generation = match self.client.generate(&self.model, &prompt, &self.options) {
            Ok(generation) => generation,
            Err(e) => {
                warn!(run_id = run.id(), "reduce call failed: {}", e);
                meta.error = Some(e.to_string());
                meta.updated_at = Local::now();
                run.write_metadata(&meta)?;
                return Err(e);
            }
        };

        let sequence = match meta.aggregates.iter().rev().find(|a| a.template == template) {
            Some(prior) if options.replace => prior.sequence,
            _ => run.next_aggregate_sequence()?,
        };

        let result = AggregateResult {
            run_id: run.id().to_string(),
            sequence,
            template: template.to_string(),
            model: self.model.clone(),
            question,
            answer: generation.text,
            input_document_ids: usable.iter().map(|r| r.document_id).collect(),
            omitted_document_ids: omitted.iter().map(|r| r.document_id).collect(),
            omitted_count: omitted.len(),
            prompt_tokens: generation.prompt_tokens,
            completion_tokens: generation.completion_tokens,
            created_at: Local::now(),
        };

        let report = render_report(&result, &records);
        let file = run.write_aggregate(&result, &report, options.replace)?;

        meta.aggregates.retain(|a| a.sequence != sequence);
        meta.aggregates.push(AggregateEntry {
            sequence,
            template: template.to_string(),
            file,
            used_records: result.input_document_ids.len(),
            omitted_records: result.omitted_count,
            created_at: result.created_at,
        });
        meta.aggregates.sort_by_key(|a| a.sequence);
        meta.transition(RunStatus::Completed)?;
        meta.error = None;
        run.write_metadata(&meta)?;

        info!(run_id = run.id(), sequence, "reduce stage finished");
        Ok(result)
    }
}

fn enter_reducing(meta: &mut RunMetadata, force: bool) -> Result<()> {
    match meta.status {
        RunStatus::Reducing => Ok(()),
        status if status.allows_reaggregation() => meta.transition(RunStatus::Reducing),
        _ if force => {
            warn!(
                run_id = %meta.run_id,
                status = %meta.status,
                "forcing aggregation of an unfinished run"
            );
            meta.status = RunStatus::Reducing;
            meta.updated_at = Local::now();
            Ok(())
        }
        status => Err(QaError::InvalidRunState {
            run_id: meta.run_id.clone(),
            status: status.to_string(),
        }),
    }
}

/// Label each answer with its position and document:
/// `【文書1: 空家/対策要綱】` followed by the answer text.
pub fn format_answers(records: &[&AnswerRecord]) -> String {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| format!("【文書{}: {}】\n{}\n", i + 1, r.label(), r.answer.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain-text report stored next to each aggregate artifact.
pub fn render_report(result: &AggregateResult, records: &[AnswerRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run:        {}", result.run_id);
    let _ = writeln!(out, "Question:   {}", result.question);
    let _ = writeln!(out, "Template:   {}", result.template);
    let _ = writeln!(out, "Model:      {}", result.model);
    let _ = writeln!(out, "Created:    {}", result.created_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Inputs:     {} used, {} omitted",
        result.input_document_ids.len(),
        result.omitted_count
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "== Answer ==");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", result.answer.trim_end());

    if result.omitted_count > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "== Omitted documents ==");
        for record in records.iter().filter(|r| !r.success) {
            let _ = writeln!(
                out,
                "  {:03}  {}  [{}] {}",
                record.document_id,
                record.label(),
                record.error_kind.as_deref().unwrap_or("unknown"),
                record.error.as_deref().unwrap_or("")
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "== Documents ==");
    for record in records {
        let _ = writeln!(
            out,
            "  {:03}  {}  {}",
            record.document_id,
            if record.success { "ok  " } else { "FAIL" },
            record.document_path
        );
    }
    out
}

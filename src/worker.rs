//! Single-document QA worker (map stage).
//!
//! [`QaWorker::answer`] turns one document and one question into an
//! [`AnswerRecord`]. Apart from an unknown template name, which is rejected
//! before the document is read, every failure is folded into the record
//! (`success = false`) so one bad document never aborts a run.
//!
//! [`Session`] is the interactive variant: the document text is loaded
//! once and earlier question/answer turns are re-supplied in each prompt.

use chrono::Local;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::{QaError, Result};
use crate::model_client::{GenerateOptions, Generation, ModelClient};
use crate::models::{AnswerRecord, Document, OutputFormat, RecordMetrics, Timing};
use crate::templates::{Role, TemplateRegistry, Variables};

/// One earlier exchange in an interactive session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

pub struct QaWorker {
    client: Arc<dyn ModelClient>,
    templates: Arc<TemplateRegistry>,
    model: String,
    options: GenerateOptions,
    settings: WorkerConfig,
}

impl QaWorker {
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
            settings: WorkerConfig::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Answer `question` against `document`.
    ///
    /// Returns `Err` only for [`QaError::UnknownTemplate`]; no model call is
    /// made in that case.
    pub fn answer(
        &self,
        document: &Document,
        question: &str,
        template: &str,
        format: OutputFormat,
    ) -> Result<AnswerRecord> {
        self.templates.ensure(Role::Single, template)?;

        let started = Instant::now();
        let text = match document.load_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(document = %document.label(), "failed to load document: {}", e);
                let mut record = self.blank_record(document, question, template, format);
                record.error_kind = Some(e.kind().to_string());
                record.error = Some(e.to_string());
                record.metrics.timing.total_secs = started.elapsed().as_secs_f64();
                return Ok(record);
            }
        };
        let load_secs = started.elapsed().as_secs_f64();

        Ok(self.answer_loaded(document, &text, question, template, format, &[], started, load_secs))
    }

    /// Start an interactive session. The document is read once, here.
    pub fn session(
        &self,
        document: Document,
        template: &str,
        format: OutputFormat,
    ) -> Result<Session<'_>> {
        self.templates.ensure(Role::Single, template)?;
        let text = document.load_text()?;
        Ok(Session {
            worker: self,
            document,
            text,
            template: template.to_string(),
            format,
            turns: VecDeque::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn answer_loaded(
        &self,
        document: &Document,
        text: &str,
        question: &str,
        template: &str,
        format: OutputFormat,
        history: &[Turn],
        started: Instant,
        load_secs: f64,
    ) -> AnswerRecord {
        let mut record = self.blank_record(document, question, template, format);

        let render_started = Instant::now();
        let vars = Variables::new()
            .set("document_text", text)
            .set("question", question)
            .set("category", document.category.as_str())
            .set("document_name", document.name.as_str());
        let prompt = match self.templates.render(Role::Single, template, &vars) {
            Ok(prompt) => insert_history(&prompt, history),
            Err(e) => {
                record.error_kind = Some(e.kind().to_string());
                record.error = Some(e.to_string());
                return record;
            }
        };
        let render_secs = render_started.elapsed().as_secs_f64();

        let model_started = Instant::now();
        let (outcome, attempts) = self.generate_with_retry(&prompt);
        let model_secs = model_started.elapsed().as_secs_f64();

        record.metrics = RecordMetrics {
            document_chars: text.chars().count(),
            prompt_chars: prompt.chars().count(),
            num_ctx: self.options.num_ctx,
            attempts,
            timing: Timing {
                load_secs,
                render_secs,
                model_secs,
                total_secs: started.elapsed().as_secs_f64(),
            },
            ..Default::default()
        };

        match outcome {
            Ok(generation) => {
                record.metrics.set_token_usage(
                    generation.prompt_tokens,
                    generation.completion_tokens,
                    self.options.num_ctx,
                );
                record.answer = generation.text;
                match format {
                    OutputFormat::Text => record.success = true,
                    OutputFormat::Structured => match parse_structured(&record.answer) {
                        Ok(value) => {
                            record.structured = Some(value);
                            record.success = true;
                        }
                        Err(e) => {
                            warn!(document = %document.label(), "{}", e);
                            record.error_kind = Some(e.kind().to_string());
                            record.error = Some(e.to_string());
                        }
                    },
                }
            }
            Err(e) => {
                warn!(document = %document.label(), kind = e.kind(), "answer failed: {}", e);
                record.error_kind = Some(e.kind().to_string());
                record.error = Some(e.to_string());
            }
        }

        debug!(
            document = %document.label(),
            success = record.success,
            attempts,
            secs = record.metrics.timing.total_secs,
            "answered document"
        );
        record
    }

    /// Generate, asking again while the answer is shorter than
    /// `min_answer_chars`. The last short answer is kept.
    fn generate_with_retry(&self, prompt: &str) -> (Result<Generation>, u32) {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.generate(&self.model, prompt, &self.options) {
                Ok(generation) => {
                    let chars = generation.text.trim().chars().count();
                    if chars >= self.settings.min_answer_chars || attempt >= max_attempts {
                        return (Ok(generation), attempt);
                    }
                    debug!(attempt, chars, "answer too short, asking again");
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    fn blank_record(
        &self,
        document: &Document,
        question: &str,
        template: &str,
        format: OutputFormat,
    ) -> AnswerRecord {
        AnswerRecord {
            run_id: None,
            document_id: document.id,
            document_path: document.path.display().to_string(),
            category: document.category.clone(),
            document_name: document.name.clone(),
            question: question.to_string(),
            template: template.to_string(),
            format,
            model: self.model.clone(),
            answer: String::new(),
            structured: None,
            success: false,
            error_kind: None,
            error: None,
            metrics: RecordMetrics::default(),
            created_at: Local::now(),
        }
    }
}

/// Interactive continuation against one document.
///
/// Owns the loaded text and the last `history_turns` turns. Dropping the
/// session is all it takes to stop; records already returned stay valid.
pub struct Session<'a> {
    worker: &'a QaWorker,
    document: Document,
    text: String,
    template: String,
    format: OutputFormat,
    turns: VecDeque<Turn>,
}

impl Session<'_> {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn ask(&mut self, question: &str) -> AnswerRecord {
        let history: Vec<Turn> = self.turns.iter().cloned().collect();
        let record = self.worker.answer_loaded(
            &self.document,
            &self.text,
            question,
            &self.template,
            self.format,
            &history,
            Instant::now(),
            0.0,
        );
        if record.success {
            self.turns.push_back(Turn {
                question: question.to_string(),
                answer: record.answer.clone(),
            });
            while self.turns.len() > self.worker.settings.history_turns {
                self.turns.pop_front();
            }
        }
        record
    }
}

/// Put earlier turns into a rendered prompt, right before the first line
/// that is exactly `---`, or at the end when there is no such line.
pub fn insert_history(prompt: &str, history: &[Turn]) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }

    let mut block = String::from("\n\n## 過去の質問と回答\n");
    for (i, turn) in history.iter().enumerate() {
        block.push_str(&format!(
            "\n**質問{}**: {}\n**回答{}**: {}\n",
            i + 1,
            turn.question,
            i + 1,
            turn.answer
        ));
    }

    let mut offset = 0;
    for line in prompt.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let mut out = String::with_capacity(prompt.len() + block.len() + 1);
            out.push_str(&prompt[..offset]);
            out.push_str(block.trim_start_matches('\n'));
            out.push('\n');
            out.push_str(&prompt[offset..]);
            return out;
        }
        offset += line.len();
    }

    format!("{}{}", prompt, block)
}

/// Extract a JSON object from model output.
///
/// Accepts a bare object, a ```json fenced block, or an object embedded in
/// surrounding prose (first `{` to last `}`).
pub fn parse_structured(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(QaError::MalformedOutput {
                    reason: "no JSON object in model output".to_string(),
                })
            }
        }
    };

    let value: serde_json::Value =
        serde_json::from_str(candidate).map_err(|e| QaError::MalformedOutput {
            reason: e.to_string(),
        })?;
    if !value.is_object() {
        return Err(QaError::MalformedOutput {
            reason: "expected a JSON object".to_string(),
        });
    }
    Ok(value)
}

//! End-to-end orchestration.
//!
//! [`Orchestrator`] wires config, templates, the model client, and run
//! storage together and exposes the operations the CLI calls:
//! single-document QA, the full map-reduce flow, aggregate-only
//! re-execution, and the endpoint check.
//!
//! The full flow validates everything it can before touching storage:
//! both templates must exist, the corpus must be non-empty, and the
//! endpoint must serve the configured models. Only then is a run
//! allocated.

use chrono::Local;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregate::{AggregateOptions, Aggregator};
use crate::config::Config;
use crate::dispatch::{dispatch_map, run_blocking, CancelFlag, MapRequest};
use crate::error::{QaError, Result};
use crate::indexer::{index_corpus, CorpusIndex, IndexOptions, IndexWarning};
use crate::model_client::{GenerateOptions, ModelClient, OllamaClient};
use crate::models::{
    AggregateResult, MapSummary, OutputFormat, RunDocument, RunMetadata, RunParameters, RunStatus,
};
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::runs::{Run, RunManager};
use crate::templates::{Role, TemplateRegistry};
use crate::worker::QaWorker;

/// Parameters of one map-reduce run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub question: String,
    pub single_template: String,
    pub aggregate_template: String,
    pub parallelism: usize,
    pub format: OutputFormat,
    pub subdirs: Vec<String>,
    /// Use this run ID instead of allocating one. Must not exist yet.
    pub run_id: Option<String>,
}

impl RunRequest {
    /// A request using the configured default templates and parallelism.
    pub fn new(question: impl Into<String>, config: &Config) -> Self {
        Self {
            question: question.into(),
            single_template: config.templates.single_default.clone(),
            aggregate_template: config.templates.aggregate_default.clone(),
            parallelism: config.dispatch.parallelism,
            format: OutputFormat::Text,
            subdirs: Vec::new(),
            run_id: None,
        }
    }
}

/// What a finished (or cancelled) run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub map: MapSummary,
    /// `None` when the run was cancelled before the reduce stage.
    pub aggregate: Option<AggregateResult>,
    pub index_warnings: Vec<IndexWarning>,
}

pub struct Orchestrator {
    config: Config,
    client: Arc<dyn ModelClient>,
    templates: Arc<TemplateRegistry>,
    runs: RunManager,
}

impl Orchestrator {
    pub fn new(config: Config, client: Arc<dyn ModelClient>, templates: TemplateRegistry) -> Self {
        let runs = RunManager::new(config.runs.dir.clone());
        Self {
            config,
            client,
            templates: Arc::new(templates),
            runs,
        }
    }

    /// Build the production stack: Ollama client plus built-in and on-disk templates.
    pub fn from_config(config: Config) -> Result<Self> {
        let templates = match &config.templates.dir {
            Some(dir) if dir.is_dir() => TemplateRegistry::from_dir(dir)?,
            Some(dir) => {
                warn!(dir = %dir.display(), "template directory not found, using built-ins");
                TemplateRegistry::with_builtins()
            }
            None => TemplateRegistry::with_builtins(),
        };
        let client = Arc::new(OllamaClient::from_config(&config.model));
        Ok(Self::new(config, client, templates))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    pub fn worker(&self) -> QaWorker {
        QaWorker::new(
            Arc::clone(&self.client),
            Arc::clone(&self.templates),
            self.config.model.name.clone(),
            GenerateOptions::from_config(&self.config.model),
        )
        .with_settings(self.config.worker.clone())
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(
            Arc::clone(&self.client),
            Arc::clone(&self.templates),
            self.config.model.aggregate_model(),
            GenerateOptions::from_config(&self.config.model),
        )
    }

    /// Index the configured corpus, optionally restricted to `subdirs`.
    pub fn index(&self, subdirs: &[String]) -> Result<CorpusIndex> {
        let options = IndexOptions::from_config(&self.config.corpus).with_subdirs(subdirs.to_vec());
        index_corpus(&self.config.corpus.root, &options)
    }

    /// Verify the endpoint serves the map and reduce models.
    pub async fn check_models(&self) -> Result<()> {
        let mut models = vec![self.config.model.name.clone()];
        let aggregate = self.config.model.aggregate_model().to_string();
        if !models.contains(&aggregate) {
            models.push(aggregate);
        }
        let client = Arc::clone(&self.client);
        run_blocking(move || {
            for model in &models {
                client.check_available(model)?;
            }
            Ok(())
        })
        .await
    }

    /// Index, allocate a run, answer every document, then reduce.
    pub async fn run_map_reduce(
        &self,
        request: RunRequest,
        cancel: CancelFlag,
        progress: Arc<dyn RunProgressReporter>,
    ) -> Result<RunOutcome> {
        self.templates.ensure(Role::Single, &request.single_template)?;
        self.templates.ensure(Role::Aggregate, &request.aggregate_template)?;

        let index = self.index(&request.subdirs)?;
        if index.is_empty() {
            return Err(QaError::EmptyCorpus {
                root: self.config.corpus.root.clone(),
            });
        }
        self.check_models().await?;

        let run = match &request.run_id {
            Some(id) => self.runs.create_run(id)?,
            None => self.runs.allocate_run()?,
        };

        let mut meta = RunMetadata::new(run.id());
        meta.parameters = Some(RunParameters {
            question: request.question.clone(),
            single_template: request.single_template.clone(),
            aggregate_template: request.aggregate_template.clone(),
            parallelism: request.parallelism,
            format: request.format,
            model: self.config.model.name.clone(),
            subdirs: request.subdirs.clone(),
        });
        meta.documents = index
            .documents()
            .iter()
            .map(|d| RunDocument {
                id: d.id,
                path: d.relative_path.clone(),
            })
            .collect();
        meta.map.total_documents = index.len();
        run.write_metadata(&meta)?;
        meta.transition(RunStatus::Mapping)?;
        run.write_metadata(&meta)?;

        let index_warnings = index.warnings().to_vec();
        let map_request = MapRequest {
            question: request.question.clone(),
            template: request.single_template.clone(),
            format: request.format,
            parallelism: request.parallelism,
        };
        let map = match dispatch_map(
            Arc::new(self.worker()),
            &run,
            index.into_documents(),
            map_request,
            cancel.clone(),
            Arc::clone(&progress),
        )
        .await
        {
            Ok(map) => map,
            Err(e) => {
                fail_run(&run, &mut meta, &e);
                return Err(e);
            }
        };
        meta.map = map.clone();

        if map.cancelled {
            progress.report(RunProgressEvent::Cancelling {
                run_id: run.id().to_string(),
            });
            meta.transition(RunStatus::Cancelled)?;
            run.write_metadata(&meta)?;
            info!(run_id = run.id(), dispatched = map.dispatched, "run cancelled");
            return Ok(RunOutcome {
                run_id: run.id().to_string(),
                status: RunStatus::Cancelled,
                map,
                aggregate: None,
                index_warnings,
            });
        }

        meta.transition(RunStatus::Reducing)?;
        run.write_metadata(&meta)?;
        progress.report(RunProgressEvent::Reducing {
            run_id: run.id().to_string(),
            records: map.succeeded as u64,
        });

        let aggregate = self
            .reduce(&run, &request.aggregate_template, AggregateOptions::default())
            .await?;

        Ok(RunOutcome {
            run_id: run.id().to_string(),
            status: RunStatus::Completed,
            map,
            aggregate: Some(aggregate),
            index_warnings,
        })
    }

    /// Re-run only the reduce stage of an existing run.
    pub async fn aggregate_only(
        &self,
        run_id: &str,
        template: &str,
        options: AggregateOptions,
    ) -> Result<AggregateResult> {
        self.templates.ensure(Role::Aggregate, template)?;
        let run = self.runs.resolve_run(run_id)?;
        self.check_models().await?;
        self.reduce(&run, template, options).await
    }

    async fn reduce(
        &self,
        run: &Run,
        template: &str,
        options: AggregateOptions,
    ) -> Result<AggregateResult> {
        let aggregator = self.aggregator();
        let run = run.clone();
        let template = template.to_string();
        run_blocking(move || aggregator.aggregate(&run, &template, &options)).await
    }
}

/// Best-effort `mapping -> failed`. `err` is still returned to the caller.
fn fail_run(run: &Run, meta: &mut RunMetadata, err: &QaError) {
    meta.status = RunStatus::Failed;
    meta.updated_at = Local::now();
    meta.error = Some(err.to_string());
    if let Err(write_err) = run.write_metadata(meta) {
        warn!(run_id = run.id(), "could not record failure: {}", write_err);
    }
}

//! # mrqa
//!
//! Command-line front-end for map-reduce document QA.
//!
//! ## Usage
//!
//! ```bash
//! mrqa --config ./config/mrqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mrqa ask <doc> [question]` | Ask one document (`-i` for a follow-up session) |
//! | `mrqa run <question>` | Map over every document, then reduce |
//! | `mrqa aggregate <run-id>` | Re-run only the reduce stage of a run |
//! | `mrqa templates` | List prompt templates |
//! | `mrqa runs` | List past runs, most recent first |
//! | `mrqa show <run-id>` | Show a run and its latest aggregate |
//! | `mrqa stats` | Corpus statistics |
//! | `mrqa index` | List the numbered documents |
//! | `mrqa check` | Check the endpoint and models |
//!
//! Every failure kind has its own exit code (see `QaError::exit_code`).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use mapreduce_qa::aggregate::AggregateOptions;
use mapreduce_qa::config::{self, Config};
use mapreduce_qa::dispatch::CancelFlag;
use mapreduce_qa::indexer::document_from_path;
use mapreduce_qa::models::{AnswerRecord, Document, OutputFormat, RunStatus};
use mapreduce_qa::pipeline::{Orchestrator, RunRequest};
use mapreduce_qa::progress::ProgressMode;
use mapreduce_qa::stats;
use mapreduce_qa::templates::Role;
use mapreduce_qa::QaError;

/// Map-reduce question answering over long administrative documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without it, `./config/mrqa.toml` is used when present.
#[derive(Parser)]
#[command(
    name = "mrqa",
    about = "Map-reduce question answering over long documents with a large-context model",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Per-invocation model settings. Override the config file and `OLLAMA_*`.
#[derive(Args, Clone, Debug, Default)]
struct ModelOverrides {
    /// Model used for the map stage.
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Context window (`num_ctx`) sent with every request.
    #[arg(short = 'c', long)]
    num_ctx: Option<u32>,

    /// Maximum output tokens (`num_predict`).
    #[arg(long)]
    num_predict: Option<u32>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Answer a question against one document.
    ///
    /// The document is an index ID (`3`, `003`), a path relative to the
    /// corpus root, a file stem, or a path to any text file.
    Ask {
        document: String,

        /// Question text. Required unless `--interactive` is given.
        question: Option<String>,

        /// Single-document template.
        #[arg(short, long)]
        template: Option<String>,

        /// `text` or `structured` (JSON object expected from the model).
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Print the full answer record as JSON.
        #[arg(long)]
        json: bool,

        /// Keep asking follow-up questions read from stdin.
        #[arg(short, long)]
        interactive: bool,

        #[command(flatten)]
        model: ModelOverrides,
    },

    /// Run the full map-reduce flow over the corpus.
    Run {
        question: String,

        #[arg(long)]
        single_template: Option<String>,

        #[arg(long)]
        aggregate_template: Option<String>,

        /// Number of documents answered concurrently.
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Restrict to a corpus subdirectory. Repeatable.
        #[arg(long = "subdir")]
        subdirs: Vec<String>,

        /// Use this run ID instead of allocating `YYYY-MM-DD_NNNN`.
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Progress on stderr: `human`, `json`, or `off`. Default: human on a TTY.
        #[arg(long)]
        progress: Option<ProgressMode>,

        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        model: ModelOverrides,
    },

    /// Re-run aggregation for an existing run without repeating the map stage.
    Aggregate {
        run_id: String,

        /// Aggregate template.
        #[arg(short, long)]
        template: Option<String>,

        /// Overwrite the latest artifact made with the same template.
        #[arg(long)]
        replace: bool,

        /// Aggregate a run still marked `created` or `mapping`.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        json: bool,
    },

    /// List available templates.
    Templates {
        /// Only list templates of this role (`single` or `aggregate`).
        #[arg(long)]
        role: Option<Role>,
    },

    /// List past runs, most recent first.
    Runs {
        #[arg(long)]
        json: bool,
    },

    /// Show a run's metadata, failures, and latest aggregate answer.
    Show {
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Show corpus statistics.
    Stats {
        #[arg(long = "subdir")]
        subdirs: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// List indexed documents with their IDs.
    Index {
        #[arg(long = "subdir")]
        subdirs: Vec<String>,

        /// Include the content hash column.
        #[arg(long)]
        show_hash: bool,

        #[arg(long)]
        json: bool,
    },

    /// Check that the endpoint is reachable and the models are present.
    Check,
}

impl Commands {
    fn model_overrides(&self) -> Option<&ModelOverrides> {
        match self {
            Commands::Ask { model, .. } | Commands::Run { model, .. } => Some(model),
            _ => None,
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "mapreduce_qa=warn,mrqa=warn",
        1 => "mapreduce_qa=info,mrqa=info",
        2 => "mapreduce_qa=debug,mrqa=debug",
        _ => "mapreduce_qa=trace,mrqa=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<QaError>()
                .map(QaError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut cfg = config::resolve_config(cli.config.as_deref())?;
    if let Some(m) = cli.command.model_overrides() {
        cfg.apply_model_overrides(m.model.clone(), m.num_ctx, m.num_predict)?;
    }
    let orch = Orchestrator::from_config(cfg)?;

    match cli.command {
        Commands::Ask {
            document,
            question,
            template,
            format,
            json,
            interactive,
            ..
        } => return run_ask(&orch, &document, question, template, format, json, interactive).await,
        Commands::Run {
            question,
            single_template,
            aggregate_template,
            parallel,
            subdirs,
            run_id,
            format,
            progress,
            json,
            ..
        } => {
            let mut request = RunRequest::new(question, orch.config());
            if let Some(t) = single_template {
                request.single_template = t;
            }
            if let Some(t) = aggregate_template {
                request.aggregate_template = t;
            }
            if let Some(n) = parallel {
                if n == 0 {
                    bail!(QaError::config("--parallel must be >= 1"));
                }
                request.parallelism = n;
            }
            request.subdirs = subdirs;
            request.run_id = run_id;
            request.format = format;
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            return run_map_reduce(&orch, request, mode, json).await;
        }
        Commands::Aggregate {
            run_id,
            template,
            replace,
            force,
            json,
        } => {
            let template =
                template.unwrap_or_else(|| orch.config().templates.aggregate_default.clone());
            let result = orch
                .aggregate_only(&run_id, &template, AggregateOptions { replace, force })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.answer.trim_end());
                eprintln!(
                    "\nrun {}  aggregate {:03} ({})  {} used, {} omitted",
                    result.run_id,
                    result.sequence,
                    result.template,
                    result.input_document_ids.len(),
                    result.omitted_count
                );
            }
        }
        Commands::Templates { role } => stats::run_templates(&orch, role)?,
        Commands::Runs { json } => stats::run_runs(&orch, json)?,
        Commands::Show { run_id, json } => stats::run_show(&orch, &run_id, json)?,
        Commands::Stats { subdirs, json } => stats::run_stats(&orch, &subdirs, json)?,
        Commands::Index {
            subdirs,
            show_hash,
            json,
        } => stats::run_index(&orch, &subdirs, show_hash, json)?,
        Commands::Check => run_check(&orch).await?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_map_reduce(
    orch: &Orchestrator,
    request: RunRequest,
    mode: ProgressMode,
    json: bool,
) -> Result<ExitCode> {
    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();

    let outcome = orch
        .run_map_reduce(request, cancel, Arc::from(mode.reporter()))
        .await?;

    for warning in &outcome.index_warnings {
        eprintln!("skipped {}: {}", warning.path.display(), warning.reason);
    }

    if json {
        let value = serde_json::json!({
            "run_id": outcome.run_id,
            "status": outcome.status,
            "map": outcome.map,
            "aggregate": outcome.aggregate,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if let Some(aggregate) = &outcome.aggregate {
            println!("{}", aggregate.answer.trim_end());
        }
        eprintln!(
            "\nrun {}  {}  {} / {} documents, {} ok, {} failed",
            outcome.run_id,
            outcome.status,
            outcome.map.dispatched,
            outcome.map.total_documents,
            outcome.map.succeeded,
            outcome.map.failed
        );
        for failure in &outcome.map.failures {
            eprintln!(
                "  FAIL {:03} {} [{}] {}",
                failure.document_id, failure.label, failure.kind, failure.message
            );
        }
    }

    if outcome.status == RunStatus::Cancelled {
        // 130: interrupted by SIGINT
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_ask(
    orch: &Orchestrator,
    query: &str,
    question: Option<String>,
    template: Option<String>,
    format: OutputFormat,
    json: bool,
    interactive: bool,
) -> Result<ExitCode> {
    if question.is_none() && !interactive {
        bail!("a question is required unless --interactive is given");
    }
    let template = template.unwrap_or_else(|| orch.config().templates.single_default.clone());
    orch.templates().ensure(Role::Single, &template)?;
    let document = resolve_document(orch, query)?;
    orch.check_models().await?;

    let worker = orch.worker();
    tokio::task::spawn_blocking(move || -> Result<ExitCode> {
        if !interactive {
            let question = question.unwrap_or_default();
            let record = worker.answer(&document, &question, &template, format)?;
            return print_record(&record, json);
        }

        let mut session = worker.session(document, &template, format)?;
        eprintln!(
            "{} {}  (empty line or `exit` to quit)",
            session.document().display_id(),
            session.document().label()
        );
        let mut last = ExitCode::SUCCESS;
        if let Some(q) = question {
            last = print_record(&session.ask(&q), json)?;
        }
        let stdin = std::io::stdin();
        loop {
            eprint!("> ");
            std::io::stderr().flush().ok();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let q = line.trim();
            if q.is_empty() || q == "exit" || q == "quit" {
                break;
            }
            last = print_record(&session.ask(q), json)?;
        }
        Ok(last)
    })
    .await
    .context("single-document task failed")?
}

fn resolve_document(orch: &Orchestrator, query: &str) -> Result<Document> {
    let path = Path::new(query);
    if path.is_file() {
        return Ok(document_from_path(path)?);
    }
    let index = orch.index(&[])?;
    index.find(query).cloned().with_context(|| {
        format!(
            "no document matches '{}' under {} (try `mrqa index`)",
            query,
            index.root().display()
        )
    })
}

fn print_record(record: &AnswerRecord, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
    } else if record.success {
        println!("{}", record.answer.trim_end());
    } else if !record.answer.is_empty() {
        // malformed structured output: show what the model said
        println!("{}", record.answer.trim_end());
    }

    if record.success {
        return Ok(ExitCode::SUCCESS);
    }
    let kind = record.error_kind.as_deref().unwrap_or("unknown");
    eprintln!(
        "error: {} [{}] {}",
        record.label(),
        kind,
        record.error.as_deref().unwrap_or("")
    );
    Ok(ExitCode::from(QaError::exit_code_for_kind(kind)))
}

async fn run_check(orch: &Orchestrator) -> Result<()> {
    let cfg: &Config = orch.config();
    println!("Endpoint:  {}", cfg.model.url);
    println!("Model:     {}", cfg.model.name);
    if cfg.model.aggregate_model() != cfg.model.name {
        println!("Aggregate: {}", cfg.model.aggregate_model());
    }
    orch.check_models().await?;
    println!("OK");
    Ok(())
}

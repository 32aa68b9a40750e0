//! Map-stage dispatcher.
//!
//! A fixed pool of `parallelism` tasks drains a shared queue of documents.
//! Each job runs the blocking worker call and the durable record write on
//! the blocking thread pool; a document is counted as done only after its
//! record is on disk. Completions arrive in any order.
//!
//! Cancellation is cooperative: once the [`CancelFlag`] is set no new
//! document is taken from the queue, while in-flight calls run to
//! completion (or to their timeout) and still write their records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{QaError, Result};
use crate::models::{AnswerRecord, Document, FailureSummary, MapSummary, OutputFormat};
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::runs::Run;
use crate::worker::QaWorker;

/// Shared cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel, reporting whether the flag was already set.
    pub fn interrupt(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    /// Set this flag on the first Ctrl-C. A second Ctrl-C exits the
    /// process with status 130 without waiting for in-flight calls.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if flag.interrupt() {
                    warn!("second interrupt, exiting without waiting for in-flight calls");
                    std::process::exit(130);
                }
                warn!("interrupt received, no further documents will be dispatched (Ctrl-C again to exit)");
            }
        });
    }
}

/// What every map-stage job asks.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub question: String,
    pub template: String,
    pub format: OutputFormat,
    pub parallelism: usize,
}

struct Outcome {
    document_id: u32,
    label: String,
    success: bool,
    error_kind: Option<String>,
    error: Option<String>,
}

struct Shared {
    queue: Mutex<VecDeque<Document>>,
    worker: Arc<QaWorker>,
    run: Run,
    request: MapRequest,
    cancel: CancelFlag,
    progress: Arc<dyn RunProgressReporter>,
    dispatched: AtomicU64,
    completed: AtomicU64,
    total: u64,
}

/// Answer every document and write one record per dispatched document.
///
/// Per-document failures are counted in the summary. A storage failure (or
/// any other error the worker cannot fold into a record) cancels the
/// remaining queue and is returned once in-flight jobs have drained.
pub async fn dispatch_map(
    worker: Arc<QaWorker>,
    run: &Run,
    documents: Vec<Document>,
    request: MapRequest,
    cancel: CancelFlag,
    progress: Arc<dyn RunProgressReporter>,
) -> Result<MapSummary> {
    let total = documents.len();
    let parallelism = request.parallelism.max(1).min(total.max(1));
    info!(run_id = run.id(), total, parallelism, "map stage started");
    progress.report(RunProgressEvent::MapStarted {
        run_id: run.id().to_string(),
        total: total as u64,
        parallelism,
    });

    let shared = Arc::new(Shared {
        queue: Mutex::new(documents.into()),
        worker,
        run: run.clone(),
        request,
        cancel,
        progress,
        dispatched: AtomicU64::new(0),
        completed: AtomicU64::new(0),
        total: total as u64,
    });

    let mut set = JoinSet::new();
    for slot in 0..parallelism {
        let shared = Arc::clone(&shared);
        set.spawn(async move { pool_task(slot, shared).await });
    }

    let mut outcomes = Vec::with_capacity(total);
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(done)) => outcomes.extend(done),
            Ok(Err(e)) => {
                shared.cancel.cancel();
                first_err.get_or_insert(e);
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!("map task ended unexpectedly: {}", e),
        }
    }
    if let Some(e) = first_err {
        warn!(run_id = run.id(), "map stage aborted: {}", e);
        return Err(e);
    }

    outcomes.sort_by_key(|o| o.document_id);
    let failures: Vec<FailureSummary> = outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| FailureSummary {
            document_id: o.document_id,
            label: o.label.clone(),
            kind: o.error_kind.clone().unwrap_or_default(),
            message: o.error.clone().unwrap_or_default(),
        })
        .collect();
    let summary = MapSummary {
        total_documents: total,
        dispatched: shared.dispatched.load(Ordering::SeqCst) as usize,
        succeeded: outcomes.len() - failures.len(),
        failed: failures.len(),
        cancelled: shared.cancel.is_cancelled() && outcomes.len() < total,
        failures,
    };
    info!(
        run_id = run.id(),
        dispatched = summary.dispatched,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "map stage finished"
    );
    Ok(summary)
}

async fn pool_task(slot: usize, shared: Arc<Shared>) -> Result<Vec<Outcome>> {
    let mut done = Vec::new();
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let Some(document) = shared.queue.lock().await.pop_front() else {
            break;
        };
        shared.dispatched.fetch_add(1, Ordering::SeqCst);
        debug!(slot, document = %document.label(), "dispatching");

        let started = Instant::now();
        let job = Arc::clone(&shared);
        let record = run_blocking(move || answer_and_store(&job, &document)).await?;

        let n = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        shared.progress.report(RunProgressEvent::DocumentDone {
            run_id: shared.run.id().to_string(),
            n,
            total: shared.total,
            document: record.label(),
            success: record.success,
            secs: started.elapsed().as_secs_f64(),
        });
        done.push(Outcome {
            document_id: record.document_id,
            label: record.label(),
            success: record.success,
            error_kind: record.error_kind,
            error: record.error,
        });
    }
    Ok(done)
}

/// Run a blocking closure (model call, file I/O) on the blocking pool.
///
/// A panic inside `f` is resumed on the calling task.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(QaError::storage(
            std::path::PathBuf::new(),
            std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()),
        )),
    }
}

fn answer_and_store(shared: &Shared, document: &Document) -> Result<AnswerRecord> {
    let request = &shared.request;
    let mut record = shared.worker.answer(
        document,
        &request.question,
        &request.template,
        request.format,
    )?;
    record.run_id = Some(shared.run.id().to_string());
    shared.run.write_record(&record)?;
    Ok(record)
}

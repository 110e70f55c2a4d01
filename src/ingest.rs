//! Orchestrates stream → extract → batch → sink.
//!
//! Records are read and extracted on a blocking thread and handed over one
//! batch at a time through a channel of capacity 1, so the next batch can be
//! prepared while the previous one is being flushed but no two flushes ever
//! overlap.

use crate::batch::{Batch, BatchAccumulator};
use crate::checkpoint::{self, CheckpointManager, CheckpointStats};
use crate::config::IngestConfig;
use crate::error::{IngestError, SinkError};
use crate::extract::extract_entity;
use crate::parser::{Compression, DumpReader};
use crate::sink::GraphSink;
use crate::stats::IngestStats;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub compression: Compression,
}

impl SourceSpec {
    /// Compression inferred from the file extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let compression = Compression::from_path(&path);
        Self { path, compression }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    SchemaReady,
    Streaming,
    Flushing { batch_index: u64 },
    Completed,
    Failed,
}

#[derive(Debug)]
pub enum Outcome {
    Completed,
    Failed {
        cause: IngestError,
        /// Batch being built or flushed when the run stopped
        batch_index: Option<u64>,
        /// Contents of the batch that could not be flushed
        batch: Option<Batch>,
    },
}

#[derive(Debug)]
pub struct IngestReport {
    pub outcome: Outcome,
    pub records_seen: u64,
    pub records_skipped: u64,
    pub entities_committed: u64,
    pub relationships_committed: u64,
    pub flushes: u64,
    pub flush_retries: u64,
    pub duration: Duration,
}

impl IngestReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }

    pub fn final_state(&self) -> DriverState {
        match self.outcome {
            Outcome::Completed => DriverState::Completed,
            Outcome::Failed { .. } => DriverState::Failed,
        }
    }

    pub fn cause(&self) -> Option<&IngestError> {
        match &self.outcome {
            Outcome::Completed => None,
            Outcome::Failed { cause, .. } => Some(cause),
        }
    }
}

/// Where a resumed run picks up, from the last committed batch.
#[derive(Debug, Clone, Copy, Default)]
struct ResumePoint {
    records_through: u64,
    skipped_through: u64,
    first_index: u64,
}

/// What the record producer hands to the flushing side.
enum Produced {
    Batch(Batch),
    Fatal {
        cause: IngestError,
        batch_index: u64,
    },
}

struct ProducerJob {
    reader: DumpReader,
    batch_size: usize,
    strict_mode: bool,
    limit: Option<u64>,
    progress_interval: u64,
    resume: ResumePoint,
    stats: Arc<IngestStats>,
    /// Raw records pulled from the reader, skipped ones included
    heartbeat: Arc<AtomicU64>,
    cancel: CancellationToken,
}

pub struct IngestionDriver<S> {
    config: IngestConfig,
    sink: S,
    stats: Arc<IngestStats>,
}

impl<S: GraphSink> IngestionDriver<S> {
    pub fn new(config: IngestConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            stats: Arc::new(IngestStats::new()),
        }
    }

    /// Live counters, for progress display while `run` is in flight.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub async fn run(&self, source: &SourceSpec, cancel: CancellationToken) -> IngestReport {
        let start = Instant::now();
        self.stats.restore(&CheckpointStats::default());

        let outcome = self.drive(source, &cancel).await;
        match &outcome {
            Outcome::Completed => info!(
                entities = self.stats.entities(),
                skipped = self.stats.skipped(),
                "Ingestion completed"
            ),
            Outcome::Failed {
                cause, batch_index, ..
            } => error!(
                error = %cause,
                batch = ?batch_index,
                entities = self.stats.entities(),
                "Ingestion failed"
            ),
        }

        IngestReport {
            outcome,
            records_seen: self.stats.records(),
            records_skipped: self.stats.skipped(),
            entities_committed: self.stats.entities(),
            relationships_committed: self.stats.relationships(),
            flushes: self.stats.flushes(),
            flush_retries: self.stats.retries(),
            duration: start.elapsed(),
        }
    }

    async fn drive(&self, source: &SourceSpec, cancel: &CancellationToken) -> Outcome {
        let mut state = DriverState::Idle;

        if let Err(e) = self.config.validate() {
            return fail(&mut state, e, None, None);
        }

        if let Err(e) = self.timed(self.sink.ensure_schema()).await {
            return fail(&mut state, e, None, None);
        }
        transition(&mut state, DriverState::SchemaReady);

        let input = source.path.to_string_lossy().to_string();
        let checkpoints = self.checkpoint_manager(&input);
        let resume = self.resume_point(&input);

        let read_timeout = self.config.read_timeout;
        let reader = match tokio::time::timeout(read_timeout, open_reader(source)).await {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => return fail(&mut state, e, None, None),
            Err(_) => return fail(&mut state, stalled(&input, read_timeout), None, None),
        };
        transition(&mut state, DriverState::Streaming);

        // Stops the producer whenever this function returns.
        let producer_cancel = cancel.child_token();
        let _stop_producer = producer_cancel.clone().drop_guard();

        let heartbeat = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel::<Produced>(1);
        let job = ProducerJob {
            reader,
            batch_size: self.config.batch_size,
            strict_mode: self.config.strict_mode,
            limit: self.config.limit,
            progress_interval: self.config.progress_interval.max(1),
            resume,
            stats: Arc::clone(&self.stats),
            heartbeat: Arc::clone(&heartbeat),
            cancel: producer_cancel,
        };
        let producer = tokio::task::spawn_blocking(move || produce(job, tx));

        loop {
            let before = heartbeat.load(Ordering::Relaxed);
            let message = match tokio::time::timeout(read_timeout, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                // A slow batch is fine as long as records keep arriving.
                Err(_) if heartbeat.load(Ordering::Relaxed) != before => continue,
                Err(_) => return fail(&mut state, stalled(&input, read_timeout), None, None),
            };
            let batch = match message {
                Produced::Batch(batch) => batch,
                Produced::Fatal { cause, batch_index } => {
                    return fail(&mut state, cause, Some(batch_index), None);
                }
            };

            if cancel.is_cancelled() {
                let index = batch.index;
                return fail(&mut state, IngestError::Cancelled, Some(index), Some(batch));
            }

            transition(
                &mut state,
                DriverState::Flushing {
                    batch_index: batch.index,
                },
            );
            if let Err(e) = self.flush_with_retry(&batch, cancel).await {
                let index = batch.index;
                return fail(&mut state, e, Some(index), Some(batch));
            }

            self.stats.add_committed(
                batch.entities.len() as u64,
                batch.relationships.len() as u64,
            );
            if let Some(mgr) = &checkpoints {
                if let Err(e) = mgr.save(&batch, &self.stats) {
                    warn!(error = %e, "Failed to save checkpoint");
                }
            }
            debug!(
                batch = batch.index,
                entities = batch.entities.len(),
                relationships = batch.relationships.len(),
                committed = self.stats.entities(),
                "Batch committed"
            );
            transition(&mut state, DriverState::Streaming);
        }

        if let Err(e) = producer.await {
            let cause = IngestError::SourceUnavailable {
                path: input,
                reason: format!("record producer stopped unexpectedly: {e}"),
            };
            return fail(&mut state, cause, None, None);
        }

        if let Some(mgr) = &checkpoints {
            if let Err(e) = mgr.clear() {
                warn!(error = %e, "Failed to clear checkpoint");
            }
        }
        transition(&mut state, DriverState::Completed);
        Outcome::Completed
    }

    /// Resubmits the whole batch on transient failures; never a partial batch.
    async fn flush_with_retry(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.flush_once(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_flush_retries => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        batch = batch.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Flush failed, retrying"
                    );
                    self.stats.inc_retries();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                    }
                }
                Err(e) => {
                    warn!(batch = batch.index, attempt, error = %e, "Flush failed");
                    return Err(e);
                }
            }
        }
    }

    async fn flush_once(&self, batch: &Batch) -> Result<(), IngestError> {
        self.timed(self.sink.upsert_entities(&batch.entities))
            .await?;
        self.timed(self.sink.upsert_relationships(&batch.relationships))
            .await?;
        Ok(())
    }

    /// A sink call that outlives `flush_timeout` counts as unavailable.
    async fn timed<F>(&self, call: F) -> Result<(), IngestError>
    where
        F: Future<Output = Result<(), SinkError>>,
    {
        let limit = self.config.flush_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(IngestError::from),
            Err(_) => Err(IngestError::SinkUnavailable(format!(
                "sink call timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }

    fn checkpoint_manager(&self, input: &str) -> Option<CheckpointManager> {
        let dir = self.config.checkpoint_dir.as_deref()?;
        match CheckpointManager::new(input, dir) {
            Ok(mgr) => Some(mgr),
            Err(e) => {
                warn!(error = %e, "Checkpointing disabled");
                None
            }
        }
    }

    fn resume_point(&self, input: &str) -> ResumePoint {
        if !self.config.resume {
            return ResumePoint::default();
        }
        let Some(dir) = self.config.checkpoint_dir.as_deref() else {
            return ResumePoint::default();
        };
        match checkpoint::load_if_valid(input, dir) {
            Ok(Some(cp)) => {
                info!(
                    records = cp.records_through,
                    entities = cp.stats.entities_committed,
                    "Resuming from checkpoint"
                );
                self.stats.restore(&cp.stats);
                ResumePoint {
                    records_through: cp.records_through,
                    skipped_through: cp.stats.records_skipped,
                    first_index: cp.batches_committed,
                }
            }
            Ok(None) => {
                info!("No valid checkpoint found, starting fresh");
                ResumePoint::default()
            }
            Err(e) => {
                warn!(error = %e, "Could not read checkpoint, starting fresh");
                ResumePoint::default()
            }
        }
    }
}

/// Opening touches the disk and sniffs the first bytes, so it runs off the
/// async workers.
async fn open_reader(source: &SourceSpec) -> Result<DumpReader, IngestError> {
    let path = source.path.clone();
    let compression = source.compression;
    tokio::task::spawn_blocking(move || DumpReader::open(&path, compression))
        .await
        .unwrap_or_else(|e| {
            Err(IngestError::SourceUnavailable {
                path: source.path.display().to_string(),
                reason: format!("open task failed: {e}"),
            })
        })
}

fn stalled(input: &str, after: Duration) -> IngestError {
    IngestError::SourceUnavailable {
        path: input.to_string(),
        reason: format!("no record read for {}ms", after.as_millis()),
    }
}

fn transition(state: &mut DriverState, next: DriverState) {
    debug!(from = ?state, to = ?next, "Driver state");
    *state = next;
}

fn fail(
    state: &mut DriverState,
    cause: IngestError,
    batch_index: Option<u64>,
    batch: Option<Batch>,
) -> Outcome {
    transition(state, DriverState::Failed);
    Outcome::Failed {
        cause,
        batch_index,
        batch,
    }
}

/// Runs on a blocking thread: read, extract, accumulate, hand off full batches.
fn produce(job: ProducerJob, tx: mpsc::Sender<Produced>) {
    let ProducerJob {
        reader,
        batch_size,
        strict_mode,
        limit,
        progress_interval,
        resume,
        stats,
        heartbeat,
        cancel,
    } = job;

    let source = reader.source().to_string();
    let skip = resume.records_through;
    let mut acc = BatchAccumulator::starting_at(
        batch_size,
        resume.records_through,
        resume.skipped_through,
        resume.first_index,
    );
    let mut processed = 0u64;

    for (ordinal, item) in (1u64..).zip(reader) {
        heartbeat.store(ordinal, Ordering::Relaxed);
        if ordinal <= skip {
            continue;
        }
        if cancel.is_cancelled() {
            let _ = tx.blocking_send(Produced::Fatal {
                cause: IngestError::Cancelled,
                batch_index: acc.next_index(),
            });
            return;
        }
        if limit.is_some_and(|limit| processed >= limit) {
            info!(limit = processed, "Record limit reached");
            break;
        }

        processed += 1;
        stats.inc_records();
        acc.mark_record();

        match item.and_then(|raw| extract_entity(&raw)) {
            Ok(extracted) => {
                acc.add_entity(extracted.entity);
                acc.add_relationships(extracted.relationships);
            }
            Err(e) if e.is_per_record() && !strict_mode => {
                stats.inc_skipped();
                acc.mark_skipped();
                warn!(source = %source, error = %e, "Skipping record");
            }
            Err(e) => {
                let _ = tx.blocking_send(Produced::Fatal {
                    cause: e,
                    batch_index: acc.next_index(),
                });
                return;
            }
        }

        if acc.should_flush() && tx.blocking_send(Produced::Batch(acc.drain())).is_err() {
            return;
        }

        if processed % progress_interval == 0 {
            info!(
                records = stats.records(),
                entities = stats.entities(),
                skipped = stats.skipped(),
                "Progress"
            );
        }
    }

    if !acc.is_empty() {
        let _ = tx.blocking_send(Produced::Batch(acc.drain()));
    }
}

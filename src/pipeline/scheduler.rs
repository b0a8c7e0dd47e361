use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::accumulator::ResultAccumulator;
use super::executor::{AttemptExecutor, TranslationStatus};
use super::reconcile::reconcile;
use super::unit::Chunk;
use crate::models::ModelAdapter;
use crate::progress::{LogSink, ProgressTracker};

/// Cooperative stop flag shared with the thread that drives a run.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Cancels and reports whether a stop had already been requested, so a second
    /// interrupt can end the process instead of waiting for the current chunk.
    pub fn interrupt(&self) -> bool {
        self.0.swap(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The queue drained.
    Completed,
    /// Stopped between chunks on request.
    Cancelled,
    /// A chunk exceeded the model's input limit; the rest of the queue was abandoned.
    Aborted { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedChapter {
    pub id: String,
    pub reason: String,
}

impl fmt::Display for SkippedChapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.reason)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub translations: ResultAccumulator,
    pub skipped: Vec<SkippedChapter>,
    /// Chapters translated or permanently skipped.
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub splits: usize,
    pub calls: usize,
}

struct QueuedChunk {
    chunk: Chunk,
    resubmission: bool,
}

impl QueuedChunk {
    fn fresh(chunk: Chunk) -> Self {
        Self {
            chunk,
            resubmission: false,
        }
    }

    fn again(chunk: Chunk) -> Self {
        Self {
            chunk,
            resubmission: true,
        }
    }
}

/// Drives chunks through the model one at a time until the queue drains,
/// shrinking the unit of work whenever a response comes back incomplete.
pub struct Scheduler<M: ModelAdapter> {
    executor: AttemptExecutor<M>,
    log: Arc<dyn LogSink>,
    progress: Arc<ProgressTracker>,
    cancel: CancelToken,
}

impl<M: ModelAdapter> Scheduler<M> {
    pub fn new(
        executor: AttemptExecutor<M>,
        log: Arc<dyn LogSink>,
        progress: Arc<ProgressTracker>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            executor,
            log,
            progress,
            cancel,
        }
    }

    pub fn into_model(self) -> M {
        self.executor.into_model()
    }

    pub fn run(&mut self, chunks: Vec<Chunk>) -> RunReport {
        let started = Instant::now();
        let total: usize = chunks.iter().map(Chunk::len).sum();
        self.progress.set_total(total);

        let policy = self.executor.policy().clone();
        let mut queue: VecDeque<QueuedChunk> = chunks.into_iter().map(QueuedChunk::fresh).collect();
        let mut acc = ResultAccumulator::new();
        let mut skipped: Vec<SkippedChapter> = Vec::new();
        let mut strikes: HashMap<String, u32> = HashMap::new();
        let mut quota_streak = 0u32;
        let mut splits = 0usize;
        let mut status = RunStatus::Completed;

        if !queue.is_empty() {
            self.log.info(&format!(
                "Processing {total} chapters in {} chunks.",
                queue.len()
            ));
        }

        loop {
            if self.cancel.is_cancelled() {
                self.log.warn("Translation stopped by user.");
                status = RunStatus::Cancelled;
                break;
            }
            let Some(QueuedChunk {
                chunk,
                resubmission,
            }) = queue.pop_front()
            else {
                break;
            };

            self.log.info(&format!(
                "--- Processing chunk {} .. {} ({} chapters{}) ---",
                chunk.first_id(),
                chunk.last_id(),
                chunk.len(),
                if resubmission { ", resubmitted" } else { "" }
            ));
            let outcome = self.executor.attempt(&chunk, resubmission);
            let detail = outcome.detail.clone().unwrap_or_default();
            if outcome.status != TranslationStatus::QuotaExceeded {
                quota_streak = 0;
            }

            match outcome.status {
                TranslationStatus::Success | TranslationStatus::OutputTruncated => {
                    if outcome.status == TranslationStatus::OutputTruncated {
                        self.log
                            .warn("Response hit the output token cap; keeping whole chapters only.");
                    }
                    let rec = reconcile(&chunk, outcome.raw_text.as_deref().unwrap_or_default());
                    if !rec.foreign.is_empty() {
                        self.log.warn(&format!(
                            "Discarded unrequested chapter ids in response: {}",
                            rec.foreign.join(", ")
                        ));
                    }
                    if rec.stray_text {
                        self.log.info("Discarded response text outside chapter markers.");
                    }
                    let recovered = rec.translated.len();
                    let added = acc.merge(rec.translated);
                    self.progress.advance(added);

                    if rec.missing.is_empty() {
                        self.log
                            .success(&format!("Chunk translated ({recovered} chapters)."));
                    } else if recovered == 0 && chunk.len() == 1 {
                        let id = chunk.first_id().to_string();
                        let n = strikes.entry(id.clone()).or_insert(0);
                        *n += 1;
                        if *n > policy.max_empty_resubmissions {
                            let reason = format!("no usable translation after {n} responses");
                            self.skip(&mut skipped, id, reason);
                        } else {
                            self.log.warn(&format!(
                                "No translation recovered for chapter {id}. Re-queuing ({n}/{}).",
                                policy.max_empty_resubmissions
                            ));
                            queue.push_front(QueuedChunk::again(chunk));
                        }
                    } else {
                        self.log.warn(&format!(
                            "Model response was incomplete. Re-queuing {} missing chapters.",
                            rec.missing.len()
                        ));
                        if let Some(remainder) = Chunk::new(rec.missing) {
                            splits += self.requeue_split(&mut queue, remainder);
                        }
                    }
                }
                TranslationStatus::Failed => {
                    self.log.error(&format!(
                        "Translation failed for a chunk of {} chapters ({detail}).",
                        chunk.len()
                    ));
                    if chunk.len() > 1 {
                        splits += self.requeue_split(&mut queue, chunk);
                    } else {
                        let reason = format!("failed after retries: {detail}");
                        self.skip(&mut skipped, chunk.first_id().to_string(), reason);
                    }
                }
                TranslationStatus::QuotaExceeded => {
                    let wait = policy.quota_delay(quota_streak);
                    quota_streak = quota_streak.saturating_add(1);
                    self.log.warn(&format!(
                        "Quota exceeded ({detail}). Waiting {:.0}s before resubmitting the same chunk.",
                        wait.as_secs_f64()
                    ));
                    std::thread::sleep(wait);
                    queue.push_front(QueuedChunk::again(chunk));
                    continue;
                }
                TranslationStatus::TokenLimitExceeded => {
                    let reason = format!(
                        "input token limit exceeded for chunk {} .. {} ({detail})",
                        chunk.first_id(),
                        chunk.last_id()
                    );
                    self.log
                        .error(&format!("Halting translation: {reason}."));
                    status = RunStatus::Aborted { reason };
                    break;
                }
            }

            if !queue.is_empty() && !policy.chunk_pause.is_zero() {
                std::thread::sleep(policy.chunk_pause);
            }
        }

        if status == RunStatus::Completed {
            if skipped.is_empty() {
                self.log
                    .success(&format!("All {} chapters translated.", acc.len()));
            } else {
                self.log.warn(&format!(
                    "Finished with {} translated and {} skipped chapters.",
                    acc.len(),
                    skipped.len()
                ));
            }
        }

        RunReport {
            status,
            processed: acc.len() + skipped.len(),
            translations: acc,
            skipped,
            total,
            elapsed: started.elapsed(),
            splits,
            calls: self.executor.calls(),
        }
    }

    /// Bisects `chunk` onto the queue front, earlier half first; a single chapter goes back whole.
    fn requeue_split(&self, queue: &mut VecDeque<QueuedChunk>, chunk: Chunk) -> usize {
        match chunk.bisect() {
            Some((first, second)) => {
                self.log.info(&format!(
                    "Split into two new chunks of size {} and {}.",
                    first.len(),
                    second.len()
                ));
                queue.push_front(QueuedChunk::again(second));
                queue.push_front(QueuedChunk::again(first));
                1
            }
            None => {
                queue.push_front(QueuedChunk::again(chunk));
                0
            }
        }
    }

    fn skip(&self, skipped: &mut Vec<SkippedChapter>, id: String, reason: String) {
        self.log
            .warn(&format!("Skipping chapter {id}: {reason}."));
        self.progress.advance(1);
        skipped.push(SkippedChapter { id, reason });
    }
}

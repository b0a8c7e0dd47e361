//! Chunked translation engine: packing chapters, calling the model, recovering what came
//! back and re-queuing what did not.

pub mod accumulator;
pub mod chunker;
pub mod config;
pub mod executor;
pub mod prompts;
pub mod reconcile;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod testing;
mod trace;
mod translator;
pub mod unit;

pub use accumulator::ResultAccumulator;
pub use config::{init_default_config, BackendKind, ConfigOverrides, PipelineConfig};
pub use executor::{AttemptExecutor, RetryPolicy, TranslationOutcome, TranslationStatus};
pub use scheduler::{CancelToken, RunReport, RunStatus, Scheduler, SkippedChapter};
pub use trace::TraceWriter;
pub use translator::{list_chapters, ChapterRange, TranslationRun, TranslatorPipeline};
pub use unit::{ChapterUnit, Chunk};

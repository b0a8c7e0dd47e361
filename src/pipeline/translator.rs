use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};

use super::chunker::build_chunks;
use super::config::FALLBACK_OUTPUT_TOKENS;
use super::executor::AttemptExecutor;
use super::scheduler::{CancelToken, RunReport, RunStatus, Scheduler};
use super::trace::TraceWriter;
use super::unit::{apportion_tokens, ChapterUnit};
use super::PipelineConfig;
use crate::epub::{rebuild_epub, ChapterRef, ChapterText, EpubBook, RebuildSummary};
use crate::models::ModelAdapter;
use crate::progress::{LogSink, ProgressTicker, ProgressTracker};
use crate::textutil::approx_tokens;

/// 1-based inclusive chapter range; open ends default to the first and last chapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChapterRange {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl ChapterRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// Zero-based half-open bounds into a list of `count` chapters.
    pub fn bounds(&self, count: usize) -> anyhow::Result<(usize, usize)> {
        if count == 0 {
            if self.start.is_some() || self.end.is_some() {
                return Err(anyhow!("chapter range given but the book has no chapters"));
            }
            return Ok((0, 0));
        }
        let start = self.start.unwrap_or(1);
        let end = self.end.unwrap_or(count);
        if start < 1 || start > count {
            return Err(anyhow!("start chapter {start} is outside 1..={count}"));
        }
        if end < 1 || end > count {
            return Err(anyhow!("end chapter {end} is outside 1..={count}"));
        }
        if start > end {
            return Err(anyhow!("start chapter {start} is after end chapter {end}"));
        }
        Ok((start - 1, end))
    }
}

/// What a finished, cancelled or aborted run left behind.
#[derive(Debug)]
pub struct TranslationRun {
    pub report: RunReport,
    /// Written EPUB, if any chapter was translated and the run was not cancelled.
    pub output: Option<PathBuf>,
    pub rebuild: Option<RebuildSummary>,
    /// Chapters with no text to translate; copied through unchanged.
    pub empty_chapters: Vec<String>,
}

impl TranslationRun {
    /// One-line outcome for the end of a run.
    pub fn summary(&self) -> String {
        let r = &self.report;
        let counts = format!(
            "{}/{} chapters translated, {} skipped",
            r.translations.len(),
            r.total,
            r.skipped.len()
        );
        let written = match &self.output {
            Some(p) => format!("wrote {}", p.display()),
            None => "no output written".to_string(),
        };
        match &r.status {
            RunStatus::Completed => format!("Finished: {counts}; {written}."),
            RunStatus::Cancelled => format!("Stopped by user (cancelled): {counts}; {written}."),
            RunStatus::Aborted { reason } => format!("Aborted ({reason}): {counts}; {written}."),
        }
    }
}

pub struct TranslatorPipeline {
    cfg: PipelineConfig,
    log: Arc<dyn LogSink>,
    cancel: CancelToken,
}

impl TranslatorPipeline {
    pub fn new(cfg: PipelineConfig, log: Arc<dyn LogSink>) -> Self {
        Self {
            cfg,
            log,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Handle another thread can use to stop the run between chunks.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Translates the selected chapters of `input` and writes `output`.
    ///
    /// The scheduler runs on a worker thread while this thread reports progress. The model
    /// is handed back so callers can reuse a loaded backend.
    pub fn translate_epub<M: ModelAdapter>(
        &self,
        mut model: M,
        input: &Path,
        output: &Path,
        range: ChapterRange,
    ) -> anyhow::Result<(TranslationRun, M)> {
        self.log.info(&format!("Read EPUB: {}", input.display()));
        let book = EpubBook::open(input)?;
        let chapters = book.chapters();
        let (lo, hi) = range.bounds(chapters.len())?;
        self.log.info(&format!(
            "Chapters {}..{} of {} selected. Model: {} Target: {}",
            lo + 1,
            hi,
            chapters.len(),
            model.name(),
            self.cfg.target_lang
        ));

        let mut texts: Vec<(ChapterRef, ChapterText)> = Vec::new();
        let mut empty_chapters = Vec::new();
        for ch in &chapters[lo..hi] {
            let text = book.read_chapter(ch)?;
            if text.text.trim().is_empty() {
                self.log
                    .info(&format!("Chapter {} has no text; leaving it unchanged.", ch.id));
                empty_chapters.push(ch.id.clone());
                continue;
            }
            texts.push((ch.clone(), text));
        }

        let costs = self.estimate_costs(&mut model, &texts);
        let max_out = match model.max_output_tokens() {
            Ok(n) if n > 0 => n,
            Ok(_) => FALLBACK_OUTPUT_TOKENS,
            Err(err) => {
                self.log.warn(&format!(
                    "Could not read the model's output limit ({err:#}); assuming {FALLBACK_OUTPUT_TOKENS}."
                ));
                FALLBACK_OUTPUT_TOKENS
            }
        };
        let budget = self.cfg.safe_budget(max_out);
        self.log.info(&format!(
            "Output limit {max_out} tokens; chunk budget {budget} tokens."
        ));

        let mut images: HashMap<String, Vec<String>> = HashMap::new();
        let units: Vec<Arc<ChapterUnit>> = texts
            .into_iter()
            .zip(costs)
            .map(|((ch, text), cost)| {
                images.insert(ch.id.clone(), text.images.clone());
                Arc::new(ChapterUnit::new(ch.id, &text.text, cost, text.images))
            })
            .collect();
        let chunks = build_chunks(&units, budget, self.cfg.max_chapters_per_chunk);

        let trace = match TraceWriter::new(self.cfg.trace_dir.clone(), self.cfg.trace_prompts) {
            Ok(t) => t,
            Err(err) => {
                self.log
                    .warn(&format!("Tracing disabled: {err:#}"));
                TraceWriter::disabled()
            }
        };
        let executor = AttemptExecutor::new(model, self.cfg.retry.clone(), Arc::clone(&self.log))
            .with_trace(trace)
            .with_log_max_chars(self.cfg.log_max_chars);
        let progress = Arc::new(ProgressTracker::new(units.len()));
        let mut scheduler = Scheduler::new(
            executor,
            Arc::clone(&self.log),
            Arc::clone(&progress),
            self.cancel.clone(),
        );

        let (report, model) = std::thread::scope(|s| {
            let worker = s.spawn(move || {
                let report = scheduler.run(chunks);
                (report, scheduler.into_model())
            });
            let ticker = ProgressTicker::spawn(
                Arc::clone(&progress),
                Arc::clone(&self.log),
                self.cfg.progress_interval,
            );
            let joined = worker.join();
            drop(ticker);
            joined.map_err(|_| anyhow!("translation worker panicked"))
        })?;

        for s in &report.skipped {
            self.log.warn(&format!("Skipped {s}"));
        }
        self.log.info(&format!(
            "{} of {} chapters translated in {} calls ({} splits).",
            report.translations.len(),
            report.total,
            report.calls,
            report.splits
        ));

        let mut run = TranslationRun {
            report,
            output: None,
            rebuild: None,
            empty_chapters,
        };
        if run.report.status == RunStatus::Cancelled {
            self.log.warn("Run cancelled; no output written.");
            return Ok((run, model));
        }
        if run.report.translations.is_empty() {
            self.log.warn("Nothing was translated; no output written.");
            return Ok((run, model));
        }

        let summary = rebuild_epub(&book, run.report.translations.as_map(), &images, output)
            .with_context(|| format!("write EPUB: {}", output.display()))?;
        self.log.success(&format!(
            "Wrote {} ({} chapters replaced).",
            output.display(),
            summary.replaced
        ));
        run.output = Some(output.to_path_buf());
        run.rebuild = Some(summary);
        Ok((run, model))
    }

    /// Counts the whole selection once and spreads the total over chapters by length.
    fn estimate_costs<M: ModelAdapter>(
        &self,
        model: &mut M,
        texts: &[(ChapterRef, ChapterText)],
    ) -> Vec<usize> {
        if texts.is_empty() {
            return Vec::new();
        }
        let joined = texts
            .iter()
            .map(|(_, t)| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        match model.count_tokens(&joined) {
            Ok(total) => {
                let chars: Vec<usize> = texts.iter().map(|(_, t)| t.text.chars().count()).collect();
                self.log
                    .info(&format!("Selected text: {total} tokens in {} chapters.", texts.len()));
                apportion_tokens(&chars, total)
            }
            Err(err) => {
                self.log.warn(&format!(
                    "Token count failed ({err:#}); estimating from character counts."
                ));
                texts.iter().map(|(_, t)| approx_tokens(&t.text)).collect()
            }
        }
    }
}

/// Chapter documents of `path` in reading order.
pub fn list_chapters(path: &Path) -> anyhow::Result<Vec<ChapterRef>> {
    Ok(EpubBook::open(path)?.chapters())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{CommandFactory, Parser};

use tome_translator::epub::{default_fixed_path, default_output_path, fix_stylesheets, proofread_epub};
use tome_translator::models::gemini::ClientCache;
use tome_translator::pipeline::{
    init_default_config, list_chapters, BackendKind, ChapterRange, ConfigOverrides,
    PipelineConfig, RunStatus, TranslationRun, TranslatorPipeline,
};
use tome_translator::progress::{ConsoleProgress, LogSink};

#[derive(Parser, Debug)]
#[command(name = "tome-translator")]
#[command(about = "EPUB translator: chapters are sent to an LLM in chunks and written back in place", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Input .epub
    #[arg(value_name = "EPUB")]
    input: Option<PathBuf>,

    /// Output .epub (default: <input_stem>_translated.epub)
    #[arg(short, long, value_name = "EPUB")]
    output: Option<PathBuf>,

    /// Config file path (default: search for tome-translator.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the chapter documents with their numbers, then exit
    #[arg(long)]
    list_chapters: bool,

    /// Report paragraphs that still look untranslated or cut off, then exit (no LLM)
    #[arg(long)]
    proofread: bool,

    /// Link style/default.css from every document that lacks it (default output: <input_stem>_fixed.epub)
    #[arg(long)]
    fix_styles: bool,

    /// First chapter to translate (1-based, inclusive)
    #[arg(long)]
    start_chapter: Option<usize>,

    /// Last chapter to translate (1-based, inclusive)
    #[arg(long)]
    end_chapter: Option<usize>,

    /// Model name (gemini) or GGUF path (local)
    #[arg(long)]
    model: Option<String>,

    /// Backend: gemini or local
    #[arg(long)]
    backend: Option<String>,

    /// Target language, e.g. English
    #[arg(long)]
    target_lang: Option<String>,

    /// Only print errors and the final result
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let console: Arc<dyn LogSink> = Arc::new(ConsoleProgress::new(!args.quiet));

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let input = match args.input {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  tome-translator <book.epub>\n\nTIPS:\n  - Set GOOGLE_API_KEY (or [model] api_key_env) for the gemini backend.\n  - Default config search: tome-translator.toml (upwards), or set TOME_TRANSLATOR_CONFIG.\n"
            );
            return Ok(());
        }
    };

    if args.list_chapters {
        for (i, ch) in list_chapters(&input)?.iter().enumerate() {
            println!("{:>4}  {}", i + 1, ch.id);
        }
        return Ok(());
    }

    if args.proofread {
        let report = proofread_epub(&input)?;
        print!("{}", report.render());
        return Ok(());
    }

    if args.fix_styles {
        let output = args.output.unwrap_or_else(|| default_fixed_path(&input));
        let report = fix_stylesheets(&input, &output)?;
        match &report.output {
            Some(path) => console.success(&format!(
                "Linked the stylesheet in {} of {} documents. Wrote {}",
                report.fixed.len(),
                report.documents_scanned,
                path.display()
            )),
            None => console.success("No missing stylesheet links found; nothing written."),
        }
        return Ok(());
    }

    let output = args.output.unwrap_or_else(|| default_output_path(&input));
    let overrides = ConfigOverrides {
        config_path: args.config,
        backend: args.backend,
        model: args.model,
        target_lang: args.target_lang,
    };
    let cfg = PipelineConfig::resolve(&input, &output, overrides).context("build config")?;
    let range = ChapterRange {
        start: args.start_chapter,
        end: args.end_chapter,
    };

    let pipeline = TranslatorPipeline::new(cfg, Arc::clone(&console));
    let cancel = pipeline.cancel_token();
    if let Err(err) = ctrlc::set_handler(move || {
        if cancel.interrupt() {
            eprintln!("Interrupted again; exiting without waiting for the current chunk.");
            std::process::exit(130);
        }
        eprintln!("Stop requested; finishing the current chunk (Ctrl+C again to exit now).");
    }) {
        console.warn(&format!("Failed to install Ctrl+C handler: {err}"));
    }

    let cfg = pipeline.config();
    let run = match cfg.backend {
        BackendKind::Gemini => {
            let api_key = std::env::var(&cfg.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow!("set {} to your Gemini API key", cfg.api_key_env))?;
            let mut clients = ClientCache::default();
            let client = clients.client(&cfg.gemini, api_key.trim(), &cfg.prompts)?;
            pipeline.translate_epub(client, &input, &output, range)?.0
        }
        BackendKind::Local => run_local(&pipeline, &console, &input, &output, range)?,
    };

    finish(&run)
}

#[cfg(feature = "local")]
fn run_local(
    pipeline: &TranslatorPipeline,
    log: &Arc<dyn LogSink>,
    input: &Path,
    output: &Path,
    range: ChapterRange,
) -> anyhow::Result<TranslationRun> {
    use tome_translator::models::native::{LocalModel, LocalSettings};

    let cfg = pipeline.config();
    let settings = LocalSettings::from_section(
        &cfg.local,
        cfg.gemini.temperature,
        cfg.gemini.max_output_tokens,
        &cfg.target_lang,
    )?;
    log.info(&format!("Load model: {}", settings.model_path.display()));
    let model = LocalModel::load(settings, cfg.prompts.clone())?;
    Ok(pipeline.translate_epub(model, input, output, range)?.0)
}

#[cfg(not(feature = "local"))]
fn run_local(
    _pipeline: &TranslatorPipeline,
    _log: &Arc<dyn LogSink>,
    _input: &Path,
    _output: &Path,
    _range: ChapterRange,
) -> anyhow::Result<TranslationRun> {
    Err(anyhow!(
        "the local backend needs a build with `--features local`"
    ))
}

fn finish(run: &TranslationRun) -> anyhow::Result<()> {
    eprintln!("{}", run.summary());
    match &run.report.status {
        RunStatus::Aborted { reason } => Err(anyhow!("translation aborted: {reason}")),
        RunStatus::Completed | RunStatus::Cancelled => Ok(()),
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};

use super::executor::RetryPolicy;
use super::prompts::{default_prompt_files, PromptSet, DEFAULT_PROMPTS_DIR};
use crate::config::{
    find_default_config, load_config, AppConfig, LocalModelSection, CONFIG_ENV_VAR,
    DEFAULT_CONFIG_FILENAME,
};
use crate::models::gemini::{GeminiSettings, DEFAULT_ENDPOINT, DEFAULT_MODEL};

pub const DEFAULT_API_KEY_ENV: &str = "GOOGLE_API_KEY";
pub const DEFAULT_TARGET_LANG: &str = "English";
/// Output limit assumed when the backend cannot report one.
pub const FALLBACK_OUTPUT_TOKENS: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Gemini,
    Local,
}

impl BackendKind {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "gemini" => Ok(Self::Gemini),
            "local" | "llama" => Ok(Self::Local),
            other => Err(anyhow!("unknown backend: {other} (expected gemini or local)")),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub target_lang: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub config_path: PathBuf,

    pub backend: BackendKind,
    pub target_lang: String,

    pub token_limit_fraction: f64,
    pub max_chapters_per_chunk: Option<usize>,
    pub retry: RetryPolicy,

    pub progress_interval: Duration,
    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub log_max_chars: usize,

    pub gemini: GeminiSettings,
    pub api_key_env: String,
    pub local: LocalModelSection,

    pub prompts: PromptSet,
}

impl PipelineConfig {
    /// Finds and loads the config for a run over `input`, writing traces next to `output`.
    pub fn resolve(input: &Path, output: &Path, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let workdir = input
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let cfg_file = overrides
            .config_path
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
            .or_else(|| find_default_config(&workdir, DEFAULT_CONFIG_FILENAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            } else if overrides.config_path.is_some() {
                return Err(anyhow!("config file not found: {}", p.display()));
            }
        }
        let cfg_path = cfg_file.unwrap_or_else(|| workdir.join(DEFAULT_CONFIG_FILENAME));

        let output_dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or(workdir);
        Self::from_app_config(&file_cfg, cfg_path, &output_dir, overrides)
    }

    pub fn from_app_config(
        file_cfg: &AppConfig,
        config_path: PathBuf,
        output_dir: &Path,
        overrides: ConfigOverrides,
    ) -> anyhow::Result<Self> {
        let p = &file_cfg.pipeline;
        let m = &file_cfg.model;

        let backend = BackendKind::parse(
            overrides
                .backend
                .as_deref()
                .or(m.backend.as_deref())
                .unwrap_or("gemini"),
        )?;
        let target_lang = overrides
            .target_lang
            .or_else(|| p.target_lang.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TARGET_LANG.to_string());

        let token_limit_fraction = p.token_limit_fraction.unwrap_or(0.60);
        if !(token_limit_fraction > 0.0 && token_limit_fraction <= 1.0) {
            return Err(anyhow!(
                "token_limit_fraction must be in (0, 1], got {token_limit_fraction}"
            ));
        }
        let max_chapters_per_chunk = Some(p.max_chapters_per_chunk.unwrap_or(20)).filter(|n| *n > 0);

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_call_attempts: p.max_call_attempts.unwrap_or(defaults.max_call_attempts).max(1),
            failure_backoff: secs(p.failure_backoff_secs, defaults.failure_backoff, "failure_backoff_secs")?,
            quota_backoff: secs(p.quota_backoff_secs, defaults.quota_backoff, "quota_backoff_secs")?,
            quota_backoff_factor: p
                .quota_backoff_factor
                .unwrap_or(defaults.quota_backoff_factor)
                .max(1.0),
            quota_backoff_max: secs(
                p.quota_backoff_max_secs,
                defaults.quota_backoff_max,
                "quota_backoff_max_secs",
            )?,
            max_empty_resubmissions: p
                .max_empty_resubmissions
                .unwrap_or(defaults.max_empty_resubmissions),
            chunk_pause: secs(p.chunk_pause_secs, defaults.chunk_pause, "chunk_pause_secs")?,
        };
        let progress_interval = secs(
            p.progress_interval_secs,
            Duration::from_secs(1),
            "progress_interval_secs",
        )?;

        let trace_dir = p.trace_dir.clone().unwrap_or_else(|| "_trace".to_string());
        let trace_dir = if Path::new(&trace_dir).is_absolute() {
            PathBuf::from(trace_dir)
        } else {
            output_dir.join(trace_dir)
        };
        let trace_prompts = p.trace_prompts.unwrap_or(false);
        let log_max_chars = p.log_max_chars.unwrap_or(240);

        let defaults = GeminiSettings::default();
        let gemini = GeminiSettings {
            endpoint: m
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: overrides
                .model
                .clone()
                .or_else(|| m.name.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: m.timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
            temperature: m.temperature,
            max_output_tokens: m.max_output_tokens,
            target_lang: target_lang.clone(),
        };
        let api_key_env = m
            .api_key_env
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());

        let mut local = m.local.clone();
        if backend == BackendKind::Local {
            if let Some(model) = overrides.model {
                local.path = Some(PathBuf::from(model));
            }
            local.path = local.path.map(|path| {
                if path.is_relative() {
                    config_path
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join(path)
                } else {
                    path
                }
            });
        }

        let prompts = PromptSet::load(&config_path, file_cfg).context("load prompts")?;

        Ok(Self {
            config_path,
            backend,
            target_lang,
            token_limit_fraction,
            max_chapters_per_chunk,
            retry,
            progress_interval,
            trace_dir,
            trace_prompts,
            log_max_chars,
            gemini,
            api_key_env,
            local,
            prompts,
        })
    }

    /// Input budget per chunk derived from the model's output limit.
    pub fn safe_budget(&self, max_output_tokens: usize) -> usize {
        ((max_output_tokens as f64 * self.token_limit_fraction).floor() as usize).max(1)
    }
}

fn secs(v: Option<f64>, default: Duration, key: &str) -> anyhow::Result<Duration> {
    match v {
        None => Ok(default),
        Some(s) => Duration::try_from_secs_f64(s)
            .map_err(|_| anyhow!("{key} must be a non-negative number of seconds, got {s}")),
    }
}

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;

    for (fname, body) in default_prompt_files() {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_CONFIG_TOML: &str = r#"[pipeline]
target_lang = "English"

# Share of the model's output-token limit used as the input budget per chunk.
# Translations are usually longer than the source, so leave headroom.
token_limit_fraction = 0.6
max_chapters_per_chunk = 20

max_call_attempts = 2
failure_backoff_secs = 2.0
quota_backoff_secs = 30.0
quota_backoff_factor = 2.0
quota_backoff_max_secs = 300.0
max_empty_resubmissions = 2
chunk_pause_secs = 1.0

progress_interval_secs = 1.0
trace_dir = "_trace"
trace_prompts = false
log_max_chars = 240

[prompts]
translate = "prompts/translate.txt"
translate_retry = "prompts/translate_retry.txt"

[model]
backend = "gemini"
name = "gemini-2.5-flash"
api_key_env = "GOOGLE_API_KEY"
timeout_secs = 600
# max_output_tokens = 65536

# Used when backend = "local" (build with --features local).
[model.local]
# path = "gemma-3-12b-it-Q4_K_M.gguf"
template_hint = "gemma"
ctx_size = 16384
threads = -1
gpu_layers = -1
batch_size = 512
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn resolve(toml: &str, overrides: ConfigOverrides) -> anyhow::Result<PipelineConfig> {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = parse_config(toml).expect("parse");
        PipelineConfig::from_app_config(&cfg, dir.path().join(DEFAULT_CONFIG_FILENAME), dir.path(), overrides)
    }

    #[test]
    fn defaults_without_config() {
        let c = resolve("", ConfigOverrides::default()).expect("resolve");
        assert_eq!(c.backend, BackendKind::Gemini);
        assert_eq!(c.target_lang, "English");
        assert_eq!(c.max_chapters_per_chunk, Some(20));
        assert_eq!(c.retry, RetryPolicy::default());
        assert_eq!(c.gemini.model, DEFAULT_MODEL);
        assert_eq!(c.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(c.safe_budget(8192), 4915);
        assert_eq!(c.prompts, PromptSet::default());
    }

    #[test]
    fn cli_overrides_win() {
        let c = resolve(
            "[pipeline]\ntarget_lang = \"German\"\n[model]\nname = \"gemini-2.5-pro\"\n",
            ConfigOverrides {
                target_lang: Some("French".into()),
                model: Some("gemini-2.0-flash".into()),
                ..Default::default()
            },
        )
        .expect("resolve");
        assert_eq!(c.target_lang, "French");
        assert_eq!(c.gemini.target_lang, "French");
        assert_eq!(c.gemini.model, "gemini-2.0-flash");
    }

    #[test]
    fn policy_values_come_from_file() {
        let c = resolve(
            "[pipeline]\nmax_call_attempts = 0\nquota_backoff_secs = 5.0\nchunk_pause_secs = 0.0\nmax_chapters_per_chunk = 0\n",
            ConfigOverrides::default(),
        )
        .expect("resolve");
        assert_eq!(c.retry.max_call_attempts, 1);
        assert_eq!(c.retry.quota_backoff, Duration::from_secs(5));
        assert!(c.retry.chunk_pause.is_zero());
        assert_eq!(c.max_chapters_per_chunk, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(resolve("[pipeline]\ntoken_limit_fraction = 1.5\n", ConfigOverrides::default()).is_err());
        assert!(resolve("[pipeline]\nchunk_pause_secs = -1.0\n", ConfigOverrides::default()).is_err());
        assert!(resolve("[model]\nbackend = \"openai\"\n", ConfigOverrides::default()).is_err());
    }

    #[test]
    fn local_model_path_is_relative_to_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = parse_config("[model]\nbackend = \"local\"\n[model.local]\npath = \"m.gguf\"\n").expect("parse");
        let cfg_path = dir.path().join(DEFAULT_CONFIG_FILENAME);
        let c = PipelineConfig::from_app_config(&cfg, cfg_path, dir.path(), ConfigOverrides::default())
            .expect("resolve");
        assert_eq!(c.backend, BackendKind::Local);
        assert_eq!(c.local.path, Some(dir.path().join("m.gguf")));
    }

    #[test]
    fn init_writes_loadable_config_and_prompts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = init_default_config(dir.path(), false).expect("init");
        assert!(dir.path().join("prompts/translate.txt").exists());
        assert!(dir.path().join("prompts/translate_retry.txt").exists());

        let cfg = load_config(&path).expect("load");
        let c = PipelineConfig::from_app_config(&cfg, path.clone(), dir.path(), ConfigOverrides::default())
            .expect("resolve");
        assert_eq!(c.retry, RetryPolicy::default());
        assert_eq!(c.prompts, PromptSet::default());

        std::fs::write(&path, "# edited").expect("write");
        init_default_config(dir.path(), false).expect("init again");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "# edited");
    }
}

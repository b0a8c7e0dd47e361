use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "tome-translator.toml";
pub const CONFIG_ENV_VAR: &str = "TOME_TRANSLATOR_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub prompts: PromptsSection,
    #[serde(default)]
    pub model: ModelSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    #[serde(default)]
    pub target_lang: Option<String>,

    /// Share of the model's output limit used as the per-chunk input budget.
    /// Translations run longer than their source, so this stays well below 1.0.
    #[serde(default)]
    pub token_limit_fraction: Option<f64>,
    #[serde(default)]
    pub max_chapters_per_chunk: Option<usize>,

    /// Total model calls per chunk attempt when the call itself fails.
    #[serde(default)]
    pub max_call_attempts: Option<u32>,
    #[serde(default)]
    pub failure_backoff_secs: Option<f64>,
    #[serde(default)]
    pub quota_backoff_secs: Option<f64>,
    #[serde(default)]
    pub quota_backoff_factor: Option<f64>,
    #[serde(default)]
    pub quota_backoff_max_secs: Option<f64>,
    /// How often a single chapter may come back without a usable body before it is skipped.
    #[serde(default)]
    pub max_empty_resubmissions: Option<u32>,
    #[serde(default)]
    pub chunk_pause_secs: Option<f64>,

    #[serde(default)]
    pub progress_interval_secs: Option<f64>,
    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
    #[serde(default)]
    pub log_max_chars: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub translate_retry: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ModelSection {
    /// "gemini" (default) or "local".
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Skips the output-limit lookup when set.
    #[serde(default)]
    pub max_output_tokens: Option<usize>,
    #[serde(default)]
    pub local: LocalModelSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LocalModelSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub template_hint: Option<String>,
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> anyhow::Result<AppConfig> {
    toml::from_str(text).context("parse config toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = parse_config("").expect("parse");
        assert!(cfg.pipeline.token_limit_fraction.is_none());
        assert!(cfg.model.backend.is_none());
        assert!(cfg.model.local.path.is_none());
    }

    #[test]
    fn parses_nested_sections() {
        let cfg = parse_config(
            r#"
[pipeline]
token_limit_fraction = 0.5
max_chapters_per_chunk = 8
quota_backoff_secs = 15.0

[prompts]
translate = "p/t.txt"

[model]
backend = "local"
name = "gemini-2.5-pro"

[model.local]
path = "models/gemma.gguf"
ctx_size = 8192
"#,
        )
        .expect("parse");
        assert_eq!(cfg.pipeline.token_limit_fraction, Some(0.5));
        assert_eq!(cfg.pipeline.max_chapters_per_chunk, Some(8));
        assert_eq!(cfg.pipeline.quota_backoff_secs, Some(15.0));
        assert_eq!(cfg.prompts.translate.as_deref(), Some("p/t.txt"));
        assert_eq!(cfg.model.backend.as_deref(), Some("local"));
        assert_eq!(cfg.model.local.ctx_size, Some(8192));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse_config("[pipeline\nx = 1").is_err());
    }

    #[test]
    fn finds_file_in_parent_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILENAME), "").expect("write");
        let found = find_file_upwards(&nested, DEFAULT_CONFIG_FILENAME, 4).expect("found");
        assert_eq!(found, dir.path().join(DEFAULT_CONFIG_FILENAME));
        assert!(find_file_upwards(&nested, "missing.toml", 1).is_none());
    }
}

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::{AppConfig, PromptsSection};

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

pub const DEFAULT_TRANSLATE: &str = "translate.txt";
pub const DEFAULT_TRANSLATE_RETRY: &str = "translate_retry.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptSet {
    pub translate: String,
    pub translate_retry: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            translate: DEFAULT_TRANSLATE_TEXT.to_string(),
            translate_retry: DEFAULT_TRANSLATE_RETRY_TEXT.to_string(),
        }
    }
}

impl PromptSet {
    /// Loads templates named in `[prompts]`, then `prompts/*.txt` next to the config, then
    /// the built-in text. A path named explicitly in the config must exist.
    pub fn load(config_path: &Path, cfg: &AppConfig) -> anyhow::Result<Self> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let p = &cfg.prompts;
        Ok(Self {
            translate: read_prompt(config_dir, p, "translate", DEFAULT_TRANSLATE)?
                .unwrap_or_else(|| DEFAULT_TRANSLATE_TEXT.to_string()),
            translate_retry: read_prompt(config_dir, p, "translate_retry", DEFAULT_TRANSLATE_RETRY)?
                .unwrap_or_else(|| DEFAULT_TRANSLATE_RETRY_TEXT.to_string()),
        })
    }

    pub fn render(&self, chapters: &str, target_lang: &str, is_retry: bool) -> String {
        let template = if is_retry {
            &self.translate_retry
        } else {
            &self.translate
        };
        render_template(
            template,
            &[("target_lang", target_lang), ("chapters", chapters)],
        )
    }
}

fn read_prompt(
    config_dir: &Path,
    p: &PromptsSection,
    key: &str,
    default_filename: &str,
) -> anyhow::Result<Option<String>> {
    let configured = match key {
        "translate" => p.translate.clone(),
        "translate_retry" => p.translate_retry.clone(),
        other => return Err(anyhow!("unknown prompt key: {other}")),
    };

    let path = match configured {
        Some(path) => {
            let mut path = PathBuf::from(path);
            if path.is_relative() {
                path = config_dir.join(&path);
            }
            if !path.exists() {
                return Err(anyhow!(
                    "prompt file not found for {key}: {} (run: tome-translator --init-config)",
                    path.display()
                ));
            }
            path
        }
        None => {
            let path = config_dir.join(DEFAULT_PROMPTS_DIR).join(default_filename);
            if !path.exists() {
                return Ok(None);
            }
            path
        }
    };
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("read prompt: {}", path.display()))?;
    Ok(Some(text))
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_TRANSLATE, DEFAULT_TRANSLATE_TEXT),
        (DEFAULT_TRANSLATE_RETRY, DEFAULT_TRANSLATE_RETRY_TEXT),
    ]
}

pub const DEFAULT_TRANSLATE_TEXT: &str = r#"Translate the following novel chapters into {{target_lang}}.

Rules:
- Every chapter starts with a line like [CHAPTER_ID::...] and ends with the line [CHAPTER_END].
  Copy both marker lines exactly around each translated chapter, in the same order.
- If a chapter has a title, put the translated title on its first line in double asterisks,
  like this: **Chapter Title**. Keep chapter numbers: **Chapter 1: The Beginning**.
- Keep placeholder lines like [IMAGE_PLACEHOLDER_N] exactly as they appear.
- Keep *italics* and **bold** formatting from the source.
- Do NOT summarize or omit content. Output ONLY the translated chapters.

{{chapters}}"#;

pub const DEFAULT_TRANSLATE_RETRY_TEXT: &str = r#"Translate the following novel chapters into {{target_lang}}.

IMPORTANT: an earlier answer for this text lost its chapter markers. Follow the format strictly.

Rules:
- Every chapter starts with a line like [CHAPTER_ID::...] and ends with the line [CHAPTER_END].
  Each translated chapter MUST begin with its [CHAPTER_ID::...] line copied character for
  character and MUST end with [CHAPTER_END]. Never merge two chapters.
- If a chapter has a title, put the translated title on its first line in double asterisks,
  like this: **Chapter Title**.
- Keep placeholder lines like [IMAGE_PLACEHOLDER_N] exactly as they appear.
- Do NOT summarize or omit content. Output ONLY the translated chapters, no commentary.

{{chapters}}"#;

//! llama.cpp backend for running a GGUF model in-process.

use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use encoding_rs::UTF_8;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::DecodeError;
use once_cell::sync::OnceCell;

use super::{ModelAdapter, ModelError, ModelErrorKind, ModelReply};
use crate::config::LocalModelSection;
use crate::pipeline::prompts::PromptSet;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> anyhow::Result<&'static LlamaBackend> {
    BACKEND.get_or_try_init(|| LlamaBackend::init().context("init llama backend"))
}

#[derive(Clone, Debug)]
pub struct LocalSettings {
    pub model_path: PathBuf,
    pub template_hint: Option<String>,
    pub ctx_size: u32,
    pub threads: i32,
    pub gpu_layers: i32,
    pub batch_size: u32,
    pub temperature: f32,
    pub max_output_tokens: Option<usize>,
    pub target_lang: String,
    pub seed: u32,
}

impl LocalSettings {
    pub fn from_section(
        section: &LocalModelSection,
        temperature: Option<f32>,
        max_output_tokens: Option<usize>,
        target_lang: &str,
    ) -> anyhow::Result<Self> {
        let model_path = section
            .path
            .clone()
            .ok_or_else(|| anyhow!("[model.local] path is required for the local backend"))?;
        Ok(Self {
            model_path,
            template_hint: section.template_hint.clone(),
            ctx_size: section.ctx_size.unwrap_or(8192),
            threads: section.threads.unwrap_or(-1),
            gpu_layers: section.gpu_layers.unwrap_or(-1),
            batch_size: section.batch_size.unwrap_or(512),
            temperature: temperature.unwrap_or(0.3),
            max_output_tokens,
            target_lang: target_lang.to_string(),
            seed: 42,
        })
    }
}

enum Generation {
    Finished(String),
    HitCap(String),
}

pub struct LocalModel {
    name: String,
    settings: LocalSettings,
    prompts: PromptSet,
    template: LlamaChatTemplate,
    ctx_size: u32,
    // Declared before `model` so it is dropped first; it borrows the boxed model.
    ctx: LlamaContext<'static>,
    model: Box<LlamaModel>,
}

// SAFETY: the context and model are only reached through `&mut self`, so they are never
// used from two threads at once; llama.cpp handles may move between threads.
unsafe impl Send for LocalModel {}

impl LocalModel {
    pub fn load(settings: LocalSettings, prompts: PromptSet) -> anyhow::Result<Self> {
        if !settings.model_path.exists() {
            return Err(anyhow!("model not found: {}", settings.model_path.display()));
        }
        let backend = backend()?;

        let mut model_params = LlamaModelParams::default();
        if settings.gpu_layers == -1 {
            // llama.cpp clamps values above n_layer to "all layers".
            model_params = model_params.with_n_gpu_layers(9999);
        } else if settings.gpu_layers >= 0 {
            model_params = model_params.with_n_gpu_layers(settings.gpu_layers as u32);
        }
        let model = Box::new(
            LlamaModel::load_from_file(backend, &settings.model_path, &model_params)
                .with_context(|| format!("load model {}", settings.model_path.display()))?,
        );
        // SAFETY: the box keeps the model at a stable address for as long as `Self` lives,
        // and `ctx` is dropped before `model` (field order).
        let model_ptr: *const LlamaModel = &*model;
        let model_ref: &'static LlamaModel = unsafe { &*model_ptr };

        let ctx_train = model_ref.n_ctx_train();
        let mut ctx_size = settings.ctx_size;
        if ctx_size == 0 {
            ctx_size = ctx_train.max(4096);
        }
        if ctx_train > 0 && ctx_size > ctx_train {
            ctx_size = ctx_train;
        }
        ctx_size = ctx_size.max(256);

        let n_batch = settings.batch_size.clamp(8, 65536);
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(ctx_size))
            .with_n_batch(n_batch)
            .with_n_ubatch(n_batch);
        if settings.threads > 0 {
            ctx_params = ctx_params
                .with_n_threads(settings.threads)
                .with_n_threads_batch(settings.threads);
        }
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .context("create model context")?;

        let template = match model_ref.chat_template(None) {
            Ok(t) => t,
            Err(_) => {
                let hint = settings.template_hint.as_deref().unwrap_or("chatml");
                LlamaChatTemplate::new(hint).context("build fallback chat template")?
            }
        };

        let name = settings
            .model_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());
        Ok(Self {
            name,
            settings,
            prompts,
            template,
            ctx_size,
            ctx,
            model,
        })
    }

    fn output_cap(&self) -> usize {
        self.settings
            .max_output_tokens
            .unwrap_or(self.ctx_size as usize)
    }

    fn generate(&mut self, user_prompt: &str) -> Result<Generation, ModelError> {
        let chat = vec![LlamaChatMessage::new("user".to_string(), user_prompt.to_string())
            .map_err(|e| ModelError::other(format!("build user message: {e}")))?];
        let prompt = self
            .model
            .apply_chat_template(&self.template, &chat, true)
            .map_err(|e| ModelError::other(format!("apply chat template: {e}")))?;

        self.ctx.clear_kv_cache();
        let prompt_tokens = self
            .model
            .str_to_token(&prompt, decide_add_bos(&prompt))
            .map_err(|e| ModelError::other(format!("tokenize prompt: {e}")))?;
        if prompt_tokens.is_empty() {
            return Err(ModelError::other("empty prompt tokens"));
        }
        let n_ctx = self.ctx.n_ctx() as usize;
        if prompt_tokens.len() + 1 >= n_ctx {
            return Err(ModelError::new(
                ModelErrorKind::TokenLimit,
                format!("prompt_too_long: prompt_tokens={} n_ctx={n_ctx}", prompt_tokens.len()),
            ));
        }
        let max_tokens = self
            .output_cap()
            .min(n_ctx.saturating_sub(prompt_tokens.len() + 1));

        let n_batch = (self.ctx.n_batch() as usize).max(1);
        let last_index = prompt_tokens.len() - 1;
        for (chunk_no, chunk) in prompt_tokens.chunks(n_batch).enumerate() {
            let start = chunk_no * n_batch;
            let mut batch = LlamaBatch::new(chunk.len().max(512), 1);
            for (i, token) in chunk.iter().copied().enumerate() {
                batch
                    .add(token, (start + i) as i32, &[0], start + i == last_index)
                    .map_err(|e| ModelError::other(format!("batch.add(prompt): {e}")))?;
            }
            self.decode_checked(&mut batch, "decode prompt")?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(self.settings.temperature),
            LlamaSampler::top_p(0.95, 1),
            if self.settings.temperature <= 0.0 {
                LlamaSampler::greedy()
            } else {
                LlamaSampler::dist(self.settings.seed)
            },
        ]);
        sampler.accept_many(&prompt_tokens);

        let mut decoder = UTF_8.new_decoder();
        let mut out = String::new();
        let mut batch = LlamaBatch::new(512, 1);
        let mut n_cur = prompt_tokens.len() as i32;
        let mut finished = false;
        for _ in 0..max_tokens {
            let token = sampler.sample(&self.ctx, -1);
            if self.model.is_eog_token(token) {
                finished = true;
                break;
            }
            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| ModelError::other(format!("token_to_bytes: {e}")))?;
            let mut piece = String::with_capacity(32);
            let _ = decoder.decode_to_string(&bytes, &mut piece, false);
            out.push_str(&piece);

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| ModelError::other(format!("batch.add(gen): {e}")))?;
            n_cur += 1;
            self.decode_checked(&mut batch, "decode(gen)")?;
        }
        let mut tail = String::new();
        let _ = decoder.decode_to_string(&[], &mut tail, true);
        out.push_str(&tail);

        Ok(if finished {
            Generation::Finished(out)
        } else {
            Generation::HitCap(out)
        })
    }

    fn decode_checked(&mut self, batch: &mut LlamaBatch, stage: &str) -> Result<(), ModelError> {
        self.ctx.decode(batch).map_err(|err| match err {
            DecodeError::Unknown(-2) => ModelError::other(format!(
                "llama_decode threw a foreign exception (likely OOM) (model={}, stage={stage})",
                self.name
            )),
            DecodeError::NoKvCacheSlot => ModelError::new(
                ModelErrorKind::TokenLimit,
                format!("no kv cache slot (model={}, stage={stage})", self.name),
            ),
            other => ModelError::other(format!("{stage}: {other}")),
        })
    }
}

impl ModelAdapter for LocalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_model(&mut self, chapters: &str, is_retry: bool) -> ModelReply {
        let prompt = self
            .prompts
            .render(chapters, &self.settings.target_lang, is_retry);
        match self.generate(&prompt) {
            Ok(Generation::Finished(text)) => ModelReply::Complete(text),
            Ok(Generation::HitCap(text)) => ModelReply::LengthLimited(text),
            Err(err) => ModelReply::Error(err),
        }
    }

    fn count_tokens(&mut self, text: &str) -> anyhow::Result<usize> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Never)
            .context("tokenize text")?;
        Ok(tokens.len())
    }

    fn max_output_tokens(&mut self) -> anyhow::Result<usize> {
        Ok(self.output_cap())
    }
}

fn decide_add_bos(prompt: &str) -> AddBos {
    let p = prompt.trim_start();
    // Templates that already open with a BOS-like token must not get a second one.
    if p.starts_with("<s>")
        || p.starts_with("<|begin_of_text|>")
        || p.starts_with("<bos>")
        || p.starts_with("<BOS>")
        || p.starts_with("<|startoftext|>")
    {
        AddBos::Never
    } else {
        AddBos::Always
    }
}

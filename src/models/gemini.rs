//! Gemini backend over the Generative Language REST API.

use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{ModelAdapter, ModelError, ModelErrorKind, ModelReply};
use crate::pipeline::prompts::PromptSet;
use crate::textutil::clip_for_log;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Clone, Debug, PartialEq)]
pub struct GeminiSettings {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<usize>,
    pub target_lang: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(600),
            temperature: None,
            max_output_tokens: None,
            target_lang: "English".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::blocking::Client,
    settings: GeminiSettings,
    prompts: PromptSet,
    api_key: String,
    fingerprint: String,
    output_limit: Option<usize>,
}

impl GeminiClient {
    pub fn connect(
        settings: GeminiSettings,
        api_key: &str,
        prompts: PromptSet,
    ) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("Gemini API key is empty"));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        let fingerprint = credential_fingerprint(&settings.endpoint, &settings.model, api_key);
        Ok(Self {
            http,
            settings,
            prompts,
            api_key: api_key.trim().to_string(),
            fingerprint,
            output_limit: None,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/{}{suffix}",
            self.settings.endpoint.trim_end_matches('/'),
            model_path(&self.settings.model)
        )
    }

    /// `generationConfig.maxOutputTokens`: the configured override, else the reported limit.
    fn generate_body(&self, prompt: &str) -> Value {
        let cap = self.settings.max_output_tokens.or(self.output_limit);
        generate_request_body(prompt, self.settings.temperature, cap)
    }

    fn post(&self, url: &str, body: &Value) -> Result<(u16, String), reqwest::Error> {
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()?;
        let status = resp.status().as_u16();
        let text = resp.text()?;
        Ok((status, text))
    }
}

impl ModelAdapter for GeminiClient {
    fn name(&self) -> &str {
        &self.settings.model
    }

    fn call_model(&mut self, chapters: &str, is_retry: bool) -> ModelReply {
        let prompt = self
            .prompts
            .render(chapters, &self.settings.target_lang, is_retry);
        let body = self.generate_body(&prompt);
        let url = self.url(":generateContent");
        let (status, text) = match self.post(&url, &body) {
            Ok(v) => v,
            Err(err) => return ModelReply::Error(ModelError::other(format!("request failed: {err}"))),
        };
        if !(200..300).contains(&status) {
            let kind = classify_http_error(status, &text);
            return ModelReply::Error(ModelError::new(
                kind,
                format!("HTTP {status}: {}", clip_for_log(&text, 300)),
            ));
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(v) => parse_generate_response(&v),
            Err(err) => ModelReply::Error(ModelError::other(format!("malformed response: {err}"))),
        }
    }

    fn count_tokens(&mut self, text: &str) -> anyhow::Result<usize> {
        let body = json!({ "contents": [{ "parts": [{ "text": text }] }] });
        let url = self.url(":countTokens");
        let (status, resp) = self.post(&url, &body).context("countTokens request")?;
        if !(200..300).contains(&status) {
            return Err(anyhow!("countTokens HTTP {status}: {}", clip_for_log(&resp, 300)));
        }
        let v: Value = serde_json::from_str(&resp).context("parse countTokens response")?;
        v["totalTokens"]
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow!("countTokens response without totalTokens"))
    }

    fn max_output_tokens(&mut self) -> anyhow::Result<usize> {
        if let Some(n) = self.settings.max_output_tokens.or(self.output_limit) {
            return Ok(n);
        }
        let resp = self
            .http
            .get(self.url(""))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .context("model info request")?;
        let status = resp.status().as_u16();
        let text = resp.text().context("read model info")?;
        if !(200..300).contains(&status) {
            return Err(anyhow!("model info HTTP {status}: {}", clip_for_log(&text, 300)));
        }
        let v: Value = serde_json::from_str(&text).context("parse model info")?;
        let limit = v["outputTokenLimit"]
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow!("model info without outputTokenLimit"))?;
        self.output_limit = Some(limit);
        Ok(limit)
    }
}

/// Holds at most one client, rebuilt when the credential identity or the HTTP timeout changes.
#[derive(Default)]
pub struct ClientCache {
    current: Option<GeminiClient>,
    connects: usize,
}

impl ClientCache {
    pub fn client(
        &mut self,
        settings: &GeminiSettings,
        api_key: &str,
        prompts: &PromptSet,
    ) -> anyhow::Result<GeminiClient> {
        let fp = credential_fingerprint(&settings.endpoint, &settings.model, api_key);
        let cached = self
            .current
            .as_ref()
            .filter(|c| c.fingerprint == fp && c.settings.timeout == settings.timeout);
        let mut client = match cached {
            Some(c) => c.clone(),
            None => {
                let c = GeminiClient::connect(settings.clone(), api_key, prompts.clone())?;
                self.connects += 1;
                self.current = Some(c.clone());
                c
            }
        };
        client.settings = settings.clone();
        client.prompts = prompts.clone();
        Ok(client)
    }

    pub fn connects(&self) -> usize {
        self.connects
    }

    pub fn invalidate(&mut self) {
        self.current = None;
    }
}

pub fn credential_fingerprint(endpoint: &str, model: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.trim_end_matches('/').as_bytes());
    hasher.update(b"\n");
    hasher.update(model_path(model).as_bytes());
    hasher.update(b"\n");
    hasher.update(api_key.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn model_path(model: &str) -> String {
    let model = model.trim();
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

pub fn generate_request_body(
    prompt: &str,
    temperature: Option<f32>,
    max_output_tokens: Option<usize>,
) -> Value {
    let safety: Vec<Value> = SAFETY_CATEGORIES
        .iter()
        .map(|c| json!({ "category": c, "threshold": "BLOCK_NONE" }))
        .collect();
    let mut generation = json!({});
    if let Some(t) = temperature {
        generation["temperature"] = json!(t);
    }
    if let Some(n) = max_output_tokens {
        generation["maxOutputTokens"] = json!(n);
    }
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "safetySettings": safety,
        "generationConfig": generation,
    })
}

pub fn classify_http_error(status: u16, body: &str) -> ModelErrorKind {
    let lower = body.to_ascii_lowercase();
    if status == 429
        || status == 503
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
    {
        return ModelErrorKind::Quota;
    }
    if status == 413 {
        return ModelErrorKind::TokenLimit;
    }
    if status == 400
        && lower.contains("token")
        && (lower.contains("exceed") || lower.contains("too long") || lower.contains("maximum"))
    {
        return ModelErrorKind::TokenLimit;
    }
    ModelErrorKind::Other
}

pub fn parse_generate_response(v: &Value) -> ModelReply {
    if let Some(reason) = v["promptFeedback"]["blockReason"].as_str() {
        return ModelReply::Error(ModelError::other(format!("prompt blocked: {reason}")));
    }
    let cand = &v["candidates"][0];
    if cand.is_null() {
        return ModelReply::Error(ModelError::other("response has no candidates"));
    }
    let text: String = cand["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p["thought"].as_bool().unwrap_or(false))
                .filter_map(|p| p["text"].as_str())
                .collect()
        })
        .unwrap_or_default();

    match cand["finishReason"].as_str().unwrap_or("STOP") {
        "MAX_TOKENS" => ModelReply::LengthLimited(text),
        "STOP" if !text.trim().is_empty() => ModelReply::Complete(text),
        "STOP" => ModelReply::Error(ModelError::other("empty response text")),
        other => ModelReply::Error(ModelError::other(format!("generation stopped: {other}"))),
    }
}

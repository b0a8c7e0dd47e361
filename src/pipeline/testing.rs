use std::sync::{Arc, Mutex};

use crate::models::{ModelAdapter, ModelError, ModelReply};
use crate::sentinels::{decode_id, id_marker, ID_MARKER_RE};

type Script = Box<dyn FnMut(&[String], bool) -> ModelReply + Send>;

/// In-memory adapter whose replies are decided by a closure over the requested ids.
pub struct ScriptedModel {
    script: Script,
    calls: Arc<Mutex<Vec<(Vec<String>, bool)>>>,
}

impl std::fmt::Debug for ScriptedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedModel").finish_non_exhaustive()
    }
}

impl ScriptedModel {
    pub fn new(script: impl FnMut(&[String], bool) -> ModelReply + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Plays the replies in order, then fails every further call.
    pub fn from_replies(replies: Vec<ModelReply>) -> Self {
        let mut it = replies.into_iter();
        Self::new(move |_, _| {
            it.next()
                .unwrap_or_else(|| ModelReply::Error(ModelError::other("script exhausted")))
        })
    }

    /// Translates whatever it is given.
    pub fn echo() -> Self {
        Self::new(|ids, _| ModelReply::Complete(translated(ids)))
    }

    pub fn requested(&self) -> Vec<Vec<String>> {
        self.log().iter().map(|(ids, _)| ids.clone()).collect()
    }

    pub fn retry_flags(&self) -> Vec<bool> {
        self.log().iter().map(|(_, f)| *f).collect()
    }

    fn log(&self) -> Vec<(Vec<String>, bool)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ModelAdapter for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn call_model(&mut self, chapters: &str, is_retry: bool) -> ModelReply {
        let ids = requested_ids(chapters);
        self.calls
            .lock()
            .expect("calls lock")
            .push((ids.clone(), is_retry));
        (self.script)(&ids, is_retry)
    }

    fn count_tokens(&mut self, text: &str) -> anyhow::Result<usize> {
        Ok(text.chars().count() / 4)
    }

    fn max_output_tokens(&mut self) -> anyhow::Result<usize> {
        Ok(8192)
    }
}

pub fn requested_ids(prompt: &str) -> Vec<String> {
    ID_MARKER_RE
        .captures_iter(prompt)
        .filter_map(|c| c.get(1).map(|m| decode_id(m.as_str())))
        .collect()
}

/// Well-formed response body translating every id as `T(<id>)`.
pub fn translated<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter()
        .map(|id| {
            let id = id.as_ref();
            format!("{}\nT({id})\n[CHAPTER_END]\n", id_marker(id))
        })
        .collect()
}

//! Text-generation backends behind one call contract.
//!
//! The pipeline never sees HTTP or llama.cpp types: an adapter turns a block of tagged
//! chapters into a [`ModelReply`] that says how generation ended, and the attempt executor
//! classifies that into a translation outcome.

use std::fmt;

pub mod gemini;
#[cfg(feature = "local")]
pub mod native;

/// Why a call produced no usable text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// Rate limit, exhausted quota or an overloaded service. Retrying later can help.
    Quota,
    /// The request is larger than the model accepts, regardless of timing.
    TokenLimit,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Other, message)
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Raw result of one generation call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelReply {
    /// Generation ended on its own.
    Complete(String),
    /// Generation hit the output-token cap; the text is cut off somewhere.
    LengthLimited(String),
    Error(ModelError),
}

pub trait ModelAdapter: Send {
    fn name(&self) -> &str;

    /// Translates a block of tagged chapters. `is_retry` asks for stricter formatting
    /// instructions because an earlier submission of this material came back unusable.
    fn call_model(&mut self, chapters: &str, is_retry: bool) -> ModelReply;

    fn count_tokens(&mut self, text: &str) -> anyhow::Result<usize>;

    fn max_output_tokens(&mut self) -> anyhow::Result<usize>;
}

impl<M: ModelAdapter + ?Sized> ModelAdapter for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call_model(&mut self, chapters: &str, is_retry: bool) -> ModelReply {
        (**self).call_model(chapters, is_retry)
    }

    fn count_tokens(&mut self, text: &str) -> anyhow::Result<usize> {
        (**self).count_tokens(text)
    }

    fn max_output_tokens(&mut self) -> anyhow::Result<usize> {
        (**self).max_output_tokens()
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::trace::TraceWriter;
use super::unit::Chunk;
use crate::models::{ModelAdapter, ModelErrorKind, ModelReply};
use crate::progress::LogSink;
use crate::sentinels::trim_to_last_boundary;
use crate::textutil::clip_for_log;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationStatus {
    Success,
    OutputTruncated,
    TokenLimitExceeded,
    QuotaExceeded,
    Failed,
}

impl fmt::Display for TranslationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::OutputTruncated => "OUTPUT_TRUNCATED",
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationOutcome {
    pub status: TranslationStatus,
    /// Present for `Success` and `OutputTruncated` (already cut to the last whole chapter).
    pub raw_text: Option<String>,
    pub detail: Option<String>,
}

impl TranslationOutcome {
    fn with_text(status: TranslationStatus, text: String) -> Self {
        Self {
            status,
            raw_text: Some(text),
            detail: None,
        }
    }

    fn without_text(status: TranslationStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            raw_text: None,
            detail: Some(detail.into()),
        }
    }
}

/// Retry and pacing constants for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Model calls per attempt when the call fails outright; at least one.
    pub max_call_attempts: u32,
    pub failure_backoff: Duration,
    pub quota_backoff: Duration,
    pub quota_backoff_factor: f64,
    pub quota_backoff_max: Duration,
    pub max_empty_resubmissions: u32,
    pub chunk_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_call_attempts: 2,
            failure_backoff: Duration::from_secs(2),
            quota_backoff: Duration::from_secs(30),
            quota_backoff_factor: 2.0,
            quota_backoff_max: Duration::from_secs(300),
            max_empty_resubmissions: 2,
            chunk_pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Same counts as the default policy, no waiting.
    pub fn immediate() -> Self {
        Self {
            failure_backoff: Duration::ZERO,
            quota_backoff: Duration::ZERO,
            quota_backoff_max: Duration::ZERO,
            chunk_pause: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Wait before call `attempt + 1` after call `attempt` (0-based) failed.
    pub fn failure_delay(&self, attempt: u32) -> Duration {
        self.failure_backoff.saturating_mul(attempt.saturating_add(2))
    }

    /// Wait after the `streak`-th consecutive quota rejection (0-based).
    pub fn quota_delay(&self, streak: u32) -> Duration {
        let exp = streak.min(64) as i32;
        let secs = self.quota_backoff.as_secs_f64() * self.quota_backoff_factor.max(1.0).powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.quota_backoff_max)
            .min(self.quota_backoff_max)
    }
}

/// Maps one raw model reply onto the pipeline's outcome set.
pub fn classify_reply(reply: ModelReply) -> TranslationOutcome {
    match reply {
        ModelReply::Complete(text) if text.trim().is_empty() => {
            TranslationOutcome::without_text(TranslationStatus::Failed, "empty response")
        }
        ModelReply::Complete(text) => TranslationOutcome::with_text(TranslationStatus::Success, text),
        ModelReply::LengthLimited(text) => TranslationOutcome::with_text(
            TranslationStatus::OutputTruncated,
            trim_to_last_boundary(&text).to_string(),
        ),
        ModelReply::Error(err) => {
            let status = match err.kind {
                ModelErrorKind::Quota => TranslationStatus::QuotaExceeded,
                ModelErrorKind::TokenLimit => TranslationStatus::TokenLimitExceeded,
                ModelErrorKind::Other => TranslationStatus::Failed,
            };
            TranslationOutcome::without_text(status, err.message)
        }
    }
}

pub struct AttemptExecutor<M: ModelAdapter> {
    model: M,
    policy: RetryPolicy,
    log: Arc<dyn LogSink>,
    trace: TraceWriter,
    log_max_chars: usize,
    calls: usize,
}

impl<M: ModelAdapter> AttemptExecutor<M> {
    pub fn new(model: M, policy: RetryPolicy, log: Arc<dyn LogSink>) -> Self {
        Self {
            model,
            policy,
            log,
            trace: TraceWriter::disabled(),
            log_max_chars: 240,
            calls: 0,
        }
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_log_max_chars(mut self, n: usize) -> Self {
        self.log_max_chars = n;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Total model calls made so far, internal retries included.
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Submits a chunk, retrying outright call failures up to the policy limit.
    ///
    /// Quota and token-limit rejections return immediately; they are the caller's to handle.
    pub fn attempt(&mut self, chunk: &Chunk, is_retry: bool) -> TranslationOutcome {
        let text = chunk.prompt_text();
        let max_attempts = self.policy.max_call_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            self.calls += 1;
            let call = self.calls;
            let _ = self
                .trace
                .write_call_text(call, chunk.first_id(), chunk.last_id(), "input", &text);

            let reply = self.model.call_model(&text, is_retry || attempt > 0);
            if let ModelReply::Complete(out) | ModelReply::LengthLimited(out) = &reply {
                let _ = self
                    .trace
                    .write_call_text(call, chunk.first_id(), chunk.last_id(), "output", out);
            }
            let outcome = classify_reply(reply);

            if outcome.status == TranslationStatus::Failed && attempt + 1 < max_attempts {
                let wait = self.policy.failure_delay(attempt);
                self.log.warn(&format!(
                    "Model call failed ({}). Waiting {}s before retrying ({}/{})...",
                    clip_for_log(outcome.detail.as_deref().unwrap_or("unknown error"), self.log_max_chars),
                    wait.as_secs(),
                    attempt + 1,
                    max_attempts - 1
                ));
                std::thread::sleep(wait);
                attempt += 1;
                continue;
            }
            return outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelError;
    use crate::pipeline::testing::ScriptedModel;
    use crate::pipeline::unit::unit;
    use crate::progress::testing::MemoryLog;
    use crate::progress::LogLevel;

    fn chunk(ids: &[&str]) -> Chunk {
        Chunk::new(ids.iter().map(|id| unit(id, 1)).collect()).expect("chunk")
    }

    #[test]
    fn complete_reply_is_success() {
        let out = classify_reply(ModelReply::Complete("x".into()));
        assert_eq!(out.status, TranslationStatus::Success);
        assert_eq!(out.raw_text.as_deref(), Some("x"));
    }

    #[test]
    fn blank_reply_is_failure() {
        let out = classify_reply(ModelReply::Complete("  \n".into()));
        assert_eq!(out.status, TranslationStatus::Failed);
        assert!(out.raw_text.is_none());
    }

    #[test]
    fn truncated_reply_is_trimmed_to_last_whole_chapter() {
        let text = "[CHAPTER_ID::a]\nA\n[CHAPTER_END]\n[CHAPTER_ID::b]\nB\n[CHAPTER_END]\n[CHAPTER_ID::c]\nC is cu";
        let out = classify_reply(ModelReply::LengthLimited(text.into()));
        assert_eq!(out.status, TranslationStatus::OutputTruncated);
        let kept = out.raw_text.expect("text");
        assert!(kept.contains("[CHAPTER_ID::b]"));
        assert!(!kept.contains("CHAPTER_ID::c"));
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let q = classify_reply(ModelReply::Error(ModelError::new(ModelErrorKind::Quota, "429")));
        assert_eq!(q.status, TranslationStatus::QuotaExceeded);
        let t = classify_reply(ModelReply::Error(ModelError::new(ModelErrorKind::TokenLimit, "big")));
        assert_eq!(t.status, TranslationStatus::TokenLimitExceeded);
        let f = classify_reply(ModelReply::Error(ModelError::other("boom")));
        assert_eq!(f.status, TranslationStatus::Failed);
        assert_eq!(f.detail.as_deref(), Some("boom"));
    }

    #[test]
    fn failed_calls_are_retried_up_to_limit() {
        let log = Arc::new(MemoryLog::default());
        let model = ScriptedModel::from_replies(vec![
            ModelReply::Error(ModelError::other("net")),
            ModelReply::Complete("[CHAPTER_ID::a]\nA\n[CHAPTER_END]".into()),
        ]);
        let mut exec = AttemptExecutor::new(model, RetryPolicy::immediate(), log.clone());
        let out = exec.attempt(&chunk(&["a"]), false);
        assert_eq!(out.status, TranslationStatus::Success);
        assert_eq!(exec.calls(), 2);
        assert_eq!(log.at(LogLevel::Warning).len(), 1);

        let flags = exec.into_model().retry_flags();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn failure_after_exhausted_retries_is_reported() {
        let model = ScriptedModel::from_replies(vec![
            ModelReply::Error(ModelError::other("a")),
            ModelReply::Error(ModelError::other("b")),
            ModelReply::Complete("never reached".into()),
        ]);
        let mut exec = AttemptExecutor::new(model, RetryPolicy::immediate(), Arc::new(MemoryLog::default()));
        let out = exec.attempt(&chunk(&["a", "b"]), false);
        assert_eq!(out.status, TranslationStatus::Failed);
        assert_eq!(exec.calls(), 2);
    }

    #[test]
    fn quota_and_token_limit_are_not_retried_here() {
        for kind in [ModelErrorKind::Quota, ModelErrorKind::TokenLimit] {
            let model = ScriptedModel::from_replies(vec![
                ModelReply::Error(ModelError::new(kind, "no")),
                ModelReply::Complete("x".into()),
            ]);
            let mut exec =
                AttemptExecutor::new(model, RetryPolicy::immediate(), Arc::new(MemoryLog::default()));
            exec.attempt(&chunk(&["a"]), true);
            assert_eq!(exec.calls(), 1);
        }
    }

    #[test]
    fn retry_flag_is_forwarded() {
        let model = ScriptedModel::from_replies(vec![ModelReply::Complete("x".into())]);
        let mut exec = AttemptExecutor::new(model, RetryPolicy::immediate(), Arc::new(MemoryLog::default()));
        exec.attempt(&chunk(&["a"]), true);
        assert_eq!(exec.into_model().retry_flags(), vec![true]);
    }

    #[test]
    fn backoff_curves_escalate_and_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.failure_delay(0), Duration::from_secs(4));
        assert_eq!(p.failure_delay(1), Duration::from_secs(6));
        assert_eq!(p.quota_delay(0), Duration::from_secs(30));
        assert_eq!(p.quota_delay(1), Duration::from_secs(60));
        assert_eq!(p.quota_delay(2), Duration::from_secs(120));
        assert_eq!(p.quota_delay(5), Duration::from_secs(300));
        assert_eq!(p.quota_delay(u32::MAX), Duration::from_secs(300));
        assert_eq!(RetryPolicy::immediate().quota_delay(3), Duration::ZERO);
    }
}

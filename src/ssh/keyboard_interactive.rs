//! Keyboard-Interactive Authentication (2FA) Support
//!
//! The server drives keyboard-interactive auth one prompt at a time, while the
//! application answers through an async responder (usually a UI dialog).
//!
//! # Bridge
//!
//! ```text
//! auth loop (async)          blocking thread               runtime
//!    │                            │                           │
//!    │── spawn_blocking ─────────▶│                           │
//!    │                            │── spawn(responder) ──────▶│
//!    │                            │   block_on(oneshot, 60s)  │
//!    │                            │◀──────── answer ──────────│
//!    │◀──────── answers ──────────│                           │
//! ```
//!
//! The wait happens on a blocking-pool thread, never on the session's own
//! task, so a slow user cannot stall the transport.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

/// Timeout waiting for the user to answer a single prompt
pub const KBI_USER_INPUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller-supplied async answer source: prompt text in, answer out
pub type KbiResponder = Arc<dyn Fn(String) -> BoxFuture<'static, String> + Send + Sync>;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// Error types for KBI flow
#[derive(Debug, Clone, thiserror::Error)]
pub enum KbiError {
    #[error("Authentication timeout ({0}s)")]
    Timeout(u64),

    #[error("No async runtime available for keyboard-interactive prompts")]
    NoRuntime,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Sync-to-async bridge for keyboard-interactive prompts
#[derive(Clone)]
pub struct KbiBridge {
    responder: KbiResponder,
    runtime: Handle,
    timeout: Duration,
}

impl KbiBridge {
    /// Capture the current runtime so prompts can be answered from a blocking thread
    pub fn new(responder: KbiResponder) -> Result<Self, KbiError> {
        let runtime = Handle::try_current().map_err(|_| KbiError::NoRuntime)?;
        Ok(Self {
            responder,
            runtime,
            timeout: KBI_USER_INPUT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answer one prompt, blocking the calling thread.
    ///
    /// Must run off the async workers (inside `spawn_blocking` or a plain thread).
    pub fn answer_blocking(&self, prompt: &str) -> Result<String, KbiError> {
        let (tx, rx) = oneshot::channel();
        let answer = (self.responder)(prompt.to_string());
        self.runtime.spawn(async move {
            let _ = tx.send(answer.await);
        });

        let timeout = self.timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, rx).await })
            .map_err(|_| KbiError::Timeout(timeout.as_secs()))?
            .map_err(|_| KbiError::ChannelError("Responder dropped before answering".to_string()))
    }

    /// Answer every prompt of one server round, in order
    pub async fn respond(&self, prompts: Vec<KbiPrompt>) -> Result<Vec<String>, KbiError> {
        debug!("Answering {} keyboard-interactive prompts", prompts.len());
        let bridge = self.clone();
        tokio::task::spawn_blocking(move || {
            prompts
                .iter()
                .map(|p| bridge.answer_blocking(&p.prompt))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| KbiError::ChannelError(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_responder() -> KbiResponder {
        Arc::new(|prompt: String| -> BoxFuture<'static, String> {
            Box::pin(async move { format!("answer:{}", prompt) })
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_respond_answers_in_order() {
        let bridge = KbiBridge::new(echo_responder()).unwrap();
        let prompts = vec![
            KbiPrompt { prompt: "Password:".into(), echo: false },
            KbiPrompt { prompt: "Code:".into(), echo: true },
        ];

        let answers = bridge.respond(prompts).await.unwrap();
        assert_eq!(answers, vec!["answer:Password:", "answer:Code:"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unanswered_prompt_times_out() {
        let responder: KbiResponder = Arc::new(|_prompt: String| -> BoxFuture<'static, String> {
            Box::pin(futures_util::future::pending())
        });
        let bridge = KbiBridge::new(responder)
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let result = bridge
            .respond(vec![KbiPrompt { prompt: "OTP:".into(), echo: true }])
            .await;
        assert!(matches!(result, Err(KbiError::Timeout(_))));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(matches!(KbiBridge::new(echo_responder()), Err(KbiError::NoRuntime)));
    }
}

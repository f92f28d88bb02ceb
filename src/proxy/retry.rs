//! Transport-level retry policy
//!
//! Response-driven: a completed response is retried when its status fails the predicate
//! (by default anything other than 200 OK), and a transient transport failure is retried
//! as well. Timeouts are never retried here. Knows nothing about response bodies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{RetryEvent, RetryLabel};
use crate::proxy::backoff::BackoffEngine;

/// Decides whether a response status should be retried
pub type RetryPredicate = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Anything with a status code the policy can classify
pub trait RetryOutcome {
    fn status(&self) -> StatusCode;
}

impl RetryOutcome for reqwest::Response {
    fn status(&self) -> StatusCode {
        reqwest::Response::status(self)
    }
}

/// Transport errors the policy may retry
pub trait TransientFailure {
    fn is_transient(&self) -> bool;
}

impl TransientFailure for reqwest::Error {
    fn is_transient(&self) -> bool {
        !self.is_timeout() && (self.is_connect() || self.is_request())
    }
}

/// Publishes retry decisions to tracing and, when wired, to a broadcast channel
#[derive(Clone, Default)]
pub struct RetryRecorder {
    sender: Option<broadcast::Sender<RetryEvent>>,
}

impl RetryRecorder {
    pub fn new(sender: broadcast::Sender<RetryEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record(&self, label: RetryLabel, delay: Duration, attempt: u32, url: &str) {
        warn!(
            label = %label,
            attempt,
            url,
            "Retry [{}] delay: {:.3}s #{} url: '{}'",
            label,
            delay.as_secs_f64(),
            attempt,
            url
        );

        if let Some(sender) = &self.sender {
            // No subscribers is fine
            let _ = sender.send(RetryEvent::new(label, delay, attempt, url));
        }
    }
}

impl std::fmt::Debug for RetryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryRecorder")
            .field("enabled", &self.sender.is_some())
            .finish()
    }
}

/// Wait-and-retry policy attached to every client
#[derive(Clone)]
pub struct RetryPolicy {
    retry_count: u32,
    first_delay_secs: u64,
    backoff: BackoffEngine,
    when_retry: RetryPredicate,
    recorder: RetryRecorder,
}

impl RetryPolicy {
    pub fn new(
        retry_count: u32,
        first_delay_secs: u64,
        backoff: BackoffEngine,
        recorder: RetryRecorder,
    ) -> Self {
        Self {
            retry_count,
            first_delay_secs,
            backoff,
            when_retry: Arc::new(|status| status != StatusCode::OK),
            recorder,
        }
    }

    /// Replace the default "not 200 OK" predicate
    pub fn with_predicate<F>(mut self, when_retry: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.when_retry = Arc::new(when_retry);
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn should_retry<T, E>(&self, outcome: &std::result::Result<T, E>) -> bool
    where
        T: RetryOutcome,
        E: TransientFailure,
    {
        match outcome {
            Ok(response) => (self.when_retry)(response.status()),
            Err(e) => e.is_transient(),
        }
    }

    /// Run `send` until it produces a non-retryable outcome or the retries are spent.
    ///
    /// The last outcome is returned as is, whether it is a response or an error.
    pub async fn execute<T, E, F, Fut>(&self, url: &str, mut send: F) -> std::result::Result<T, E>
    where
        T: RetryOutcome,
        E: TransientFailure,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 0u32;

        loop {
            let outcome = send().await;

            if attempt >= self.retry_count || !self.should_retry(&outcome) {
                return outcome;
            }

            attempt += 1;
            let delay = self.backoff.delay(self.first_delay_secs, attempt);
            self.recorder.record(RetryLabel::Client, delay, attempt, url);
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("first_delay_secs", &self.first_delay_secs)
            .finish_non_exhaustive()
    }
}

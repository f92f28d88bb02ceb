//! Application-level request execution
//!
//! Wraps a client already governed by the transport [`RetryPolicy`](crate::proxy::retry::RetryPolicy)
//! with a second attempt loop for the outcomes that layer cannot see: a successful
//! response with an empty body, and body failures it never classified. Steady-state
//! failures end in `None`, never in an error.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::config::HttpClientConfig;
use crate::error::Result;
use crate::models::RetryLabel;
use crate::proxy::pool::ClientRegistry;
use crate::proxy::transport::{ClientHandle, FetchError};

/// Where one logical request stands after an attempt
#[derive(Debug)]
pub enum AttemptState {
    Success(String),
    Retrying(RetryLabel),
    Exhausted,
    Failed(FetchError),
}

/// Attempt bookkeeping for a single logical request
#[derive(Debug, Clone)]
pub struct RetryAttemptState {
    attempt: u32,
    max: u32,
    url: String,
}

impl RetryAttemptState {
    pub fn new(url: impl Into<String>, max: u32) -> Self {
        Self {
            attempt: 0,
            max,
            url: url.into(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn has_budget(&self) -> bool {
        self.attempt < self.max
    }

    /// Classify the outcome of the latest attempt
    pub fn classify(&self, outcome: std::result::Result<String, FetchError>) -> AttemptState {
        match outcome {
            Ok(body) if !body.is_empty() => AttemptState::Success(body),
            Ok(_) if self.has_budget() => AttemptState::Retrying(RetryLabel::Empty),
            Ok(_) => AttemptState::Exhausted,
            // cancelled, already retried by the transport policy, or unrecoverable
            Err(e) if e.is_terminal() => AttemptState::Failed(e),
            Err(_) if self.has_budget() => AttemptState::Retrying(RetryLabel::Exception),
            Err(e) => AttemptState::Failed(e),
        }
    }

    /// Move to the next attempt, returning its number
    pub fn advance(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

/// Caller-facing client bound to one registered name
#[derive(Clone)]
pub struct HttpProxyClient {
    registry: Arc<ClientRegistry>,
    name: String,
    retry: u32,
    first_delay_secs: u64,
}

impl HttpProxyClient {
    pub fn new(registry: Arc<ClientRegistry>, name: impl Into<String>, config: &HttpClientConfig) -> Self {
        Self {
            registry,
            name: name.into(),
            retry: config.retry,
            first_delay_secs: config.retry_first_delay,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client for the pool slot `index`, a random slot, or the direct client
    pub fn client(&self, index: Option<usize>) -> Result<ClientHandle> {
        self.registry.select_client(&self.name, index)
    }

    /// GET `url` as text.
    ///
    /// `encoding` is a charset label that overrides any declared charset, `retry`
    /// overrides the configured retry count, `client_index` pins a pool slot.
    /// Returns `None` on exhaustion, cancellation and unrecoverable failures.
    #[instrument(skip(self, encoding), fields(client = %self.name))]
    pub async fn get_string(
        &self,
        url: &str,
        encoding: Option<&str>,
        retry: Option<u32>,
        client_index: Option<usize>,
    ) -> Option<String> {
        let client = match self.client(client_index) {
            Ok(client) => client,
            Err(e) => {
                error!("No client for '{}': {}", url, e);
                return None;
            }
        };

        let mut state = RetryAttemptState::new(url, retry.unwrap_or(self.retry));

        loop {
            let outcome = client.get_text(url, encoding).await;

            match state.classify(outcome) {
                AttemptState::Success(body) => {
                    debug!("{} answered after {} retries", url, state.attempt());
                    return Some(body);
                }
                AttemptState::Retrying(label) => {
                    let attempt = state.advance();
                    let delay = self.registry.backoff().delay(self.first_delay_secs, attempt);
                    self.registry.recorder().record(label, delay, attempt, url);
                    tokio::time::sleep(delay).await;
                }
                AttemptState::Exhausted => {
                    error!(
                        "Empty response from '{}' after {} attempts",
                        url,
                        state.attempt() + 1
                    );
                    return None;
                }
                AttemptState::Failed(e) if e.is_timeout() => {
                    warn!("Request to '{}' cancelled: {}", url, e);
                    return None;
                }
                AttemptState::Failed(e) => {
                    error!("Request to '{}' failed: {}", url, e);
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for HttpProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxyClient")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("first_delay_secs", &self.first_delay_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyEndpoint, RetryEvent};
    use crate::proxy::backoff::{BackoffEngine, NoJitter};
    use crate::proxy::pool::ProxyPool;
    use crate::proxy::retry::RetryRecorder;
    use crate::proxy::transport::HttpTransport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    type Step = std::result::Result<String, FetchError>;

    /// Replays a fixed script, then keeps answering with an empty body
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        encodings: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                encodings: Mutex::new(vec![]),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get_text(&self, _url: &str, encoding: Option<&str>) -> Step {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.encodings.lock().push(encoding.map(str::to_string));
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn config(retry: u32) -> HttpClientConfig {
        HttpClientConfig {
            retry,
            retry_first_delay: 0,
            ..HttpClientConfig::default()
        }
    }

    fn setup(
        transport: Arc<ScriptedTransport>,
        retry: u32,
    ) -> (HttpProxyClient, broadcast::Receiver<RetryEvent>) {
        let (tx, rx) = broadcast::channel(16);
        let registry = ClientRegistry::new(
            BackoffEngine::new(Arc::new(NoJitter)),
            RetryRecorder::new(tx),
        );
        registry.register_with("test", transport, false).unwrap();

        let client = HttpProxyClient::new(Arc::new(registry), "test", &config(retry));
        (client, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_twice_then_success() {
        let transport = ScriptedTransport::new(vec![
            Ok(String::new()),
            Ok(String::new()),
            Ok("payload".to_string()),
        ]);
        let (client, mut events) = setup(transport.clone(), 2);

        let body = client
            .get_string("http://example.test/", None, None, None)
            .await;

        assert_eq!(body.as_deref(), Some("payload"));
        assert_eq!(transport.calls(), 3);

        let first = events.try_recv().unwrap();
        assert_eq!(first.label, RetryLabel::Empty);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.delay, Duration::from_secs(2));
        let second = events.try_recv().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.url, "http://example.test/");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_empty_exhausts_after_retry_plus_one() {
        let transport = ScriptedTransport::new(vec![]);
        let (client, _events) = setup(transport.clone(), 2);

        let body = client
            .get_string("http://example.test/", None, None, None)
            .await;

        assert!(body.is_none());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_override() {
        let transport = ScriptedTransport::new(vec![]);
        let (client, _events) = setup(transport.clone(), 3);

        assert!(client
            .get_string("http://example.test/", None, Some(0), None)
            .await
            .is_none());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Timeout),
            Ok("never reached".to_string()),
        ]);
        let (client, mut events) = setup(transport.clone(), 3);

        let body = client
            .get_string("http://example.test/", None, None, None)
            .await;

        assert!(body.is_none());
        assert_eq!(transport.calls(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_classified_failures_are_not_retried_again() {
        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            Ok("never reached".to_string()),
        ]);
        let (client, _events) = setup(transport.clone(), 3);

        assert!(client
            .get_string("http://example.test/", None, None, None)
            .await
            .is_none());
        assert_eq!(transport.calls(), 1);

        let transport = ScriptedTransport::new(vec![Err(FetchError::Connect("refused".into()))]);
        let (client, _events) = setup(transport.clone(), 3);
        assert!(client
            .get_string("http://example.test/", None, None, None)
            .await
            .is_none());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Request("too many redirects".into())),
            Ok("unreachable".to_string()),
        ]);
        let (client, mut events) = setup(transport.clone(), 3);

        assert!(client
            .get_string("http://example.test/", None, None, None)
            .await
            .is_none());
        assert_eq!(transport.calls(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_failure_is_retried_with_exception_label() {
        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Body("connection reset".into())),
            Ok("payload".to_string()),
        ]);
        let (client, mut events) = setup(transport.clone(), 1);

        let body = client
            .get_string("http://example.test/", None, None, None)
            .await;

        assert_eq!(body.as_deref(), Some("payload"));
        assert_eq!(events.try_recv().unwrap().label, RetryLabel::Exception);

        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Body("reset".into())),
            Err(FetchError::Body("reset".into())),
        ]);
        let (client, _events) = setup(transport.clone(), 1);
        assert!(client
            .get_string("http://example.test/", None, None, None)
            .await
            .is_none());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoding_is_forwarded() {
        let transport = ScriptedTransport::new(vec![Ok("text".to_string())]);
        let (client, _events) = setup(transport.clone(), 0);

        client
            .get_string("http://example.test/", Some("windows-1250"), None, None)
            .await;

        assert_eq!(
            transport.encodings.lock().as_slice(),
            &[Some("windows-1250".to_string())]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_client_index_yields_none() {
        let registry = ClientRegistry::default();
        let direct = ScriptedTransport::new(vec![Ok("direct".to_string())]);
        let slot = ScriptedTransport::new(vec![Ok("slot".to_string())]);
        registry.register_with("test", direct, true).unwrap();
        registry
            .publish_clients(
                "test",
                ProxyPool::from_endpoints(vec![ProxyEndpoint::new("10.0.0.1", 3128)]),
                vec![slot.clone() as ClientHandle],
            )
            .unwrap();
        let client = HttpProxyClient::new(Arc::new(registry), "test", &config(0));

        assert!(client
            .get_string("http://example.test/", None, None, Some(5))
            .await
            .is_none());
        assert_eq!(slot.calls(), 0);

        let body = client
            .get_string("http://example.test/", None, None, Some(0))
            .await;
        assert_eq!(body.as_deref(), Some("slot"));
    }

    #[tokio::test]
    async fn test_unregistered_name_yields_none() {
        let client = HttpProxyClient::new(
            Arc::new(ClientRegistry::default()),
            "missing",
            &config(0),
        );
        assert!(client
            .get_string("http://example.test/", None, None, None)
            .await
            .is_none());
    }

    #[test]
    fn test_attempt_state_transitions() {
        let mut state = RetryAttemptState::new("http://example.test/", 1);
        assert!(matches!(
            state.classify(Ok(String::new())),
            AttemptState::Retrying(RetryLabel::Empty)
        ));
        assert_eq!(state.advance(), 1);
        assert!(matches!(state.classify(Ok(String::new())), AttemptState::Exhausted));
        assert!(matches!(
            state.classify(Ok("x".into())),
            AttemptState::Success(_)
        ));
        assert!(matches!(
            state.classify(Err(FetchError::Timeout)),
            AttemptState::Failed(FetchError::Timeout)
        ));
        assert_eq!(state.max(), 1);
        assert_eq!(state.url(), "http://example.test/");
    }
}

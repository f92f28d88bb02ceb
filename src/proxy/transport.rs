//! Outbound HTTP clients
//!
//! Builds long-lived clients whose egress is either direct or forced through a single
//! HTTP forward proxy, and wraps them with the transport-level [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::config::HttpClientConfig;
use crate::error::Result;
use crate::models::ProxyEndpoint;
use crate::proxy::retry::RetryPolicy;

/// Settings applied to every client built by [`ProxyTransport`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub gzip: bool,
    pub user_agent: String,
    /// Whole-request timeout; `None` leaves the client unbounded
    pub timeout: Option<Duration>,
}

impl From<&HttpClientConfig> for ClientOptions {
    fn from(config: &HttpClientConfig) -> Self {
        Self {
            gzip: config.gzip_enabled,
            user_agent: config.user_agent.clone(),
            timeout: (config.request_timeout > 0)
                .then(|| Duration::from_secs(config.request_timeout)),
        }
    }
}

/// Why a single GET produced no text
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("unsuccessful status: {0}")]
    Status(StatusCode),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("failed to read body: {0}")]
    Body(String),

    /// Redirect loops, malformed requests and other errors no retry can fix
    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout)
    }

    /// Outcomes the transport policy has already classified (and retried where allowed)
    pub fn handled_by_transport(&self) -> bool {
        matches!(self, FetchError::Status(_) | FetchError::Connect(_))
    }

    /// Not retried by the request executor.
    ///
    /// Timeouts and [`FetchError::Request`] are never retried at either layer.
    pub fn is_terminal(&self) -> bool {
        self.is_timeout() || self.handled_by_transport() || matches!(self, FetchError::Request(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status(status)
        } else if err.is_connect() || err.is_request() {
            FetchError::Connect(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

/// A client the executor can issue GETs through
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `url` and decode the body.
    ///
    /// A caller-chosen charset label replaces whatever charset the response declares.
    async fn get_text(
        &self,
        url: &str,
        encoding: Option<&str>,
    ) -> std::result::Result<String, FetchError>;

    /// Proxy this client egresses through, `None` for direct clients
    fn endpoint(&self) -> Option<&ProxyEndpoint> {
        None
    }
}

/// Shared handle to a registered client
pub type ClientHandle = Arc<dyn HttpTransport>;

/// Client factory
pub struct ProxyTransport;

impl ProxyTransport {
    /// Build a client, forcing egress through `endpoint` when given.
    ///
    /// Direct clients ignore proxy environment variables.
    pub fn build_client(
        endpoint: Option<&ProxyEndpoint>,
        options: &ClientOptions,
    ) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .gzip(options.gzip);

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match endpoint {
            Some(endpoint) => {
                let proxy_url = Url::parse(&endpoint.proxy_url())?;
                builder.proxy(reqwest::Proxy::all(proxy_url)?)
            }
            None => builder.no_proxy(),
        };

        Ok(builder.build()?)
    }
}

/// A client governed by the transport-level retry policy
pub struct RetryingClient {
    name: String,
    endpoint: Option<ProxyEndpoint>,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: Option<ProxyEndpoint>,
        client: reqwest::Client,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client,
            policy,
        }
    }

    pub fn build(
        name: impl Into<String>,
        endpoint: Option<ProxyEndpoint>,
        options: &ClientOptions,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let client = ProxyTransport::build_client(endpoint.as_ref(), options)?;
        Ok(Self::new(name, endpoint, client, policy))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl HttpTransport for RetryingClient {
    #[instrument(skip(self, encoding), fields(client = %self.name))]
    async fn get_text(
        &self,
        url: &str,
        encoding: Option<&str>,
    ) -> std::result::Result<String, FetchError> {
        let charset = encoding.map(resolve_charset).transpose()?;

        let response = self
            .policy
            .execute(url, || self.client.get(url).send())
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!("{} answered {}", url, status);
            return Err(FetchError::Status(status));
        }

        let text = match charset {
            Some(charset) => {
                let bytes = response.bytes().await?;
                let (text, _, _) = charset.decode(&bytes);
                text.into_owned()
            }
            None => response.text().await?,
        };

        Ok(text)
    }

    fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.endpoint.as_ref()
    }
}

fn resolve_charset(label: &str) -> std::result::Result<&'static Encoding, FetchError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| FetchError::Body(format!("unknown encoding label '{}'", label)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::backoff::{BackoffEngine, NoJitter};
    use crate::proxy::retry::RetryRecorder;
    use tokio::net::TcpListener;
    use wiremock::matchers::{any, header, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> ClientOptions {
        ClientOptions {
            gzip: true,
            user_agent: "proxyrelay-test".to_string(),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn policy(retry: u32) -> RetryPolicy {
        RetryPolicy::new(
            retry,
            0,
            BackoffEngine::new(Arc::new(NoJitter)),
            RetryRecorder::disabled(),
        )
    }

    fn direct(retry: u32) -> RetryingClient {
        RetryingClient::build("direct", None, &options(), policy(retry)).unwrap()
    }

    #[tokio::test]
    async fn test_direct_client_returns_body() {
        let server = MockServer::start().await;
        Mock::given(any())
            .and(header("user-agent", "proxyrelay-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let client = direct(0);
        assert!(client.endpoint().is_none());
        let body = client.get_text(&server.uri(), None).await.unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_unsuccessful_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = direct(0).get_text(&server.uri(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::NOT_FOUND)));
        assert!(err.handled_by_transport());
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_transport_policy_retries_server_error() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let body = direct(1).get_text(&server.uri(), None).await.unwrap();
        assert_eq!(body, "recovered");
    }

    #[tokio::test]
    async fn test_encoding_override_applies_to_undeclared_charset() {
        let server = MockServer::start().await;
        // "Šla" in windows-1250
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0x8A, b'l', b'a'], "text/plain"))
            .mount(&server)
            .await;

        let body = direct(0)
            .get_text(&server.uri(), Some("windows-1250"))
            .await
            .unwrap();
        assert_eq!(body, "Šla");
    }

    #[tokio::test]
    async fn test_encoding_override_wins_over_declared_charset() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(vec![0x8A, b'l', b'a'], "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let client = direct(0);
        let body = client
            .get_text(&server.uri(), Some("windows-1250"))
            .await
            .unwrap();
        assert_eq!(body, "Šla");

        // without an override the declared charset is honoured
        let body = client.get_text(&server.uri(), None).await.unwrap();
        assert_eq!(body, "\u{FFFD}la");
    }

    #[tokio::test]
    async fn test_unknown_encoding_label_is_a_body_error() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let err = direct(0)
            .get_text(&server.uri(), Some("klingon-8"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Body(_)), "{:?}", err);
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_redirect_loop_is_terminal_request_error() {
        let server = MockServer::start().await;
        Mock::given(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let err = direct(2)
            .get_text(&format!("{}/loop", server.uri()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)), "{:?}", err);
        assert!(!err.handled_by_transport());
        assert!(err.is_terminal());

        // reqwest gives up after ten redirects; the transport policy does not resend
        let requests = server.received_requests().await.unwrap();
        assert!(requests.len() <= 11, "{} requests", requests.len());
    }

    #[tokio::test]
    async fn test_proxied_client_egresses_through_endpoint() {
        // The mock server acts as a plain HTTP forward proxy for the absolute-form request.
        let proxy = MockServer::start().await;
        Mock::given(any())
            .and(header("host", "upstream.test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("via proxy"))
            .expect(1)
            .mount(&proxy)
            .await;

        let endpoint = ProxyEndpoint::new("127.0.0.1", proxy.address().port());
        let client =
            RetryingClient::build("proxied", Some(endpoint.clone()), &options(), policy(0))
                .unwrap();

        assert_eq!(client.endpoint(), Some(&endpoint));
        let body = client
            .get_text("http://upstream.test/page", None)
            .await
            .unwrap();
        assert_eq!(body, "via proxy");
    }

    #[tokio::test]
    async fn test_refused_proxy_is_a_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = ProxyEndpoint::new("127.0.0.1", port);
        let client = RetryingClient::build("dead", Some(endpoint), &options(), policy(0)).unwrap();

        let err = client
            .get_text("http://upstream.test/", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connect(_)), "{:?}", err);
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let options = ClientOptions {
            timeout: Some(Duration::from_millis(200)),
            ..options()
        };
        let client = RetryingClient::build("slow", None, &options, policy(2)).unwrap();

        let err = client.get_text(&server.uri(), None).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_client_options_from_config() {
        let config = HttpClientConfig {
            request_timeout: 0,
            gzip_enabled: false,
            ..HttpClientConfig::default()
        };
        let options = ClientOptions::from(&config);
        assert!(options.timeout.is_none());
        assert!(!options.gzip);
        assert_eq!(options.user_agent, config.user_agent);
    }
}

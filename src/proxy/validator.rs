//! Candidate validation
//!
//! Static filters first, then a bounded concurrent probe of every survivor:
//! echo-IP fetch through the candidate (latency is measured here), egress IP check for
//! non-transparent runs, a second liveness fetch, and the latency ceiling. Rejections
//! are logged and skipped. Once `required` candidates are accepted the remaining probes
//! are cancelled by dropping the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument};

use crate::error::{ProxyError, Result};
use crate::models::{ProbeSettings, ProxyCandidate, ValidationFilters};
use crate::proxy::transport::{ClientOptions, FetchError, ProxyTransport};

/// Per-candidate rejection; never fatal to the batch
#[derive(Debug, Error)]
pub enum ValidationRejection {
    #[error("timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("empty {0} response")]
    EmptyBody(&'static str),

    #[error("egress ip {seen:?} does not match")]
    EgressMismatch { seen: Option<String> },

    #[error("slow in {latency_ms}ms")]
    Slow { latency_ms: u64 },
}

impl From<FetchError> for ValidationRejection {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout => ValidationRejection::Timeout,
            other => ValidationRejection::Request(other.to_string()),
        }
    }
}

/// Issues GETs with egress forced through one candidate
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    /// State shared by every request to a single candidate
    type Session: Send + Sync;

    /// Prepare the candidate's session; called once per candidate
    fn open(
        &self,
        candidate: &ProxyCandidate,
    ) -> std::result::Result<Self::Session, ValidationRejection>;

    async fn fetch(
        &self,
        session: &Self::Session,
        url: &str,
    ) -> std::result::Result<String, ValidationRejection>;
}

/// Lightweight probe: one client per candidate, no retry policy
#[derive(Debug, Clone)]
pub struct HttpProbe {
    user_agent: String,
}

impl HttpProbe {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_AGENT)
    }
}

#[async_trait]
impl ProxyProbe for HttpProbe {
    type Session = reqwest::Client;

    fn open(
        &self,
        candidate: &ProxyCandidate,
    ) -> std::result::Result<reqwest::Client, ValidationRejection> {
        let options = ClientOptions {
            gzip: true,
            user_agent: self.user_agent.clone(),
            timeout: None,
        };
        ProxyTransport::build_client(Some(&candidate.endpoint()), &options)
            .map_err(|e| ValidationRejection::Request(e.to_string()))
    }

    async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> std::result::Result<String, ValidationRejection> {
        let response = client.get(url).send().await.map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status).into());
        }

        Ok(response.text().await.map_err(FetchError::from)?)
    }
}

/// Cheap in-memory filters; order preserving
pub fn apply_filters(
    candidates: Vec<ProxyCandidate>,
    filters: &ValidationFilters,
) -> Vec<ProxyCandidate> {
    let countries: Vec<String> = filters
        .countries
        .iter()
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect();

    let mut list = candidates;

    if filters.non_transparent_only {
        list.retain(|c| !c.anonymity.is_transparent());
        debug!("Filter: [non_transparent_only] {} proxies.", list.len());
    }

    if let Some(https) = filters.https {
        list.retain(|c| c.supports_https == https);
        debug!("Filter: [https] {} proxies.", list.len());
    }

    if !countries.is_empty() {
        list.retain(|c| countries.contains(&c.country_code.to_uppercase()));
        debug!("Filter: [countries] {} proxies.", list.len());
    }

    list
}

/// Probes candidates and ranks the accepted ones by latency
pub struct ProxyValidator<P> {
    probe: P,
    settings: ProbeSettings,
}

impl<P: ProxyProbe> ProxyValidator<P> {
    pub fn new(probe: P, settings: ProbeSettings) -> Result<Self> {
        Selector::parse(&settings.echo_selector).map_err(|e| {
            ProxyError::InvalidConfig(format!(
                "invalid echo selector '{}': {}",
                settings.echo_selector, e
            ))
        })?;

        Ok(Self { probe, settings })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Accepted candidates, fastest first, each with `latency_ms` set
    #[instrument(skip_all, fields(candidates = candidates.len(), required = filters.required))]
    pub async fn validate(
        &self,
        candidates: Vec<ProxyCandidate>,
        filters: &ValidationFilters,
    ) -> Vec<ProxyCandidate> {
        let candidates = apply_filters(candidates, filters);
        debug!(
            "Check: {} proxies, {} required.",
            candidates.len(),
            filters.required
        );

        let concurrency = self.settings.concurrency.max(1);
        let mut checks = futures::stream::iter(candidates.into_iter().enumerate())
            .map(|(n, candidate)| self.check(n + 1, candidate, filters))
            .buffer_unordered(concurrency);

        let mut accepted = Vec::new();
        while let Some(result) = checks.next().await {
            if let Some(candidate) = result {
                accepted.push(candidate);
                if filters.required > 0 && accepted.len() >= filters.required {
                    debug!("Required count reached, cancelling remaining probes");
                    break;
                }
            }
        }
        drop(checks);

        accepted.sort_by_key(|c| c.latency_ms.unwrap_or(u64::MAX));
        info!("Validated {} proxies", accepted.len());
        accepted
    }

    async fn check(
        &self,
        ordinal: usize,
        candidate: ProxyCandidate,
        filters: &ValidationFilters,
    ) -> Option<ProxyCandidate> {
        let label = format!(
            "#{} {} {}",
            ordinal,
            candidate.address(),
            candidate.display_note()
        );

        match self.check_candidate(candidate, filters).await {
            Ok(candidate) => {
                debug!("{} [OK in {}ms]", label, candidate.latency_ms.unwrap_or_default());
                Some(candidate)
            }
            Err(rejection) => {
                debug!("{} [{}]", label, rejection);
                None
            }
        }
    }

    async fn check_candidate(
        &self,
        mut candidate: ProxyCandidate,
        filters: &ValidationFilters,
    ) -> std::result::Result<ProxyCandidate, ValidationRejection> {
        let probe_timeout = Duration::from_secs(filters.probe_timeout_secs.max(1));
        let session = self.probe.open(&candidate)?;

        let started = Instant::now();
        let echo = self
            .fetch_with_timeout(&session, &self.settings.echo_url, probe_timeout)
            .await?;
        if echo.is_empty() {
            return Err(ValidationRejection::EmptyBody("echo"));
        }
        let latency_ms = started.elapsed().as_millis() as u64;

        if filters.non_transparent_only {
            let seen = self.extract_egress_ip(&echo);
            if seen.as_deref() != Some(candidate.ip.as_str()) {
                return Err(ValidationRejection::EgressMismatch { seen });
            }
        }

        let liveness = self
            .fetch_with_timeout(&session, &self.settings.liveness_url, probe_timeout)
            .await?;
        if liveness.is_empty() {
            return Err(ValidationRejection::EmptyBody("liveness"));
        }

        if filters.max_latency_ms > 0 && latency_ms > filters.max_latency_ms {
            return Err(ValidationRejection::Slow { latency_ms });
        }

        candidate.latency_ms = Some(latency_ms);
        Ok(candidate)
    }

    async fn fetch_with_timeout(
        &self,
        session: &P::Session,
        url: &str,
        probe_timeout: Duration,
    ) -> std::result::Result<String, ValidationRejection> {
        match timeout(probe_timeout, self.probe.fetch(session, url)).await {
            Ok(result) => result,
            Err(_) => Err(ValidationRejection::Timeout),
        }
    }

    /// Text of the echo marker element, if present
    pub fn extract_egress_ip(&self, html: &str) -> Option<String> {
        let selector = Selector::parse(&self.settings.echo_selector).ok()?;
        let document = Html::parse_document(html);
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|ip| !ip.is_empty())
    }
}

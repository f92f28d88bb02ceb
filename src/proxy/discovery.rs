//! Candidate discovery
//!
//! A [`CandidateSource`] produces an unranked list of candidates. The bundled source scrapes
//! the free-proxy-list.net table, whose rows are laid out as:
//! `ip | port | code | country | anonymity | (ignored) | https`.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{ProxyError, Result};
use crate::models::{AnonymityLevel, ProxyCandidate};
use crate::proxy::transport::{ClientOptions, ProxyTransport};

/// Applied when the shared client options leave the request unbounded
const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces proxy candidates; a failure here is fatal to the discovery step
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<ProxyCandidate>>;
}

/// Fixed list of candidates, mostly useful for seeding and tests
pub struct StaticSource {
    candidates: Vec<ProxyCandidate>,
}

impl StaticSource {
    pub fn new(candidates: Vec<ProxyCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl CandidateSource for StaticSource {
    async fn fetch_candidates(&self) -> Result<Vec<ProxyCandidate>> {
        Ok(self.candidates.clone())
    }
}

/// Scraper for the free-proxy-list.net listing
pub struct FreeProxyListSource {
    url: String,
    client: reqwest::Client,
}

impl FreeProxyListSource {
    /// Direct client with the shared user agent and gzip settings
    pub fn new(url: impl Into<String>, options: &ClientOptions) -> Result<Self> {
        let options = ClientOptions {
            timeout: options.timeout.or(Some(LISTING_TIMEOUT)),
            ..options.clone()
        };
        let client = ProxyTransport::build_client(None, &options)?;
        Ok(Self::with_client(url, client))
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl CandidateSource for FreeProxyListSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_candidates(&self) -> Result<Vec<ProxyCandidate>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ProxyError::Discovery(format!("listing unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Discovery(format!(
                "listing answered {}",
                status
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| ProxyError::Discovery(format!("failed to read listing: {}", e)))?;

        let candidates = parse_listing(&html)?;
        info!("Discovered {} proxy candidates", candidates.len());
        Ok(candidates)
    }
}

/// Map the listing table onto candidates.
///
/// Rows that do not fit the column contract are skipped. A page without table rows,
/// or where no row is usable, is a discovery failure.
pub fn parse_listing(html: &str) -> Result<Vec<ProxyCandidate>> {
    let document = Html::parse_document(html);
    let rows = Selector::parse("table tbody tr")
        .map_err(|e| ProxyError::Internal(format!("invalid row selector: {}", e)))?;
    let cells = Selector::parse("td")
        .map_err(|e| ProxyError::Internal(format!("invalid cell selector: {}", e)))?;

    let mut candidates = Vec::new();
    let mut row_count = 0usize;

    for row in document.select(&rows) {
        row_count += 1;
        let columns: Vec<String> = row
            .select(&cells)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();

        match parse_row(&columns) {
            Some(candidate) => {
                trace!(
                    "{} {}",
                    candidate.address(),
                    candidate.display_note()
                );
                candidates.push(candidate);
            }
            None => warn!("Skipping malformed listing row #{}: {:?}", row_count, columns),
        }
    }

    if row_count == 0 {
        return Err(ProxyError::Discovery(
            "listing contains no table rows".to_string(),
        ));
    }
    if candidates.is_empty() {
        return Err(ProxyError::Discovery(format!(
            "none of {} listing rows could be parsed",
            row_count
        )));
    }

    debug!(
        "Parsed {} of {} listing rows",
        candidates.len(),
        row_count
    );
    Ok(candidates)
}

/// Column contract for one listing row
pub fn parse_row(columns: &[String]) -> Option<ProxyCandidate> {
    if columns.len() < 7 {
        return None;
    }

    let ip = columns[0].trim();
    if ip.is_empty() {
        return None;
    }

    let port: u16 = columns[1].trim().parse().ok().filter(|p| *p > 0)?;

    Some(ProxyCandidate {
        ip: ip.to_string(),
        port,
        country_code: columns[2].clone(),
        country_name: columns[3].clone(),
        anonymity: AnonymityLevel::from_label(&columns[4]),
        supports_https: columns[6] != "no",
        latency_ms: None,
    })
}

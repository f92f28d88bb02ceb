//! Pool refresh
//!
//! Discovery, validation and publication of the proxy pool: once at setup
//! ([`PoolRefresher::assign_to_config`]) and optionally on an interval
//! ([`PoolRefreshService`]). A failed or empty run never replaces a published pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument, warn};

use crate::config::HttpClientConfig;
use crate::error::{ProxyError, Result};
use crate::models::ValidationFilters;
use crate::proxy::discovery::CandidateSource;
use crate::proxy::pool::{ClientRegistry, ProxyPool};
use crate::proxy::validator::{ProxyProbe, ProxyValidator};

/// Runs discovery and validation end to end
pub struct PoolRefresher<P> {
    source: Arc<dyn CandidateSource>,
    validator: ProxyValidator<P>,
    filters: ValidationFilters,
    /// Fewer than `filters.required` accepted proxies is an error
    require_minimum: bool,
}

impl<P: ProxyProbe> PoolRefresher<P> {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        validator: ProxyValidator<P>,
        filters: ValidationFilters,
        require_minimum: bool,
    ) -> Self {
        Self {
            source,
            validator,
            filters,
            require_minimum,
        }
    }

    pub fn filters(&self) -> &ValidationFilters {
        &self.filters
    }

    /// Discover and validate; the pool may be empty unless `require_minimum` is set
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<ProxyPool> {
        let candidates = self.source.fetch_candidates().await?;
        let accepted = self.validator.validate(candidates, &self.filters).await;

        if self.require_minimum && accepted.len() < self.filters.required {
            return Err(ProxyError::NotEnoughProxies {
                found: accepted.len(),
                required: self.filters.required,
            });
        }

        Ok(ProxyPool::from_candidates(&accepted))
    }

    /// Scan and write the ranked proxies into `config.proxies`
    pub async fn assign_to_config(&self, config: &mut HttpClientConfig) -> Result<ProxyPool> {
        let pool = self.scan().await?;
        info!("Assigning {} validated proxies", pool.len());
        config.proxies = pool.entries().to_vec();
        Ok(pool)
    }
}

/// Re-validates the pool of one named client group on a fixed interval
pub struct PoolRefreshService<P> {
    refresher: PoolRefresher<P>,
    registry: Arc<ClientRegistry>,
    name: String,
    http: HttpClientConfig,
    interval_secs: u64,
}

impl<P: ProxyProbe> PoolRefreshService<P> {
    pub fn new(
        refresher: PoolRefresher<P>,
        registry: Arc<ClientRegistry>,
        name: impl Into<String>,
        http: HttpClientConfig,
        interval_secs: u64,
    ) -> Self {
        Self {
            refresher,
            registry,
            name: name.into(),
            http,
            interval_secs,
        }
    }

    /// Run until the shutdown flag flips
    #[instrument(skip(self, shutdown), fields(client = %self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool refresh service (interval: {}s)",
            self.interval_secs
        );

        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        error!("Pool refresh failed, keeping previous pool: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One refresh cycle; `Ok(false)` when the previous pool was kept
    pub async fn refresh_once(&self) -> Result<bool> {
        let pool = self.refresher.scan().await?;

        if pool.is_empty() {
            warn!("Refresh accepted no proxies, keeping previous pool");
            return Ok(false);
        }

        self.registry.publish(&self.name, pool, &self.http)?;
        Ok(true)
    }
}

/// Handle for stopping the pool refresh service
pub struct PoolRefreshHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl PoolRefreshHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for PoolRefreshHandle {
    fn default() -> Self {
        Self::new().0
    }
}

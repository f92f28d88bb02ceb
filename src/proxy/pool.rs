//! Published proxy pool and named client registry
//!
//! Each named group owns one direct client plus one long-lived client per pool slot.
//! Slots are bound when a pool is published and swapped in as a whole, so selections
//! never observe a half-updated pool.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info};

use crate::config::HttpClientConfig;
use crate::error::{ProxyError, Result};
use crate::models::{ProxyCandidate, ProxyEndpoint};
use crate::proxy::backoff::BackoffEngine;
use crate::proxy::retry::{RetryPolicy, RetryPredicate, RetryRecorder};
use crate::proxy::transport::{ClientHandle, ClientOptions, RetryingClient};

/// Immutable snapshot of validated proxies, fastest first
#[derive(Debug, Clone)]
pub struct ProxyPool {
    entries: Arc<[ProxyEndpoint]>,
    published_at: DateTime<Utc>,
}

impl ProxyPool {
    pub fn from_endpoints(entries: Vec<ProxyEndpoint>) -> Self {
        Self {
            entries: entries.into(),
            published_at: Utc::now(),
        }
    }

    /// Build from accepted candidates; order is re-established by latency
    pub fn from_candidates(candidates: &[ProxyCandidate]) -> Self {
        let mut ranked: Vec<&ProxyCandidate> = candidates.iter().collect();
        ranked.sort_by_key(|c| c.latency_ms.unwrap_or(u64::MAX));
        Self::from_endpoints(ranked.into_iter().map(ProxyCandidate::endpoint).collect())
    }

    pub fn empty() -> Self {
        Self::from_endpoints(vec![])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ProxyEndpoint] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ProxyEndpoint> {
        self.entries.get(index)
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::empty()
    }
}

/// A pool together with the clients bound to its slots
struct PoolClients {
    pool: ProxyPool,
    clients: Vec<ClientHandle>,
}

struct ClientGroup {
    direct: ClientHandle,
    proxy_enabled: bool,
    slots: ArcSwap<PoolClients>,
}

/// Named client handles, built once at setup and shared by every request
pub struct ClientRegistry {
    groups: DashMap<String, Arc<ClientGroup>>,
    backoff: BackoffEngine,
    recorder: RetryRecorder,
    when_retry: Option<RetryPredicate>,
}

impl ClientRegistry {
    pub fn new(backoff: BackoffEngine, recorder: RetryRecorder) -> Self {
        Self {
            groups: DashMap::new(),
            backoff,
            recorder,
            when_retry: None,
        }
    }

    /// Transport policy predicate for every client built from now on
    pub fn with_retry_predicate<F>(mut self, when_retry: F) -> Self
    where
        F: Fn(reqwest::StatusCode) -> bool + Send + Sync + 'static,
    {
        self.when_retry = Some(Arc::new(when_retry));
        self
    }

    pub fn backoff(&self) -> &BackoffEngine {
        &self.backoff
    }

    pub fn recorder(&self) -> &RetryRecorder {
        &self.recorder
    }

    /// Register `name` from configuration.
    ///
    /// Always builds the direct client. With proxying enabled the configured proxies are
    /// bound as the initial pool, and an empty list is a configuration error.
    pub fn register(&self, name: &str, config: &HttpClientConfig) -> Result<()> {
        ensure_name(name)?;

        if config.proxy_enabled && config.proxies.is_empty() {
            return Err(ProxyError::MissingProxies {
                name: name.to_string(),
            });
        }

        let options = ClientOptions::from(config);
        let direct: ClientHandle = Arc::new(RetryingClient::build(
            name,
            None,
            &options,
            self.policy(config),
        )?);

        let pool = ProxyPool::from_endpoints(config.proxies.clone());
        let clients = if config.proxy_enabled {
            self.build_slot_clients(name, &pool, config)?
        } else {
            vec![]
        };

        self.insert(name, direct, config.proxy_enabled, pool, clients);
        Ok(())
    }

    /// Register `name` around an existing direct client with an empty pool
    pub fn register_with(&self, name: &str, direct: ClientHandle, proxy_enabled: bool) -> Result<()> {
        ensure_name(name)?;
        self.insert(name, direct, proxy_enabled, ProxyPool::empty(), vec![]);
        Ok(())
    }

    /// Bind a freshly validated pool to `name`, building one client per slot
    pub fn publish(&self, name: &str, pool: ProxyPool, config: &HttpClientConfig) -> Result<()> {
        let clients = self.build_slot_clients(name, &pool, config)?;
        self.publish_clients(name, pool, clients)
    }

    /// Atomically replace the pool of `name` with prebuilt slot clients
    pub fn publish_clients(
        &self,
        name: &str,
        pool: ProxyPool,
        clients: Vec<ClientHandle>,
    ) -> Result<()> {
        let group = self.group(name)?;

        if group.proxy_enabled && pool.is_empty() {
            return Err(ProxyError::MissingProxies {
                name: name.to_string(),
            });
        }
        if clients.len() != pool.len() {
            return Err(ProxyError::Internal(format!(
                "{} clients for a pool of {}",
                clients.len(),
                pool.len()
            )));
        }

        info!("Publishing {} proxies for '{}'", pool.len(), name);
        group.slots.store(Arc::new(PoolClients { pool, clients }));
        Ok(())
    }

    /// Resolve a client for one request.
    ///
    /// Direct when proxying is off or the pool is empty; otherwise the slot at `index`,
    /// or a slot drawn uniformly at random on every call.
    pub fn select_client(&self, name: &str, index: Option<usize>) -> Result<ClientHandle> {
        let group = self.group(name)?;
        let slots = group.slots.load();

        if !group.proxy_enabled || slots.clients.is_empty() {
            return Ok(group.direct.clone());
        }

        let size = slots.clients.len();
        let index = match index {
            Some(index) if index < size => index,
            Some(index) => return Err(ProxyError::ClientIndexOutOfRange { index, size }),
            None => rand::thread_rng().gen_range(0..size),
        };

        debug!("Selected client {}.{}", name, index);
        Ok(slots.clients[index].clone())
    }

    /// Currently published pool of `name`
    pub fn pool(&self, name: &str) -> Result<ProxyPool> {
        Ok(self.group(name)?.slots.load().pool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Transport policy for clients built from `config`
    pub fn policy(&self, config: &HttpClientConfig) -> RetryPolicy {
        let policy = RetryPolicy::new(
            config.retry,
            config.retry_first_delay,
            self.backoff.clone(),
            self.recorder.clone(),
        );

        match &self.when_retry {
            Some(when_retry) => {
                let when_retry = when_retry.clone();
                policy.with_predicate(move |status| when_retry(status))
            }
            None => policy,
        }
    }

    fn build_slot_clients(
        &self,
        name: &str,
        pool: &ProxyPool,
        config: &HttpClientConfig,
    ) -> Result<Vec<ClientHandle>> {
        let options = ClientOptions::from(config);

        pool.entries()
            .iter()
            .enumerate()
            .map(|(n, endpoint)| -> Result<ClientHandle> {
                info!("HttpClient #{} proxy {} {}", n, endpoint.address(), endpoint.note);
                let client = RetryingClient::build(
                    format!("{}.{}", name, n),
                    Some(endpoint.clone()),
                    &options,
                    self.policy(config),
                )?;
                Ok(Arc::new(client))
            })
            .collect()
    }

    fn insert(
        &self,
        name: &str,
        direct: ClientHandle,
        proxy_enabled: bool,
        pool: ProxyPool,
        clients: Vec<ClientHandle>,
    ) {
        let group = ClientGroup {
            direct,
            proxy_enabled,
            slots: ArcSwap::from_pointee(PoolClients { pool, clients }),
        };
        self.groups.insert(name.to_string(), Arc::new(group));
    }

    fn group(&self, name: &str) -> Result<Arc<ClientGroup>> {
        self.groups
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProxyError::ClientNotRegistered(name.to_string()))
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(BackoffEngine::default(), RetryRecorder::disabled())
    }
}

fn ensure_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProxyError::InvalidConfig(
            "client name must not be empty".to_string(),
        ));
    }
    Ok(())
}

//! Proxyrelay - Entry Point
//!
//! `scan` discovers and validates proxies, `fetch` requests URLs through the validated pool.

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyrelay::config::{Config, LogConfig};
use proxyrelay::models::RetryEvent;
use proxyrelay::proxy::{
    BackoffEngine, ClientOptions, ClientRegistry, FreeProxyListSource, HttpProbe, HttpProxyClient,
    ProxyValidator, RetryRecorder,
};
use proxyrelay::services::{PoolRefreshHandle, PoolRefreshService, PoolRefresher};

const CLIENT_NAME: &str = "proxy.client";

/// Resilient outbound HTTP through validated free proxies
#[derive(Debug, Parser)]
#[command(name = "proxyrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover and validate proxies, then print the ranked pool
    Scan(ScanArgs),

    /// Fetch URLs, through the proxy pool when PROXY_ENABLED is set
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Print the pool as a JSON array
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Decode bodies with this charset label (e.g. windows-1250), whatever they declare
    #[arg(long)]
    encoding: Option<String>,

    /// Override HTTP_RETRY for these requests
    #[arg(long)]
    retry: Option<u32>,

    /// Pin a pool slot instead of drawing one at random
    #[arg(long)]
    client_index: Option<usize>,

    /// Print every retry decision as a JSON line on stderr
    #[arg(long)]
    trace_retries: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    match cli.command {
        Command::Scan(args) => scan(&config, args).await,
        Command::Fetch(args) => fetch(&mut config, args).await,
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxyrelay={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn refresher(config: &Config) -> anyhow::Result<PoolRefresher<HttpProbe>> {
    let source = FreeProxyListSource::new(
        config.discovery.listing_url.clone(),
        &ClientOptions::from(&config.http),
    )?;
    let validator = ProxyValidator::new(
        HttpProbe::new(config.http.user_agent.clone()),
        config.probe.clone(),
    )?;

    Ok(PoolRefresher::new(
        Arc::new(source),
        validator,
        config.validation.clone(),
        config.discovery.require_minimum,
    ))
}

async fn scan(config: &Config, args: ScanArgs) -> anyhow::Result<()> {
    let pool = refresher(config)?.scan().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(pool.entries())?);
    } else {
        for (n, endpoint) in pool.entries().iter().enumerate() {
            println!(
                "#{} {} {} {}ms",
                n,
                endpoint.address(),
                endpoint.note,
                endpoint.latency_ms.unwrap_or_default()
            );
        }
    }

    info!("Scan complete: {} proxies", pool.len());
    Ok(())
}

async fn fetch(config: &mut Config, args: FetchArgs) -> anyhow::Result<()> {
    let (events_tx, events_rx) = broadcast::channel::<RetryEvent>(256);
    if args.trace_retries {
        tokio::spawn(print_retry_events(events_rx));
    }

    let registry = Arc::new(ClientRegistry::new(
        BackoffEngine::default(),
        RetryRecorder::new(events_tx),
    ));

    if config.http.proxy_enabled && config.http.proxies.is_empty() {
        refresher(config)?
            .assign_to_config(&mut config.http)
            .await
            .context("proxy validation failed")?;
    }
    registry
        .register(CLIENT_NAME, &config.http)
        .context("failed to register client")?;

    // Start pool refresh service
    let refresh = if config.http.proxy_enabled && config.discovery.refresh_interval > 0 {
        let (handle, shutdown) = PoolRefreshHandle::new();
        let service = PoolRefreshService::new(
            refresher(config)?,
            registry.clone(),
            CLIENT_NAME,
            config.http.clone(),
            config.discovery.refresh_interval,
        );
        let task = tokio::spawn(async move {
            service.run(shutdown).await;
        });
        Some((handle, task))
    } else {
        None
    };

    let client = HttpProxyClient::new(registry, CLIENT_NAME, &config.http);
    let total = args.urls.len();

    let failures = tokio::select! {
        failures = fetch_all(&client, &args) => failures,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            total
        }
    };

    if let Some((handle, task)) = refresh {
        handle.shutdown();
        let _ = task.await;
    }

    if failures > 0 {
        anyhow::bail!("{} of {} requests returned no content", failures, total);
    }
    Ok(())
}

async fn fetch_all(client: &HttpProxyClient, args: &FetchArgs) -> usize {
    let mut failures = 0;

    for url in &args.urls {
        match client
            .get_string(url, args.encoding.as_deref(), args.retry, args.client_index)
            .await
        {
            Some(body) => println!("{}", body),
            None => {
                warn!("No content from {}", url);
                failures += 1;
            }
        }
    }

    failures
}

async fn print_retry_events(mut events: broadcast::Receiver<RetryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{}", line),
                Err(e) => error!("Failed to encode retry event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Skipped {} retry events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// Numan Thabit 2025
mod config;
mod http;
mod poller;
mod state;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use config::ObserverConfig;
use parking_lot::Mutex;
use solana_telemetry_core::{
    epoch_cache::HttpEpochSource, prices::HttpQuoteSource, validators::HttpMetadataSource,
    BlockPipeline, EndpointRole, EpochCache, HistoricalStore, PriceCache, ProviderClient,
    ProviderEndpoint, Session, TelemetryMetrics, UpdateBuffer, ValidatorDirectory,
};
use state::ObserverState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(author, version, about = "Solana chain telemetry observer")]
struct Cli {
    /// Path to the observer configuration file
    #[arg(long, default_value = "ops/solana-telemetry-observer.example.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = ObserverConfig::load(cli.config).await?;
    let metrics = TelemetryMetrics::new();
    let timeout = config.polling.request_timeout();

    let primary = ProviderEndpoint::new(
        EndpointRole::Primary,
        config.primary.url.clone(),
        config.primary.auth_token.clone(),
    );
    let fallback = config.fallback.as_ref().map(|endpoint| {
        ProviderEndpoint::new(
            EndpointRole::Fallback,
            endpoint.url.clone(),
            endpoint.auth_token.clone(),
        )
    });
    let client = Arc::new(
        ProviderClient::new(primary, fallback, timeout, metrics.clone())
            .context("failed to build provider client")?,
    );

    let history_path = config.history.path();
    let history = Arc::new(
        HistoricalStore::open(&history_path, config.history.retention())
            .with_context(|| format!("failed to open history at {}", history_path.display()))?,
    );

    let session = Arc::new(Mutex::new(Session::new(
        config.session.accumulator(),
        config.session.seen_horizon(),
    )));
    let updates = UpdateBuffer::new(
        config.stream.queue_depth(),
        config.stream.channel_capacity(),
        metrics.clone(),
    );
    let pipeline = Arc::new(BlockPipeline::new(
        client.clone(),
        session.clone(),
        Some(history.clone()),
        updates.clone(),
        metrics.clone(),
        config.polling.pipeline(),
    ));

    let epochs = match &config.epochs {
        Some(epochs) => {
            let source = HttpEpochSource::new(epochs.url_template.clone(), epochs.request_timeout())
                .context("failed to build epoch service client")?;
            Some(http::EpochService {
                cache: EpochCache::new(epochs.cache(), Arc::new(source), metrics.clone()),
                max_batch: epochs.max_batch(),
                max_epoch: epochs.max_epoch,
            })
        }
        None => None,
    };

    let prices = match &config.prices {
        Some(prices) => {
            let source = HttpQuoteSource::new(prices.url.as_str(), timeout)
                .context("failed to build price service client")?;
            Some(Arc::new(PriceCache::new(
                prices.assets.clone(),
                prices.ttl(),
                Arc::new(source),
            )))
        }
        None => None,
    };

    let validators = match &config.validators {
        Some(validators) => {
            let source = HttpMetadataSource::new(validators.url.as_str(), timeout)
                .context("failed to build validator metadata client")?;
            Some(Arc::new(ValidatorDirectory::new(Arc::new(source))))
        }
        None => None,
    };

    let shutdown = CancellationToken::new();
    let app = http::AppState {
        observer: ObserverState::new(session),
        metrics,
        history,
        updates,
        epochs,
        prices,
        validators,
        shutdown: shutdown.clone(),
    };

    let poll_handles = poller::spawn_pollers(
        &config,
        poller::Pollers {
            client,
            pipeline,
            app: app.clone(),
        },
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
        signal.cancel();
    });

    let served = http::serve(config.http_bind, app).await;
    shutdown.cancel();
    for handle in poll_handles {
        handle.abort();
    }
    served
}

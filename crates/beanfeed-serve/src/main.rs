//! Beanfeed Serve - coffee feed generator.
//!
//! This binary runs the whole service in one process: the firehose ingestor,
//! the retention sweeper and the HTTP API.

use std::sync::Arc;

use anyhow::Context;
use axum::http::Request;
use beanfeed_core::metrics::{init_metrics, start_metrics_server};
use beanfeed_ingest::{CarCommitDecoder, FirehoseIngestor, PostStore, run_eviction_loop};
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use beanfeed_serve::{AppState, Config, router};

/// Feed generator serving recent coffee posts from the AT Protocol firehose.
#[derive(Parser, Debug)]
#[command(name = "beanfeed-serve")]
#[command(about = "Coffee post feed generator", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The firehose client uses rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Parse CLI arguments
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    // Load configuration
    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let retention = config.retention;
    let eviction_interval = config.eviction_interval;

    // Open the post store
    let store = Arc::new(
        PostStore::open(&config.data_path)
            .with_context(|| format!("failed to open store at {}", config.data_path.display()))?,
    );
    metrics::gauge!("store_posts").set(store.count() as f64);

    // Background tasks
    let ingestor = Arc::new(FirehoseIngestor::new(
        config.firehose_config(),
        Arc::clone(&store),
        Arc::new(CarCommitDecoder),
    ));
    let ingest_task = {
        let ingestor = Arc::clone(&ingestor);
        tokio::spawn(async move { ingestor.run().await })
    };

    let (sweeper_tx, sweeper_rx) = watch::channel(false);
    let eviction_task = tokio::spawn(run_eviction_loop(
        Arc::clone(&store),
        eviction_interval,
        retention,
        sweeper_rx,
    ));

    // Create application state
    let state = AppState::new(config, store, ingestor.subscribe_state());

    // Build router with middleware
    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    query = request.uri().query().unwrap_or("")
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    let shutdown = {
        let ingestor = Arc::clone(&ingestor);
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received, stopping gracefully...");
            ingestor.shutdown();
            sweeper_tx.send_replace(true);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let (ingest, eviction) = tokio::join!(ingest_task, eviction_task);
    ingest.context("ingestor task panicked")?;
    eviction.context("eviction task panicked")?;

    let stats = ingestor.stats();
    tracing::info!(
        frames = stats.frames,
        accepted = stats.accepted,
        duplicates = stats.duplicates,
        rejected = stats.rejected,
        reconnects = stats.reconnects,
        "shutdown complete"
    );

    Ok(())
}

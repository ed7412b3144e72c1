mod config;
mod error;
mod identity;
mod routes;
mod storage;
mod tracker;
mod upstream;

use axum::ServiceExt;
use axum::http::{HeaderValue, Method, header};
use clap::Parser;
use config::{Config, CorsMode};
use error::BrokerError;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracker::UsageTracker;
use upstream::RealtimeClient;

pub const SERVICE_NAME: &str = "realtime-broker";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// Timeout for session-establishment calls to the realtime API
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub tracker: Arc<UsageTracker>,
    pub realtime: RealtimeClient,
    /// Bearer key required on /api routes; `None` disables the check
    pub api_key: Option<String>,
}

#[derive(Parser)]
#[command(name = "realtime-broker")]
#[command(about = "Usage-metered broker for realtime voice sessions")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "BROKER_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "BROKER_PORT")]
    port: Option<u16>,
}

fn cors_layer(mode: &CorsMode) -> CorsLayer {
    let cors_origins = mode.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn run(args: Args, config: Config) -> Result<(), BrokerError> {
    // Storage must be reachable before serving any traffic
    let storage = storage::connect(&config.storage, config.storage_timeout).await?;
    let tracker = Arc::new(UsageTracker::new(
        storage,
        config.token_limit,
        config.reset_period(),
        config.storage_timeout,
    ));
    info!(
        "Token limit: {} per client every {}h",
        tracker.token_limit(),
        tracker.reset_period().num_hours()
    );

    // Shared HTTP client with connection pooling
    let http_client = Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .pool_max_idle_per_host(10)
        .build()?;
    let realtime = RealtimeClient::new(http_client, config.realtime.clone());
    if !realtime.is_configured() {
        warn!("OPENAI_API_KEY is not set; realtime sessions will be refused");
    }

    if config.api_key.is_none() {
        warn!("BROKER_API_KEY is not set; /api routes are unauthenticated");
    }

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    let state = Arc::new(AppState {
        tracker: tracker.clone(),
        realtime,
        api_key: config.api_key.clone(),
    });

    let app = NormalizePath::trim_trailing_slash(
        routes::router(state).layer(cors_layer(&config.cors_mode)),
    );

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| BrokerError::Config(format!("Invalid listen address {host}:{port}: {e}")))?;

    info!(
        "Starting {} v{}-{} (built {})",
        SERVICE_NAME, VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("API docs: http://{}/swagger", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<SocketAddr>(
            app,
        ),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Close storage even if the server stopped with an error
    if let Err(e) = tracker.close().await {
        warn!("Failed to close usage storage: {e}");
    }
    served?;

    info!("Shut down cleanly");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config first so values from .env are visible to the CLI parser
    let config = Config::from_env();
    let args = Args::parse();

    let result = match config {
        Ok(config) => run(args, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {e}");
        std::process::exit(1);
    }
}

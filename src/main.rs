//! CardStor Storage Service
//!
//! Process entrypoint: wires the backend adapters into the mode detector,
//! resource deduplicator and storage orchestrator, starts the periodic
//! mode monitoring loop, and exposes health and metrics endpoints.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CardStor Storage Service                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │     Mode     │───▶│   Storage    │───▶│   Backend    │       │
//! │  │   Detector   │    │ Orchestrator │    │   Adapters   │       │
//! │  │    (Eyes)    │    │   (Brain)    │    │   (Hands)    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod adapters;
mod dedup;
mod detector;
mod domain;
mod error;
mod metrics;
mod orchestrator;

use crate::adapters::{FsFallbackStore, S3Config, S3ObjectStore, TracingEventLog};
use crate::dedup::{DedupConfig, ResourceDeduplicator};
use crate::detector::{DetectorConfig, ModeDetector};
use crate::domain::ports::{EventLog, FallbackStore, MetadataStore, ObjectStore, ProjectService};
use crate::error::Result;
use crate::orchestrator::{OrchestratorConfig, StorageOrchestrator};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CardStor - mode-aware storage orchestration for template platforms
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// S3-compatible endpoint URL (SeaweedFS, MinIO)
    #[arg(long, env = "OBJECT_STORE_ENDPOINT", default_value = "http://seaweedfs:8333")]
    object_store_endpoint: String,

    /// Object store access key
    #[arg(long, env = "OBJECT_STORE_ACCESS_KEY", default_value = "admin")]
    object_store_access_key: String,

    /// Object store secret key
    #[arg(long, env = "OBJECT_STORE_SECRET_KEY", default_value = "admin")]
    object_store_secret_key: String,

    /// Bucket for template and resource blobs
    #[arg(long, env = "STORAGE_BUCKET", default_value = "cardstor")]
    bucket: String,

    /// Root directory of the filesystem fallback store
    #[arg(long, env = "FALLBACK_ROOT", default_value = "/var/lib/cardstor/fallback")]
    fallback_root: String,

    /// PostgreSQL connection URL for the metadata store
    #[cfg(feature = "postgres")]
    #[arg(long, env = "METADATA_DATABASE_URL")]
    metadata_database_url: Option<String>,

    /// Probe timeout in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECONDS", default_value = "5")]
    probe_timeout_seconds: u64,

    /// Probe interval in seconds
    #[arg(long, env = "PROBE_INTERVAL_SECONDS", default_value = "30")]
    probe_interval_seconds: u64,

    /// Maximum resource size in megabytes
    #[arg(long, env = "MAX_RESOURCE_MB", default_value = "50")]
    max_resource_mb: usize,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting CardStor storage service");
    info!("  Object store endpoint: {}", args.object_store_endpoint);
    info!("  Bucket: {}", args.bucket);
    info!("  Fallback root: {}", args.fallback_root);
    info!("  Probe interval: {}s", args.probe_interval_seconds);

    // Backend adapters, constructed once and injected everywhere.
    let object_store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(S3Config {
            endpoint: Some(args.object_store_endpoint.clone()),
            access_key_id: args.object_store_access_key.clone(),
            secret_access_key: args.object_store_secret_key.clone(),
            ..Default::default()
        })
        .await,
    );

    let fallback: Arc<dyn FallbackStore> =
        Arc::new(FsFallbackStore::new(&args.fallback_root).await?);

    let metadata: Arc<dyn MetadataStore> = build_metadata_store(&args).await?;
    let event_log: Arc<dyn EventLog> = Arc::new(TracingEventLog::info_level());
    let projects: Arc<dyn ProjectService> =
        Arc::new(adapters::memory::InMemoryProjectService::new());

    // Bootstrap the bucket so a clean deployment probes as Full.
    if let Err(e) = object_store.create_bucket(&args.bucket).await {
        error!("Bucket bootstrap failed (continuing degraded): {}", e);
    }

    let detector = Arc::new(ModeDetector::new(
        DetectorConfig {
            probe_timeout: Duration::from_secs(args.probe_timeout_seconds),
            probe_interval: Duration::from_secs(args.probe_interval_seconds),
            bucket: args.bucket.clone(),
        },
        Arc::clone(&metadata),
        Arc::clone(&event_log),
        Arc::clone(&object_store),
        Arc::clone(&fallback),
    ));

    let dedup = Arc::new(ResourceDeduplicator::new(
        DedupConfig {
            max_resource_bytes: args.max_resource_mb * 1024 * 1024,
            bucket: args.bucket.clone(),
            ..Default::default()
        },
        Arc::clone(&detector),
        Arc::clone(&metadata),
        Arc::clone(&event_log),
        Arc::clone(&object_store),
        Arc::clone(&fallback),
    ));

    let orchestrator = Arc::new(StorageOrchestrator::new(
        OrchestratorConfig {
            bucket: args.bucket.clone(),
            ..Default::default()
        },
        Arc::clone(&detector),
        dedup,
        metadata,
        object_store,
        fallback,
        event_log,
        projects,
    ));

    // Periodic probing: eager first cycle, then every interval.
    Arc::clone(&detector).start_monitoring();

    let health_addr = args.health_addr.clone();
    let health_detector = Arc::clone(&detector);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_detector).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("CardStor storage service ready");

    // The orchestrator is driven by the API layer in front of this
    // process; keep the runtime alive until asked to stop.
    let _orchestrator = orchestrator;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| error::Error::Internal(format!("signal handler failed: {}", e)))?;

    info!("Shutting down");
    detector.stop_monitoring();
    info!("Storage service shutdown complete");
    Ok(())
}

#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
async fn build_metadata_store(args: &Args) -> Result<Arc<dyn MetadataStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &args.metadata_database_url {
        let store = adapters::postgres::PostgresMetadataStore::new(url, 20).await?;
        info!("Metadata store: postgres");
        return Ok(Arc::new(store));
    }

    info!("Metadata store: in-memory (no database configured)");
    Ok(Arc::new(adapters::memory::InMemoryMetadataStore::new()))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("aws_config=warn".parse().unwrap())
        .add_directive("aws_smithy_runtime=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, detector: Arc<ModeDetector>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        detector: Arc<ModeDetector>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            "/mode" => {
                let body = format!("{{\"mode\":\"{}\"}}", detector.current_mode());
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| error::Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| error::Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| error::Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let detector = Arc::clone(&detector);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| health_handler(req, Arc::clone(&detector))),
                )
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| error::Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| error::Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| error::Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

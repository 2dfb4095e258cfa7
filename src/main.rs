use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderName, Method};
use base64::Engine;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::cli::{self, Commands, KeyCommands, SubjectCommands};
use relay::config::{self, Config};
use relay::delivery::DeliveryClient;
use relay::jobs::{spawn_pool, RelayWorker};
use relay::queue::JobQueue;
use relay::store::CredentialStore;
use relay::vault::{DataKey, Keyring};
use relay::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Keys {
            command: KeyCommands::Generate { kid },
        }) => generate_keys(&kid),
        Some(Commands::Serve { port, workers }) => run_server(config::load()?, port, workers).await,
        Some(Commands::Worker { concurrency }) => run_workers(config::load()?, concurrency).await,
        Some(Commands::Subject {
            command: SubjectCommands::Add { id, secret },
        }) => add_subject(&config::load()?, &id, &secret).await,
        Some(Commands::Encrypt { data }) => encrypt(&config::load()?, &data),
        None => run_server(config::load()?, None, None).await,
    };

    if let Err(ref e) = result {
        tracing::error!("{:#}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when a collector is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "relay-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json = std::env::var("RELAY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        ))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(telemetry_layer)
        .init();
    Ok(())
}

struct Backends {
    store: Arc<dyn CredentialStore>,
    queue: Arc<dyn JobQueue>,
}

#[cfg(not(feature = "test-store"))]
async fn connect_backends(cfg: &Config) -> anyhow::Result<Backends> {
    use relay::queue::RedisJobQueue;
    use relay::store::RedisCredentialStore;

    tracing::info!("Connecting to Redis...");
    let client = redis::Client::open(cfg.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;

    Ok(Backends {
        store: Arc::new(RedisCredentialStore::new(conn.clone(), &cfg.key_prefix)),
        queue: Arc::new(RedisJobQueue::new(conn, &cfg.key_prefix, cfg.archive_ttl())),
    })
}

/// In-memory backends seeded from `RELAY_TEST_SUBJECTS` (`id:secret,...`).
#[cfg(feature = "test-store")]
async fn connect_backends(cfg: &Config) -> anyhow::Result<Backends> {
    use relay::queue::MemoryJobQueue;
    use relay::store::MemoryCredentialStore;

    if cfg.production {
        anyhow::bail!("a test-store build refuses to run with RELAY_ENV=production");
    }
    tracing::warn!("test-store build: subjects and jobs live in memory and are lost on exit");

    let mut store = MemoryCredentialStore::new();
    let seeds = std::env::var("RELAY_TEST_SUBJECTS").unwrap_or_default();
    for pair in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, secret) = pair
            .split_once(':')
            .context("RELAY_TEST_SUBJECTS entries must look like <id>:<secret>")?;
        store = store.with_subject(id, secret)?;
    }

    Ok(Backends {
        store: Arc::new(store),
        queue: Arc::new(MemoryJobQueue::new()),
    })
}

fn build_worker(
    cfg: &Config,
    queue: Arc<dyn JobQueue>,
    keyring: Arc<Keyring>,
) -> anyhow::Result<RelayWorker> {
    let delivery = DeliveryClient::new(cfg.delivery_timeout(), cfg.delivery_signing_secret.clone())
        .context("failed to build delivery HTTP client")?;
    Ok(RelayWorker::new(queue, keyring, delivery, cfg.retry_policy())
        .with_visibility(cfg.visibility_timeout()))
}

async fn run_server(cfg: Config, port: Option<u16>, workers: Option<usize>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);
    let workers = workers.unwrap_or(cfg.workers);

    let backends = connect_backends(&cfg).await?;
    let keyring = Arc::new(cfg.keyring()?);
    tracing::info!(active_key = keyring.active_key_id(), "Data keyring loaded");

    let state = Arc::new(AppState {
        credentials: cfg.credential_service()?,
        store: backends.store,
        queue: backends.queue.clone(),
        keyring: keyring.clone(),
    });

    let shutdown = CancellationToken::new();
    let handles = if workers > 0 {
        spawn_pool(build_worker(&cfg, backends.queue, keyring)?, workers, shutdown.clone())
    } else {
        Vec::new()
    };
    tracing::info!(workers, "Embedded relay workers started");

    let app = relay::router(state).layer(cors_layer(&cfg));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    futures::future::join_all(handles).await;
    tracing::info!("Relay stopped");
    Ok(())
}

async fn run_workers(cfg: Config, concurrency: Option<usize>) -> anyhow::Result<()> {
    let size = concurrency.unwrap_or(cfg.workers).max(1);

    let backends = connect_backends(&cfg).await?;
    let keyring = Arc::new(cfg.keyring()?);

    let shutdown = CancellationToken::new();
    let handles = spawn_pool(build_worker(&cfg, backends.queue, keyring)?, size, shutdown.clone());
    tracing::info!(workers = size, "Relay workers started");

    shutdown_signal(shutdown).await;
    futures::future::join_all(handles).await;
    tracing::info!("Relay workers stopped");
    Ok(())
}

/// Resolve on Ctrl-C and cancel `token` so workers wind down.
async fn shutdown_signal(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
    token.cancel();
}

fn cors_layer(cfg: &Config) -> CorsLayer {
    let allowed = cfg.cors_origin.clone();
    let local_dev = !cfg.production;

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin = origin.to_str().unwrap_or("");
            allowed.as_deref() == Some(origin)
                || (local_dev
                    && (origin.starts_with("http://localhost:")
                        || origin.starts_with("http://127.0.0.1:")))
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
}

fn generate_keys(kid: &str) -> anyhow::Result<()> {
    let signing = relay::auth::credentials::generate_signing_key()?;
    let data_key = DataKey::generate(kid)?;

    println!(
        "RELAY_SIGNING_KEY={}",
        base64::engine::general_purpose::STANDARD.encode(signing)
    );
    println!("RELAY_DATA_KEY={}:{}", data_key.id(), data_key.to_hex());
    Ok(())
}

async fn add_subject(cfg: &Config, id: &str, secret: &str) -> anyhow::Result<()> {
    let backends = connect_backends(cfg).await?;
    backends.store.put_subject(id, secret).await?;
    println!("Subject {} stored.", id);
    Ok(())
}

fn encrypt(cfg: &Config, data: &str) -> anyhow::Result<()> {
    let keyring = cfg.keyring()?;
    println!("{}", keyring.encrypt(data.as_bytes())?);
    Ok(())
}

// Spindle server
//
// Wires the pieces together: database, vault, docker engine, job queue,
// event consumer, jetstream ingester, and the HTTP surface (XRPC + SSE).

mod auth;
mod config;
mod error;
mod events;
mod identity;
mod xrpc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use spindle_core::traits::{CursorStore, Vault, WorkflowEngine};
use spindle_core::Notifier;
use spindle_storage::{
    Database, Enforcer, EncryptionService, OpenBaoConfig, OpenBaoVault, SqliteVault,
};
use spindle_worker::{
    ConsumerConfig, DockerEngine, DockerEngineConfig, EventConsumer, EventSource,
    JetstreamIngester, JobQueue, Spindle, SpindleConfig,
};

use crate::auth::{AuthState, JwtServiceAuth};
use crate::config::{Config, SecretsProvider};
use crate::identity::IdResolver;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    owner: String,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        xrpc::add_secret,
        xrpc::remove_secret,
        xrpc::list_secrets,
        xrpc::owner,
        events::stream_events,
    ),
    components(schemas(
        xrpc::AddSecretRequest,
        xrpc::RemoveSecretRequest,
        xrpc::ListSecretsResponse,
        xrpc::SecretView,
        xrpc::OwnerResponse,
        error::ErrorBody,
    )),
    tags(
        (name = "secrets", description = "Repo secret management"),
        (name = "events", description = "Workflow status event stream")
    ),
    info(
        title = "Spindle",
        description = "CI executor for the Tangled network",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        hostname = %config.hostname,
        owner = %config.owner,
        "spindle starting..."
    );

    // Database
    let db = Database::open(&config.db_path)
        .await
        .context("Failed to open database")?;
    db.add_known_did(&config.owner).await?;
    tracing::info!(path = %config.db_path.display(), "Database ready");

    // Vault backend
    let vault: Arc<dyn Vault> = match config.secrets_provider {
        SecretsProvider::Sqlite => {
            let encryption = match EncryptionService::from_env() {
                Ok(service) => {
                    tracing::info!("Secret values are encrypted at rest");
                    Some(service)
                }
                Err(err) => {
                    tracing::warn!(
                        "SECRETS_ENCRYPTION_KEY not usable ({err}); storing secret values in plaintext"
                    );
                    None
                }
            };
            Arc::new(SqliteVault::new(db.clone(), encryption))
        }
        SecretsProvider::OpenBao => {
            let addr = config
                .openbao_addr
                .clone()
                .context("OPENBAO_ADDR required for the openbao secrets provider")?;
            let token = config
                .openbao_token
                .clone()
                .context("OPENBAO_TOKEN required for the openbao secrets provider")?;
            let mut bao = OpenBaoConfig::new(addr, token);
            bao.mount = config.openbao_mount.clone();
            Arc::new(OpenBaoVault::new(bao))
        }
    };

    // Execution engine
    let engine: Arc<dyn WorkflowEngine> = Arc::new(
        DockerEngine::new(DockerEngineConfig {
            nixery_host: config.nixery_host.clone(),
            workflow_timeout: config.workflow_timeout,
            dev: config.dev,
        })
        .context("Failed to create docker engine")?,
    );

    // Queue, orchestrator, consumers
    let notifier = Notifier::new();
    let queue = Arc::new(JobQueue::new(config.queue_size));
    queue.start(config.queue_workers).await;

    let spindle = Spindle::new(
        db.clone(),
        engine,
        vault.clone(),
        notifier.clone(),
        queue.clone(),
        SpindleConfig {
            owner: config.owner.clone(),
            log_dir: config.log_dir.clone(),
        },
    );

    let cursors: Arc<dyn CursorStore> = Arc::new(db.clone());
    let consumer = Arc::new(EventConsumer::new(
        ConsumerConfig {
            dev: config.dev,
            workers: config.consumer_workers,
            ..Default::default()
        },
        cursors.clone(),
        spindle.process_func(),
    ));

    // Subscribe to configured knots plus any remembered from earlier runs
    let mut sources: Vec<EventSource> = config
        .subscribed_knots
        .iter()
        .map(EventSource::knot)
        .collect();
    for knot in db.list_knots().await? {
        sources.push(EventSource::knot(knot.hostname));
    }
    consumer.start(sources).await;

    let jetstream = Arc::new(JetstreamIngester::new(
        config.jetstream_endpoint.clone(),
        config.owner.clone(),
        db.clone(),
        cursors,
    ));
    let jetstream_task = jetstream.clone().start();

    // HTTP surface
    let resolver = Arc::new(IdResolver::new(
        config.plc_directory.clone(),
        config.dev,
        db.clone(),
    ));
    let xrpc_state = xrpc::AppState {
        vault: vault.clone(),
        enforcer: Enforcer::new(db.clone(), config.owner.clone()),
        resolver: resolver.clone(),
    };
    let auth_state = AuthState {
        validator: Arc::new(JwtServiceAuth::new(config.self_did(), resolver)),
    };
    let events_state = events::AppState {
        db: db.clone(),
        notifier: notifier.clone(),
    };

    let health_owner = config.owner.clone();
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let owner = health_owner.clone();
                async move {
                    Json(HealthResponse {
                        status: "ok",
                        version: env!("CARGO_PKG_VERSION"),
                        owner,
                    })
                }
            }),
        )
        .merge(xrpc::routes(xrpc_state, auth_state))
        .merge(events::routes(events_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down");
    consumer.stop().await;
    jetstream.stop();
    jetstream_task.abort();
    queue.stop().await;
    vault.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

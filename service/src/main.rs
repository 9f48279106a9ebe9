#![deny(
    clippy::expect_used,
    clippy::panic,
    clippy::print_stdout,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used
)]

use std::sync::Arc;

use axum::{
    http::{header::HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;
use vaultkeep_api::{
    config::Config,
    exchange::{self, http::SESSION_HEADER, Exchange},
    http::{build_security_headers, security_headers_middleware},
    maintenance::Sweeper,
    operations::{
        InMemorySettingsStore, JsonFileSettingsStore, Orchestrator, OrchestratorLimits,
        ScriptStorageEngine, SettingsStore, StorageEngine,
    },
    session::SessionKeyStore,
    tokens::TokenIssuer,
    upload::UploadPipeline,
};

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load and validate configuration first (fail-fast)
    let config = Config::load().map_err(|e| anyhow::anyhow!("{e}"))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vaultkeep-api starting up");

    tokio::fs::create_dir_all(&config.upload.dir).await?;
    tracing::info!(dir = %config.upload.dir, "upload directory ready");

    let settings: Arc<dyn SettingsStore> = match &config.storage.settings_file {
        Some(path) => {
            tracing::info!(path = %path, "settings persisted to file");
            Arc::new(JsonFileSettingsStore::new(path))
        }
        None => {
            tracing::warn!("no settings file configured - saved passphrases are lost on restart");
            Arc::new(InMemorySettingsStore::new())
        }
    };
    if config.storage.dump_command.is_none() || config.storage.restore_command.is_none() {
        tracing::warn!("dump or restore command not configured - those operations will fail");
    }
    let engine: Arc<dyn StorageEngine> = Arc::new(ScriptStorageEngine::from_config(&config.storage));

    let sessions = Arc::new(SessionKeyStore::new(config.session.idle_timeout()));
    let tokens = Arc::new(TokenIssuer::new(config.tokens.max_duration_minutes));
    let uploads = Arc::new(UploadPipeline::from_config(&config.upload, Arc::clone(&tokens)));
    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        Arc::clone(&settings),
        Arc::clone(&tokens),
        Arc::clone(&uploads),
        OrchestratorLimits::from_config(&config.operations, &config.tokens),
    ));

    let sweeper = Sweeper {
        sessions: Arc::clone(&sessions),
        tokens: Arc::clone(&tokens),
        uploads: Arc::clone(&uploads),
        orchestrator: Arc::clone(&orchestrator),
    }
    .spawn(config.maintenance.sweep_interval());

    let exchange = Arc::new(Exchange {
        sessions,
        tokens,
        uploads,
        orchestrator,
        settings,
        password_length: config.tokens.password_length,
    });

    // Build CORS layer from config
    let cors_origins = &config.cors.allowed_origins;
    let allow_origin: AllowOrigin = if cors_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow any origin - not recommended for production");
        AllowOrigin::any()
    } else if cors_origins.is_empty() {
        tracing::info!(
            "CORS allowed origins not configured - cross-origin requests will be blocked"
        );
        AllowOrigin::list(Vec::<HeaderValue>::new())
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        tracing::info!(origins = ?cors_origins, "CORS allowed origins configured");
        AllowOrigin::list(origins)
    };

    let upload_limit = exchange::http::upload_body_limit(config.upload.max_chunk_size_bytes());
    let mut app = Router::new()
        .merge(exchange::http::router(
            upload_limit,
            config.session.bootstrap_enabled,
        ))
        .route("/health", get(health_check))
        .layer(Extension(exchange))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    HeaderName::from_static(SESSION_HEADER),
                ])
                .allow_origin(allow_origin),
        );

    if config.security_headers.enabled {
        tracing::info!("Security headers enabled");
        app = app
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(Extension(build_security_headers(&config.security_headers)));
    } else {
        tracing::info!("Security headers disabled");
    }
    let app = app.layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}

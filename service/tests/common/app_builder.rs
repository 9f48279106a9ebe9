//! Test app builder that mirrors main.rs wiring with injectable mocks.
//!
//! # Preset Builders
//!
//! - [`TestAppBuilder::minimal()`] - Health check only
//! - [`TestAppBuilder::with_mocks()`] - Full app with mock storage engine and
//!   settings store, CORS and security headers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use vaultkeep_api::{
    config::SecurityHeadersConfig,
    exchange::{self, http::SESSION_HEADER, Exchange, Reply},
    http::{build_security_headers, security_headers_middleware},
    operations::{
        settings::mock::MockSettingsStore, storage::mock::MockStorageEngine, Orchestrator,
        OrchestratorLimits,
    },
    session::{SessionId, SessionKeyStore},
    tokens::TokenIssuer,
    upload::{UploadLimits, UploadPipeline},
};
use vk_crypto::SessionKey;

use super::factories::MULTIPART_BOUNDARY;

/// Health check handler (mirrors main.rs)
async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// A caller session with its key.
pub struct TestSession {
    pub id: SessionId,
    pub key: SessionKey,
}

/// Built app plus handles on everything a test wants to inspect.
pub struct TestApp {
    pub router: Router,
    pub exchange: Arc<Exchange>,
    pub engine: Arc<MockStorageEngine>,
    pub settings: Arc<MockSettingsStore>,
    pub upload_dir: TempDir,
}

impl TestApp {
    /// Issue a session key the way the host application's login would.
    pub fn open_session(&self) -> TestSession {
        let id = SessionId::generate();
        let key = self.exchange.sessions.issue(&id).expect("issue key");
        TestSession { id, key }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("response")
    }

    /// POST a raw `data` string to `/api/exchange`.
    pub async fn post_exchange(&self, session: &SessionId, data: &str) -> Response {
        let body = serde_json::json!({ "data": data }).to_string();
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/api/exchange")
                .header(CONTENT_TYPE, "application/json")
                .header(SESSION_HEADER, session.as_str())
                .body(Body::from(body))
                .expect("request"),
        )
        .await
    }

    /// Seal `command`, send it, and open the sealed reply.
    pub async fn command(&self, session: &TestSession, command: Value) -> Reply {
        let wire = vk_crypto::encode_wire(&command, &session.key).expect("seal command");
        let response = self.post_exchange(&session.id, &wire).await;
        assert_eq!(response.status(), StatusCode::OK);
        self.open_reply(session, response).await
    }

    /// Command that must succeed; returns its result.
    pub async fn command_ok(&self, session: &TestSession, command: Value) -> Value {
        match self.command(session, command).await {
            Reply::Success(value) => value,
            Reply::Failure(failure) => panic!("command failed: {failure:?}"),
        }
    }

    pub async fn post_upload(&self, session: &SessionId, body: Vec<u8>) -> Response {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/api/upload")
                .header(
                    CONTENT_TYPE,
                    format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
                )
                .header(SESSION_HEADER, session.as_str())
                .body(Body::from(body))
                .expect("request"),
        )
        .await
    }

    pub async fn upload(&self, session: &TestSession, body: Vec<u8>) -> Reply {
        let response = self.post_upload(&session.id, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        self.open_reply(session, response).await
    }

    pub async fn open_reply(&self, session: &TestSession, response: Response) -> Reply {
        let body = super::body_json(response).await;
        let data = body["data"].as_str().expect("sealed data");
        vk_crypto::decode_wire(data, &session.key).expect("open reply")
    }

    /// Poll `operation_status` until the operation leaves its running states.
    pub async fn wait_settled(&self, session: &TestSession, operation_id: &str) -> Reply {
        for _ in 0..200 {
            let reply = self
                .command(session, super::factories::operation_status(operation_id))
                .await;
            match &reply {
                Reply::Success(status)
                    if !matches!(
                        status["state"].as_str(),
                        Some("backup_done" | "restore_done" | "cancelled")
                    ) =>
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                _ => return reply,
            }
        }
        panic!("operation {operation_id} never settled");
    }
}

/// Builder for test applications that mirrors main.rs wiring.
pub struct TestAppBuilder {
    include_exchange: bool,
    include_health: bool,
    bootstrap_enabled: bool,
    limits: UploadLimits,
    operation_timeout: Duration,
    max_token_minutes: i64,
    cors_origins: Option<Vec<String>>,
    security_headers: Option<SecurityHeadersConfig>,
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestAppBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            include_exchange: false,
            include_health: false,
            bootstrap_enabled: false,
            limits: UploadLimits {
                max_file_size: 64 * 1024,
                max_chunk_size: 16 * 1024,
                allowed_extensions: vec!["sql".to_string()],
                inactivity_timeout: Duration::from_secs(60),
            },
            operation_timeout: Duration::from_secs(30),
            max_token_minutes: 60,
            cors_origins: None,
            security_headers: None,
        }
    }

    // =========================================================================
    // Preset Builders
    // =========================================================================

    #[must_use]
    pub fn minimal() -> Self {
        Self::new().with_health()
    }

    #[must_use]
    pub fn with_mocks() -> Self {
        Self::new()
            .with_exchange()
            .with_health()
            .with_cors(&["http://localhost:3000"])
            .with_security_headers_default()
    }

    // =========================================================================
    // Component Configuration
    // =========================================================================

    #[must_use]
    pub const fn with_exchange(mut self) -> Self {
        self.include_exchange = true;
        self
    }

    #[must_use]
    pub const fn with_health(mut self) -> Self {
        self.include_health = true;
        self
    }

    #[must_use]
    pub const fn with_bootstrap(mut self) -> Self {
        self.bootstrap_enabled = true;
        self
    }

    #[must_use]
    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Configure CORS with specific allowed origins.
    #[must_use]
    pub fn with_cors(mut self, origins: &[&str]) -> Self {
        self.cors_origins = Some(origins.iter().map(|s| (*s).to_string()).collect());
        self
    }

    #[must_use]
    pub fn with_security_headers_default(mut self) -> Self {
        self.security_headers = Some(SecurityHeadersConfig::default());
        self
    }

    #[must_use]
    pub fn with_security_headers(mut self, config: SecurityHeadersConfig) -> Self {
        self.security_headers = Some(config);
        self
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Build the app. Layer ordering matches main.rs:
    /// routes, exchange extension, CORS, security headers.
    #[must_use]
    pub fn build(self) -> TestApp {
        let upload_dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(MockStorageEngine::new());
        let settings = Arc::new(MockSettingsStore::new());

        let sessions = Arc::new(SessionKeyStore::new(Duration::from_secs(3600)));
        let tokens = Arc::new(TokenIssuer::new(self.max_token_minutes));
        let upload_limit = exchange::http::upload_body_limit(self.limits.max_chunk_size);
        let uploads = Arc::new(UploadPipeline::new(
            upload_dir.path(),
            self.limits,
            Arc::clone(&tokens),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            engine.clone(),
            settings.clone(),
            Arc::clone(&tokens),
            Arc::clone(&uploads),
            OrchestratorLimits {
                timeout: self.operation_timeout,
                retention: Duration::from_secs(3600),
                password_length: 40,
            },
        ));
        let exchange = Arc::new(Exchange {
            sessions,
            tokens,
            uploads,
            orchestrator,
            settings: settings.clone(),
            password_length: 40,
        });

        let mut app = Router::new();
        if self.include_exchange {
            app = app.merge(exchange::http::router(upload_limit, self.bootstrap_enabled));
        }
        if self.include_health {
            app = app.route("/health", get(health_check));
        }
        app = app.layer(Extension(Arc::clone(&exchange)));

        if let Some(origins) = self.cors_origins {
            let allow_origin: AllowOrigin = if origins.iter().any(|o| o == "*") {
                AllowOrigin::any()
            } else {
                let header_values: Vec<HeaderValue> = origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect();
                AllowOrigin::list(header_values)
            };
            app = app.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                    .allow_headers([CONTENT_TYPE, HeaderName::from_static(SESSION_HEADER)])
                    .allow_origin(allow_origin),
            );
        }

        if let Some(config) = self.security_headers {
            if config.enabled {
                app = app
                    .layer(middleware::from_fn(security_headers_middleware))
                    .layer(Extension(build_security_headers(&config)));
            }
        }

        TestApp {
            router: app,
            exchange,
            engine,
            settings,
            upload_dir,
        }
    }
}

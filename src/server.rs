//! HTTP surface: the execution WebSocket and the health probe.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::{ExecutionBackend, PythonBackend};
use crate::config::Config;
use crate::reclaim::{MemoryStats, Reclaimer};
use crate::session::SessionManager;
use crate::transport::WebSocketConnection;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub reclaimer: Reclaimer,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn ExecutionBackend>, reclaimer: Reclaimer) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            reclaimer,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub cors_origins: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub memory: MemoryStats,
}

/// Build the application router.
pub fn router(state: AppState) -> Result<Router> {
    let cors = cors_layer(&state.config)?;

    Ok(Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn_with_state(state.clone(), host_guard))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}

/// Bind, serve until Ctrl-C or SIGTERM, then return.
pub async fn serve(config: Config) -> Result<()> {
    let reclaimer = Reclaimer::new();
    let backend = PythonBackend::new(config.deadline(), reclaimer.clone())
        .with_python_path(config.python_path.clone());
    let addr = SocketAddr::new(config.host, config.port);
    let app = router(AppState::new(config, Arc::new(backend), reclaimer))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        SessionManager::serve(WebSocketConnection::new(socket), state.backend).await;
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: state.config.version.clone(),
        cors_origins: state.config.cors_origins.clone(),
        allowed_hosts: state.config.allowed_hosts.clone(),
        memory: state.reclaimer.snapshot(),
    })
}

/// Reject requests whose `Host` header is not in `allowed_hosts`.
async fn host_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();

    if !state.config.host_allowed(host) {
        warn!(host, "Rejected request with disallowed host");
        return (StatusCode::BAD_REQUEST, "Invalid host header").into_response();
    }
    next.run(request).await
}

fn cors_layer(config: &Config) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.allows_any_origin() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = config
        .cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    use super::*;

    fn app(config: Config) -> Router {
        let reclaimer = Reclaimer::new();
        let backend = PythonBackend::new(Duration::from_secs(5), reclaimer.clone());
        router(AppState::new(config, Arc::new(backend), reclaimer)).unwrap()
    }

    fn get_with_host(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_configuration() {
        let config = Config {
            version: "2.1.0".to_string(),
            cors_origins: vec!["https://lab.example.com".to_string()],
            ..Config::default()
        };

        let response = app(config)
            .oneshot(get_with_host("/health", "localhost:8000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "2.1.0");
        assert_eq!(body["cors_origins"], serde_json::json!(["https://lab.example.com"]));
        assert_eq!(body["allowed_hosts"], serde_json::json!(["*"]));
        assert_eq!(body["memory"]["reclamation_passes"], 0);
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected() {
        let config = Config {
            allowed_hosts: vec!["*.example.com".to_string()],
            ..Config::default()
        };

        let response = app(config)
            .oneshot(get_with_host("/health", "evil.test"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Invalid host header");
    }

    #[tokio::test]
    async fn wildcard_subdomain_host_is_accepted() {
        let config = Config {
            allowed_hosts: vec!["*.example.com".to_string()],
            ..Config::default()
        };

        let response = app(config)
            .oneshot(get_with_host("/health", "api.example.com:8000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_echoes_listed_origin() {
        let config = Config {
            cors_origins: vec!["https://lab.example.com".to_string()],
            ..Config::default()
        };

        let request = Request::builder()
            .uri("/health")
            .header(header::HOST, "localhost")
            .header(header::ORIGIN, "https://lab.example.com")
            .body(Body::empty())
            .unwrap();
        let response = app(config).oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://lab.example.com"
        );
    }

    #[tokio::test]
    async fn cors_allows_any_origin_by_default() {
        let request = Request::builder()
            .uri("/health")
            .header(header::HOST, "localhost")
            .header(header::ORIGIN, "https://anywhere.test")
            .body(Body::empty())
            .unwrap();
        let response = app(Config::default()).oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn websocket_route_requires_upgrade() {
        let response = app(Config::default())
            .oneshot(get_with_host("/ws", "localhost"))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = app(Config::default())
            .oneshot(get_with_host("/missing", "localhost"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

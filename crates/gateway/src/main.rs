//! Quarry API Gateway
//!
//! The main entry point for all external API requests.
//! Handles:
//! - Streaming query answers over Server-Sent Events
//! - Session inspection, follow-ups, completion and cancellation
//! - Recall over completed sessions
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use quarry_common::{
    config::{AppConfig, ObservabilityConfig},
    embeddings::create_embedder,
    llm::create_generator,
    metrics,
};
use quarry_research::{build_clients, EventBus, QueryEngine};
use quarry_sessions::create_store;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<QueryEngine>,
    pub bus: Arc<EventBus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    init_tracing(&config.observability);
    info!("Starting Quarry API Gateway v{}", quarry_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(metrics_addr).install()?;
        info!("Metrics exporter listening on {}", metrics_addr);
    }

    // Wire the engine
    info!(backend = %config.storage.backend, "Opening session store...");
    let store = create_store(&config.storage).await?;
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.llm)?;
    let clients = build_clients(&config.sources)?;
    if clients.is_empty() {
        warn!("No sources configured; research queries will degrade to source outages");
    }
    let engine = QueryEngine::from_config(&config, store, embedder, generator, clients)?;

    // Create app state
    let state = AppState {
        config: Arc::new(config),
        engine: Arc::new(engine),
        bus: Arc::new(EventBus::default()),
    };

    // Build the router
    let app = create_router(state.clone());

    // Start the server
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Subscribers can hold SSE connections open indefinitely; stop waiting
    // on them once the grace period after the signal has passed
    let grace = state.config.shutdown_timeout();
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state, signalled_tx))
        .into_future();
    let drain_deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server => result?,
        _ = drain_deadline => warn!(grace_secs = grace.as_secs(), "Grace period elapsed, closing open connections"),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Query endpoint (SSE)
        .route("/query", post(handlers::query::query))

        // Session endpoints
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .route("/sessions/{id}/events", get(handlers::sessions::session_events))
        .route("/sessions/{id}/messages", post(handlers::sessions::post_message))
        .route("/sessions/{id}/complete", post(handlers::sessions::complete_session))
        .route("/sessions/{id}/cancel", post(handlers::sessions::cancel_session))

        // Recall and host lifecycle
        .route("/recall", post(handlers::recall::recall))
        .route("/lifecycle/signal", post(handlers::lifecycle::host_signal))
        .route_layer(axum::middleware::from_fn(middleware::metrics::track_metrics));

    if state.config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        );
        api_routes = api_routes.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(request_id)
                .layer(TraceLayer::new_for_http())
                .layer(propagate_id)
                .layer(cors)
                .layer(ConcurrencyLimitLayer::new(state.config.server.max_concurrent_requests.max(1))),
        )
        .with_state(state)
}

/// Graceful shutdown: stop running research and complete active sessions
async fn shutdown_signal(state: AppState, signalled: tokio::sync::oneshot::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
    let _ = signalled.send(());

    let cancelled = state.engine.registry().cancel_all();
    match state.engine.lifecycle().on_host_signal().await {
        Ok(completed) => info!(cancelled, completed = completed.len(), "Sessions closed for shutdown"),
        Err(e) => warn!(error = %e, "Failed to complete sessions on shutdown"),
    }
    state.engine.lifecycle().shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use quarry_common::embeddings::MockEmbedder;
    use quarry_common::llm::MockGenerator;
    use quarry_common::models::SourceType;
    use quarry_research::{SourceClients, StaticSourceClient};
    use quarry_sessions::InMemorySessionStore;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;

        let mut clients: SourceClients = Default::default();
        for source in SourceType::ALL {
            clients.insert(source, Arc::new(StaticSourceClient::synthetic(source, "statins", 20)));
        }

        let engine = QueryEngine::from_config(
            &config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(MockEmbedder::new(64)),
            Arc::new(MockGenerator::fixed("Paris is the capital of France.")),
            clients,
        )
        .unwrap();

        AppState {
            config: Arc::new(config),
            engine: Arc::new(engine),
            bus: Arc::new(EventBus::default()),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_ready_reports_store() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/v1/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["session_store"]["status"], "up");
    }

    #[tokio::test]
    async fn test_query_streams_until_completed() {
        let state = test_state();
        let app = create_router(state.clone());
        let response = app
            .oneshot(post_json("/v1/query", serde_json::json!({ "query": "What is the capital of France?" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let body = body_text(response).await;
        assert!(body.contains("event: tier-selected"));
        assert!(body.contains("event: token"));
        assert!(body.contains("event: completed"));
        assert!(body.contains("Paris is the capital of France."));
        state.engine.lifecycle().shutdown();
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let app = create_router(test_state());
        let response = app
            .clone()
            .oneshot(post_json("/v1/query", serde_json::json!({ "query": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/v1/query", serde_json::json!({ "query": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = create_router(test_state());
        let id = uuid::Uuid::new_v4();

        let response = app
            .clone()
            .oneshot(Request::builder().uri(format!("/v1/sessions/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json(&format!("/v1/sessions/{id}/cancel"), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disconnected_session_subscriber_releases_channel() {
        use quarry_common::models::{Query, ResearchSession, Tier};

        let state = test_state();
        let session = ResearchSession::new(Query::new("statins", "en", "u1"), Tier::DeepResearch);
        let id = session.session_id;
        state.engine.store().insert(session).await.unwrap();

        let app = create_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/sessions/{id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.bus.channel_count(), 1);

        drop(response);
        assert_eq!(state.bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_recall_without_history_offers_research() {
        let app = create_router(test_state());
        let response = app
            .oneshot(post_json("/v1/recall", serde_json::json!({ "query": "what did we find about statins" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["matches"].as_array().map(Vec::len), Some(0));
        assert_eq!(body["outcome"]["outcome"], "no_match");
    }

    #[tokio::test]
    async fn test_recall_limit_validated() {
        let app = create_router(test_state());
        let response = app
            .oneshot(post_json("/v1/recall", serde_json::json!({ "query": "statins", "limit": 500 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_host_signal_completes_sessions() {
        let state = test_state();
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/v1/query", serde_json::json!({ "query": "What is the capital of France?" })))
            .await
            .unwrap();
        body_text(response).await;

        let response = app
            .oneshot(post_json("/v1/lifecycle/signal", serde_json::json!({ "signal": "terminate" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["completed"].as_array().map(Vec::len), Some(1));
        assert_eq!(state.engine.lifecycle().active_timers(), 0);
    }
}

mod cache;
mod config;
mod extractor;
mod fetcher;
mod http;
mod images;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cache::CacheBackend;
use config::AppConfig;
use images::FsImageStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, RunSummary, ScrapeRequest};
use pipeline::{CatalogPipeline, Orchestrator, PipelineError, PipelineErrorKind};
use security::{AuthState, constant_time_eq, require_scrape_token};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = CacheBackend::from_config(&config.cache)?;
    let images = FsImageStore::new(config.catalog.images_dir.clone(), &config.fetch)?;
    let pipeline = Arc::new(Orchestrator::new(
        config.catalog.clone(),
        config.fetch.clone(),
        cache,
        images,
        shutdown_rx,
    )?);
    let (queue, _worker) =
        jobs::JobQueue::spawn(pipeline.clone(), config.queue_capacity, config.jobs_retained);
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let data_file = pipeline.store().path().display().to_string();
    let state = AppState {
        pipeline,
        queue,
        prometheus_handle,
        metrics_key: config.metrics_key.clone().map(Arc::from),
    };
    let app = build_router(state, AuthState::new(config.scrape_token.clone()));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "catalog.api",
        data_file = %data_file,
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target = "catalog.api", "shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<CatalogPipeline>,
    queue: jobs::JobQueue,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<Arc<str>>,
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/scrape", post(scrape_catalogue))
        .nest(
            "/jobs",
            Router::new()
                .route("/scrape", post(enqueue_scrape_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_scrape_token));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "catalog-scraper-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(secret) = state.metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Scrape the catalogue and reconcile it with the stored copy.
///
/// - Method: `POST`
/// - Path: `/scrape?pages=<n>&proxy=<url>`
/// - Auth: `Authorization: Bearer <token>`, Basic auth password, or `X-Scrape-Token`
/// - Response: `RunSummary`
async fn scrape_catalogue(
    State(state): State<AppState>,
    Query(request): Query<ScrapeRequest>,
) -> Result<Json<RunSummary>, AppError> {
    crate::metrics::inc_requests("/scrape");
    info!(target = "catalog.api", pages = ?request.pages, "scrape requested");
    let summary = state.pipeline.run(request).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_scrape_job(
    State(state): State<AppState>,
    Query(request): Query<ScrapeRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/scrape");
    let id = state
        .queue
        .enqueue(request)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::conflict("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound => {
                let payload = ApiError {
                    error: "jobs".to_string(),
                    detail: Some("not_found".to_string()),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPriceCache;
    use crate::config::{CatalogConfig, FetchConfig};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_app(base_url: String, dir: &TempDir) -> Router {
        test_app_with_metrics_key(base_url, dir, None)
    }

    fn test_app_with_metrics_key(base_url: String, dir: &TempDir, metrics_key: Option<&str>) -> Router {
        let catalog = CatalogConfig {
            base_url,
            default_pages: 1,
            max_pages: 3,
            data_file: dir.path().join("scraped_data.json"),
            images_dir: dir.path().join("images"),
        };
        let fetch = FetchConfig {
            retry_delay: Duration::ZERO,
            ..FetchConfig::default()
        };
        let images = FsImageStore::new(catalog.images_dir.clone(), &fetch).unwrap();
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(
                catalog,
                fetch,
                CacheBackend::Memory(MemoryPriceCache::default()),
                images,
                rx,
            )
            .unwrap(),
        );
        let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), 2, 8);
        let state = AppState {
            pipeline,
            queue,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: metrics_key.map(Arc::from),
        };
        build_router(state, AuthState::new(TOKEN))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let dir = TempDir::new().unwrap();
        let app = test_app("http://127.0.0.1:1/{page}".into(), &dir);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scrape_without_token_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let app = test_app("http://127.0.0.1:1/{page}".into(), &dir);
        let response = app
            .oneshot(Request::post("/scrape?pages=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "missing_token");
    }

    #[tokio::test]
    async fn scrape_returns_run_summary() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/shop/page/1/")
            .with_status(200)
            .with_body(
                r#"<div class="product-inner"><h2 class="woo-loop-product__title">Burs</h2>
                   <span class="woocommerce-Price-amount">₹1,234.50</span></div>"#,
            )
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let app = test_app(format!("{}/shop/page/{{page}}/", server.url()), &dir);

        let response = app
            .oneshot(
                Request::post("/scrape?pages=1")
                    .header("X-Scrape-Token", TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_scraped"], 1);
        assert_eq!(body["total_updated"], 1);
        assert_eq!(body["message"], "Scraped 1 products, 1 updated.");
    }

    #[tokio::test]
    async fn too_many_pages_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = test_app("http://127.0.0.1:1/{page}".into(), &dir);
        let response = app
            .oneshot(
                Request::post("/scrape?pages=9")
                    .header("Authorization", format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = test_app("http://127.0.0.1:1/{page}".into(), &dir);
        let response = app
            .oneshot(
                Request::get(format!("/jobs/{}", uuid::Uuid::new_v4()))
                    .header("X-Scrape-Token", TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_require_matching_key() {
        let dir = TempDir::new().unwrap();
        let app = test_app_with_metrics_key("http://127.0.0.1:1/{page}".into(), &dir, Some("scrape-metrics"));

        let wrong = app
            .clone()
            .oneshot(
                Request::get("/metrics")
                    .header("X-Metrics-Key", "scrape-metricz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let right = app
            .oneshot(
                Request::get("/metrics")
                    .header("X-Metrics-Key", "scrape-metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(right.status(), StatusCode::OK);
    }
}

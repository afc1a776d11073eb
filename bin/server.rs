// Transaction Categorizer - Web Server
// REST API over the categorization engine

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use txn_categorizer::{
    load_default_backend, CategorizationEngine, CategorizeRequest, CategorizerError,
    EngineConfig, ManualOverride, Store,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<CategorizationEngine>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
        .into_response()
}

fn error_response(e: CategorizerError) -> Response {
    let status = match e {
        CategorizerError::UnknownCategory { .. } | CategorizerError::Configuration(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "request failed");
    }
    failure(status, e.to_string())
}

#[derive(Deserialize, Default)]
struct RetrainRequest {
    /// Only run when the counter reached the trigger or a retrain was requested
    #[serde(default)]
    if_needed: bool,
}

#[derive(Serialize)]
struct StatsResponse<A, B, C> {
    engine: A,
    pipeline: B,
    semantic: C,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// POST /api/categorize - Categorize one transaction
async fn categorize(
    State(state): State<AppState>,
    Json(request): Json<CategorizeRequest>,
) -> Response {
    ApiResponse::ok(state.engine.categorize(&request))
}

/// POST /api/overrides - Register a manual correction (may retrain)
async fn register_override(
    State(state): State<AppState>,
    Json(correction): Json<ManualOverride>,
) -> Response {
    let engine = Arc::clone(&state.engine);
    match tokio::task::spawn_blocking(move || engine.register_manual_override(&correction)).await {
        Ok(Ok(outcome)) => ApiResponse::ok(outcome),
        Ok(Err(e)) => error_response(e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("override task failed: {}", e)),
    }
}

/// POST /api/retrain - Run the retraining pipeline
async fn retrain(State(state): State<AppState>, body: Option<Json<RetrainRequest>>) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let engine = Arc::clone(&state.engine);

    let joined = tokio::task::spawn_blocking(move || {
        if request.if_needed {
            engine.retrain_if_needed()
        } else {
            Some(engine.trigger_retraining_now())
        }
    })
    .await;

    match joined {
        Ok(result) => ApiResponse::ok(result),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("retrain task failed: {}", e)),
    }
}

/// GET /api/stats - Engine and pipeline statistics
async fn get_stats(State(state): State<AppState>) -> Response {
    let engine = Arc::clone(&state.engine);
    match tokio::task::spawn_blocking(move || StatsResponse {
        engine: engine.get_stats(),
        pipeline: engine.pipeline_stats(),
        semantic: engine.semantic_stats(),
    })
    .await
    {
        Ok(stats) => ApiResponse::ok(stats),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("stats task failed: {}", e)),
    }
}

/// GET /api/categories - Configured categories
async fn get_categories(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.engine.get_categories())
}

/// GET /api/categories/:name/subcategories
async fn get_subcategories(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    ApiResponse::ok(state.engine.get_subcategories(&name))
}

/// GET /api/audit - Retraining history
async fn get_audit(State(state): State<AppState>) -> Response {
    let engine = Arc::clone(&state.engine);
    match tokio::task::spawn_blocking(move || engine.audit_log()).await {
        Ok(Ok(records)) => ApiResponse::ok(records),
        Ok(Err(e)) => error_response(e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("audit task failed: {}", e)),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("CATEGORIZER_CONFIG")
        .unwrap_or_else(|_| "config/categorizer.json".to_string());
    let db_path = std::env::var("CATEGORIZER_DB").unwrap_or_else(|_| "categorizer.db".to_string());
    let addr = std::env::var("CATEGORIZER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path))?;
    let store = Store::open(&db_path).with_context(|| format!("opening database {}", db_path))?;
    info!(db = %db_path, "database opened");

    // Embedding the examples blocks; keep it off the async workers
    let engine = tokio::task::spawn_blocking(move || {
        let backend = load_default_backend(&config.embedding_model);
        CategorizationEngine::new(config, store, backend)
    })
    .await
    .context("engine startup task failed")??;

    let state = AppState {
        engine: Arc::new(engine),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/categorize", post(categorize))
        .route("/overrides", post(register_override))
        .route("/retrain", post(retrain))
        .route("/stats", get(get_stats))
        .route("/categories", get(get_categories))
        .route("/categories/:name/subcategories", get(get_subcategories))
        .route("/audit", get(get_audit))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!(%addr, "categorizer server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

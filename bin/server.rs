// Crossing History - Read-only API Server
// Serves current rows and point-in-time views to dashboard collaborators

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crossing_history::{Config, ConfigError, HistoryStore, PersistenceError};

#[derive(Parser, Debug)]
#[command(name = "crossing-history-server", version)]
struct Args {
    /// History database (overrides the config file)
    #[arg(long, env = "CROSSING_HISTORY_DB")]
    database: Option<PathBuf>,

    /// JSON config with dataset definitions (built-in presets otherwise)
    #[arg(long, env = "CROSSING_HISTORY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<HistoryStore>>,
    config: Arc<Config>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    NotFound(String),
    Internal(String),
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        error!("query failed: {}", err);
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

impl AppState {
    /// Run a query against the store for a configured dataset
    fn query<T, F>(&self, dataset: &str, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&HistoryStore, &str) -> Result<T, PersistenceError>,
    {
        let name = self.config.dataset(dataset)?.name.as_str();
        let store = self
            .store
            .lock()
            .map_err(|_| ApiError::Internal("store lock poisoned".to_string()))?;
        Ok(f(&store, name)?)
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/datasets - Configured datasets with row counts
async fn list_datasets(State(state): State<AppState>) -> ApiResult<Vec<crossing_history::DatasetStat>> {
    let store = state
        .store
        .lock()
        .map_err(|_| ApiError::Internal("store lock poisoned".to_string()))?;
    let stats = store.datasets()?;
    Ok(Json(ApiResponse::ok(stats)))
}

/// GET /api/datasets/:dataset/current - Latest version of every key
async fn current_rows(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> ApiResult<Vec<crossing_history::HistoryRow>> {
    let rows = state.query(&dataset, |store, name| store.current_rows(name))?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// GET /api/datasets/:dataset/as-of/:date - Every key as it stood on a date
async fn snapshot_as_of(
    State(state): State<AppState>,
    Path((dataset, date)): Path<(String, NaiveDate)>,
) -> ApiResult<Vec<crossing_history::HistoryRow>> {
    let rows = state.query(&dataset, |store, name| store.snapshot_as_of(name, date))?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// GET /api/datasets/:dataset/keys/:key - All versions of a key
async fn key_history(
    State(state): State<AppState>,
    Path((dataset, key)): Path<(String, NaiveDate)>,
) -> ApiResult<Vec<crossing_history::HistoryRow>> {
    let rows = state.query(&dataset, |store, name| store.history(name, key))?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// GET /api/datasets/:dataset/keys/:key/as-of/:date - Version valid on a date
async fn key_as_of(
    State(state): State<AppState>,
    Path((dataset, key, date)): Path<(String, NaiveDate, NaiveDate)>,
) -> ApiResult<crossing_history::HistoryRow> {
    let row = state
        .query(&dataset, |store, name| store.as_of(name, key, date))?
        .ok_or_else(|| ApiError::NotFound(format!("no version of {} valid on {}", key, date)))?;
    Ok(Json(ApiResponse::ok(row)))
}

/// GET /api/datasets/:dataset/runs - Applied runs, newest first
async fn runs(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> ApiResult<Vec<crossing_history::MergeRun>> {
    let runs = state.query(&dataset, |store, name| store.runs(name))?;
    Ok(Json(ApiResponse::ok(runs)))
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/datasets", get(list_datasets))
        .route("/datasets/:dataset/current", get(current_rows))
        .route("/datasets/:dataset/as-of/:date", get(snapshot_as_of))
        .route("/datasets/:dataset/keys/:key", get(key_history))
        .route("/datasets/:dataset/keys/:key/as-of/:date", get(key_as_of))
        .route("/datasets/:dataset/runs", get(runs))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::builtin(),
    };
    if let Some(database) = args.database {
        config.database = database;
    }

    if !config.database.exists() {
        anyhow::bail!(
            "history database not found at {} (run `crossing-history init` first)",
            config.database.display()
        );
    }

    let store = HistoryStore::open_read_only(&config.database)
        .with_context(|| format!("Failed to open history database {}", config.database.display()))?;
    info!(database = %config.database.display(), "history database opened read-only");

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;
    info!(version = crossing_history::VERSION, "serving history API on http://{}/api", args.bind);

    axum::serve(listener, router(state))
        .await
        .context("Server stopped with an error")?;

    Ok(())
}

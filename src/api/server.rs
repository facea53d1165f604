//! Read-only HTTP API over batch runs and evaluation results

use super::views::{
    AlertList, AlertView, AppLatest, HistoryPage, ResultView, RunSummary, ThresholdsView,
};
use crate::config::{list_resolved_apps, resolve_app_config, RootConfig};
use crate::error::EvalError;
use crate::evaluation::{level_rank, HealthStatus};
use crate::orchestration::{ItemLog, JobStatusStore};
use crate::storage::ResultStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
const DEFAULT_RESULT_LIMIT: usize = 20;
const MAX_RESULT_LIMIT: usize = 500;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

/// Stores and configuration the handlers read from
#[derive(Clone)]
pub struct DashboardState {
    pub jobs: Arc<dyn JobStatusStore>,
    pub results: Arc<dyn ResultStore>,
    pub config: Arc<RootConfig>,
    /// Instance ID
    pub instance_id: String,
}

impl DashboardState {
    pub fn new(
        jobs: Arc<dyn JobStatusStore>,
        results: Arc<dyn ResultStore>,
        config: Arc<RootConfig>,
    ) -> Self {
        Self {
            jobs,
            results,
            config,
            instance_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        }
    }
}

/// Handler error mapped onto an HTTP status
#[derive(Debug)]
pub struct ApiError(EvalError);

impl From<EvalError> for ApiError {
    fn from(err: EvalError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EvalError::NotFound(_) => StatusCode::NOT_FOUND,
            EvalError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: DashboardState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: DashboardState) -> Self {
        Self { config, state }
    }

    /// Get instance ID
    pub fn instance_id(&self) -> &str {
        &self.state.instance_id
    }

    /// Build router
    pub fn build_router(state: DashboardState) -> Router {
        Router::new()
            // Batch tracking
            .route("/api/batch/current", get(current_batch_handler))
            .route("/api/batch/history", get(batch_history_handler))
            .route(
                "/api/batch/run/:run_id/item/:item_id/logs",
                get(item_logs_handler),
            )
            // Results
            .route("/api/apps/:app_id/latest", get(app_latest_handler))
            .route("/api/alerts", get(alerts_handler))
            .route("/api/thresholds", get(thresholds_handler))
            // Health check
            .route("/health", get(health_handler))
            // State
            .with_state(state)
            // Middleware
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start serving with dynamic port allocation
    ///
    /// Tries the configured address first, then the next ten ports.
    pub async fn serve(self) -> anyhow::Result<()> {
        let instance_id = self.state.instance_id.clone();
        let router = Self::build_router(self.state);

        match tokio::net::TcpListener::bind(self.config.addr).await {
            Ok(listener) => {
                info!(
                    "Dashboard API [{}] listening on http://{}",
                    instance_id, self.config.addr
                );
                axum::serve(listener, router).await?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(
                    "Port {} in use, trying alternative ports...",
                    self.config.addr.port()
                );
            }
            Err(e) => return Err(e.into()),
        }

        let base_port = self.config.addr.port();
        for offset in 1..=10 {
            let alt_addr = SocketAddr::new(self.config.addr.ip(), base_port + offset);

            match tokio::net::TcpListener::bind(alt_addr).await {
                Ok(listener) => {
                    info!(
                        "Dashboard API [{}] listening on http://{}",
                        instance_id, alt_addr
                    );
                    axum::serve(listener, router).await?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow::anyhow!(
            "All ports ({}-{}) are in use. Dashboard API unavailable for instance {}.",
            base_port,
            base_port + 10,
            instance_id
        ))
    }
}

/// Health check handler
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    instance_id: String,
    apps: usize,
}

async fn health_handler(State(state): State<DashboardState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.instance_id.clone(),
        apps: state.config.app_config.len(),
    })
}

/// Latest run with its items, or null before the first run
async fn current_batch_handler(
    State(state): State<DashboardState>,
) -> ApiResult<Option<RunSummary>> {
    let runs = state.jobs.load_runs().await?;
    Ok(Json(runs.first().map(|run| RunSummary::from_run(run, true))))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn batch_history_handler(
    State(state): State<DashboardState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page == 0 {
        return Err(EvalError::InvalidArgument("page must be >= 1".to_string()).into());
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(EvalError::InvalidArgument(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        ))
        .into());
    }

    let runs = state.jobs.load_runs().await?;
    let total = runs.len();
    let runs = runs
        .iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .map(|run| RunSummary::from_run(run, false))
        .collect();

    Ok(Json(HistoryPage {
        page,
        page_size,
        total,
        runs,
    }))
}

async fn item_logs_handler(
    State(state): State<DashboardState>,
    Path((run_id, item_id)): Path<(String, String)>,
) -> ApiResult<Vec<ItemLog>> {
    Ok(Json(state.jobs.item_logs(&run_id, &item_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> std::result::Result<usize, EvalError> {
        let limit = self.limit.unwrap_or(DEFAULT_RESULT_LIMIT);
        if limit == 0 || limit > MAX_RESULT_LIMIT {
            return Err(EvalError::InvalidArgument(format!(
                "limit must be between 1 and {}",
                MAX_RESULT_LIMIT
            )));
        }
        Ok(limit)
    }
}

/// Newest results of one application, re-checked against current thresholds
async fn app_latest_handler(
    State(state): State<DashboardState>,
    Path(app_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<AppLatest> {
    let limit = query.resolve()?;
    let resolved = resolve_app_config(&state.config, &app_id);
    let results: Vec<ResultView> = state
        .results
        .latest_results(&app_id, limit)
        .await?
        .into_iter()
        .map(|r| ResultView::evaluate(r, &resolved.thresholds))
        .collect();

    let status = results
        .first()
        .map(|r| r.status)
        .unwrap_or(HealthStatus::Healthy);

    Ok(Json(AppLatest {
        app_id,
        status,
        results,
    }))
}

/// Breaches across the newest results of every configured application
///
/// Critical alerts sort first, newest first within a level.
async fn alerts_handler(
    State(state): State<DashboardState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<AlertList> {
    let limit = query.resolve()?;
    let mut alerts = Vec::new();

    for app in list_resolved_apps(&state.config) {
        let results = state.results.latest_results(&app.app_id, limit).await?;
        for result in results {
            let view = ResultView::evaluate(result, &app.thresholds);
            for breach in view.breaches {
                alerts.push(AlertView {
                    app_id: view.app_id.clone(),
                    result_id: view.id.clone(),
                    policy_name: view.policy_name.clone(),
                    timestamp: view.timestamp,
                    breach,
                });
            }
        }
    }

    alerts.sort_by(|a, b| {
        level_rank(&b.breach.level)
            .cmp(&level_rank(&a.breach.level))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.result_id.cmp(&b.result_id))
    });

    Ok(Json(AlertList {
        total: alerts.len(),
        alerts,
    }))
}

async fn thresholds_handler(State(state): State<DashboardState>) -> Json<ThresholdsView> {
    let apps = list_resolved_apps(&state.config)
        .into_iter()
        .map(|app| (app.app_id, app.thresholds))
        .collect();
    Json(ThresholdsView {
        global: state.config.global_thresholds.clone(),
        apps,
    })
}

//! Axum read API over the contract store, plus ingestion triggers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bidscope_core::SourceTag;
use bidscope_storage::{ContractFilter, ContractQuery, ContractStore};
use bidscope_sync::{recent_reports, IngestError, Ingestor};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "bidscope-web";

const DEFAULT_RUNS_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContractStore>,
    /// Absent when the process was started without ingestion credentials.
    pub ingestor: Option<Arc<Ingestor>>,
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(store: Arc<dyn ContractStore>) -> Self {
        Self {
            store,
            ingestor: None,
            reports_dir: None,
        }
    }

    pub fn with_ingestor(mut self, ingestor: Arc<Ingestor>) -> Self {
        if self.reports_dir.is_none() {
            self.reports_dir = ingestor.reports_dir().map(PathBuf::from);
        }
        self.ingestor = Some(ingestor);
        self
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/contracts", get(contracts_handler))
        .route("/api/ingest/{source}", get(ingest_handler).post(ingest_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unavailable(&'static str),
    Internal { error: &'static str, details: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::BadRequest(details) => (StatusCode::BAD_REQUEST, "Bad request", details),
            ApiError::Unavailable(details) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                details.to_string(),
            ),
            ApiError::Internal { error, details } => (StatusCode::INTERNAL_SERVER_ERROR, error, details),
        };
        (status, Json(json!({ "error": error, "details": details }))).into_response()
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Raw query string values; parsed by hand so bad input gets a JSON 400.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractsParams {
    category: Option<String>,
    value_min: Option<String>,
    set_aside: Option<String>,
    date_from: Option<String>,
    search: Option<String>,
    state: Option<String>,
    source: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_param<T: std::str::FromStr>(name: &str, value: Option<String>) -> Result<Option<T>, ApiError> {
    non_empty(value)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {name}: {v:?}")))
        })
        .transpose()
}

fn parse_date_from(value: Option<String>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = non_empty(value) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| ApiError::BadRequest(format!("invalid dateFrom: {raw:?}")))
}

impl ContractsParams {
    fn into_query(self) -> Result<ContractQuery, ApiError> {
        let value_min = parse_param::<f64>("valueMin", self.value_min)?;
        if value_min.is_some_and(|v| !v.is_finite()) {
            return Err(ApiError::BadRequest("invalid valueMin: must be finite".into()));
        }
        let source = non_empty(self.source)
            .map(|s| s.parse::<SourceTag>())
            .transpose()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;

        let filter = ContractFilter {
            category: non_empty(self.category),
            value_min,
            set_aside: non_empty(self.set_aside),
            date_from: parse_date_from(self.date_from)?,
            search: non_empty(self.search),
            state: non_empty(self.state),
            source,
        };
        Ok(ContractQuery::new(
            filter,
            parse_param::<u32>("page", self.page)?,
            parse_param::<u32>("pageSize", self.page_size)?,
        ))
    }
}

async fn contracts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ContractsParams>,
) -> Result<Response, ApiError> {
    let query = params.into_query()?;
    let page = state.store.query(&query).await.map_err(|err| {
        error!(error = %format!("{err:#}"), "contract query failed");
        ApiError::Internal {
            error: "Query failed",
            details: format!("{err:#}"),
        }
    })?;
    Ok(Json(page).into_response())
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Result<Response, ApiError> {
    let source = source
        .parse::<SourceTag>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let ingestor = state
        .ingestor
        .as_ref()
        .ok_or(ApiError::Unavailable("ingestion is not configured"))?;

    match ingestor.run_source(source).await {
        Ok(report) => Ok(Json(report).into_response()),
        Err(IngestError::NotEnabled(source)) => {
            Err(ApiError::BadRequest(format!("source `{source}` is not enabled")))
        }
        Err(IngestError::Failed(err)) => {
            error!(%source, error = %format!("{err:#}"), "ingestion failed");
            Err(ApiError::Internal {
                error: "Fetch failed",
                details: format!("{err:#}"),
            })
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsParams {
    limit: Option<String>,
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Result<Response, ApiError> {
    let limit = parse_param::<usize>("limit", params.limit)?.unwrap_or(DEFAULT_RUNS_LIMIT);
    let Some(reports_dir) = &state.reports_dir else {
        return Ok(Json(json!({ "runs": [] })).into_response());
    };
    let runs = recent_reports(reports_dir, limit).map_err(|err| ApiError::Internal {
        error: "Report listing failed",
        details: format!("{err:#}"),
    })?;
    Ok(Json(json!({ "runs": runs })).into_response())
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bidscope_adapters::StopReason;
use bidscope_core::SourceTag;
use bidscope_storage::{ContractStore, MemoryContractStore};
use bidscope_sync::{recent_reports, Ingestor, RunStatus, SourceRegistry, SyncConfig};
use serde_json::{json, Value as JsonValue};

/// SAM.gov stand-in that answers 429 exactly once at `rate_limit_at`.
struct FlakySamGov {
    total: u64,
    rate_limit_at: u64,
    rate_limited: AtomicBool,
    offsets: Mutex<Vec<u64>>,
}

async fn search(
    State(upstream): State<Arc<FlakySamGov>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let offset = params
        .get("offset")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1000);
    upstream.offsets.lock().unwrap().push(offset);

    if offset == upstream.rate_limit_at && !upstream.rate_limited.swap(true, Ordering::SeqCst) {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }

    let end = (offset + limit).min(upstream.total);
    let data = (offset..end)
        .map(|i| json!({ "noticeId": format!("RL{i:03}"), "title": format!("Notice {i}") }))
        .collect::<Vec<JsonValue>>();
    Json(json!({ "totalRecords": upstream.total, "opportunitiesData": data })).into_response()
}

async fn spawn_upstream(upstream: Arc<FlakySamGov>) -> SocketAddr {
    let app = Router::new()
        .route("/opportunities/v2/search", get(search))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(reports_dir: &Path) -> SyncConfig {
    let reports_dir = reports_dir.display().to_string();
    SyncConfig::from_lookup(|name| match name {
        "DATABASE_URL" => Some("postgres://localhost/bidscope".to_string()),
        "SAM_API_KEY" => Some("test-key".to_string()),
        "BIDSCOPE_REPORTS_DIR" => Some(reports_dir.clone()),
        _ => None,
    })
    .unwrap()
}

fn registry(addr: SocketAddr) -> SourceRegistry {
    let yaml = format!(
        r#"
sources:
  - source: federal
    endpoint: http://{addr}/opportunities/v2/search
    page_size: 2
    inter_page_delay_ms: 0
  - source: ny
    enabled: false
  - source: il
    enabled: false
"#
    );
    SourceRegistry::from_yaml_str(&yaml, Path::new("sources.yaml")).unwrap()
}

#[tokio::test]
async fn one_rate_limit_on_page_three_ends_the_run_after_page_two() {
    let upstream = Arc::new(FlakySamGov {
        total: 10,
        rate_limit_at: 4,
        rate_limited: AtomicBool::new(false),
        offsets: Mutex::new(Vec::new()),
    });
    let addr = spawn_upstream(upstream.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryContractStore::new());

    let ingestor = Ingestor::new(&config(dir.path()), &registry(addr), store.clone()).unwrap();
    let report = ingestor.run_source(SourceTag::Federal).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.pages, 2);
    assert_eq!(report.total_fetched, 4);
    assert_eq!(report.total_upserted, 4);
    assert_eq!(report.stop_reason, Some(StopReason::Transient));
    assert!(report.transient_error.as_deref().unwrap().contains("429"));
    assert_eq!(*upstream.offsets.lock().unwrap(), vec![0, 2, 4]);
    assert_eq!(store.count().await.unwrap(), 4);

    let on_disk = recent_reports(dir.path(), 5).unwrap();
    assert_eq!(on_disk[0].pages, 2);
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bidscope_adapters::{AdapterContext, AdapterError, PagingPolicy, SamGovAdapter, SourceAdapter, StopReason};
use bidscope_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value as JsonValue};

const API_KEY: &str = "test-key";

#[derive(Default)]
struct FakeSamGov {
    total: u64,
    rate_limit_from_offset: Option<u64>,
    seen: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeSamGov {
    fn seen(&self) -> Vec<HashMap<String, String>> {
        self.seen.lock().unwrap().clone()
    }
}

async fn search(
    State(upstream): State<Arc<FakeSamGov>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    upstream.seen.lock().unwrap().push(params.clone());

    if params.get("api_key").map(String::as_str) != Some(API_KEY) {
        return (StatusCode::FORBIDDEN, "invalid api key").into_response();
    }
    let offset = params
        .get("offset")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1000);
    if upstream.rate_limit_from_offset.is_some_and(|from| offset >= from) {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }

    let end = (offset + limit).min(upstream.total);
    let data = (offset..end)
        .map(|i| {
            json!({
                "noticeId": format!("N{i:04}"),
                "title": format!("Notice {i}"),
                "postedDate": "2026-03-01",
                "award": { "amount": i * 100 }
            })
        })
        .collect::<Vec<JsonValue>>();
    Json(json!({ "totalRecords": upstream.total, "opportunitiesData": data })).into_response()
}

async fn spawn_upstream(upstream: Arc<FakeSamGov>) -> SocketAddr {
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

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::none(),
        ..HttpClientConfig::default()
    })
    .unwrap()
}

fn adapter(addr: SocketAddr, api_key: &str) -> SamGovAdapter {
    SamGovAdapter::new(api_key)
        .with_endpoint(format!("http://{addr}/opportunities/v2/search"))
        .with_paging(PagingPolicy {
            page_size: 2,
            inter_page_delay: Duration::ZERO,
        })
}

#[tokio::test]
async fn pages_through_upstream_until_advertised_total() {
    let upstream = Arc::new(FakeSamGov {
        total: 5,
        ..FakeSamGov::default()
    });
    let addr = spawn_upstream(upstream.clone()).await;

    let outcome = adapter(addr, API_KEY)
        .fetch(&fetcher(), &AdapterContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.records.len(), 5);
    assert_eq!(outcome.stop_reason, StopReason::TotalReached);

    let seen = upstream.seen();
    let offsets = seen.iter().map(|p| p["offset"].clone()).collect::<Vec<_>>();
    assert_eq!(offsets, vec!["0", "2", "4"]);
    let posted_from = &seen[0]["postedFrom"];
    assert_eq!(posted_from.len(), 10);
    assert_eq!(&posted_from[2..3], "/");

    let normalized = outcome
        .records
        .iter()
        .filter_map(|raw| adapter(addr, API_KEY).normalize(raw))
        .collect::<Vec<_>>();
    assert_eq!(normalized.len(), 5);
    assert_eq!(normalized[4].natural_key, "N0004");
    assert_eq!(normalized[4].award.amount.value(), 400.0);
}

#[tokio::test]
async fn rate_limit_keeps_pages_fetched_so_far() {
    let upstream = Arc::new(FakeSamGov {
        total: 10,
        rate_limit_from_offset: Some(4),
        ..FakeSamGov::default()
    });
    let addr = spawn_upstream(upstream.clone()).await;

    let outcome = adapter(addr, API_KEY)
        .fetch(&fetcher(), &AdapterContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.records.len(), 4);
    assert_eq!(outcome.stop_reason, StopReason::Transient);
    assert!(outcome.transient_error.unwrap().contains("429"));
}

#[tokio::test]
async fn rejected_key_is_fatal_and_never_echoed() {
    let upstream = Arc::new(FakeSamGov {
        total: 10,
        ..FakeSamGov::default()
    });
    let addr = spawn_upstream(upstream).await;

    let err = adapter(addr, "super-secret-key")
        .fetch(&fetcher(), &AdapterContext::new())
        .await
        .unwrap_err();

    let AdapterError::Fetch(fetch_err) = &err else {
        panic!("expected fetch error, got {err}");
    };
    assert!(!fetch_err.is_transient());
    assert!(!err.to_string().contains("super-secret-key"));
}

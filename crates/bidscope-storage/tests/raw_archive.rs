use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bidscope_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RawPageArchive};
use chrono::Utc;
use uuid::Uuid;

const PAGE_BODY: &str = r#"{"totalRecords":1,"opportunitiesData":[{"noticeId":"abc123","title":"Roof replacement"}]}"#;

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/search", get(|| async { ([("content-type", "application/json")], PAGE_BODY) }))
        .route("/throttled", get(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn archived_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[tokio::test]
async fn fetched_pages_are_archived_once_by_content_hash() {
    let addr = spawn_upstream().await;
    let archive_dir = tempfile::tempdir().unwrap();
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::none(),
        archive_dir: Some(archive_dir.path().to_path_buf()),
        ..HttpClientConfig::default()
    })
    .unwrap();
    let url = format!("http://{addr}/search");
    let query = [("api_key", "secret".to_string()), ("offset", "0".to_string())];

    for _ in 0..2 {
        let body = http.fetch_json(Uuid::new_v4(), "federal", &url, &query).await.unwrap();
        assert_eq!(body["opportunitiesData"][0]["noticeId"], "abc123");
    }
    let throttled = http
        .fetch_json(Uuid::new_v4(), "federal", &format!("http://{addr}/throttled"), &query)
        .await
        .unwrap_err();
    assert!(throttled.is_transient());

    let files = archived_files(archive_dir.path());
    assert_eq!(files.len(), 1, "{files:?}");

    let hash = RawPageArchive::sha256_hex(PAGE_BODY.as_bytes());
    let expected = archive_dir
        .path()
        .join(Utc::now().format("%Y%m%d").to_string())
        .join("federal")
        .join(format!("{hash}.json"));
    assert_eq!(files[0], expected);
    assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), PAGE_BODY);
}

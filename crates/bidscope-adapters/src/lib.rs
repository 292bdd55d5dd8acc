//! Source adapter contracts and the federal / Socrata fetchers.

pub mod normalize;
pub mod paging;

use async_trait::async_trait;
use bidscope_core::{ContractRecord, DateWindow, SourceTag};
use bidscope_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use normalize::{field_map, normalize, FieldMap};
pub use paging::{
    evaluate_page, fetch_single, paginate, FetchOutcome, Page, PageObservation, PageSource,
    PagingPolicy, StopReason, DEFAULT_INTER_PAGE_DELAY, MAX_PAGES,
};

pub const CRATE_NAME: &str = "bidscope-adapters";

pub const SAM_SEARCH_URL: &str = "https://api.sam.gov/opportunities/v2/search";
pub const NY_CITY_RECORD_URL: &str = "https://data.cityofnewyork.us/resource/i858-z32e.json";
pub const COOK_COUNTY_CONTRACTS_URL: &str =
    "https://datacatalog.cookcountyil.gov/resource/qh8j-6k63.json";

pub const DEFAULT_LOOKBACK_DAYS: i64 = 90;
/// SAM.gov rejects larger pages.
pub const SAM_MAX_PAGE_SIZE: u64 = 1000;
pub const SOCRATA_RESULT_LIMIT: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            now: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Config(String),
}

/// One upstream: how to fetch its raw records and how to map them.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceTag;

    /// Posted-date window this adapter asks the upstream for, if any.
    fn date_window(&self, now: DateTime<Utc>) -> Option<DateWindow>;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchOutcome, AdapterError>;

    fn normalize(&self, raw: &JsonValue) -> Option<ContractRecord> {
        normalize::normalize(self.source(), raw)
    }
}

/// Per-source knobs, usually loaded from the source registry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub lookback_days: Option<i64>,
    /// Page size for paged upstreams, result cap for single-shot ones.
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub inter_page_delay_ms: Option<u64>,
}

fn sam_date(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// SAM.gov Get Opportunities v2. Paged by record offset.
#[derive(Debug, Clone)]
pub struct SamGovAdapter {
    endpoint: String,
    api_key: String,
    lookback_days: i64,
    paging: PagingPolicy,
}

impl SamGovAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: SAM_SEARCH_URL.to_string(),
            api_key: api_key.into(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            paging: PagingPolicy {
                page_size: SAM_MAX_PAGE_SIZE,
                ..PagingPolicy::default()
            },
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_paging(mut self, paging: PagingPolicy) -> Self {
        self.paging = PagingPolicy {
            page_size: paging.page_size.clamp(1, SAM_MAX_PAGE_SIZE),
            ..paging
        };
        self
    }
}

struct SamGovPages<'a> {
    http: &'a HttpFetcher,
    run_id: Uuid,
    endpoint: &'a str,
    api_key: &'a str,
    window: DateWindow,
}

#[async_trait]
impl<'a> PageSource for SamGovPages<'a> {
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Page, FetchError> {
        let query = [
            ("api_key", self.api_key.to_string()),
            ("postedFrom", sam_date(self.window.from)),
            ("postedTo", sam_date(self.window.to)),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let body = self
            .http
            .fetch_json(self.run_id, SourceTag::Federal.as_str(), self.endpoint, &query)
            .await?;
        Ok(sam_page(body))
    }
}

fn sam_page(body: JsonValue) -> Page {
    let total = body.get("totalRecords").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    });
    let records = match body {
        JsonValue::Object(mut map) => match map.remove("opportunitiesData") {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Page { records, total }
}

#[async_trait]
impl SourceAdapter for SamGovAdapter {
    fn source(&self) -> SourceTag {
        SourceTag::Federal
    }

    fn date_window(&self, now: DateTime<Utc>) -> Option<DateWindow> {
        Some(DateWindow::lookback(now, self.lookback_days))
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchOutcome, AdapterError> {
        let window = DateWindow::lookback(ctx.now, self.lookback_days);
        info!(
            source = "federal",
            from = %window.from,
            to = %window.to,
            page_size = self.paging.page_size,
            "fetching federal opportunities"
        );
        let pages = SamGovPages {
            http,
            run_id: ctx.run_id,
            endpoint: &self.endpoint,
            api_key: &self.api_key,
            window,
        };
        Ok(paginate(&pages, &self.paging).await?)
    }
}

/// Socrata open-data dataset fetched with a single ordered, capped request.
#[derive(Debug, Clone)]
pub struct SocrataAdapter {
    source: SourceTag,
    endpoint: String,
    order_field: &'static str,
    /// Column compared against the lookback window, when the dataset is windowed.
    window_field: Option<&'static str>,
    lookback_days: i64,
    result_limit: u64,
}

impl SocrataAdapter {
    /// NYC City Record Online, windowed on registration date.
    pub fn ny_city_record() -> Self {
        Self {
            source: SourceTag::Ny,
            endpoint: NY_CITY_RECORD_URL.to_string(),
            order_field: "registration_date",
            window_field: Some("registration_date"),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            result_limit: SOCRATA_RESULT_LIMIT,
        }
    }

    /// Cook County contracts, newest awards first, no window.
    pub fn cook_county_contracts() -> Self {
        Self {
            source: SourceTag::Il,
            endpoint: COOK_COUNTY_CONTRACTS_URL.to_string(),
            order_field: "award_date",
            window_field: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            result_limit: SOCRATA_RESULT_LIMIT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_result_limit(mut self, limit: u64) -> Self {
        self.result_limit = limit.max(1);
        self
    }

    fn where_clause(&self, now: DateTime<Utc>) -> Option<String> {
        let field = self.window_field?;
        let window = DateWindow::lookback(now, self.lookback_days);
        Some(format!("{field} > '{}T00:00:00.000'", window.from.format("%Y-%m-%d")))
    }
}

struct SocrataRequest<'a> {
    http: &'a HttpFetcher,
    run_id: Uuid,
    source: SourceTag,
    endpoint: &'a str,
    order: String,
    where_clause: Option<String>,
}

#[async_trait]
impl<'a> PageSource for SocrataRequest<'a> {
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Page, FetchError> {
        let mut query = vec![("$limit", limit.to_string()), ("$order", self.order.clone())];
        if let Some(clause) = &self.where_clause {
            query.push(("$where", clause.clone()));
        }
        if offset > 0 {
            query.push(("$offset", offset.to_string()));
        }
        let body = self
            .http
            .fetch_json(self.run_id, self.source.as_str(), self.endpoint, &query)
            .await?;
        let records = match body {
            JsonValue::Array(rows) => rows,
            _ => Vec::new(),
        };
        Ok(Page { records, total: None })
    }
}

#[async_trait]
impl SourceAdapter for SocrataAdapter {
    fn source(&self) -> SourceTag {
        self.source
    }

    fn date_window(&self, now: DateTime<Utc>) -> Option<DateWindow> {
        self.window_field
            .map(|_| DateWindow::lookback(now, self.lookback_days))
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchOutcome, AdapterError> {
        let request = SocrataRequest {
            http,
            run_id: ctx.run_id,
            source: self.source,
            endpoint: &self.endpoint,
            order: format!("{} DESC", self.order_field),
            where_clause: self.where_clause(ctx.now),
        };
        info!(source = %self.source, limit = self.result_limit, "fetching socrata dataset");
        Ok(fetch_single(&request, self.result_limit).await?)
    }
}

/// Build the adapter for `source`. The federal adapter needs an API key.
pub fn adapter_for_source(
    source: SourceTag,
    settings: &AdapterSettings,
    sam_api_key: Option<&str>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source {
        SourceTag::Federal => {
            let api_key = sam_api_key
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .ok_or_else(|| AdapterError::Config("SAM_API_KEY is required for the federal source".into()))?;
            let mut adapter = SamGovAdapter::new(api_key);
            if let Some(endpoint) = &settings.endpoint {
                adapter = adapter.with_endpoint(endpoint.clone());
            }
            if let Some(days) = settings.lookback_days {
                adapter = adapter.with_lookback_days(days);
            }
            let mut paging = adapter.paging;
            if let Some(size) = settings.page_size {
                paging.page_size = size;
            }
            if let Some(ms) = settings.inter_page_delay_ms {
                paging.inter_page_delay = std::time::Duration::from_millis(ms);
            }
            Ok(Box::new(adapter.with_paging(paging)))
        }
        SourceTag::Ny | SourceTag::Il => {
            let mut adapter = if source == SourceTag::Ny {
                SocrataAdapter::ny_city_record()
            } else {
                SocrataAdapter::cook_county_contracts()
            };
            if let Some(endpoint) = &settings.endpoint {
                adapter = adapter.with_endpoint(endpoint.clone());
            }
            if let Some(days) = settings.lookback_days {
                adapter = adapter.with_lookback_days(days);
            }
            if let Some(limit) = settings.page_size {
                adapter = adapter.with_result_limit(limit);
            }
            Ok(Box::new(adapter))
        }
    }
}

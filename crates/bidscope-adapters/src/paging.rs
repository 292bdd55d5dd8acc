//! Offset pagination over an upstream that returns pages of raw JSON records.

use std::time::Duration;

use async_trait::async_trait;
use bidscope_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Hard upper bound on requests per paginated run.
pub const MAX_PAGES: usize = 10;
pub const DEFAULT_INTER_PAGE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<JsonValue>,
    /// Total result count advertised by the upstream, when it reports one.
    pub total: Option<u64>,
}

/// One request against an upstream at a given offset.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Page, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EmptyPage,
    TotalReached,
    ShortPage,
    PageCap,
    Transient,
    SingleShot,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EmptyPage => "empty_page",
            StopReason::TotalReached => "total_reached",
            StopReason::ShortPage => "short_page",
            StopReason::PageCap => "page_cap",
            StopReason::Transient => "transient",
            StopReason::SingleShot => "single_shot",
        }
    }
}

/// State of the pager right after a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageObservation {
    pub pages_fetched: usize,
    pub returned: u64,
    pub page_size: u64,
    pub fetched_total: u64,
    pub advertised_total: Option<u64>,
}

/// Decide whether another page should be requested. `None` means continue.
pub fn evaluate_page(obs: &PageObservation) -> Option<StopReason> {
    if obs.returned == 0 {
        Some(StopReason::EmptyPage)
    } else if obs
        .advertised_total
        .is_some_and(|total| obs.fetched_total >= total)
    {
        Some(StopReason::TotalReached)
    } else if obs.returned < obs.page_size {
        Some(StopReason::ShortPage)
    } else if obs.pages_fetched >= MAX_PAGES {
        Some(StopReason::PageCap)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingPolicy {
    pub page_size: u64,
    pub inter_page_delay: Duration,
}

impl Default for PagingPolicy {
    fn default() -> Self {
        Self {
            page_size: 1000,
            inter_page_delay: DEFAULT_INTER_PAGE_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<JsonValue>,
    /// Successful requests, including a trailing empty page.
    pub pages: usize,
    pub stop_reason: StopReason,
    pub advertised_total: Option<u64>,
    pub transient_error: Option<String>,
}

impl FetchOutcome {
    fn transient(records: Vec<JsonValue>, pages: usize, advertised_total: Option<u64>, err: &FetchError) -> Self {
        Self {
            records,
            pages,
            stop_reason: StopReason::Transient,
            advertised_total,
            transient_error: Some(err.to_string()),
        }
    }
}

/// Walk `source` page by page until a stop condition holds.
///
/// A transient failure ends the walk with whatever was accumulated; any other
/// failure is returned as an error and the accumulated records are discarded.
pub async fn paginate(source: &dyn PageSource, policy: &PagingPolicy) -> Result<FetchOutcome, FetchError> {
    let page_size = policy.page_size.max(1);
    let mut records = Vec::new();
    let mut offset = 0u64;
    let mut pages = 0usize;
    let mut advertised_total = None;

    loop {
        let page = match source.fetch_page(offset, page_size).await {
            Ok(page) => page,
            Err(err) if err.is_transient() => {
                warn!(pages, offset, error = %err, "transient upstream failure; stopping pagination");
                return Ok(FetchOutcome::transient(records, pages, advertised_total, &err));
            }
            Err(err) => return Err(err),
        };

        pages += 1;
        let returned = page.records.len() as u64;
        offset += returned;
        advertised_total = page.total.or(advertised_total);
        records.extend(page.records);

        let observation = PageObservation {
            pages_fetched: pages,
            returned,
            page_size,
            fetched_total: records.len() as u64,
            advertised_total,
        };
        if let Some(stop_reason) = evaluate_page(&observation) {
            debug!(pages, fetched = records.len(), stop = stop_reason.as_str(), "pagination finished");
            return Ok(FetchOutcome {
                records,
                pages,
                stop_reason,
                advertised_total,
                transient_error: None,
            });
        }

        if !policy.inter_page_delay.is_zero() {
            tokio::time::sleep(policy.inter_page_delay).await;
        }
    }
}

/// One capped request for upstreams that are not paged.
pub async fn fetch_single(source: &dyn PageSource, limit: u64) -> Result<FetchOutcome, FetchError> {
    match source.fetch_page(0, limit.max(1)).await {
        Ok(page) => Ok(FetchOutcome {
            records: page.records,
            pages: 1,
            stop_reason: StopReason::SingleShot,
            advertised_total: page.total,
            transient_error: None,
        }),
        Err(err) if err.is_transient() => {
            warn!(error = %err, "transient upstream failure");
            Ok(FetchOutcome::transient(Vec::new(), 0, None, &err))
        }
        Err(err) => Err(err),
    }
}

//! Store contract, read-side query model and the batching upsert sink.

use std::sync::Arc;

use async_trait::async_trait;
use bidscope_core::{ContractRecord, SourceTag, StoredContract};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on records per bulk write.
pub const BATCH_SIZE: usize = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Read API predicates. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractFilter {
    /// NAICS code, exact match.
    pub category: Option<String>,
    pub value_min: Option<f64>,
    /// Matches either the legacy or the primary set-aside field.
    pub set_aside: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    /// Case-insensitive substring over title and description.
    pub search: Option<String>,
    pub state: Option<String>,
    pub source: Option<SourceTag>,
}

impl ContractFilter {
    pub fn matches(&self, record: &ContractRecord) -> bool {
        if let Some(category) = &self.category {
            if record.naics_code.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.value_min {
            if record.award.amount.value() < min {
                return false;
            }
        }
        if let Some(set_aside) = &self.set_aside {
            let wanted = Some(set_aside.as_str());
            if record.set_aside.as_deref() != wanted && record.type_of_set_aside.as_deref() != wanted {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            match record.posted_date {
                Some(posted) if posted >= from => {}
                _ => return false,
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let in_title = record.title.to_lowercase().contains(&needle);
            let in_description = record
                .description
                .as_deref()
                .map(|d| d.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_title && !in_description {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if record.state_code() != Some(state.as_str()) {
                return false;
            }
        }
        if let Some(source) = self.source {
            if record.source != source {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractQuery {
    pub filter: ContractFilter,
    pub page: u32,
    pub page_size: u32,
}

impl ContractQuery {
    /// Page numbers start at 1; page size is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(filter: ContractFilter, page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            filter,
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for ContractQuery {
    fn default() -> Self {
        Self::new(ContractFilter::default(), None, None)
    }
}

/// One page of read results, newest posting first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractPage {
    pub contracts: Vec<StoredContract>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl ContractPage {
    pub fn new(contracts: Vec<StoredContract>, total: u64, query: &ContractQuery) -> Self {
        Self {
            contracts,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total.div_ceil(u64::from(query.page_size)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    /// Position of the record inside the batch.
    pub index: usize,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub upserted: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub failures: Vec<WriteFailure>,
}

/// Persistent sink/source for canonical records.
///
/// `bulk_upsert` must isolate per-record failures: one bad write is reported
/// in [`BulkWriteOutcome::failures`] while the rest of the batch proceeds. An
/// `Err` means the whole batch could not be attempted.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn bulk_upsert(&self, batch: &[ContractRecord]) -> anyhow::Result<BulkWriteOutcome>;

    async fn query(&self, query: &ContractQuery) -> anyhow::Result<ContractPage>;

    async fn count(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub upserted: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub batches: usize,
    pub errors: Vec<String>,
}

pub struct UpsertSink {
    store: Arc<dyn ContractStore>,
    batch_size: usize,
}

impl UpsertSink {
    pub fn new(store: Arc<dyn ContractStore>) -> Self {
        Self {
            store,
            batch_size: BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Write `records` in fixed-size batches. Never fails as a whole: batch and
    /// record failures end up in [`WriteSummary::errors`].
    pub async fn write(&self, records: &[ContractRecord]) -> WriteSummary {
        let mut summary = WriteSummary::default();

        for (idx, batch) in records.chunks(self.batch_size).enumerate() {
            let batch_no = idx + 1;
            summary.batches += 1;
            match self.store.bulk_upsert(batch).await {
                Ok(outcome) => {
                    debug!(
                        batch = batch_no,
                        upserted = outcome.upserted,
                        modified = outcome.modified,
                        failed = outcome.failures.len(),
                        "batch written"
                    );
                    summary.upserted += outcome.upserted;
                    summary.modified += outcome.modified;
                    summary.unchanged += outcome.unchanged;
                    for failure in outcome.failures {
                        summary.errors.push(format!(
                            "batch {batch_no}: record {}: {}",
                            failure.key, failure.message
                        ));
                    }
                }
                Err(err) => {
                    warn!(batch = batch_no, records = batch.len(), error = %err, "batch write failed");
                    summary
                        .errors
                        .push(format!("batch {batch_no} failed: {err:#}"));
                }
            }
        }

        summary
    }
}

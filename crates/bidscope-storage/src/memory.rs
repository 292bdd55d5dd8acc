//! In-process [`ContractStore`] used by tests and dry runs.
//!
//! Records live in a `BTreeMap` keyed by `(source, natural_key)` behind a
//! `std::sync::RwLock`. Failures can be injected per record or per
//! `bulk_upsert` call to exercise partial-write handling.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use bidscope_core::{ContractRecord, SourceTag, StoredContract};
use chrono::Utc;

use crate::store::{BulkWriteOutcome, ContractPage, ContractQuery, ContractStore, WriteFailure};

type RecordKey = (SourceTag, String);

#[derive(Debug, Default)]
pub struct MemoryContractStore {
    docs: RwLock<BTreeMap<RecordKey, StoredContract>>,
    failing_records: RwLock<HashSet<RecordKey>>,
    failing_calls: RwLock<HashSet<usize>>,
    calls: AtomicUsize,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write of this record fails with a per-record error.
    pub fn fail_record(&self, source: SourceTag, natural_key: &str) {
        self.failing_records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((source, natural_key.to_string()));
    }

    /// The n-th `bulk_upsert` call (1-based) fails as a whole.
    pub fn fail_batch_call(&self, call_no: usize) {
        self.failing_calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call_no);
    }

    pub fn get(&self, source: SourceTag, natural_key: &str) -> Option<StoredContract> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(source, natural_key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn bulk_upsert(&self, batch: &[ContractRecord]) -> anyhow::Result<BulkWriteOutcome> {
        let call_no = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .failing_calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&call_no)
        {
            return Err(anyhow!("simulated connection loss on bulk write #{call_no}"));
        }

        let failing = self
            .failing_records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut outcome = BulkWriteOutcome::default();

        for (index, record) in batch.iter().enumerate() {
            let key = (record.source, record.natural_key.clone());
            if failing.contains(&key) {
                outcome.failures.push(WriteFailure {
                    index,
                    key: record.key(),
                    message: "simulated write rejection".to_string(),
                });
                continue;
            }

            let now = Utc::now();
            match docs.get_mut(&key) {
                Some(existing) if existing.record == *record => outcome.unchanged += 1,
                Some(existing) => {
                    existing.record = record.clone();
                    existing.updated_at = now;
                    outcome.modified += 1;
                }
                None => {
                    docs.insert(
                        key,
                        StoredContract {
                            record: record.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    outcome.upserted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn query(&self, query: &ContractQuery) -> anyhow::Result<ContractPage> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched = docs
            .values()
            .filter(|doc| query.filter.matches(&doc.record))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| {
            b.record
                .posted_date
                .cmp(&a.record.posted_date)
                .then_with(|| a.record.source.as_str().cmp(b.record.source.as_str()))
                .then_with(|| a.record.natural_key.cmp(&b.record.natural_key))
        });

        let total = matched.len() as u64;
        let rows = matched
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size as usize)
            .collect();
        Ok(ContractPage::new(rows, total, query))
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.docs.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}

//! A single fetch, normalize and write pass over one source.

use anyhow::{bail, Context};
use bidscope_adapters::{AdapterContext, SourceAdapter, StopReason};
use bidscope_core::{DateWindow, SourceTag};
use bidscope_storage::{HttpFetcher, UpsertSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Normalizing,
    Writing,
    Done,
    Failed,
}

impl RunStage {
    pub fn can_transition_to(self, next: RunStage) -> bool {
        matches!(
            (self, next),
            (RunStage::Fetching, RunStage::Normalizing)
                | (RunStage::Fetching, RunStage::Done)
                | (RunStage::Fetching, RunStage::Failed)
                | (RunStage::Normalizing, RunStage::Writing)
                | (RunStage::Writing, RunStage::Done)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoData,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: SourceTag,
    pub status: RunStatus,
    pub stage: RunStage,
    pub total_fetched: usize,
    pub total_normalized: usize,
    /// Records the mapper rejected for lacking both key and title.
    pub total_dropped: usize,
    pub total_upserted: usize,
    pub total_modified: usize,
    pub total_unchanged: usize,
    pub pages: usize,
    pub stop_reason: Option<StopReason>,
    pub transient_error: Option<String>,
    pub date_range: Option<DateWindow>,
    pub errors: Vec<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl RunReport {
    fn begin(source: SourceTag, ctx: &AdapterContext, date_range: Option<DateWindow>) -> Self {
        let now = Utc::now();
        Self {
            run_id: ctx.run_id,
            source,
            status: RunStatus::Completed,
            stage: RunStage::Fetching,
            total_fetched: 0,
            total_normalized: 0,
            total_dropped: 0,
            total_upserted: 0,
            total_modified: 0,
            total_unchanged: 0,
            pages: 0,
            stop_reason: None,
            transient_error: None,
            date_range,
            errors: Vec::new(),
            message: String::new(),
            started_at: now,
            timestamp: now,
        }
    }

    /// Report for a run that ended in a fatal error.
    pub fn failed(source: SourceTag, ctx: &AdapterContext, started_at: DateTime<Utc>, err: &anyhow::Error) -> Self {
        let mut report = Self::begin(source, ctx, None);
        report.status = RunStatus::Failed;
        report.stage = RunStage::Failed;
        report.started_at = started_at;
        report.message = format!("{source}: fetch failed");
        report.errors.push(format!("{err:#}"));
        report
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    fn advance(&mut self, next: RunStage) -> anyhow::Result<()> {
        if !self.stage.can_transition_to(next) {
            bail!("illegal run stage transition {:?} -> {:?}", self.stage, next);
        }
        debug!(from = ?self.stage, to = ?next, "run stage");
        self.stage = next;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.advance(RunStage::Done)?;
        self.timestamp = Utc::now();
        Ok(())
    }
}

/// Fetch everything `adapter` yields, normalize it and write it through `sink`.
///
/// A fatal fetch error is returned as `Err`; transient upstream trouble, dropped
/// records and write failures all end up inside the returned report.
pub async fn run_ingestion(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    sink: &UpsertSink,
    ctx: &AdapterContext,
) -> anyhow::Result<RunReport> {
    let source = adapter.source();
    let span = info_span!("ingest_run", run_id = %ctx.run_id, %source);

    async move {
        let mut report = RunReport::begin(source, ctx, adapter.date_window(ctx.now));
        info!("ingestion started");

        let fetched = match adapter.fetch(http, ctx).await {
            Ok(fetched) => fetched,
            Err(err) => {
                report.advance(RunStage::Failed)?;
                error!(error = %err, "fetch failed");
                return Err(err).with_context(|| format!("fetching {source}"));
            }
        };
        report.total_fetched = fetched.records.len();
        report.pages = fetched.pages;
        report.stop_reason = Some(fetched.stop_reason);
        report.transient_error = fetched.transient_error;

        if fetched.records.is_empty() {
            report.status = RunStatus::NoData;
            report.message = format!("No data found for {source}");
            report.finish()?;
            info!(pages = report.pages, "no records fetched");
            return Ok(report);
        }

        report.advance(RunStage::Normalizing)?;
        let records = fetched
            .records
            .iter()
            .filter_map(|raw| adapter.normalize(raw))
            .collect::<Vec<_>>();
        report.total_normalized = records.len();
        report.total_dropped = report.total_fetched - records.len();

        report.advance(RunStage::Writing)?;
        let summary = sink.write(&records).await;
        report.total_upserted = summary.upserted;
        report.total_modified = summary.modified;
        report.total_unchanged = summary.unchanged;
        report.errors = summary.errors;

        report.message = format!(
            "{source}: fetched {}, normalized {}, upserted {}, modified {}, unchanged {}",
            report.total_fetched,
            report.total_normalized,
            report.total_upserted,
            report.total_modified,
            report.total_unchanged
        );
        report.finish()?;
        info!(
            fetched = report.total_fetched,
            normalized = report.total_normalized,
            dropped = report.total_dropped,
            upserted = report.total_upserted,
            modified = report.total_modified,
            unchanged = report.total_unchanged,
            pages = report.pages,
            errors = report.errors.len(),
            "ingestion finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

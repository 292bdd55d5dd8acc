//! Ingestion orchestration: configuration, per-source runs, reports and scheduling.

mod config;
mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bidscope_adapters::{adapter_for_source, AdapterContext, SourceAdapter};
use bidscope_core::SourceTag;
use bidscope_storage::{BackoffPolicy, ContractStore, HttpClientConfig, HttpFetcher, UpsertSink};
use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use config::{
    reports_dir_from_env, ConfigError, SourceRegistry, SourceSettings, SyncConfig,
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_SYNC_CRON, DEFAULT_WEB_PORT,
};
pub use run::{run_ingestion, RunReport, RunStage, RunStatus};

pub const CRATE_NAME: &str = "bidscope-sync";

const RUN_REPORT_FILE: &str = "run_report.json";
const DAILY_BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source `{0}` is not enabled")]
    NotEnabled(SourceTag),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// HTTP settings for ingestion. A rate limit, 5xx or timeout must end the
/// current pagination walk, so the fetcher never retries on this path.
pub fn ingest_http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::none(),
        archive_dir: config.raw_archive_dir.clone(),
    }
}

/// Owns one adapter per enabled source plus the shared HTTP client and sink.
pub struct Ingestor {
    adapters: Vec<Box<dyn SourceAdapter>>,
    http: HttpFetcher,
    sink: UpsertSink,
    reports_dir: Option<PathBuf>,
}

impl Ingestor {
    /// Build adapters for every enabled source. Missing credentials for an
    /// enabled source are a configuration error.
    pub fn new(
        config: &SyncConfig,
        registry: &SourceRegistry,
        store: Arc<dyn ContractStore>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut adapters = Vec::new();
        for settings in registry.enabled() {
            if settings.source == SourceTag::Federal && config.sam_api_key.is_none() {
                return Err(ConfigError::Missing("SAM_API_KEY"));
            }
            let adapter = adapter_for_source(settings.source, &settings.adapter, config.sam_api_key.as_deref())
                .map_err(|err| ConfigError::Invalid {
                    name: "BIDSCOPE_SOURCES_FILE",
                    value: settings.source.to_string(),
                    reason: err.to_string(),
                })?;
            adapters.push(adapter);
        }

        let http = HttpFetcher::new(ingest_http_config(config))
        .map_err(|err| ConfigError::Invalid {
            name: "BIDSCOPE_USER_AGENT",
            value: config.user_agent.clone(),
            reason: format!("{err:#}"),
        })?;

        Ok(Self::from_parts(adapters, http, UpsertSink::new(store)).with_reports_dir(config.reports_dir.clone()))
    }

    pub fn from_parts(adapters: Vec<Box<dyn SourceAdapter>>, http: HttpFetcher, sink: UpsertSink) -> Self {
        Self {
            adapters,
            http,
            sink,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn reports_dir(&self) -> Option<&Path> {
        self.reports_dir.as_deref()
    }

    pub fn enabled_sources(&self) -> Vec<SourceTag> {
        self.adapters.iter().map(|a| a.source()).collect()
    }

    /// Run one source. A fatal failure is still recorded as a report on disk.
    pub async fn run_source(&self, source: SourceTag) -> std::result::Result<RunReport, IngestError> {
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.source() == source)
            .ok_or(IngestError::NotEnabled(source))?;

        let ctx = AdapterContext::new();
        let started_at = Utc::now();
        match run_ingestion(adapter.as_ref(), &self.http, &self.sink, &ctx).await {
            Ok(report) => {
                self.persist_report(&report).await;
                Ok(report)
            }
            Err(err) => {
                self.persist_report(&RunReport::failed(source, &ctx, started_at, &err)).await;
                Err(IngestError::Failed(err))
            }
        }
    }

    /// Run every enabled source in turn; one failing source never stops the rest.
    pub async fn run_all(&self) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let source = adapter.source();
            let ctx = AdapterContext::new();
            let started_at = Utc::now();
            let report = match run_ingestion(adapter.as_ref(), &self.http, &self.sink, &ctx).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(%source, error = %format!("{err:#}"), "source run failed");
                    RunReport::failed(source, &ctx, started_at, &err)
                }
            };
            self.persist_report(&report).await;
            reports.push(report);
        }
        reports
    }

    async fn persist_report(&self, report: &RunReport) {
        let Some(reports_dir) = &self.reports_dir else {
            return;
        };
        if let Err(err) = write_report(reports_dir, report).await {
            warn!(run_id = %report.run_id, error = %format!("{err:#}"), "failed to write run report");
        }
    }
}

/// Write `<reports_dir>/<run_id>/run_report.json` and a markdown brief.
pub async fn write_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join(RUN_REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_REPORT_FILE}"))?;

    fs::write(run_dir.join(DAILY_BRIEF_FILE), daily_brief(report))
        .await
        .with_context(|| format!("writing {DAILY_BRIEF_FILE}"))?;

    Ok(run_dir)
}

fn daily_brief(report: &RunReport) -> String {
    let mut lines = vec![
        "# Bidscope Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Source: {}", report.source),
        format!("- Status: {:?}", report.status),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.timestamp),
    ];
    if let Some(window) = &report.date_range {
        lines.push(format!("- Window: {} to {}", window.from, window.to));
    }
    lines.push(String::new());
    lines.push("## Counts".to_string());
    lines.push(format!("- fetched: {}", report.total_fetched));
    lines.push(format!("- normalized: {}", report.total_normalized));
    lines.push(format!("- dropped: {}", report.total_dropped));
    lines.push(format!("- upserted: {}", report.total_upserted));
    lines.push(format!("- modified: {}", report.total_modified));
    lines.push(format!("- unchanged: {}", report.total_unchanged));
    lines.push(format!("- pages: {}", report.pages));
    if let Some(reason) = report.stop_reason {
        lines.push(format!("- stop reason: {}", reason.as_str()));
    }
    if let Some(err) = &report.transient_error {
        lines.push(format!("- transient error: {err}"));
    }
    if !report.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.extend(report.errors.iter().map(|e| format!("- {e}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Most recent run reports, newest first. A missing directory means no runs.
pub fn recent_reports(reports_dir: &Path, limit: usize) -> Result<Vec<RunReport>> {
    let entries = match std::fs::read_dir(reports_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", reports_dir.display())),
    };

    let mut reports = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(RUN_REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<RunReport>(&text) {
            Ok(report) => reports.push(report),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    reports.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    reports.truncate(limit);
    Ok(reports)
}

pub fn report_daily_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let reports = recent_reports(reports_dir, runs.max(1))?;

    let mut lines = vec!["# Bidscope Run Report".to_string(), String::new()];
    if reports.is_empty() {
        lines.push(format!("No runs recorded under `{}`.", reports_dir.display()));
    }
    for report in reports {
        lines.push(format!("## {} run `{}`", report.source, report.run_id));
        lines.push(format!("- status: {:?}", report.status));
        lines.push(format!("- finished: {}", report.timestamp));
        lines.push(format!(
            "- fetched {} / normalized {} / upserted {} / modified {} / unchanged {}",
            report.total_fetched,
            report.total_normalized,
            report.total_upserted,
            report.total_modified,
            report.total_unchanged
        ));
        if let Some(err) = &report.transient_error {
            lines.push(format!("- transient error: {err}"));
        }
        if !report.errors.is_empty() {
            lines.push(format!("- errors: {}", report.errors.len()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// Cron-driven `run_all`, only when the scheduler is switched on.
pub async fn maybe_build_scheduler(config: &SyncConfig, ingestor: Arc<Ingestor>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let ingestor = ingestor.clone();
        Box::pin(async move {
            info!("scheduled ingestion triggered");
            let reports = ingestor.run_all().await;
            let failed = reports.iter().filter(|r| r.is_failed()).count();
            info!(sources = reports.len(), failed, "scheduled ingestion finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

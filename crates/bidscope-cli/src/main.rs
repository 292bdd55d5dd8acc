use std::sync::Arc;

use anyhow::{Context, Result};
use bidscope_core::SourceTag;
use bidscope_storage::{ContractStore, PgContractStore};
use bidscope_sync::{
    maybe_build_scheduler, report_daily_markdown, reports_dir_from_env, Ingestor, RunReport, SourceRegistry,
    SyncConfig,
};
use bidscope_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset. Lists every workspace target explicitly.
const DEFAULT_LOG_FILTER: &str =
    "bidscope=info,bidscope_adapters=info,bidscope_storage=info,bidscope_sync=info,bidscope_web=info";

#[derive(Debug, Parser)]
#[command(name = "bidscope")]
#[command(about = "Government contract opportunity aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source (or just one) into the store.
    Sync {
        #[arg(long)]
        source: Option<SourceTag>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the read API, with the scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => sync(source).await,
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgContractStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Serve { port } => serve(port).await,
        Commands::Report { runs } => {
            println!("{}", report_daily_markdown(runs, &reports_dir_from_env())?);
            Ok(())
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<Arc<dyn ContractStore>> {
    let store = PgContractStore::connect(&config.database_url).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn sync(source: Option<SourceTag>) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let mut registry = SourceRegistry::load(&config.sources_file).await?;
    if let Some(source) = source {
        // Only the requested source needs credentials.
        registry.sources.retain(|s| s.source == source);
        if registry.enabled().next().is_none() {
            anyhow::bail!("source `{source}` is not enabled in {}", config.sources_file.display());
        }
    }
    let ingestor = Ingestor::new(&config, &registry, connect(&config).await?)?;

    let reports = ingestor.run_all().await;
    for report in &reports {
        print_summary(report);
    }
    let failed = reports.iter().filter(|r| r.is_failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} source runs failed", reports.len());
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!(
        "{} run_id={} status={:?} fetched={} normalized={} upserted={} modified={} unchanged={} errors={}",
        report.source,
        report.run_id,
        report.status,
        report.total_fetched,
        report.total_normalized,
        report.total_upserted,
        report.total_modified,
        report.total_unchanged,
        report.errors.len()
    );
}

async fn serve(port: Option<u16>) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let store = connect(&config).await?;
    let ingestor = Arc::new(Ingestor::new(&config, &registry, store.clone())?);

    let scheduler = maybe_build_scheduler(&config, ingestor.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    } else {
        warn!("scheduler disabled; ingestion runs only on request");
    }

    let state = AppState::new(store)
        .with_ingestor(ingestor)
        .with_reports_dir(config.reports_dir.clone());
    bidscope_web::serve(state, port.unwrap_or(config.web_port)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_filter_covers_every_crate() {
        for target in ["bidscope", "bidscope_adapters", "bidscope_storage", "bidscope_sync", "bidscope_web"] {
            assert!(
                DEFAULT_LOG_FILTER.split(',').any(|d| d == format!("{target}=info")),
                "{target} missing"
            );
        }
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn sync_accepts_a_single_source() {
        let cli = Cli::try_parse_from(["bidscope", "sync", "--source", "ny"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sync { source: Some(SourceTag::Ny) })));
        assert!(Cli::try_parse_from(["bidscope", "sync", "--source", "tx"]).is_err());
    }
}

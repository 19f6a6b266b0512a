use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use integobase_core::{EntityKind, JobId, RunTrigger, SourceKind};
use integobase_storage::{MemoryStore, PgStore, RunFilter, SyncStore};
use integobase_sync::{build_sequencer, EntryStatus, Scheduler, SchedulerOptions, SyncConfig};
use integobase_web::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "integobase")]
#[command(about = "Integobase helpdesk and RMM sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync cycle and exit.
    Sync,
    /// Run a single job now, e.g. `trigger helpdesk ticket`.
    Trigger { source: SourceKind, kind: EntityKind },
    /// Start the scheduler and the read API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Print recent sync runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u64,
        /// Restrict to one job (`source/kind`).
        #[arg(long)]
        job: Option<JobId>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SyncStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store that is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open_store(&config).await?;
            let registry = config.load_registry().await?;
            let (_tx, rx) = watch::channel(false);
            let sequencer = build_sequencer(&config, &registry, store, rx)?;
            let report = sequencer.run_cycle(RunTrigger::Manual).await;
            for entry in &report.entries {
                match &entry.status {
                    EntryStatus::Ran {
                        outcome, counts, ..
                    } => println!(
                        "{:<18} {:<8} fetched={} created={} updated={} unchanged={} skipped={} invalid={} failed={}",
                        entry.job,
                        outcome.as_str(),
                        counts.fetched,
                        counts.created,
                        counts.updated,
                        counts.unchanged,
                        counts.skipped,
                        counts.invalid,
                        counts.failed
                    ),
                    EntryStatus::NotDue { next_due } => println!("{:<18} not due until {next_due}", entry.job),
                    EntryStatus::Halted { source } => {
                        println!("{:<18} halted: {source} rejected our credentials", entry.job)
                    }
                    EntryStatus::Errored { detail } => println!("{:<18} error: {detail}", entry.job),
                }
            }
        }
        Commands::Trigger { source, kind } => {
            let store = open_store(&config).await?;
            let registry = config.load_registry().await?;
            let (_tx, rx) = watch::channel(false);
            let sequencer = build_sequencer(&config, &registry, store, rx)?;
            let run = sequencer
                .run_job(JobId::new(source, kind), RunTrigger::Manual)
                .await?;
            println!(
                "run {} for {}: {} (created={} updated={} unchanged={})",
                run.id,
                run.job,
                run.outcome.as_str(),
                run.counts.created,
                run.counts.updated,
                run.counts.unchanged
            );
            if let Some(message) = run.message {
                println!("  {message}");
            }
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Runs { limit, job } => {
            let store = open_store(&config).await?;
            let runs = store.list_runs(&RunFilter { job, limit }).await?;
            if runs.is_empty() {
                println!("no sync runs recorded");
            }
            for run in runs {
                println!(
                    "{} {:<18} {:<9} {:<8} started={} created={} updated={} invalid={} failed={}",
                    run.id,
                    run.job,
                    run.trigger.as_str(),
                    run.outcome.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.counts.created,
                    run.counts.updated,
                    run.counts.invalid,
                    run.counts.failed
                );
            }
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let swept = store.abandon_running_runs().await?;
    if swept > 0 {
        warn!(runs = swept, "marked runs left open by an earlier process as failed");
    }
    let registry = config.load_registry().await?;
    let (tx, rx) = watch::channel(false);
    let sequencer = build_sequencer(&config, &registry, Arc::clone(&store), rx)?;

    let scheduler = Scheduler::new(
        Arc::new(sequencer),
        SchedulerOptions {
            interval: config.cycle_interval(),
            run_on_start: config.run_on_start,
        },
        tx,
    );
    if config.scheduler_enabled {
        scheduler.start().await?;
    } else {
        info!("scheduler disabled; only manual triggers will run");
    }

    let state = AppState::new(store).with_scheduler(scheduler.clone());
    integobase_web::serve(state, config.web_port, shutdown_signal()).await?;

    scheduler.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

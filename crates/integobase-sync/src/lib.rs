//! Sync engine: schema mapping, reconciliation, per-job runs, dependency
//! sequencing and the cycle scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use integobase_adapters::{
    DattoClient, DattoConfig, FixtureSourceClient, FreshserviceClient, FreshserviceConfig,
    SourceClient,
};
use integobase_core::SourceKind;
use integobase_storage::SyncStore;
use tokio::sync::watch;
use tracing::info;

pub mod config;
pub mod job;
pub mod reconcile;
pub mod scheduler;
pub mod schema;
pub mod sequencer;

pub use config::{ConfigError, SourceMode, SyncConfig, SyncRegistry};
pub use job::{JobOptions, JobReport, SyncJob};
pub use reconcile::{Baseline, Decision, Reconciler};
pub use scheduler::{CycleRunner, Scheduler, SchedulerOptions};
pub use schema::{map_record, EntityDraft, Mapped};
pub use sequencer::{plan, CycleEntry, CycleReport, EntryStatus, RunJobError, Sequencer};

/// Builds the client for every enabled source and one job per enabled
/// registry entry, layered by declared dependencies.
pub fn build_sequencer(
    config: &SyncConfig,
    registry: &SyncRegistry,
    store: Arc<dyn SyncStore>,
    shutdown: watch::Receiver<bool>,
) -> Result<Sequencer> {
    let layers = plan(registry)?;
    let options = JobOptions {
        batch_size: registry.batch_size.max(1),
        error_sample_limit: registry.error_sample_limit,
    };

    let mut clients: HashMap<SourceKind, Arc<dyn SourceClient>> = HashMap::new();
    let mut jobs = Vec::new();
    let mut intervals = Vec::new();
    for settings in registry.enabled_jobs() {
        let client = match clients.get(&settings.source) {
            Some(client) => Arc::clone(client),
            None => {
                let client = build_client(config, registry, settings.source)
                    .with_context(|| format!("building {} client", settings.source))?;
                clients.insert(settings.source, Arc::clone(&client));
                client
            }
        };
        jobs.push(
            SyncJob::new(client, Arc::clone(&store), settings.kind, options)
                .with_shutdown(shutdown.clone()),
        );
        if let Some(interval) = settings.interval() {
            intervals.push((settings.id(), interval));
        }
    }

    info!(jobs = jobs.len(), layers = layers.len(), "sync jobs planned");
    Ok(intervals
        .into_iter()
        .fold(Sequencer::new(layers, jobs, store), |seq, (id, interval)| {
            seq.with_interval(id, interval)
        }))
}

fn build_client(
    config: &SyncConfig,
    registry: &SyncRegistry,
    source: SourceKind,
) -> Result<Arc<dyn SourceClient>> {
    let settings = registry.source(source);
    let mode = settings.map(|s| s.mode).unwrap_or_default();

    if mode == SourceMode::Fixture {
        let root = settings
            .and_then(|s| s.fixture_path.clone())
            .unwrap_or_else(|| config.fixtures_dir.clone());
        info!(%source, root = %root.display(), "replaying recorded fixtures");
        return Ok(Arc::new(FixtureSourceClient::new(source, root)));
    }

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let http = match settings {
        Some(s) => registry.http_config(s, timeout, &config.user_agent),
        None => integobase_storage::HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: registry.retry.backoff(),
            ..Default::default()
        },
    };

    let client: Arc<dyn SourceClient> = match source {
        SourceKind::Helpdesk => {
            let creds = config
                .helpdesk
                .as_ref()
                .ok_or(ConfigError::MissingCredentials(source))?;
            let mut fs_config = FreshserviceConfig::for_domain(&creds.domain, creds.api_key.clone());
            fs_config.initial_lookback_days = registry.initial_lookback_days;
            Arc::new(FreshserviceClient::new(fs_config, http)?)
        }
        SourceKind::Rmm => {
            let creds = config
                .rmm
                .as_ref()
                .ok_or(ConfigError::MissingCredentials(source))?;
            Arc::new(DattoClient::new(
                DattoConfig::new(&creds.api_endpoint, creds.api_key.clone(), creds.api_secret.clone()),
                http,
            )?)
        }
    };
    info!(%source, "live source client ready");
    Ok(client)
}

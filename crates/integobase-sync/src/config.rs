use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use integobase_core::{EntityKind, JobId, SourceKind};
use integobase_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job {job} depends on unknown job `{dependency}`")]
    UnknownDependency { job: JobId, dependency: String },
    #[error("dependency cycle between jobs: {0}")]
    Cycle(String),
    #[error("job {0} is declared more than once")]
    DuplicateJob(JobId),
    #[error("{source_kind} does not provide {kind} records")]
    UnsupportedJob {
        source_kind: SourceKind,
        kind: EntityKind,
    },
    #[error("{0} is enabled in live mode but its credentials are not set")]
    MissingCredentials(SourceKind),
}

#[derive(Debug, Clone)]
pub struct HelpdeskCredentials {
    pub domain: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct RmmCredentials {
    pub api_endpoint: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Process settings read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub registry_path: PathBuf,
    pub fixtures_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cycle_minutes: u64,
    pub run_on_start: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
    pub helpdesk: Option<HelpdeskCredentials>,
    pub rmm: Option<RmmCredentials>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database_url: env_opt("DATABASE_URL"),
            registry_path: env_opt("INTEGOBASE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("integobase.yaml")),
            fixtures_dir: env_opt("INTEGOBASE_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            scheduler_enabled: env_flag("INTEGOBASE_SCHEDULER_ENABLED", true),
            cycle_minutes: env_parse("INTEGOBASE_CYCLE_MINUTES", 60),
            run_on_start: env_flag("INTEGOBASE_RUN_ON_START", true),
            http_timeout_secs: env_parse("INTEGOBASE_HTTP_TIMEOUT_SECS", 90),
            user_agent: env_opt("INTEGOBASE_USER_AGENT")
                .unwrap_or_else(|| "integobase-sync/0.1".to_string()),
            web_port: env_parse("INTEGOBASE_WEB_PORT", 8080),
            helpdesk: match (env_opt("FRESHSERVICE_DOMAIN"), env_opt("FRESHSERVICE_API_KEY")) {
                (Some(domain), Some(api_key)) => Some(HelpdeskCredentials { domain, api_key }),
                _ => None,
            },
            rmm: match (
                env_opt("DATTO_API_ENDPOINT"),
                env_opt("DATTO_API_KEY"),
                env_opt("DATTO_API_SECRET"),
            ) {
                (Some(api_endpoint), Some(api_key), Some(api_secret)) => Some(RmmCredentials {
                    api_endpoint,
                    api_key,
                    api_secret,
                }),
                _ => None,
            },
        }
    }

    pub fn has_credentials(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Helpdesk => self.helpdesk.is_some(),
            SourceKind::Rmm => self.rmm.is_some(),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_minutes.max(1) * 60)
    }

    /// Reads the registry file, falling back to the built-in job set when it
    /// does not exist.
    pub async fn load_registry(&self) -> anyhow::Result<SyncRegistry> {
        if !tokio::fs::try_exists(&self.registry_path).await.unwrap_or(false) {
            warn!(
                path = %self.registry_path.display(),
                "registry file not found; using built-in job set"
            );
            return Ok(SyncRegistry::builtin(self));
        }
        SyncRegistry::load(&self.registry_path).await
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    /// Minimum spacing between two requests to this source.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    pub source: SourceKind,
    pub kind: EntityKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum time between scheduled runs of this job; `None` runs every cycle.
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    /// Jobs (`source/kind`) that must finish before this one starts.
    #[serde(default)]
    pub after: Vec<String>,
}

impl JobSettings {
    pub fn id(&self) -> JobId {
        JobId::new(self.source, self.kind)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_minutes.map(|m| Duration::from_secs(m * 60))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Declarative source and job registry (`integobase.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRegistry {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_error_sample_limit")]
    pub error_sample_limit: usize,
    #[serde(default = "default_lookback_days")]
    pub initial_lookback_days: i64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

impl SyncRegistry {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Built-in job set: daily client, contact, ticket, site and asset
    /// syncs. Sources without credentials replay recorded fixtures.
    pub fn builtin(config: &SyncConfig) -> Self {
        let sources = SourceKind::ALL
            .into_iter()
            .map(|source| SourceSettings {
                source,
                enabled: true,
                mode: if config.has_credentials(source) {
                    SourceMode::Live
                } else {
                    SourceMode::Fixture
                },
                fixture_path: None,
                request_interval_ms: default_request_interval_ms(),
                concurrency: default_concurrency(),
            })
            .collect();

        let job = |source, kind, after: &[&str]| JobSettings {
            source,
            kind,
            enabled: true,
            interval_minutes: Some(1440),
            after: after.iter().map(|s| s.to_string()).collect(),
        };
        let jobs = vec![
            job(SourceKind::Helpdesk, EntityKind::Client, &[]),
            job(SourceKind::Helpdesk, EntityKind::Contact, &["helpdesk/client"]),
            job(SourceKind::Helpdesk, EntityKind::Ticket, &["helpdesk/client"]),
            job(SourceKind::Rmm, EntityKind::Site, &["helpdesk/client"]),
            job(SourceKind::Rmm, EntityKind::Asset, &["rmm/site"]),
        ];

        Self {
            batch_size: default_batch_size(),
            error_sample_limit: default_error_sample_limit(),
            initial_lookback_days: default_lookback_days(),
            retry: RetrySettings::default(),
            sources,
            jobs,
        }
    }

    pub fn source(&self, source: SourceKind) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.source == source)
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &JobSettings> {
        self.jobs.iter().filter(|j| {
            j.enabled && self.source(j.source).map_or(true, |s| s.enabled)
        })
    }

    pub fn http_config(&self, source: &SourceSettings, timeout: Duration, user_agent: &str) -> HttpClientConfig {
        HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.to_string()),
            concurrency: source.concurrency.max(1),
            backoff: self.retry.backoff(),
            token_bucket: (source.request_interval_ms > 0).then(|| {
                TokenBucketConfig::spaced(Duration::from_millis(source.request_interval_ms))
            }),
            ..Default::default()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_request_interval_ms() -> u64 {
    500
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> usize {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    100
}

fn default_error_sample_limit() -> usize {
    10
}

fn default_lookback_days() -> i64 {
    365
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_defaults_fill_missing_fields() {
        let registry = SyncRegistry::parse(
            r#"
sources:
  - source: helpdesk
    mode: fixture
jobs:
  - source: helpdesk
    kind: client
  - source: helpdesk
    kind: ticket
    interval_minutes: 15
    after: ["helpdesk/client"]
"#,
        )
        .unwrap();

        assert_eq!(registry.batch_size, 100);
        assert_eq!(registry.error_sample_limit, 10);
        assert_eq!(registry.retry.max_attempts, 4);
        assert_eq!(registry.sources[0].mode, SourceMode::Fixture);
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.jobs[1].interval(), Some(Duration::from_secs(900)));
        assert_eq!(registry.jobs[1].after, vec!["helpdesk/client".to_string()]);
    }

    #[test]
    fn disabled_source_hides_its_jobs() {
        let registry = SyncRegistry::parse(
            r#"
sources:
  - source: rmm
    enabled: false
jobs:
  - {source: rmm, kind: site}
  - {source: helpdesk, kind: client}
"#,
        )
        .unwrap();
        let ids: Vec<JobId> = registry.enabled_jobs().map(JobSettings::id).collect();
        assert_eq!(ids, vec![JobId::new(SourceKind::Helpdesk, EntityKind::Client)]);
    }

    #[tokio::test]
    async fn registry_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integobase.yaml");
        std::fs::write(&path, "batch_size: 25\njobs: []\n").unwrap();
        let registry = SyncRegistry::load(&path).await.unwrap();
        assert_eq!(registry.batch_size, 25);
        assert!(registry.jobs.is_empty());

        let missing = SyncRegistry::load(&dir.path().join("nope.yaml")).await;
        assert!(missing.is_err());
    }
}

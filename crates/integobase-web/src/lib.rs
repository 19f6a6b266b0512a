//! Axum JSON read API over the sync store, plus the manual job trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use integobase_core::{EntityKind, JobId, SourceKind};
use integobase_storage::{RunFilter, SyncStore};
use integobase_sync::Scheduler;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;
/// Largest offset a SQL `OFFSET` accepts.
const MAX_OFFSET: u64 = i64::MAX as u64;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    /// Absent when the process serves reads only.
    pub scheduler: Option<Scheduler>,
}

impl AppState {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    job: Option<String>,
    limit: Option<u64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/entities/{kind}", get(entities_handler))
        .route("/api/v1/entities/{kind}/{id}", get(entity_detail_handler))
        .route("/api/v1/sync/runs", get(runs_handler))
        .route("/api/v1/sync/status", get(status_handler))
        .route("/api/v1/sync/jobs/{source}/{kind}/run", post(trigger_job_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read API listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn entities_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let Ok(kind) = kind.parse::<EntityKind>() else {
        return not_found(format!("unknown entity kind `{kind}`"));
    };
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = page.offset.unwrap_or(0).min(MAX_OFFSET);
    match state.store.list_entities(kind, offset, limit).await
    {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn entity_detail_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Response {
    let Ok(kind) = kind.parse::<EntityKind>() else {
        return not_found(format!("unknown entity kind `{kind}`"));
    };
    match state.store.get_entity_by_id(id).await {
        Ok(Some(entity)) if entity.key.kind == kind => Json(entity).into_response(),
        Ok(_) => not_found(format!("no {kind} with id {id}")),
        Err(err) => server_error(err.into()),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let job = match query.job.as_deref().map(str::parse::<JobId>) {
        Some(Ok(job)) => Some(job),
        Some(Err(err)) => return bad_request(err.to_string()),
        None => None,
    };
    let filter = RunFilter {
        job,
        limit: query.limit.unwrap_or(RunFilter::default().limit).clamp(1, MAX_PAGE_SIZE),
    };
    match state.store.list_runs(&filter).await {
        Ok(runs) => Json(json!({"runs": runs})).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest = match state.store.latest_runs().await {
        Ok(runs) => runs,
        Err(err) => return server_error(err.into()),
    };
    let scheduler = match &state.scheduler {
        Some(scheduler) => json!({
            "enabled": true,
            "busy": scheduler.is_busy(),
            "interval_secs": scheduler.options().interval.as_secs(),
            "last_cycle": scheduler.last_cycle().await,
        }),
        None => json!({"enabled": false}),
    };
    Json(json!({"scheduler": scheduler, "jobs": latest})).into_response()
}

async fn trigger_job_handler(
    State(state): State<Arc<AppState>>,
    Path((source, kind)): Path<(String, String)>,
) -> Response {
    let (Ok(source), Ok(kind)) = (source.parse::<SourceKind>(), kind.parse::<EntityKind>()) else {
        return not_found(format!("unknown job `{source}/{kind}`"));
    };
    let job = JobId::new(source, kind);
    let Some(scheduler) = &state.scheduler else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "scheduler is not running in this process"})),
        )
            .into_response();
    };
    if !scheduler.has_job(job) {
        return not_found(format!("job {job} is not configured"));
    }
    if scheduler.spawn_job(job) {
        info!(%job, "manual job run accepted");
        (StatusCode::ACCEPTED, Json(json!({"job": job, "status": "accepted"}))).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({"job": job, "status": "skipped", "error": "a sync cycle is already running"})),
        )
            .into_response()
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("Server error: {err}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use integobase_core::{
        EntityFields, EntityKey, RunOutcome, RunTrigger, SiteFields, SyncRun,
    };
    use integobase_storage::{EntityWrite, MemoryStore};
    use integobase_sync::{CycleReport, CycleRunner, RunJobError, SchedulerOptions};
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct SlowRunner;

    #[async_trait]
    impl CycleRunner for SlowRunner {
        fn has_job(&self, job: JobId) -> bool {
            job == JobId::new(SourceKind::Rmm, EntityKind::Site)
        }

        async fn run_cycle(&self, trigger: RunTrigger) -> CycleReport {
            tokio::time::sleep(Duration::from_secs(5)).await;
            CycleReport {
                trigger,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                entries: Vec::new(),
            }
        }

        async fn run_job(&self, job: JobId, trigger: RunTrigger) -> Result<SyncRun, RunJobError> {
            let mut run = SyncRun::open(job, trigger);
            run.finalize(RunOutcome::Success, None);
            Ok(run)
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .commit_batch(&[EntityWrite {
                key: EntityKey::new(SourceKind::Rmm, EntityKind::Site, "s-1"),
                parent_id: None,
                natural_key: None,
                source_modified_at: None,
                content_hash: "h".into(),
                fields: EntityFields::Site(SiteFields {
                    name: "Head Office".into(),
                    ..Default::default()
                }),
            }])
            .await
            .unwrap();
        let mut run = SyncRun::open(JobId::new(SourceKind::Rmm, EntityKind::Site), RunTrigger::Manual);
        store.begin_run(&run).await.unwrap();
        run.finalize(RunOutcome::Success, None);
        store.finish_run(&run).await.unwrap();
        store
    }

    fn with_scheduler(store: Arc<MemoryStore>) -> (AppState, Scheduler) {
        let (tx, _rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            Arc::new(SlowRunner),
            SchedulerOptions {
                interval: Duration::from_secs(3600),
                run_on_start: false,
            },
            tx,
        );
        (AppState::new(store).with_scheduler(scheduler.clone()), scheduler)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = get_json(app(AppState::new(seeded_store().await)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn entities_list_and_detail() {
        let app = app(AppState::new(seeded_store().await));
        let (status, page) = get_json(app.clone(), "/api/v1/entities/sites?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["fields"]["name"], "Head Office");

        let id = page["items"][0]["id"].as_str().unwrap().to_string();
        let (status, entity) = get_json(app.clone(), &format!("/api/v1/entities/site/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entity["key"]["source_id"], "s-1");

        let (status, _) = get_json(app.clone(), &format!("/api/v1/entities/asset/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(app, "/api/v1/entities/invoices").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn out_of_range_offset_is_clamped() {
        let app = app(AppState::new(seeded_store().await));
        let (status, page) = get_json(app, "/api/v1/entities/site?offset=18446744073709551615").await;
        assert_eq!(status, StatusCode::OK);
        assert!(page["items"].as_array().unwrap().is_empty());
        assert_eq!(page["offset"], i64::MAX);
    }

    #[tokio::test]
    async fn runs_filter_by_job() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get_json(app.clone(), "/api/v1/sync/runs?job=rmm/site").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);
        assert_eq!(body["runs"][0]["outcome"], "success");

        let (_, none) = get_json(app.clone(), "/api/v1/sync/runs?job=helpdesk/ticket").await;
        assert!(none["runs"].as_array().unwrap().is_empty());

        let (status, _) = get_json(app, "/api/v1/sync/runs?job=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_latest_runs() {
        let (state, _scheduler) = with_scheduler(seeded_store().await);
        let (status, body) = get_json(app(state), "/api/v1/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduler"]["enabled"], true);
        assert_eq!(body["scheduler"]["busy"], false);
        assert_eq!(body["jobs"][0]["job"]["source"], "rmm");
    }

    #[tokio::test]
    async fn manual_trigger_accepted_or_conflicts() {
        let (state, scheduler) = with_scheduler(seeded_store().await);
        let app = app(state);

        assert_eq!(post(app.clone(), "/api/v1/sync/jobs/helpdesk/ticket/run").await, StatusCode::NOT_FOUND);
        assert_eq!(post(app.clone(), "/api/v1/sync/jobs/nowhere/site/run").await, StatusCode::NOT_FOUND);

        assert!(scheduler.spawn_cycle(RunTrigger::Manual));
        assert_eq!(post(app.clone(), "/api/v1/sync/jobs/rmm/site/run").await, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn manual_trigger_runs_when_idle() {
        let (state, _scheduler) = with_scheduler(seeded_store().await);
        assert_eq!(post(app(state), "/api/v1/sync/jobs/rmm/sites/run").await, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn trigger_without_scheduler_is_unavailable() {
        let app = app(AppState::new(seeded_store().await));
        assert_eq!(
            post(app, "/api/v1/sync/jobs/rmm/site/run").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

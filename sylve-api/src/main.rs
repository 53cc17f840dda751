//! Sylve API server
//!
//! Wires the cluster data-protection subsystem together: database,
//! cluster service (Raft + FSM), lease manager, event store, replication
//! and backup engines, periodic snapshot scheduler and the REST surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use sylve_api::backup::restore::RestoreRequest;
use sylve_api::backup::BackupEngine;
use sylve_api::cluster::fsm::Proposal;
use sylve_api::cluster::lease::LeaseManager;
use sylve_api::cluster::raft::{AppendRequest, VoteRequest};
use sylve_api::cluster::router::{verify_cluster_token, ClusterRouter, ForwardedResponse};
use sylve_api::cluster::{ClusterService, JoinRequest};
use sylve_api::config::SylveConfig;
use sylve_api::db::{self, Database};
use sylve_api::driver::ShellGuestDriver;
use sylve_api::error::{ok, ApiError, ApiResult};
use sylve_api::events::EventStore;
use sylve_api::logging::LoggingConfig;
use sylve_api::periodic::PeriodicSnapshotScheduler;
use sylve_api::replication::ReplicationEngine;
use sylve_api::ssh::SecretStore;
use sylve_api::vmsnapshot::VmSnapshotManager;
use sylve_api::zfs::ZfsManager;

use sylve_common::model::{
    BackupJob, BackupTarget, ClusterSshIdentity, GuestType, PeriodicSnapshotJob, ReplicationPolicy,
};
use sylve_common::{ApiEnvelope, Error};

/// Shared application state
struct AppState {
    config: Arc<SylveConfig>,
    database: Arc<Database>,
    cluster: Arc<ClusterService>,
    router: Arc<ClusterRouter>,
    leases: Arc<LeaseManager>,
    events: Arc<EventStore>,
    replication: Arc<ReplicationEngine>,
    backups: Arc<BackupEngine>,
    periodic: Arc<PeriodicSnapshotScheduler>,
    snapshots: Arc<VmSnapshotManager>,
    zfs: Arc<ZfsManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = SylveConfig::load();
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }

    LoggingConfig {
        level: config.logging.level.clone(),
        ..Default::default()
    }
    .init()
    .ok();
    info!("Configuration loaded successfully");
    let config = Arc::new(config);

    // Initialize database
    let database = Arc::new(
        Database::new(&config.database.url)
            .await
            .expect("Failed to connect to database"),
    );
    database.migrate().await.expect("Failed to run migrations");
    info!("Database initialized");

    // Cluster service: node identity, Raft, FSM
    let cluster = ClusterService::bootstrap(database.clone(), &config)
        .await
        .expect("Failed to bootstrap cluster service");
    let router = Arc::new(ClusterRouter::new(cluster.clone()));
    let leases = Arc::new(LeaseManager::new(cluster.clone()));
    info!("Cluster service initialized (node {})", cluster.node_id());

    // Publish this node's SSH identity so peers can authorize pipelines.
    // Followers hand theirs to the leader through the internal endpoint;
    // retries cover the window while the cluster is electing.
    {
        let cluster = cluster.clone();
        let router = router.clone();
        let pub_key_path = config.paths.cluster_ssh_key.with_extension("pub");
        tokio::spawn(async move {
            let public_key = match tokio::fs::read_to_string(&pub_key_path).await {
                Ok(key) => key,
                Err(e) => {
                    warn!(
                        "Cluster SSH public key {:?} unreadable ({}); peer replication needs it",
                        pub_key_path, e
                    );
                    return;
                }
            };
            loop {
                match cluster.publish_ssh_identity(&public_key).await {
                    Ok(()) => break,
                    Err(Error::NotLeader) => {
                        let identity = serde_json::json!({
                            "node_id": cluster.node_id(),
                            "public_key": public_key.trim(),
                        });
                        if let Some(raft) = cluster.raft().await {
                            if let Some((leader_id, _)) = raft.leader().await {
                                match router
                                    .forward_to_node(
                                        &leader_id,
                                        reqwest::Method::POST,
                                        "/api/cluster/ssh/identity",
                                        Some(&identity),
                                    )
                                    .await
                                {
                                    Ok(resp) if resp.status < 300 => break,
                                    Ok(resp) => warn!(
                                        "Leader rejected SSH identity (status {})",
                                        resp.status
                                    ),
                                    Err(e) => warn!("Failed to publish SSH identity: {}", e),
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Failed to publish SSH identity: {}", e),
                }
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        });
    }

    let zfs = Arc::new(ZfsManager::new());
    let events = Arc::new(EventStore::new(database.clone()));
    let driver = Arc::new(ShellGuestDriver::new());

    let replication = ReplicationEngine::new(
        database.clone(),
        zfs.clone(),
        events.clone(),
        leases.clone(),
        cluster.clone(),
        config.paths.cluster_ssh_key.to_string_lossy().to_string(),
        config.protection.ssh_connect_timeout_secs,
        config.protection.replication_workers,
    );
    replication.start_scheduler();
    info!("Replication engine initialized");

    let backups = BackupEngine::new(
        database.clone(),
        zfs.clone(),
        events.clone(),
        cluster.clone(),
        driver.clone(),
        SecretStore::new(config.paths.secrets.clone()),
        config.protection.ssh_connect_timeout_secs,
        config.protection.shutdown_wait_secs,
        config.protection.backup_workers,
    );
    backups.start_scheduler();
    info!("Backup engine initialized");

    let periodic = Arc::new(PeriodicSnapshotScheduler::new(database.clone(), zfs.clone()));
    periodic.clone().start();
    info!("Periodic snapshot scheduler initialized");

    let snapshots = Arc::new(VmSnapshotManager::new(
        database.clone(),
        zfs.clone(),
        driver,
        config.paths.guest_state.clone(),
    ));
    info!("VM snapshot manager initialized");

    let state = Arc::new(AppState {
        config: config.clone(),
        database,
        cluster,
        router,
        leases,
        events,
        replication,
        backups,
        periodic,
        snapshots,
        zfs,
    });

    let internal_routes = Router::new()
        .route("/api/cluster/raft/append", post(raft_append))
        .route("/api/cluster/raft/vote", post(raft_vote))
        .route("/api/cluster/join-request", post(cluster_join_request))
        .route("/api/cluster/replication/policies/activate", post(activate_replication_policy))
        .route("/api/cluster/ssh/identity", post(post_ssh_identity))
        .layer(middleware::from_fn_with_state(state.clone(), cluster_auth));

    let app = Router::new()
        .route("/api/health", get(health_check))
        // Cluster membership
        .route("/api/cluster/init", post(cluster_init))
        .route("/api/cluster/join", post(cluster_join))
        .route("/api/cluster/nodes", get(list_cluster_nodes))
        // Backup targets
        .route("/api/cluster/backups/targets", get(list_backup_targets))
        .route("/api/cluster/backups/targets", post(create_backup_target))
        .route("/api/cluster/backups/targets/:id", put(update_backup_target))
        .route("/api/cluster/backups/targets/:id", delete(delete_backup_target))
        .route("/api/cluster/backups/targets/:id/validate", post(validate_backup_target))
        .route("/api/cluster/backups/targets/:id/datasets", get(list_target_datasets))
        .route("/api/cluster/backups/targets/:id/datasets/snapshots", get(list_target_dataset_snapshots))
        .route("/api/cluster/backups/targets/:id/datasets/jail", get(get_target_jail_metadata))
        .route("/api/cluster/backups/targets/:id/restore", post(restore_from_target))
        // Backup jobs
        .route("/api/cluster/backups/jobs", get(list_backup_jobs))
        .route("/api/cluster/backups/jobs", post(create_backup_job))
        .route("/api/cluster/backups/jobs/:id", put(update_backup_job))
        .route("/api/cluster/backups/jobs/:id", delete(delete_backup_job))
        .route("/api/cluster/backups/jobs/:id/run", post(run_backup_job))
        .route("/api/cluster/backups/jobs/:id/restore", post(restore_backup_job))
        .route("/api/cluster/backups/jobs/:id/snapshots", get(list_backup_job_snapshots))
        // Backup events
        .route("/api/cluster/backups/events", get(list_backup_events))
        .route("/api/cluster/backups/events/remote", get(list_backup_events_remote))
        .route("/api/cluster/backups/events/:id", get(get_backup_event))
        .route("/api/cluster/backups/events/:id/progress", get(get_backup_event_progress))
        // Replication policies
        .route("/api/cluster/replication/policies", get(list_replication_policies))
        .route("/api/cluster/replication/policies", post(create_replication_policy))
        .route("/api/cluster/replication/policies/:id", put(update_replication_policy))
        .route("/api/cluster/replication/policies/:id", delete(delete_replication_policy))
        .route("/api/cluster/replication/policies/:id/run", post(run_replication_policy))
        // Replication events
        .route("/api/cluster/replication/events", get(list_replication_events))
        .route("/api/cluster/replication/events/:id", get(get_replication_event))
        .route("/api/cluster/replication/events/:id/progress", get(get_replication_event_progress))
        // SSH reconcile (local action, operator-triggered)
        .route("/api/cluster/ssh/reconcile", post(post_ssh_reconcile))
        // Guest start gate
        .route("/api/cluster/guests/:kind/:rid/start-check", post(guest_start_check))
        // VM snapshots
        .route("/api/vm/:rid/snapshots", get(list_vm_snapshots))
        .route("/api/vm/:rid/snapshots", post(create_vm_snapshot))
        .route("/api/vm/:rid/snapshots/:snapshot_id", delete(delete_vm_snapshot))
        .route("/api/vm/:rid/snapshots/:snapshot_id/rollback", post(rollback_vm_snapshot))
        // Periodic snapshots
        .route("/api/zfs/periodic-snapshots", get(list_periodic_snapshots))
        .route("/api/zfs/periodic-snapshots", post(create_periodic_snapshot))
        .route("/api/zfs/periodic-snapshots/:id", delete(delete_periodic_snapshot))
        // Pools (dashboard data)
        .route("/api/zfs/pools", get(list_zfs_pools))
        .merge(internal_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Sylve API listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ----- middleware -----

/// Intra-cluster authentication: a short-lived cluster JWT in
/// `X-Cluster-Token`, or the legacy `clusterkey` query parameter used by
/// the reverse-proxy path.
async fn cluster_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let key = match state.cluster.cluster_key().await {
        Ok(Some(key)) => key,
        _ => {
            return ApiError(Error::validation("this node is not part of a cluster"))
                .into_response()
        }
    };

    let query = request.uri().query().unwrap_or("");
    let by_query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(k, v)| k == "clusterkey" && v == key);

    let by_token = request
        .headers()
        .get("X-Cluster-Token")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| verify_cluster_token(token, &key).is_ok())
        .unwrap_or(false);

    if !by_query && !by_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiEnvelope::<()>::error(
                "invalid_cluster_token",
                "missing or invalid intra-cluster credentials",
            )),
        )
            .into_response();
    }

    next.run(request).await
}

// ----- helpers -----

fn forwarded(resp: ForwardedResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Leader gate for replicated-config writes: followers forward the call
/// to the leader and relay its response verbatim.
async fn leader_or_forward<T: serde::Serialize>(
    state: &AppState,
    method: reqwest::Method,
    path: &str,
    payload: Option<&T>,
) -> ApiResult<Option<Response>> {
    if state.cluster.is_leader().await {
        return Ok(None);
    }
    let body = match payload {
        Some(payload) => Some(serde_json::to_vec(payload).map_err(Error::from)?),
        None => None,
    };
    let resp = state
        .router
        .forward_to_leader(method, path, "", body)
        .await?;
    Ok(Some(forwarded(resp)))
}

fn redact_target(mut target: BackupTarget) -> BackupTarget {
    target.ssh_key = String::new();
    target
}

// ----- health -----

async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.database.health_check().await?;
    Ok(ok(serde_json::json!({
        "node_id": state.cluster.node_id(),
        "hostname": state.cluster.hostname(),
        "api_port": state.config.server.port,
        "leader": state.cluster.is_leader().await,
        "clustered": state.cluster.is_initialized().await,
    })))
}

// ----- cluster membership -----

async fn cluster_init(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let cluster_key = state.cluster.init_cluster().await?;
    Ok(ok(serde_json::json!({ "cluster_key": cluster_key })))
}

#[derive(serde::Deserialize)]
struct JoinBody {
    peer: String,
    cluster_key: String,
}

async fn cluster_join(
    State(state): State<Arc<AppState>>,
    Json(body): Json<JoinBody>,
) -> ApiResult<impl IntoResponse> {
    state.cluster.join_cluster(&body.peer, &body.cluster_key).await?;
    Ok(ok(()))
}

async fn cluster_join_request(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::POST,
        "/api/cluster/join-request",
        Some(&request),
    )
    .await?
    {
        return Ok(resp);
    }
    let response = state.cluster.handle_join(request).await?;
    Ok(ok(response).into_response())
}

async fn list_cluster_nodes(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.cluster.nodes().await?))
}

// ----- raft transport -----

async fn raft_append(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendRequest>,
) -> ApiResult<impl IntoResponse> {
    let raft = state.cluster.raft().await.ok_or(Error::LeaderUnknown)?;
    Ok(Json(raft.handle_append(request).await?))
}

async fn raft_vote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VoteRequest>,
) -> ApiResult<impl IntoResponse> {
    let raft = state.cluster.raft().await.ok_or(Error::LeaderUnknown)?;
    Ok(Json(raft.handle_vote(request).await?))
}

// ----- backup targets -----

async fn list_backup_targets(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let targets = db::backup_targets::list(state.database.pool()).await?;
    Ok(ok(targets.into_iter().map(redact_target).collect::<Vec<_>>()))
}

async fn create_backup_target(
    State(state): State<Arc<AppState>>,
    Json(mut target): Json<BackupTarget>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::POST,
        "/api/cluster/backups/targets",
        Some(&target),
    )
    .await?
    {
        return Ok(resp);
    }

    target.id = db::backup_targets::next_id(state.database.pool()).await?;
    state
        .cluster
        .propose(Proposal::BackupTargetCreate {
            target: target.clone(),
        })
        .await?;
    Ok(ok(redact_target(target)).into_response())
}

async fn update_backup_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(mut target): Json<BackupTarget>,
) -> ApiResult<Response> {
    target.id = id;
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::PUT,
        &format!("/api/cluster/backups/targets/{}", id),
        Some(&target),
    )
    .await?
    {
        return Ok(resp);
    }

    if db::backup_targets::get(state.database.pool(), id).await?.is_none() {
        return Err(ApiError(Error::not_found(
            "backup_target_not_found",
            format!("backup target {}", id),
        )));
    }
    state
        .cluster
        .propose(Proposal::BackupTargetUpdate {
            target: target.clone(),
        })
        .await?;
    Ok(ok(redact_target(target)).into_response())
}

async fn delete_backup_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward::<()>(
        &state,
        reqwest::Method::DELETE,
        &format!("/api/cluster/backups/targets/{}", id),
        None,
    )
    .await?
    {
        return Ok(resp);
    }

    let target = db::backup_targets::get(state.database.pool(), id)
        .await?
        .ok_or_else(|| {
            Error::not_found("backup_target_not_found", format!("backup target {}", id))
        })?;
    state
        .cluster
        .propose(Proposal::BackupTargetDelete { id })
        .await?;

    // Deleting a target also removes its on-disk key material.
    if let Err(e) = state.backups.scrub_target_secrets(&target).await {
        warn!("Failed to scrub key material for target {}: {}", id, e);
    }
    Ok(ok(()).into_response())
}

async fn validate_backup_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let target = state.backups.target(id).await?;
    state.backups.validate_target(&target).await?;
    Ok(ok(()))
}

// ----- target browse & restore -----

#[derive(serde::Deserialize)]
struct DatasetQuery {
    dataset: String,
}

async fn list_target_datasets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.backups.list_remote_datasets(id).await?))
}

async fn list_target_dataset_snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<DatasetQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state
        .backups
        .list_remote_dataset_snapshots(id, &query.dataset)
        .await?))
}

async fn get_target_jail_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<DatasetQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state
        .backups
        .remote_jail_metadata(id, &query.dataset)
        .await?))
}

async fn restore_from_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Response> {
    // Restores execute on the chosen destination node.
    if state.router.should_forward(&request.restore_node_id) {
        let node_id = request.restore_node_id.clone();
        let mut forwarded_request = request.clone();
        forwarded_request.restore_node_id = String::new();
        let payload = serde_json::to_value(&forwarded_request).map_err(Error::from)?;
        let resp = state
            .router
            .forward_to_node(
                &node_id,
                reqwest::Method::POST,
                &format!("/api/cluster/backups/targets/{}/restore", id),
                Some(&payload),
            )
            .await?;
        return Ok(forwarded(resp));
    }

    let event_id = state.backups.restore_dataset(id, &request).await?;
    Ok(ok(serde_json::json!({ "event_id": event_id })).into_response())
}

// ----- backup jobs -----

async fn list_backup_jobs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(ok(db::backup_jobs::list(state.database.pool()).await?))
}

async fn create_backup_job(
    State(state): State<Arc<AppState>>,
    Json(mut job): Json<BackupJob>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::POST,
        "/api/cluster/backups/jobs",
        Some(&job),
    )
    .await?
    {
        return Ok(resp);
    }

    job.id = db::backup_jobs::next_id(state.database.pool()).await?;
    // Runner pinning: an unpinned job is assigned here instead of
    // falling back to whoever happens to lead later.
    if job.runner_node_id.is_empty() {
        job.runner_node_id = state.cluster.node_id().to_string();
    }
    state
        .cluster
        .propose(Proposal::BackupJobCreate { job: job.clone() })
        .await?;
    Ok(ok(job).into_response())
}

async fn update_backup_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(mut job): Json<BackupJob>,
) -> ApiResult<Response> {
    job.id = id;
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::PUT,
        &format!("/api/cluster/backups/jobs/{}", id),
        Some(&job),
    )
    .await?
    {
        return Ok(resp);
    }

    if db::backup_jobs::get(state.database.pool(), id).await?.is_none() {
        return Err(ApiError(Error::not_found(
            "backup_job_not_found",
            format!("backup job {}", id),
        )));
    }
    state
        .cluster
        .propose(Proposal::BackupJobUpdate { job: job.clone() })
        .await?;
    Ok(ok(job).into_response())
}

async fn delete_backup_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward::<()>(
        &state,
        reqwest::Method::DELETE,
        &format!("/api/cluster/backups/jobs/{}", id),
        None,
    )
    .await?
    {
        return Ok(resp);
    }
    state
        .cluster
        .propose(Proposal::BackupJobDelete { id })
        .await?;
    Ok(ok(()).into_response())
}

/// Route a job-scoped call to its runner: pinned runner first, leader
/// for legacy unpinned jobs.
async fn route_to_runner(
    state: &AppState,
    job: &BackupJob,
    path: &str,
) -> ApiResult<Option<Response>> {
    if state.router.should_forward(&job.runner_node_id) {
        let resp = state
            .router
            .forward_to_node(&job.runner_node_id, reqwest::Method::POST, path, None)
            .await?;
        return Ok(Some(forwarded(resp)));
    }
    if job.runner_node_id.is_empty() && !state.cluster.is_leader().await {
        let resp = state
            .router
            .forward_to_leader(reqwest::Method::POST, path, "", None)
            .await?;
        return Ok(Some(forwarded(resp)));
    }
    Ok(None)
}

async fn run_backup_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let job = state.backups.job(id).await?;
    if let Some(resp) =
        route_to_runner(&state, &job, &format!("/api/cluster/backups/jobs/{}/run", id)).await?
    {
        return Ok(resp);
    }
    let event_id = state.backups.run_job(id).await?;
    Ok(ok(serde_json::json!({ "event_id": event_id })).into_response())
}

async fn restore_backup_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let job = state.backups.job(id).await?;
    if let Some(resp) = route_to_runner(
        &state,
        &job,
        &format!("/api/cluster/backups/jobs/{}/restore", id),
    )
    .await?
    {
        return Ok(resp);
    }
    let event_id = state.backups.restore_job(id).await?;
    Ok(ok(serde_json::json!({ "event_id": event_id })).into_response())
}

async fn list_backup_job_snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.backups.job_snapshots(id).await?))
}

// ----- backup events -----

#[derive(serde::Deserialize)]
struct EventListQuery {
    limit: Option<u32>,
    #[serde(rename = "jobId")]
    job_id: Option<i64>,
}

async fn list_backup_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state
        .events
        .list_backup_events(query.limit.unwrap_or(100), query.job_id)
        .await?))
}

async fn list_backup_events_remote(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let page = params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let size = params.get("size").and_then(|v| v.parse().ok()).unwrap_or(50);
    let sort_field = params
        .get("sort[0][field]")
        .map(String::as_str)
        .unwrap_or("id");
    let sort_dir = params
        .get("sort[0][dir]")
        .map(String::as_str)
        .unwrap_or("desc");
    let job_id = params.get("jobId").and_then(|v| v.parse().ok());
    let search = params.get("search").map(String::as_str).unwrap_or("");

    Ok(ok(state
        .events
        .list_backup_events_paginated(page, size, sort_field, sort_dir, job_id, search)
        .await?))
}

async fn get_backup_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let event = state.events.get_backup_event(id).await?.ok_or_else(|| {
        Error::not_found("backup_event_not_found", format!("backup event {}", id))
    })?;
    Ok(ok(event))
}

async fn get_backup_event_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let (event, progress) = state
        .events
        .backup_event_progress(id)
        .await?
        .ok_or_else(|| {
            Error::not_found("backup_event_not_found", format!("backup event {}", id))
        })?;
    Ok(ok(serde_json::json!({ "event": event, "progress": progress })))
}

// ----- replication policies -----

async fn list_replication_policies(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(db::replication_policies::list(state.database.pool()).await?))
}

async fn create_replication_policy(
    State(state): State<Arc<AppState>>,
    Json(mut policy): Json<ReplicationPolicy>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::POST,
        "/api/cluster/replication/policies",
        Some(&policy),
    )
    .await?
    {
        return Ok(resp);
    }

    policy.id = db::replication_policies::next_id(state.database.pool()).await?;
    state
        .cluster
        .propose(Proposal::ReplicationPolicyCreate {
            policy: policy.clone(),
        })
        .await?;
    // Activation pins execution to the source node.
    state
        .cluster
        .propose(Proposal::ReplicationPolicyActivate {
            policy_id: policy.id,
            active_node_id: policy.source_node_id.clone(),
        })
        .await?;
    policy.active_node_id = Some(policy.source_node_id.clone());
    Ok(ok(policy).into_response())
}

async fn update_replication_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(mut policy): Json<ReplicationPolicy>,
) -> ApiResult<Response> {
    policy.id = id;
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::PUT,
        &format!("/api/cluster/replication/policies/{}", id),
        Some(&policy),
    )
    .await?
    {
        return Ok(resp);
    }

    if db::replication_policies::get(state.database.pool(), id)
        .await?
        .is_none()
    {
        return Err(ApiError(Error::not_found(
            "replication_policy_not_found",
            format!("replication policy {}", id),
        )));
    }
    state
        .cluster
        .propose(Proposal::ReplicationPolicyUpdate {
            policy: policy.clone(),
        })
        .await?;
    Ok(ok(policy).into_response())
}

async fn delete_replication_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward::<()>(
        &state,
        reqwest::Method::DELETE,
        &format!("/api/cluster/replication/policies/{}", id),
        None,
    )
    .await?
    {
        return Ok(resp);
    }
    state
        .cluster
        .propose(Proposal::ReplicationPolicyDelete { id })
        .await?;
    Ok(ok(()).into_response())
}

async fn run_replication_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let policy = db::replication_policies::get(state.database.pool(), id)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "replication_policy_not_found",
                format!("replication policy {}", id),
            )
        })?;

    let active = policy.active_node_id.clone().unwrap_or_default();
    if active.is_empty() {
        // Never activated: the leader activates, then the source runs.
        if let Some(resp) = leader_or_forward::<()>(
            &state,
            reqwest::Method::POST,
            &format!("/api/cluster/replication/policies/{}/run", id),
            None,
        )
        .await?
        {
            return Ok(resp);
        }
        state
            .cluster
            .propose(Proposal::ReplicationPolicyActivate {
                policy_id: id,
                active_node_id: policy.source_node_id.clone(),
            })
            .await?;
        if state.router.should_forward(&policy.source_node_id) {
            let resp = state
                .router
                .forward_to_node(
                    &policy.source_node_id,
                    reqwest::Method::POST,
                    &format!("/api/cluster/replication/policies/{}/run", id),
                    None,
                )
                .await?;
            return Ok(forwarded(resp));
        }
    } else if state.router.should_forward(&active) {
        let resp = state
            .router
            .forward_to_node(
                &active,
                reqwest::Method::POST,
                &format!("/api/cluster/replication/policies/{}/run", id),
                None,
            )
            .await?;
        return Ok(forwarded(resp));
    }

    state.replication.run_policy(id).await?;
    Ok(ok(serde_json::json!({ "policy_id": id, "status": "started" })).into_response())
}

#[derive(serde::Deserialize)]
struct ActivateBody {
    policy_id: i64,
}

async fn activate_replication_policy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActivateBody>,
) -> ApiResult<Response> {
    if let Some(resp) = leader_or_forward(
        &state,
        reqwest::Method::POST,
        "/api/cluster/replication/policies/activate",
        Some(&serde_json::json!({ "policy_id": body.policy_id })),
    )
    .await?
    {
        return Ok(resp);
    }

    let policy = db::replication_policies::get(state.database.pool(), body.policy_id)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "replication_policy_not_found",
                format!("replication policy {}", body.policy_id),
            )
        })?;
    state
        .cluster
        .propose(Proposal::ReplicationPolicyActivate {
            policy_id: policy.id,
            active_node_id: policy.source_node_id.clone(),
        })
        .await?;
    Ok(ok(()).into_response())
}

// ----- replication events -----

#[derive(serde::Deserialize)]
struct ReplicationEventQuery {
    limit: Option<u32>,
    #[serde(rename = "policyId")]
    policy_id: Option<i64>,
}

async fn list_replication_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReplicationEventQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state
        .events
        .list_replication_events(query.limit.unwrap_or(100), query.policy_id)
        .await?))
}

async fn get_replication_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let event = state
        .events
        .get_replication_event(id)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "replication_event_not_found",
                format!("replication event {}", id),
            )
        })?;
    Ok(ok(event))
}

async fn get_replication_event_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let (event, progress) = state
        .events
        .replication_event_progress(id)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "replication_event_not_found",
                format!("replication event {}", id),
            )
        })?;
    Ok(ok(serde_json::json!({ "event": event, "progress": progress })))
}

// ----- ssh identities -----

async fn post_ssh_identity(
    State(state): State<Arc<AppState>>,
    Json(identity): Json<ClusterSshIdentity>,
) -> ApiResult<Response> {
    // Leader-only internal endpoint; followers do not relay.
    if !state.cluster.is_leader().await {
        return Err(ApiError(Error::NotLeader));
    }
    state
        .cluster
        .propose(Proposal::ClusterSshIdentityUpsert { identity })
        .await?;
    Ok(ok(()).into_response())
}

async fn post_ssh_reconcile(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let identities = state.cluster.ssh_identities().await?;
    let path = std::path::Path::new("/root/.ssh/authorized_keys");
    sylve_api::ssh::reconcile_authorized_keys(path, &identities).await?;
    Ok(ok(serde_json::json!({ "identities": identities.len() })))
}

// ----- guest start gate -----

async fn guest_start_check(
    State(state): State<Arc<AppState>>,
    Path((kind, rid)): Path<(String, u32)>,
) -> ApiResult<impl IntoResponse> {
    let guest_type: GuestType = kind.parse()?;
    state.leases.check_guest_start(guest_type, rid).await?;
    Ok(ok(serde_json::json!({ "allowed": true })))
}

// ----- vm snapshots -----

async fn list_vm_snapshots(
    State(state): State<Arc<AppState>>,
    Path(rid): Path<u32>,
) -> ApiResult<impl IntoResponse> {
    let vm = db::guests::get_vm(state.database.pool(), rid)
        .await?
        .ok_or_else(|| Error::not_found("vm_not_found", format!("vm {}", rid)))?;
    Ok(ok(state.snapshots.list_snapshots(vm.id).await?))
}

#[derive(serde::Deserialize)]
struct CreateSnapshotBody {
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_vm_snapshot(
    State(state): State<Arc<AppState>>,
    Path(rid): Path<u32>,
    Json(body): Json<CreateSnapshotBody>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .snapshots
        .create_snapshot(rid, &body.name, &body.description)
        .await?;
    Ok(ok(record))
}

#[derive(serde::Deserialize)]
struct RollbackBody {
    #[serde(default)]
    destroy_more_recent: bool,
}

async fn rollback_vm_snapshot(
    State(state): State<Arc<AppState>>,
    Path((_rid, snapshot_id)): Path<(u32, i64)>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<impl IntoResponse> {
    let warnings = state
        .snapshots
        .rollback(snapshot_id, body.destroy_more_recent)
        .await?;
    Ok(ok(serde_json::json!({ "warnings": warnings })))
}

async fn delete_vm_snapshot(
    State(state): State<Arc<AppState>>,
    Path((_rid, snapshot_id)): Path<(u32, i64)>,
) -> ApiResult<impl IntoResponse> {
    state.snapshots.delete_snapshot(snapshot_id).await?;
    Ok(ok(()))
}

// ----- periodic snapshots -----

async fn list_periodic_snapshots(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.periodic.list_jobs().await?))
}

async fn create_periodic_snapshot(
    State(state): State<Arc<AppState>>,
    Json(mut job): Json<PeriodicSnapshotJob>,
) -> ApiResult<impl IntoResponse> {
    // Key the job by dataset GUID so renames do not orphan it.
    if job.guid.is_empty() {
        let datasets = state.zfs.list_datasets(Some(job.dataset.as_str())).await?;
        let dataset = datasets
            .into_iter()
            .find(|d| d.name == job.dataset)
            .ok_or_else(|| {
                Error::not_found("dataset_not_found", format!("dataset {}", job.dataset))
            })?;
        job.guid = dataset.guid;
    }
    Ok(ok(state.periodic.create_job(job).await?))
}

async fn delete_periodic_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.periodic.delete_job(id).await?;
    Ok(ok(()))
}

// ----- pools -----

async fn list_zfs_pools(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.zfs.list_pools().await?))
}

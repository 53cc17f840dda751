//! Replication engine.
//!
//! Executes incremental dataset replication between cluster peers. One
//! run: activation check, lease acquisition, common-snapshot discovery,
//! recursive snapshot, `zfs send | ssh peer zfs recv` per root dataset
//! with progress accounting, keep-last retention on both ends, lease
//! release. At most one run per policy; runs across policies are
//! parallel, bounded by a worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sylve_common::model::{EventStatus, GuestType, NodeRecord, ReplicationPolicy};
use sylve_common::{Error, Result};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::cluster::lease::{ttl_for_policy, LeaseManager};
use crate::cluster::ClusterService;
use crate::db::{self, Database};
use crate::events::EventStore;
use crate::ssh::SshEndpoint;
use crate::zfs::send::{send_to_endpoint, SendOptions};
use crate::zfs::{common_base_snapshot, parse_snapshot_list, SnapshotInfo, ZfsManager, REPL_SNAPSHOT_PREFIX};

const SEND_RETRIES: u32 = 3;
const SCHEDULE_TICK: Duration = Duration::from_secs(15);

/// New run snapshot name shared by every root dataset of the run.
fn run_snapshot_name() -> String {
    format!("{}{}", REPL_SNAPSHOT_PREFIX, Utc::now().timestamp_millis())
}

/// Replication snapshots beyond `keep_last`, oldest first.
pub(crate) fn prune_candidates(snapshots: &[SnapshotInfo], keep_last: u32) -> Vec<String> {
    let mut repl: Vec<&SnapshotInfo> = snapshots
        .iter()
        .filter(|s| s.name.starts_with(REPL_SNAPSHOT_PREFIX))
        .collect();
    repl.sort_by_key(|s| std::cmp::Reverse((s.creation, s.name.clone())));
    repl.iter()
        .skip(keep_last.max(1) as usize)
        .map(|s| s.full_name.clone())
        .collect()
}

/// Retry transient failures with exponential backoff; fail fast on
/// everything else.
async fn with_retries<T, F, Fut>(mut op: F, attempts: u32) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut tries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries + 1 < attempts => {
                tries += 1;
                warn!("transient failure (attempt {}): {}", tries, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct ReplicationEngine {
    db: Arc<Database>,
    zfs: Arc<ZfsManager>,
    events: Arc<EventStore>,
    leases: Arc<LeaseManager>,
    cluster: Arc<ClusterService>,
    cluster_ssh_key: String,
    connect_timeout_secs: u64,
    running: Mutex<HashSet<i64>>,
    workers: Arc<Semaphore>,
}

impl ReplicationEngine {
    pub fn new(
        db: Arc<Database>,
        zfs: Arc<ZfsManager>,
        events: Arc<EventStore>,
        leases: Arc<LeaseManager>,
        cluster: Arc<ClusterService>,
        cluster_ssh_key: String,
        connect_timeout_secs: u64,
        worker_pool: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            zfs,
            events,
            leases,
            cluster,
            cluster_ssh_key,
            connect_timeout_secs,
            running: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(worker_pool.max(1))),
        })
    }

    /// The at-most-one-run-per-policy TryLock.
    async fn try_begin(&self, policy_id: i64) -> Result<()> {
        let mut running = self.running.lock().await;
        if !running.insert(policy_id) {
            return Err(Error::conflict(
                "already_running",
                format!("replication policy {} already has a run in flight", policy_id),
            ));
        }
        Ok(())
    }

    async fn end(&self, policy_id: i64) {
        self.running.lock().await.remove(&policy_id);
    }

    /// Enqueue a run for a policy. Returns once the run is admitted; the
    /// transfer itself happens on a worker.
    pub async fn run_policy(self: &Arc<Self>, policy_id: i64) -> Result<()> {
        let policy = db::replication_policies::get(self.db.pool(), policy_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "replication_policy_not_found",
                    format!("replication policy {}", policy_id),
                )
            })?;

        if !policy.enabled {
            return Err(Error::validation(format!(
                "replication policy {} is disabled",
                policy_id
            )));
        }

        // Only the activated node runs; everybody else refuses.
        let active = policy.active_node_id.clone().unwrap_or_default();
        if active != self.cluster.node_id() {
            return Err(Error::conflict(
                "replication_must_run_on_active_node",
                format!(
                    "policy {} is active on node {}, not {}",
                    policy_id,
                    active,
                    self.cluster.node_id()
                ),
            ));
        }

        self.try_begin(policy_id).await?;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let permit = engine.workers.clone().acquire_owned().await;
            if permit.is_err() {
                engine.end(policy_id).await;
                return;
            }
            engine.execute_run(policy).await;
            engine.end(policy_id).await;
        });

        Ok(())
    }

    /// One full run across all destination nodes of the policy.
    async fn execute_run(self: &Arc<Self>, policy: ReplicationPolicy) {
        info!("Starting replication run for policy {}", policy.id);

        let lease = match self.leases.acquire(policy.id, ttl_for_policy(&policy)).await {
            Ok(lease) => lease,
            Err(e) => {
                // No lease, no run: record the failure per destination.
                for dest in &policy.destination_node_ids {
                    if let Ok(event) = self
                        .events
                        .start_replication_event(
                            policy.id,
                            policy.guest_type,
                            policy.guest_id,
                            &policy.source_node_id,
                            dest,
                        )
                        .await
                    {
                        let _ = self
                            .events
                            .finish_replication_event(
                                event.id,
                                EventStatus::Failed,
                                "",
                                &format!("lease_not_acquired: {}", e),
                                "",
                            )
                            .await;
                    }
                }
                return;
            }
        };

        // Keep the lease alive while transfers run; renewals stop when
        // the run ends and the lease is released.
        let renewer = {
            let leases = self.leases.clone();
            let lease = lease.clone();
            let ttl = ttl_for_policy(&policy);
            let period = std::time::Duration::from_secs((ttl.num_seconds() as u64 / 2).max(1));
            tokio::spawn(async move {
                let mut current = lease;
                loop {
                    tokio::time::sleep(period).await;
                    match leases.renew(&current, ttl).await {
                        Ok(renewed) => current = renewed,
                        Err(e) => {
                            warn!(
                                "Failed to renew lease for policy {}: {}",
                                current.policy_id, e
                            );
                            break;
                        }
                    }
                }
            })
        };

        for dest_id in policy.destination_node_ids.clone() {
            let event = match self
                .events
                .start_replication_event(
                    policy.id,
                    policy.guest_type,
                    policy.guest_id,
                    &policy.source_node_id,
                    &dest_id,
                )
                .await
            {
                Ok(event) => event,
                Err(e) => {
                    error!("Failed to open replication event: {}", e);
                    continue;
                }
            };

            // The transfer runs on its own task so a panic inside the
            // pipeline is captured into the event instead of crossing
            // worker boundaries.
            let engine = Arc::clone(self);
            let run_policy = policy.clone();
            let run_dest = dest_id.clone();
            let event_id = event.id;
            let outcome = tokio::spawn(async move {
                engine.replicate_to(&run_policy, &run_dest, event_id).await
            })
            .await;

            match outcome {
                Ok(Ok(last_snapshot)) => {
                    let _ = self
                        .events
                        .finish_replication_event(
                            event_id,
                            EventStatus::Success,
                            "replication completed",
                            "",
                            &last_snapshot,
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    warn!("Replication to {} failed: {}", dest_id, e);
                    let _ = self
                        .events
                        .finish_replication_event(
                            event_id,
                            EventStatus::Failed,
                            "",
                            &e.to_string(),
                            "",
                        )
                        .await;
                }
                Err(join) => {
                    let detail = if join.is_panic() {
                        "replication worker panicked".to_string()
                    } else {
                        join.to_string()
                    };
                    error!("Replication worker died: {}", detail);
                    let _ = self
                        .events
                        .finish_replication_event(
                            event_id,
                            EventStatus::Failed,
                            "",
                            &detail,
                            "",
                        )
                        .await;
                }
            }
        }

        renewer.abort();
        if let Err(e) = self.leases.release(&lease).await {
            warn!("Failed to release lease for policy {}: {}", policy.id, e);
        }
    }

    fn root_datasets_for(
        &self,
        policy: &ReplicationPolicy,
        vm: Option<sylve_common::guest::Vm>,
        jail: Option<sylve_common::guest::Jail>,
    ) -> Result<Vec<String>> {
        let roots = match policy.guest_type {
            GuestType::Vm => vm
                .ok_or_else(|| {
                    Error::not_found("vm_not_found", format!("vm {}", policy.guest_id))
                })?
                .root_datasets(),
            GuestType::Jail => {
                let jail = jail.ok_or_else(|| {
                    Error::not_found("jail_not_found", format!("jail {}", policy.guest_id))
                })?;
                vec![jail.root_dataset]
            }
        };
        if roots.is_empty() {
            return Err(Error::validation(format!(
                "{} {} has no ZFS root datasets",
                policy.guest_type, policy.guest_id
            )));
        }
        Ok(roots)
    }

    async fn destination_endpoint(&self, dest_node_id: &str) -> Result<(NodeRecord, SshEndpoint)> {
        let node = db::nodes::get(self.db.pool(), dest_node_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("node_not_found", format!("node {}", dest_node_id))
            })?;
        let host = node
            .api_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| node.api_addr.clone());
        let endpoint =
            SshEndpoint::for_peer(host, self.cluster_ssh_key.clone(), self.connect_timeout_secs);
        Ok((node, endpoint))
    }

    async fn remote_snapshots(
        &self,
        endpoint: &SshEndpoint,
        dataset: &str,
    ) -> Result<Vec<SnapshotInfo>> {
        let cmd = format!(
            "zfs list -H -p -t snapshot -o name,guid,used,creation {}",
            dataset
        );
        match endpoint.run(&cmd).await {
            Ok(out) => Ok(parse_snapshot_list(&out)),
            // A missing destination dataset means an initial full send.
            Err(e) if e.to_string().contains("does not exist") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Replicate every root dataset of the guest to one destination node.
    /// Returns the snapshot name produced by this run.
    async fn replicate_to(
        self: &Arc<Self>,
        policy: &ReplicationPolicy,
        dest_node_id: &str,
        event_id: i64,
    ) -> Result<String> {
        let vm = db::guests::get_vm(self.db.pool(), policy.guest_id).await?;
        let jail = db::guests::get_jail(self.db.pool(), policy.guest_id).await?;
        let roots = self.root_datasets_for(policy, vm, jail)?;

        let (_, endpoint) = self.destination_endpoint(dest_node_id).await?;

        let snapshot_name = run_snapshot_name();
        let mut plans = Vec::new();
        let mut total_bytes: u64 = 0;

        for root in &roots {
            let local: Vec<SnapshotInfo> = self
                .zfs
                .list_snapshots(root, false)
                .await?
                .into_iter()
                .filter(|s| s.dataset == *root)
                .collect();
            let remote = self.remote_snapshots(&endpoint, root).await?;
            let base = common_base_snapshot(&local, &remote);

            let full = format!("{}@{}", root, snapshot_name);
            self.zfs.snapshot(&full, true).await?;

            let options = SendOptions {
                snapshot: full.clone(),
                incremental_base: base.as_ref().map(|b| format!("{}@{}", root, b)),
                replicate: true,
                with_intermediates: false,
            };
            let size = self
                .zfs
                .send_size(&full, options.incremental_base.as_deref(), true)
                .await?;
            total_bytes += size;
            plans.push((root.clone(), options));
        }

        self.events
            .update_replication_progress(event_id, 0, Some(total_bytes as i64))
            .await?;

        let mut offset: u64 = 0;
        for (root, options) in plans {
            let (tx, mut rx) = mpsc::channel::<u64>(8);
            let events = self.events.clone();
            let progress_offset = offset;
            let total = total_bytes as i64;
            let drain = tokio::spawn(async move {
                while let Some(moved) = rx.recv().await {
                    let _ = events
                        .update_replication_progress(
                            event_id,
                            (progress_offset + moved) as i64,
                            Some(total),
                        )
                        .await;
                }
            });

            let report = with_retries(
                || {
                    send_to_endpoint(
                        &options,
                        &endpoint,
                        &root,
                        true,
                        Some(tx.clone()),
                        None,
                    )
                },
                SEND_RETRIES,
            )
            .await;
            drop(tx);
            let _ = drain.await;

            let report = report?;
            offset += report.moved_bytes;

            self.prune_both_ends(&endpoint, &root, policy.keep_last).await;
        }

        self.events
            .update_replication_progress(event_id, total_bytes as i64, Some(total_bytes as i64))
            .await?;

        Ok(snapshot_name)
    }

    /// Keep at most `keep_last` replication snapshots on both ends.
    /// Pruning failures are warnings; the replication itself succeeded.
    async fn prune_both_ends(&self, endpoint: &SshEndpoint, root: &str, keep_last: u32) {
        match self.zfs.list_snapshots(root, false).await {
            Ok(local) => {
                let local: Vec<SnapshotInfo> =
                    local.into_iter().filter(|s| s.dataset == *root).collect();
                for full in prune_candidates(&local, keep_last) {
                    if let Err(e) = self.zfs.destroy(&full, true).await {
                        warn!("Failed to prune local snapshot {}: {}", full, e);
                    }
                }
            }
            Err(e) => warn!("Failed to list local snapshots of {}: {}", root, e),
        }

        match self.remote_snapshots(endpoint, root).await {
            Ok(remote) => {
                for full in prune_candidates(&remote, keep_last) {
                    if let Err(e) = endpoint.run(&format!("zfs destroy -r {}", full)).await {
                        warn!("Failed to prune remote snapshot {}: {}", full, e);
                    }
                }
            }
            Err(e) => warn!("Failed to list remote snapshots of {}: {}", root, e),
        }
    }

    /// Scheduler loop: fires policies whose frequency elapsed since their
    /// last run. Contention with manual runs resolves through the
    /// per-policy TryLock.
    pub fn start_scheduler(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("Replication dispatcher started");
            let mut ticker = tokio::time::interval(SCHEDULE_TICK);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.schedule_due_policies().await {
                    error!("Replication scheduling failed: {}", e);
                }
            }
        });
    }

    async fn schedule_due_policies(self: &Arc<Self>) -> Result<()> {
        let policies = db::replication_policies::list(self.db.pool()).await?;
        let now = Utc::now();

        for policy in policies {
            if !policy.enabled {
                continue;
            }
            if policy.active_node_id.as_deref() != Some(self.cluster.node_id()) {
                continue;
            }
            let due = match policy.frequency_seconds {
                Some(frequency) if frequency > 0 => {
                    let last = self
                        .events
                        .list_replication_events(1, Some(policy.id))
                        .await?
                        .into_iter()
                        .next()
                        .map(|e| e.started_at);
                    match last {
                        Some(last) => {
                            now - last >= chrono::Duration::seconds(frequency as i64)
                        }
                        None => true,
                    }
                }
                _ => {
                    if policy.cron_expr.is_empty() {
                        continue;
                    }
                    let last = self
                        .events
                        .list_replication_events(1, Some(policy.id))
                        .await?
                        .into_iter()
                        .next()
                        .map(|e| e.started_at);
                    match crate::periodic::latest_cron_boundary(
                        &policy.cron_expr,
                        now.with_timezone(&chrono::Local),
                    )? {
                        Some(boundary) => last
                            .map(|l| l < boundary.with_timezone(&Utc))
                            .unwrap_or(true),
                        None => false,
                    }
                }
            };

            if due {
                match self.run_policy(policy.id).await {
                    Ok(()) => {}
                    Err(e) if e.code() == "already_running" => {}
                    Err(e) => warn!("Scheduled run of policy {} failed: {}", policy.id, e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SylveConfig;

    fn snap(dataset: &str, name: &str, creation: i64) -> SnapshotInfo {
        SnapshotInfo {
            full_name: format!("{}@{}", dataset, name),
            dataset: dataset.to_string(),
            name: name.to_string(),
            guid: String::new(),
            used: 0,
            creation,
        }
    }

    #[test]
    fn test_prune_candidates_keeps_newest() {
        let snapshots = vec![
            snap("tank/ds", "sylve_repl_100", 100),
            snap("tank/ds", "sylve_repl_300", 300),
            snap("tank/ds", "sylve_repl_200", 200),
            snap("tank/ds", "manual", 400),
        ];

        let pruned = prune_candidates(&snapshots, 2);
        assert_eq!(pruned, vec!["tank/ds@sylve_repl_100".to_string()]);

        // Manual snapshots are never pruned
        let pruned = prune_candidates(&snapshots, 1);
        assert_eq!(pruned.len(), 2);
        assert!(!pruned.iter().any(|p| p.contains("manual")));

        // keep_last floor of 1: a zero config still keeps the newest
        let pruned = prune_candidates(&snapshots, 0);
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_run_snapshot_name_prefix() {
        let name = run_snapshot_name();
        assert!(name.starts_with(REPL_SNAPSHOT_PREFIX));
        assert!(name[REPL_SNAPSHOT_PREFIX.len()..].parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_with_retries_only_retries_transient() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

        // Fatal errors fail on the first attempt
        let counter = attempts.clone();
        let result: Result<()> = with_retries(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(Error::fatal("permission denied"))
                }
            },
            3,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Transient errors retry until the budget runs out
        attempts.store(0, std::sync::atomic::Ordering::SeqCst);
        let counter = attempts.clone();
        let result: Result<()> = with_retries(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(Error::transient("connection reset"))
                }
            },
            3,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        // A transient failure that recovers succeeds
        attempts.store(0, std::sync::atomic::Ordering::SeqCst);
        let counter = attempts.clone();
        let result = with_retries(
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(Error::transient("timed out"))
                    } else {
                        Ok(42)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    async fn engine() -> Arc<ReplicationEngine> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let cluster = ClusterService::bootstrap(db.clone(), &SylveConfig::default())
            .await
            .unwrap();
        let events = Arc::new(EventStore::new(db.clone()));
        let leases = Arc::new(LeaseManager::new(cluster.clone()));
        ReplicationEngine::new(
            db,
            Arc::new(ZfsManager::new()),
            events,
            leases,
            cluster,
            "/tmp/key".to_string(),
            30,
            4,
        )
    }

    #[tokio::test]
    async fn test_try_begin_enforces_single_run() {
        let engine = engine().await;

        engine.try_begin(7).await.unwrap();
        let err = engine.try_begin(7).await.unwrap_err();
        assert_eq!(err.code(), "already_running");

        // Other policies run in parallel
        engine.try_begin(8).await.unwrap();

        engine.end(7).await;
        engine.try_begin(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_policy_requires_active_node() {
        let engine = engine().await;
        let pool = engine.db.pool();

        let policy = ReplicationPolicy {
            id: 1,
            name: "p".to_string(),
            guest_type: GuestType::Vm,
            guest_id: 100,
            source_node_id: "other".to_string(),
            active_node_id: Some("other".to_string()),
            destination_node_ids: vec!["dst".to_string()],
            mode: sylve_common::model::ReplicationMode::Push,
            cron_expr: String::new(),
            frequency_seconds: Some(300),
            keep_last: 2,
            enabled: true,
        };
        db::replication_policies::upsert(pool, &policy).await.unwrap();

        let err = engine.run_policy(1).await.unwrap_err();
        assert_eq!(err.code(), "replication_must_run_on_active_node");

        // Disabled policies refuse outright
        let disabled = ReplicationPolicy {
            enabled: false,
            active_node_id: Some(engine.cluster.node_id().to_string()),
            ..policy
        };
        db::replication_policies::upsert(pool, &disabled).await.unwrap();
        let err = engine.run_policy(1).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        // Unknown policy
        let err = engine.run_policy(99).await.unwrap_err();
        assert_eq!(err.code(), "replication_policy_not_found");
    }
}

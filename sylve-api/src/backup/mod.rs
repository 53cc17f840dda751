//! Backup engine.
//!
//! Pushes ZFS-snapshot backups of datasets and jails to SSH-accessible
//! backup targets. Destination layout is
//! `<backupRoot>/<sourceHost>/<guestKind>/<guestId><destSuffix>`; jail
//! mode optionally stops the jail and writes a `.sylve/jail.json`
//! side-car into the jail root before snapshotting. Prune order after a
//! successful send: remote first, then local.

pub mod restore;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sylve_common::model::{BackupJob, BackupMode, BackupTarget, EventKind, EventStatus, GuestType};
use sylve_common::{Error, Result};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::cluster::ClusterService;
use crate::db::{self, Database};
use crate::driver::{stop_and_wait, GuestDriver};
use crate::events::EventStore;
use crate::ssh::{SecretStore, SshEndpoint};
use crate::zfs::send::{send_to_endpoint, SendOptions};
use crate::zfs::{common_base_snapshot, parse_snapshot_list, SnapshotInfo, ZfsManager, REPL_SNAPSHOT_PREFIX};

const SEND_RETRIES: u32 = 3;
const SCHEDULE_TICK: Duration = Duration::from_secs(15);

/// Destination dataset of a job on its target:
/// `<backupRoot>/<sourceHost>/<guestKind>/<guestId><destSuffix>`.
/// Dataset-mode jobs file under `datasets/<jobId>`; jail jobs under
/// `jails/<rid>` taken from the jail root dataset's last component.
pub fn destination_dataset(job: &BackupJob, backup_root: &str, source_host: &str) -> String {
    let (kind_dir, guest_id) = match job.mode {
        BackupMode::Dataset => ("datasets".to_string(), job.id.to_string()),
        BackupMode::Jail => {
            let rid = job
                .jail_root_dataset
                .rsplit('/')
                .next()
                .unwrap_or("0")
                .to_string();
            ("jails".to_string(), rid)
        }
    };
    format!(
        "{}/{}/{}/{}{}",
        backup_root, source_host, kind_dir, guest_id, job.dest_suffix
    )
}

/// Parent of a dataset path, for `zfs create -p` before an initial recv.
fn parent_dataset(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

fn run_snapshot_name() -> String {
    format!("{}{}", REPL_SNAPSHOT_PREFIX, Utc::now().timestamp_millis())
}

/// Replication-prefixed snapshots beyond `keep_last`, oldest first.
fn prune_candidates(snapshots: &[SnapshotInfo], keep_last: u32) -> Vec<String> {
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

pub struct BackupEngine {
    db: Arc<Database>,
    zfs: Arc<ZfsManager>,
    events: Arc<EventStore>,
    cluster: Arc<ClusterService>,
    driver: Arc<dyn GuestDriver>,
    secrets: SecretStore,
    connect_timeout_secs: u64,
    shutdown_wait: Duration,
    running: Mutex<HashSet<i64>>,
    workers: Arc<Semaphore>,
}

impl BackupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        zfs: Arc<ZfsManager>,
        events: Arc<EventStore>,
        cluster: Arc<ClusterService>,
        driver: Arc<dyn GuestDriver>,
        secrets: SecretStore,
        connect_timeout_secs: u64,
        shutdown_wait_secs: u64,
        worker_pool: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            zfs,
            events,
            cluster,
            driver,
            secrets,
            connect_timeout_secs,
            shutdown_wait: Duration::from_secs(shutdown_wait_secs),
            running: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(worker_pool.max(1))),
        })
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    async fn try_begin(&self, job_id: i64) -> Result<()> {
        let mut running = self.running.lock().await;
        if !running.insert(job_id) {
            return Err(Error::conflict(
                "already_running",
                format!("backup job {} already has a run in flight", job_id),
            ));
        }
        Ok(())
    }

    async fn end(&self, job_id: i64) {
        self.running.lock().await.remove(&job_id);
    }

    pub async fn target(&self, target_id: i64) -> Result<BackupTarget> {
        db::backup_targets::get(self.db.pool(), target_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "backup_target_not_found",
                    format!("backup target {}", target_id),
                )
            })
    }

    pub async fn job(&self, job_id: i64) -> Result<BackupJob> {
        db::backup_jobs::get(self.db.pool(), job_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("backup_job_not_found", format!("backup job {}", job_id))
            })
    }

    /// Endpoint for a target with its key material guaranteed on disk.
    pub async fn endpoint_for(&self, target: &BackupTarget) -> Result<SshEndpoint> {
        let key_path = self.secrets.ensure_target_key(target).await?;
        let mut endpoint = SshEndpoint::from_target(target, self.connect_timeout_secs);
        endpoint.key_path = key_path.to_string_lossy().to_string();
        Ok(endpoint)
    }

    /// Remove on-disk key material when a target is deleted.
    pub async fn scrub_target_secrets(&self, target: &BackupTarget) -> Result<()> {
        self.secrets.remove_key(target.id, &target.ssh_key_path).await
    }

    /// Dial the target, verify the backup root exists and is writable.
    pub async fn validate_target(&self, target: &BackupTarget) -> Result<()> {
        let endpoint = self.endpoint_for(target).await?;

        endpoint
            .run(&format!("zfs list -H -o name {}", target.backup_root))
            .await
            .map_err(|e| match e {
                Error::Transient(d) => Error::Transient(d),
                other => Error::validation(format!(
                    "backup root {} not usable: {}",
                    target.backup_root, other
                )),
            })?;

        // Writability probe: create and destroy a scratch child.
        let probe = format!(
            "{}/.sylve-validate-{}",
            target.backup_root,
            Utc::now().timestamp_millis()
        );
        endpoint
            .run(&format!("zfs create {}", probe))
            .await
            .map_err(|e| {
                Error::validation(format!(
                    "backup root {} is not writable: {}",
                    target.backup_root, e
                ))
            })?;
        if let Err(e) = endpoint.run(&format!("zfs destroy {}", probe)).await {
            warn!("Failed to remove validation probe {}: {}", probe, e);
        }

        info!("Validated backup target {} ({})", target.id, target.name);
        Ok(())
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
            Err(e) if e.to_string().contains("does not exist") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Snapshots a job has produced on its target, newest first.
    pub async fn job_snapshots(&self, job_id: i64) -> Result<Vec<SnapshotInfo>> {
        let job = self.job(job_id).await?;
        let target = self.target(job.target_id).await?;
        let endpoint = self.endpoint_for(&target).await?;
        let dest = destination_dataset(&job, &target.backup_root, self.cluster.hostname());

        let mut snapshots = self.remote_snapshots(&endpoint, &dest).await?;
        snapshots.sort_by_key(|s| std::cmp::Reverse(s.creation));
        Ok(snapshots)
    }

    /// Admit a run for a job on this node. The caller (handler layer)
    /// already routed to the runner node.
    pub async fn run_job(self: &Arc<Self>, job_id: i64) -> Result<i64> {
        let job = self.job(job_id).await?;
        if !job.enabled {
            return Err(Error::validation(format!("backup job {} is disabled", job_id)));
        }
        let target = self.target(job.target_id).await?;
        if !target.enabled {
            return Err(Error::validation(format!(
                "backup target {} is disabled",
                target.id
            )));
        }

        self.try_begin(job_id).await?;

        let event = match self
            .events
            .start_backup_event(Some(job_id), Some(target.id), EventKind::Backup)
            .await
        {
            Ok(event) => event,
            Err(e) => {
                self.end(job_id).await;
                return Err(e);
            }
        };
        let event_id = event.id;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let permit = engine.workers.clone().acquire_owned().await;
            if permit.is_err() {
                engine.end(job_id).await;
                return;
            }

            // Panics inside the pipeline are captured into the event.
            let worker = {
                let engine = Arc::clone(&engine);
                let job = job.clone();
                let target = target.clone();
                tokio::spawn(async move { engine.execute_backup(&job, &target, event_id).await })
            };

            match worker.await {
                Ok(Ok(snapshot)) => {
                    let _ = engine
                        .events
                        .finish_backup_event(
                            event_id,
                            EventStatus::Success,
                            "backup completed",
                            "",
                            &snapshot,
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    warn!("Backup job {} failed: {}", job_id, e);
                    let _ = engine
                        .events
                        .finish_backup_event(event_id, EventStatus::Failed, "", &e.to_string(), "")
                        .await;
                }
                Err(join) => {
                    let detail = if join.is_panic() {
                        "backup worker panicked".to_string()
                    } else {
                        join.to_string()
                    };
                    error!("Backup worker died: {}", detail);
                    let _ = engine
                        .events
                        .finish_backup_event(event_id, EventStatus::Failed, "", &detail, "")
                        .await;
                }
            }
            engine.end(job_id).await;
        });

        Ok(event_id)
    }

    /// One backup run. Returns the snapshot name it produced.
    async fn execute_backup(
        self: &Arc<Self>,
        job: &BackupJob,
        target: &BackupTarget,
        event_id: i64,
    ) -> Result<String> {
        let endpoint = self.endpoint_for(target).await?;
        let dest = destination_dataset(job, &target.backup_root, self.cluster.hostname());

        let (source, recursive) = match job.mode {
            BackupMode::Dataset => (job.source_dataset.clone(), false),
            BackupMode::Jail => (job.jail_root_dataset.clone(), true),
        };
        if source.is_empty() {
            return Err(Error::validation("backup job has no source dataset"));
        }

        // Jail preparation: optional stop, then the metadata side-car.
        let mut jail_was_running = false;
        if job.mode == BackupMode::Jail {
            let rid: u32 = job
                .jail_root_dataset
                .rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            if job.stop_before_backup {
                jail_was_running = stop_and_wait(
                    self.driver.as_ref(),
                    GuestType::Jail,
                    rid,
                    self.shutdown_wait,
                )
                .await?;
            }

            if let Some(jail) = db::guests::get_jail(self.db.pool(), rid).await? {
                if let Some(mountpoint) = self.zfs.mountpoint(&source).await? {
                    let dir = std::path::Path::new(&mountpoint).join(".sylve");
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(dir.join("jail.json"), serde_json::to_vec_pretty(&jail)?)
                        .await?;
                }
            }
        }

        // Base discovery against the destination, then the new snapshot.
        let local: Vec<SnapshotInfo> = self
            .zfs
            .list_snapshots(&source, false)
            .await?
            .into_iter()
            .filter(|s| s.dataset == source)
            .collect();
        let remote = self.remote_snapshots(&endpoint, &dest).await?;
        let base = common_base_snapshot(&local, &remote);

        let snapshot_name = run_snapshot_name();
        let full = format!("{}@{}", source, snapshot_name);
        self.zfs.snapshot(&full, recursive).await?;

        // The snapshot is the consistency point; the jail can come back
        // while the stream runs.
        if jail_was_running {
            let rid: u32 = job
                .jail_root_dataset
                .rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if let Err(e) = self.driver.start(GuestType::Jail, rid).await {
                warn!("Failed to restart jail {} after snapshot: {}", rid, e);
            }
        }

        if remote.is_empty() {
            if let Some(parent) = parent_dataset(&dest) {
                endpoint.run(&format!("zfs create -p {}", parent)).await?;
            }
        }

        let options = SendOptions {
            snapshot: full.clone(),
            incremental_base: base.as_ref().map(|b| format!("{}@{}", source, b)),
            replicate: true,
            with_intermediates: false,
        };
        let total = self
            .zfs
            .send_size(&full, options.incremental_base.as_deref(), true)
            .await?;
        self.events
            .update_backup_progress(event_id, 0, Some(total as i64))
            .await?;

        let (tx, mut rx) = mpsc::channel::<u64>(8);
        let events = self.events.clone();
        let drain = tokio::spawn(async move {
            while let Some(moved) = rx.recv().await {
                let _ = events
                    .update_backup_progress(event_id, moved as i64, Some(total as i64))
                    .await;
            }
        });

        let report = with_retries(
            || send_to_endpoint(&options, &endpoint, &dest, true, Some(tx.clone()), None),
            SEND_RETRIES,
        )
        .await;
        drop(tx);
        let _ = drain.await;
        report?;

        // Prune remote first, then local (mirrors the original order).
        if job.prune_target {
            match self.remote_snapshots(&endpoint, &dest).await {
                Ok(remote) => {
                    for prune in prune_candidates(&remote, job.prune_keep_last) {
                        if let Err(e) =
                            endpoint.run(&format!("zfs destroy -r {}", prune)).await
                        {
                            warn!("Failed to prune remote snapshot {}: {}", prune, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list remote snapshots for prune: {}", e),
            }
        }
        if job.prune_keep_last > 0 {
            match self.zfs.list_snapshots(&source, false).await {
                Ok(local) => {
                    let local: Vec<SnapshotInfo> =
                        local.into_iter().filter(|s| s.dataset == source).collect();
                    for prune in prune_candidates(&local, job.prune_keep_last) {
                        if let Err(e) = self.zfs.destroy(&prune, true).await {
                            warn!("Failed to prune local snapshot {}: {}", prune, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list local snapshots for prune: {}", e),
            }
        }

        Ok(snapshot_name)
    }

    /// Cron scheduler: fires enabled jobs pinned to this node whose cron
    /// boundary passed since their last run.
    pub fn start_scheduler(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("Backup dispatcher started");
            let mut ticker = tokio::time::interval(SCHEDULE_TICK);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.schedule_due_jobs().await {
                    error!("Backup scheduling failed: {}", e);
                }
            }
        });
    }

    /// Whether this node runs a job: pinned runner, or the leader for
    /// legacy jobs with an empty runner.
    async fn runs_here(&self, job: &BackupJob) -> bool {
        if job.runner_node_id.is_empty() {
            self.cluster.is_leader().await
        } else {
            job.runner_node_id == self.cluster.node_id()
        }
    }

    async fn schedule_due_jobs(self: &Arc<Self>) -> Result<()> {
        let jobs = db::backup_jobs::list(self.db.pool()).await?;
        let now = Utc::now();

        for job in jobs {
            if !job.enabled || job.cron_expr.is_empty() {
                continue;
            }
            if !self.runs_here(&job).await {
                continue;
            }

            let boundary = match crate::periodic::latest_cron_boundary(
                &job.cron_expr,
                now.with_timezone(&chrono::Local),
            ) {
                Ok(Some(boundary)) => boundary.with_timezone(&Utc),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Backup job {} has a bad cron expression: {}", job.id, e);
                    continue;
                }
            };

            let last = self
                .events
                .list_backup_events(1, Some(job.id))
                .await?
                .into_iter()
                .next()
                .map(|e| e.started_at);
            let due = last.map(|l| l < boundary).unwrap_or(true);

            if due {
                match self.run_job(job.id).await {
                    Ok(_) => {}
                    Err(e) if e.code() == "already_running" => {}
                    Err(e) => warn!("Scheduled run of backup job {} failed: {}", job.id, e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(mode: BackupMode) -> BackupJob {
        BackupJob {
            id: 7,
            target_id: 1,
            runner_node_id: "n1".to_string(),
            mode,
            source_dataset: "tank/ds1".to_string(),
            jail_root_dataset: "tank/sylve/jails/104".to_string(),
            dest_suffix: String::new(),
            prune_keep_last: 3,
            prune_target: true,
            stop_before_backup: false,
            cron_expr: String::new(),
            enabled: true,
        }
    }

    #[test]
    fn test_destination_dataset_layout() {
        let dataset_job = job(BackupMode::Dataset);
        assert_eq!(
            destination_dataset(&dataset_job, "bkp/data", "N1"),
            "bkp/data/N1/datasets/7"
        );

        let jail_job = job(BackupMode::Jail);
        assert_eq!(
            destination_dataset(&jail_job, "bkp/data", "N1"),
            "bkp/data/N1/jails/104"
        );

        let suffixed = BackupJob {
            dest_suffix: "_dr".to_string(),
            ..job(BackupMode::Dataset)
        };
        assert_eq!(
            destination_dataset(&suffixed, "bkp/data", "N1"),
            "bkp/data/N1/datasets/7_dr"
        );
    }

    #[test]
    fn test_parent_dataset() {
        assert_eq!(parent_dataset("bkp/data/N1/datasets/7"), Some("bkp/data/N1/datasets"));
        assert_eq!(parent_dataset("bkp"), None);
    }

    #[test]
    fn test_prune_candidates_ignores_foreign_snapshots() {
        let snap = |name: &str, creation: i64| SnapshotInfo {
            full_name: format!("bkp/data/N1/datasets/7@{}", name),
            dataset: "bkp/data/N1/datasets/7".to_string(),
            name: name.to_string(),
            guid: String::new(),
            used: 0,
            creation,
        };
        let snapshots = vec![
            snap("sylve_repl_1", 1),
            snap("sylve_repl_2", 2),
            snap("sylve_repl_3", 3),
            snap("pre-migration", 10),
        ];
        let pruned = prune_candidates(&snapshots, 2);
        assert_eq!(pruned, vec!["bkp/data/N1/datasets/7@sylve_repl_1".to_string()]);
    }

    async fn engine() -> Arc<BackupEngine> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let cluster = ClusterService::bootstrap(db.clone(), &crate::config::SylveConfig::default())
            .await
            .unwrap();
        let events = Arc::new(EventStore::new(db.clone()));
        let dir = tempfile::tempdir().unwrap();
        BackupEngine::new(
            db,
            Arc::new(ZfsManager::new()),
            events,
            cluster,
            Arc::new(crate::driver::testing::MockGuestDriver::default()),
            SecretStore::new(dir.into_path()),
            30,
            45,
            4,
        )
    }

    #[tokio::test]
    async fn test_try_begin_enforces_single_run() {
        let engine = engine().await;
        engine.try_begin(7).await.unwrap();
        let err = engine.try_begin(7).await.unwrap_err();
        assert_eq!(err.code(), "already_running");
        engine.try_begin(8).await.unwrap();
        engine.end(7).await;
        engine.try_begin(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_job_validates_job_and_target() {
        let engine = engine().await;
        let pool = engine.db.pool();

        let err = engine.run_job(7).await.unwrap_err();
        assert_eq!(err.code(), "backup_job_not_found");

        let target = BackupTarget {
            id: 1,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: false,
        };
        db::backup_targets::upsert(pool, &target).await.unwrap();
        let mut j = job(BackupMode::Dataset);
        j.enabled = false;
        db::backup_jobs::upsert(pool, &j).await.unwrap();

        // Disabled job refuses
        let err = engine.run_job(7).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        // Disabled target refuses
        j.enabled = true;
        db::backup_jobs::upsert(pool, &j).await.unwrap();
        let err = engine.run_job(7).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }
}

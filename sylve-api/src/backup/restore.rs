//! Restore flows.
//!
//! Three entry points: dataset restore (pull a specific remote snapshot
//! into an arbitrary local dataset), job restore (reconstitute a workload
//! from its job's last successful snapshot), and remote browsing of a
//! target's datasets. Restores destined for another node are forwarded
//! there; before any bytes move, the guest-ID uniqueness pre-check walks
//! the cluster placement sets.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sylve_common::model::{BackupMode, EventKind, EventStatus, NodeRecord};
use sylve_common::{Error, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::BackupEngine;
use crate::zfs::send::{recv_from_endpoint, SendOptions};
use crate::zfs::{parse_dataset_list, DatasetInfo};

/// Restore request body for `POST /backups/targets/:id/restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Full remote snapshot (`dataset@snap`) to pull.
    pub snapshot: String,
    /// Local destination dataset.
    pub destination_dataset: String,
    /// Node that should perform the restore; handlers forward when it is
    /// not the local node.
    #[serde(default)]
    pub restore_node_id: String,
}

/// Guest identity parsed out of a destination dataset path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedGuest {
    Jail(u32),
    Vm(u32),
}

/// Extract the guest ID from a destination path: `…/jails/<id>` or
/// `…/virtual-machines/<id>`, tolerating `_`/`.` suffixes on the id
/// component (`100_restore`, `100.old`).
pub fn parse_guest_id(path: &str) -> Option<ParsedGuest> {
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let kind = match segment {
            "jails" => Some(false),
            "virtual-machines" => Some(true),
            _ => None,
        };
        let Some(is_vm) = kind else { continue };
        let Some(raw) = segments.peek() else { continue };

        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            continue;
        }
        // Only a clean id or an id with a `_`/`.` suffix counts.
        let rest = &raw[digits.len()..];
        if !(rest.is_empty() || rest.starts_with('_') || rest.starts_with('.')) {
            continue;
        }
        if let Ok(id) = digits.parse() {
            return Some(if is_vm {
                ParsedGuest::Vm(id)
            } else {
                ParsedGuest::Jail(id)
            });
        }
    }
    None
}

/// The uniqueness pre-check: the guest ID must not be registered on any
/// node other than the restore destination, and never on several nodes.
pub fn check_guest_id_placement(
    nodes: &[NodeRecord],
    guest_id: u32,
    restore_node_id: &str,
) -> Result<()> {
    let holders: Vec<&NodeRecord> = nodes
        .iter()
        .filter(|n| n.guest_ids.contains(&guest_id))
        .collect();

    if holders.len() > 1 {
        return Err(Error::conflict(
            "restore_guest_id_conflict",
            format!(
                "guest id {} is registered on multiple nodes: {}",
                guest_id,
                holders
                    .iter()
                    .map(|n| n.hostname.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }
    if let Some(holder) = holders.first() {
        if holder.id != restore_node_id {
            return Err(Error::conflict(
                "restore_guest_id_conflict",
                format!(
                    "guest id {} is already registered on node {}",
                    guest_id, holder.hostname
                ),
            ));
        }
    }
    Ok(())
}

impl BackupEngine {
    /// Pre-check a restore destination against the cluster placement
    /// sets. A failed node-table load is a 500-class error, not a 409.
    pub async fn restore_precheck(&self, destination_dataset: &str) -> Result<()> {
        let Some(parsed) = parse_guest_id(destination_dataset) else {
            return Ok(());
        };
        let guest_id = match parsed {
            ParsedGuest::Jail(id) | ParsedGuest::Vm(id) => id,
        };

        let nodes = self
            .cluster
            .nodes()
            .await
            .map_err(|e| Error::RestorePrecheck(e.to_string()))?;

        check_guest_id_placement(&nodes, guest_id, self.cluster.node_id())
    }

    /// Pull one remote snapshot into a local dataset. Runs on the local
    /// node; routing happened in the handler layer.
    pub async fn restore_dataset(
        self: &Arc<Self>,
        target_id: i64,
        request: &RestoreRequest,
    ) -> Result<i64> {
        let target = self.target(target_id).await?;
        if !request.snapshot.contains('@') {
            return Err(Error::validation("snapshot must be dataset@name"));
        }
        if request.destination_dataset.is_empty() {
            return Err(Error::validation("destination dataset must not be empty"));
        }

        // Pre-check before any event exists; a conflict leaves no trace.
        self.restore_precheck(&request.destination_dataset).await?;

        let endpoint = self.endpoint_for(&target).await?;
        let event = self
            .events
            .start_backup_event(None, Some(target_id), EventKind::Restore)
            .await?;
        let event_id = event.id;

        let engine = Arc::clone(self);
        let request = request.clone();
        tokio::spawn(async move {
            let result = engine
                .execute_restore(&endpoint, &request.snapshot, &request.destination_dataset, event_id)
                .await;
            match result {
                Ok(()) => {
                    let _ = engine
                        .events
                        .finish_backup_event(
                            event_id,
                            EventStatus::Success,
                            "restore completed",
                            "",
                            &request.snapshot,
                        )
                        .await;
                    // Keep the placement set authoritative.
                    if let Some(parsed) = parse_guest_id(&request.destination_dataset) {
                        let id = match parsed {
                            ParsedGuest::Jail(id) | ParsedGuest::Vm(id) => id,
                        };
                        if let Err(e) = engine.cluster.register_guest_id(id).await {
                            warn!("Failed to register guest id {}: {}", id, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Restore into {} failed: {}", request.destination_dataset, e);
                    let _ = engine
                        .events
                        .finish_backup_event(event_id, EventStatus::Failed, "", &e.to_string(), "")
                        .await;
                }
            }
        });

        Ok(event_id)
    }

    async fn execute_restore(
        &self,
        endpoint: &crate::ssh::SshEndpoint,
        snapshot: &str,
        destination: &str,
        event_id: i64,
    ) -> Result<()> {
        info!("Restoring {} -> {}", snapshot, destination);

        let options = SendOptions {
            snapshot: snapshot.to_string(),
            incremental_base: None,
            replicate: true,
            with_intermediates: false,
        };

        let (tx, mut rx) = mpsc::channel::<u64>(8);
        let events = self.events.clone();
        let drain = tokio::spawn(async move {
            while let Some(moved) = rx.recv().await {
                let _ = events
                    .update_backup_progress(event_id, moved as i64, None)
                    .await;
            }
        });

        let result =
            recv_from_endpoint(endpoint, &options, destination, true, Some(tx.clone()), None).await;
        drop(tx);
        let _ = drain.await;
        result.map(|_| ())
    }

    /// Reconstitute a workload from its job's last successful snapshot.
    pub async fn restore_job(self: &Arc<Self>, job_id: i64) -> Result<i64> {
        let job = self.job(job_id).await?;
        let target = self.target(job.target_id).await?;

        let last = self
            .events
            .last_successful_backup(job_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "backup_event_not_found",
                    format!("job {} has no successful backup", job_id),
                )
            })?;
        if last.last_snapshot.is_empty() {
            return Err(Error::not_found(
                "backup_event_not_found",
                format!("job {} recorded no snapshot name", job_id),
            ));
        }

        let destination = match job.mode {
            BackupMode::Dataset => job.source_dataset.clone(),
            BackupMode::Jail => job.jail_root_dataset.clone(),
        };
        let remote_dataset =
            super::destination_dataset(&job, &target.backup_root, self.cluster.hostname());
        let request = RestoreRequest {
            snapshot: format!("{}@{}", remote_dataset, last.last_snapshot),
            destination_dataset: destination,
            restore_node_id: String::new(),
        };
        self.restore_dataset(target.id, &request).await
    }

    /// Browse the datasets below a target's backup root.
    pub async fn list_remote_datasets(&self, target_id: i64) -> Result<Vec<DatasetInfo>> {
        let target = self.target(target_id).await?;
        let endpoint = self.endpoint_for(&target).await?;
        let out = endpoint
            .run(&format!(
                "zfs list -H -p -t filesystem,volume -o name,guid,used,referenced,volsize,mountpoint -r {}",
                target.backup_root
            ))
            .await?;
        Ok(parse_dataset_list(&out))
    }

    /// Browse the snapshots of one dataset on a target. The dataset must
    /// live under the target's backup root.
    pub async fn list_remote_dataset_snapshots(
        &self,
        target_id: i64,
        dataset: &str,
    ) -> Result<Vec<crate::zfs::SnapshotInfo>> {
        let target = self.target(target_id).await?;
        if !dataset.starts_with(&target.backup_root) {
            return Err(Error::validation(format!(
                "dataset {} is outside backup root {}",
                dataset, target.backup_root
            )));
        }
        let endpoint = self.endpoint_for(&target).await?;
        let mut snapshots = self.remote_snapshots(&endpoint, dataset).await?;
        snapshots.sort_by_key(|s| std::cmp::Reverse(s.creation));
        Ok(snapshots)
    }

    /// Fetch the `.sylve/jail.json` side-car of a backed-up jail dataset.
    pub async fn remote_jail_metadata(
        &self,
        target_id: i64,
        dataset: &str,
    ) -> Result<sylve_common::guest::Jail> {
        let target = self.target(target_id).await?;
        if !dataset.starts_with(&target.backup_root) {
            return Err(Error::validation(format!(
                "dataset {} is outside backup root {}",
                dataset, target.backup_root
            )));
        }
        let endpoint = self.endpoint_for(&target).await?;

        let mountpoint = endpoint
            .run(&format!("zfs get -H -o value mountpoint {}", dataset))
            .await?;
        let mountpoint = mountpoint.trim();
        if mountpoint.is_empty() || mountpoint == "-" || mountpoint == "none" {
            return Err(Error::not_found(
                "jail_metadata_not_found",
                format!("dataset {} is not mounted on the target", dataset),
            ));
        }

        let raw = endpoint
            .run(&format!("cat {}/.sylve/jail.json", mountpoint))
            .await
            .map_err(|_| {
                Error::not_found(
                    "jail_metadata_not_found",
                    format!("dataset {} carries no jail side-car", dataset),
                )
            })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, hostname: &str, guest_ids: Vec<u32>) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            hostname: hostname.to_string(),
            raft_addr: "10.0.0.1:8182".to_string(),
            api_addr: "10.0.0.1:8181".to_string(),
            guest_ids,
        }
    }

    #[test]
    fn test_parse_guest_id_variants() {
        assert_eq!(parse_guest_id("tank/jails/100"), Some(ParsedGuest::Jail(100)));
        assert_eq!(
            parse_guest_id("tank/sylve/virtual-machines/104"),
            Some(ParsedGuest::Vm(104))
        );
        // Suffix tolerance
        assert_eq!(
            parse_guest_id("bkp/data/n1/jails/100_restore"),
            Some(ParsedGuest::Jail(100))
        );
        assert_eq!(
            parse_guest_id("tank/jails/100.old"),
            Some(ParsedGuest::Jail(100))
        );
        // Non-guest paths carry no id
        assert_eq!(parse_guest_id("tank/data/100"), None);
        assert_eq!(parse_guest_id("tank/jails/not-a-number"), None);
        // `100abc` is not an id
        assert_eq!(parse_guest_id("tank/jails/100abc"), None);
    }

    #[test]
    fn test_guest_id_placement_conflicts() {
        let nodes = vec![
            node("n1", "host1", vec![100]),
            node("n2", "host2", vec![200]),
        ];

        // Registered on the restore node itself: fine
        check_guest_id_placement(&nodes, 100, "n1").unwrap();

        // Registered elsewhere: conflict
        let err = check_guest_id_placement(&nodes, 100, "n2").unwrap_err();
        assert_eq!(err.code(), "restore_guest_id_conflict");

        // Unknown id: fine anywhere
        check_guest_id_placement(&nodes, 999, "n2").unwrap();

        // Registered on multiple nodes: conflict even on a holder
        let nodes = vec![
            node("n1", "host1", vec![100]),
            node("n2", "host2", vec![100]),
        ];
        let err = check_guest_id_placement(&nodes, 100, "n1").unwrap_err();
        assert_eq!(err.code(), "restore_guest_id_conflict");
    }

    async fn engine() -> Arc<BackupEngine> {
        let db = Arc::new(crate::db::Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let cluster = crate::cluster::ClusterService::bootstrap(
            db.clone(),
            &crate::config::SylveConfig::default(),
        )
        .await
        .unwrap();
        let events = Arc::new(crate::events::EventStore::new(db.clone()));
        let dir = tempfile::tempdir().unwrap();
        BackupEngine::new(
            db,
            Arc::new(crate::zfs::ZfsManager::new()),
            events,
            cluster,
            Arc::new(crate::driver::testing::MockGuestDriver::default()),
            crate::ssh::SecretStore::new(dir.into_path()),
            30,
            45,
            4,
        )
    }

    #[tokio::test]
    async fn test_restore_conflict_creates_no_event() {
        let engine = engine().await;
        let pool = engine.db.pool();

        // Another node holds guest 100
        crate::db::nodes::upsert(pool, &node("other", "other-host", vec![100]))
            .await
            .unwrap();
        let target = sylve_common::model::BackupTarget {
            id: 1,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: true,
        };
        crate::db::backup_targets::upsert(pool, &target).await.unwrap();

        let request = RestoreRequest {
            snapshot: "bkp/data/n1/jails/100@sylve_repl_1".to_string(),
            destination_dataset: "tank/sylve/jails/100".to_string(),
            restore_node_id: String::new(),
        };
        let err = engine.restore_dataset(1, &request).await.unwrap_err();
        assert_eq!(err.code(), "restore_guest_id_conflict");

        // The pre-check fired before any event was written
        let events = engine.events().list_backup_events(10, None).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_restore_validates_request_shape() {
        let engine = engine().await;
        let target = sylve_common::model::BackupTarget {
            id: 1,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: true,
        };
        crate::db::backup_targets::upsert(engine.db.pool(), &target)
            .await
            .unwrap();

        let bad_snapshot = RestoreRequest {
            snapshot: "no-at-sign".to_string(),
            destination_dataset: "tank/restore".to_string(),
            restore_node_id: String::new(),
        };
        assert!(engine.restore_dataset(1, &bad_snapshot).await.is_err());

        let no_dest = RestoreRequest {
            snapshot: "bkp/data/x@s".to_string(),
            destination_dataset: String::new(),
            restore_node_id: String::new(),
        };
        assert!(engine.restore_dataset(1, &no_dest).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_job_requires_successful_backup() {
        let engine = engine().await;
        let pool = engine.db.pool();

        let target = sylve_common::model::BackupTarget {
            id: 1,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: true,
        };
        crate::db::backup_targets::upsert(pool, &target).await.unwrap();
        let job = sylve_common::model::BackupJob {
            id: 7,
            target_id: 1,
            runner_node_id: String::new(),
            mode: BackupMode::Dataset,
            source_dataset: "tank/ds1".to_string(),
            jail_root_dataset: String::new(),
            dest_suffix: String::new(),
            prune_keep_last: 0,
            prune_target: false,
            stop_before_backup: false,
            cron_expr: String::new(),
            enabled: true,
        };
        crate::db::backup_jobs::upsert(pool, &job).await.unwrap();

        let err = engine.restore_job(7).await.unwrap_err();
        assert_eq!(err.code(), "backup_event_not_found");
    }
}

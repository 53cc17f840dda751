//! Cluster finite-state machine.
//!
//! The committed Raft log is a sequence of tagged proposals; this module
//! defines the exhaustive proposal set and applies committed entries to
//! the SQL-backed replicated tables. Every apply is idempotent by
//! `(kind, id)` so log replays and snapshot restores converge. Referential
//! integrity violations reject with a typed error which surfaces to the
//! proposer as a failed future.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sylve_common::model::{
    BackupJob, BackupTarget, ClusterSshIdentity, NodeRecord, ReplicationLease, ReplicationPolicy,
};
use sylve_common::{Error, Result};
use tracing::debug;

use crate::db::{self, Database};

/// Exhaustive set of replicated mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Proposal {
    BackupTargetCreate { target: BackupTarget },
    BackupTargetUpdate { target: BackupTarget },
    BackupTargetDelete { id: i64 },
    BackupJobCreate { job: BackupJob },
    BackupJobUpdate { job: BackupJob },
    BackupJobDelete { id: i64 },
    ReplicationPolicyCreate { policy: ReplicationPolicy },
    ReplicationPolicyUpdate { policy: ReplicationPolicy },
    ReplicationPolicyDelete { id: i64 },
    ReplicationPolicyActivate { policy_id: i64, active_node_id: String },
    ClusterSshIdentityUpsert { identity: ClusterSshIdentity },
    LeaseAcquire { lease: ReplicationLease },
    LeaseRenew { policy_id: i64, token: String, expires_at: DateTime<Utc> },
    LeaseRelease { policy_id: i64, token: String },
    NodeUpsert { node: NodeRecord },
    NodeRemove { node_id: String },
    ClusterKeyRotate { cluster_key: String },
}

impl Proposal {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Proposal::BackupTargetCreate { .. } => "backup_target.create",
            Proposal::BackupTargetUpdate { .. } => "backup_target.update",
            Proposal::BackupTargetDelete { .. } => "backup_target.delete",
            Proposal::BackupJobCreate { .. } => "backup_job.create",
            Proposal::BackupJobUpdate { .. } => "backup_job.update",
            Proposal::BackupJobDelete { .. } => "backup_job.delete",
            Proposal::ReplicationPolicyCreate { .. } => "replication_policy.create",
            Proposal::ReplicationPolicyUpdate { .. } => "replication_policy.update",
            Proposal::ReplicationPolicyDelete { .. } => "replication_policy.delete",
            Proposal::ReplicationPolicyActivate { .. } => "replication_policy.activate",
            Proposal::ClusterSshIdentityUpsert { .. } => "ssh_identity.upsert",
            Proposal::LeaseAcquire { .. } => "lease.acquire",
            Proposal::LeaseRenew { .. } => "lease.renew",
            Proposal::LeaseRelease { .. } => "lease.release",
            Proposal::NodeUpsert { .. } => "node.upsert",
            Proposal::NodeRemove { .. } => "node.remove",
            Proposal::ClusterKeyRotate { .. } => "cluster_key.rotate",
        }
    }
}

/// Portable snapshot of the replicated tables, used for log compaction
/// and for bringing late joiners up to date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub cluster_key: Option<String>,
    pub nodes: Vec<NodeRecord>,
    pub targets: Vec<BackupTarget>,
    pub jobs: Vec<BackupJob>,
    pub policies: Vec<ReplicationPolicy>,
    pub identities: Vec<ClusterSshIdentity>,
}

/// SQL-backed state machine for replicated cluster configuration.
pub struct ClusterFsm {
    db: Arc<Database>,
}

impl ClusterFsm {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply one committed proposal. Serialized by the caller (the Raft
    /// apply loop, or the single-node fallback path).
    pub async fn apply(&self, proposal: &Proposal) -> Result<()> {
        debug!("Applying proposal: {}", proposal.kind());
        let pool = self.db.pool();

        match proposal {
            Proposal::BackupTargetCreate { target } | Proposal::BackupTargetUpdate { target } => {
                if target.name.is_empty() || target.ssh_host.is_empty() {
                    return Err(Error::validation("backup target needs a name and ssh host"));
                }
                if target.backup_root.is_empty() {
                    return Err(Error::validation("backup target needs a backup root dataset"));
                }
                db::backup_targets::upsert(pool, target).await
            }
            Proposal::BackupTargetDelete { id } => {
                if db::backup_jobs::exists_for_target(pool, *id).await? {
                    return Err(Error::conflict(
                        "backup_target_in_use",
                        format!("backup target {} still has jobs", id),
                    ));
                }
                db::backup_targets::delete(pool, *id).await
            }
            Proposal::BackupJobCreate { job } | Proposal::BackupJobUpdate { job } => {
                if db::backup_targets::get(pool, job.target_id).await?.is_none() {
                    return Err(Error::not_found(
                        "backup_target_not_found",
                        format!("backup target {} does not exist", job.target_id),
                    ));
                }
                db::backup_jobs::upsert(pool, job).await
            }
            Proposal::BackupJobDelete { id } => db::backup_jobs::delete(pool, *id).await,
            Proposal::ReplicationPolicyCreate { policy }
            | Proposal::ReplicationPolicyUpdate { policy } => {
                if policy.destination_node_ids.is_empty() {
                    return Err(Error::validation(
                        "replication policy needs at least one destination node",
                    ));
                }
                db::replication_policies::upsert(pool, policy).await
            }
            Proposal::ReplicationPolicyDelete { id } => {
                db::replication_leases::delete(pool, *id).await?;
                db::replication_policies::delete(pool, *id).await
            }
            Proposal::ReplicationPolicyActivate { policy_id, active_node_id } => {
                if db::replication_policies::get(pool, *policy_id).await?.is_none() {
                    return Err(Error::not_found(
                        "replication_policy_not_found",
                        format!("replication policy {} does not exist", policy_id),
                    ));
                }
                db::replication_policies::set_active_node(pool, *policy_id, active_node_id).await
            }
            Proposal::ClusterSshIdentityUpsert { identity } => {
                db::ssh_identities::upsert(pool, identity).await
            }
            Proposal::LeaseAcquire { lease } => {
                if let Some(existing) = db::replication_leases::get(pool, lease.policy_id).await? {
                    // Re-acquisition by the same token is the idempotent
                    // replay case; anything else needs the old lease expired.
                    if existing.token != lease.token
                        && !existing.is_expired_at(lease.acquired_at)
                    {
                        return Err(Error::conflict(
                            "lease_not_acquired",
                            format!(
                                "lease for policy {} held by {} until {}",
                                lease.policy_id, existing.owner_node_id, existing.expires_at
                            ),
                        ));
                    }
                }
                db::replication_leases::upsert(pool, lease).await
            }
            Proposal::LeaseRenew { policy_id, token, expires_at } => {
                match db::replication_leases::get(pool, *policy_id).await? {
                    Some(existing) if existing.token == *token => {
                        db::replication_leases::set_expires(pool, *policy_id, *expires_at).await
                    }
                    Some(_) => Err(Error::conflict(
                        "lease_token_mismatch",
                        format!("lease for policy {} is owned elsewhere", policy_id),
                    )),
                    None => Err(Error::not_found(
                        "lease_not_found",
                        format!("no lease for policy {}", policy_id),
                    )),
                }
            }
            Proposal::LeaseRelease { policy_id, token } => {
                match db::replication_leases::get(pool, *policy_id).await? {
                    Some(existing) if existing.token == *token => {
                        db::replication_leases::delete(pool, *policy_id).await
                    }
                    // Releasing an absent or foreign lease is a no-op so
                    // that replays and late releases converge.
                    _ => Ok(()),
                }
            }
            Proposal::NodeUpsert { node } => {
                if node.id.is_empty() {
                    return Err(Error::validation("node id must not be empty"));
                }
                db::nodes::upsert(pool, node).await
            }
            Proposal::NodeRemove { node_id } => db::nodes::remove(pool, node_id).await,
            Proposal::ClusterKeyRotate { cluster_key } => {
                db::cluster::set_cluster_key(pool, cluster_key).await
            }
        }
    }

    /// Dump the replicated tables into a portable snapshot.
    pub async fn snapshot(&self) -> Result<FsmSnapshot> {
        let pool = self.db.pool();
        Ok(FsmSnapshot {
            cluster_key: db::cluster::get_cluster_key(pool).await?,
            nodes: db::nodes::list(pool).await?,
            targets: db::backup_targets::list(pool).await?,
            jobs: db::backup_jobs::list(pool).await?,
            policies: db::replication_policies::list(pool).await?,
            identities: db::ssh_identities::list(pool).await?,
        })
    }

    /// Replace the replicated tables with a snapshot's contents.
    pub async fn restore(&self, snapshot: &FsmSnapshot) -> Result<()> {
        let pool = self.db.pool();

        if let Some(key) = &snapshot.cluster_key {
            db::cluster::set_cluster_key(pool, key).await?;
        }
        for node in db::nodes::list(pool).await? {
            db::nodes::remove(pool, &node.id).await?;
        }
        for node in &snapshot.nodes {
            db::nodes::upsert(pool, node).await?;
        }
        for job in db::backup_jobs::list(pool).await? {
            db::backup_jobs::delete(pool, job.id).await?;
        }
        for target in db::backup_targets::list(pool).await? {
            db::backup_targets::delete(pool, target.id).await?;
        }
        for target in &snapshot.targets {
            db::backup_targets::upsert(pool, target).await?;
        }
        for job in &snapshot.jobs {
            db::backup_jobs::upsert(pool, job).await?;
        }
        for policy in db::replication_policies::list(pool).await? {
            db::replication_policies::delete(pool, policy.id).await?;
        }
        for policy in &snapshot.policies {
            db::replication_policies::upsert(pool, policy).await?;
        }
        for identity in &snapshot.identities {
            db::ssh_identities::upsert(pool, identity).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fsm() -> (ClusterFsm, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        (ClusterFsm::new(db.clone()), db)
    }

    fn target(id: i64) -> BackupTarget {
        BackupTarget {
            id,
            name: format!("target-{}", id),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: true,
        }
    }

    fn job(id: i64, target_id: i64) -> BackupJob {
        BackupJob {
            id,
            target_id,
            runner_node_id: "n1".to_string(),
            mode: sylve_common::model::BackupMode::Dataset,
            source_dataset: "tank/ds1".to_string(),
            jail_root_dataset: String::new(),
            dest_suffix: String::new(),
            prune_keep_last: 3,
            prune_target: true,
            stop_before_backup: false,
            cron_expr: String::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_job_create_requires_target() {
        let (fsm, _db) = fsm().await;

        let err = fsm
            .apply(&Proposal::BackupJobCreate { job: job(1, 9) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backup_target_not_found");

        fsm.apply(&Proposal::BackupTargetCreate { target: target(9) })
            .await
            .unwrap();
        fsm.apply(&Proposal::BackupJobCreate { job: job(1, 9) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_target_delete_blocked_by_jobs() {
        let (fsm, db) = fsm().await;
        fsm.apply(&Proposal::BackupTargetCreate { target: target(1) })
            .await
            .unwrap();
        fsm.apply(&Proposal::BackupJobCreate { job: job(1, 1) })
            .await
            .unwrap();

        let err = fsm
            .apply(&Proposal::BackupTargetDelete { id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backup_target_in_use");

        fsm.apply(&Proposal::BackupJobDelete { id: 1 }).await.unwrap();
        fsm.apply(&Proposal::BackupTargetDelete { id: 1 })
            .await
            .unwrap();
        assert!(db::backup_targets::get(db.pool(), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (fsm, db) = fsm().await;
        let proposal = Proposal::BackupTargetCreate { target: target(1) };
        fsm.apply(&proposal).await.unwrap();
        fsm.apply(&proposal).await.unwrap();
        assert_eq!(db::backup_targets::list(db.pool()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_acquire_conflict_and_expiry() {
        let (fsm, _db) = fsm().await;
        let now = Utc::now();

        let lease = ReplicationLease {
            policy_id: 7,
            owner_node_id: "n1".to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            token: "aaaa".to_string(),
        };
        fsm.apply(&Proposal::LeaseAcquire { lease: lease.clone() })
            .await
            .unwrap();

        // Replay of the same acquire converges
        fsm.apply(&Proposal::LeaseAcquire { lease: lease.clone() })
            .await
            .unwrap();

        // A different owner cannot take an unexpired lease
        let contender = ReplicationLease {
            owner_node_id: "n2".to_string(),
            token: "bbbb".to_string(),
            acquired_at: now + chrono::Duration::seconds(10),
            expires_at: now + chrono::Duration::seconds(70),
            ..lease.clone()
        };
        let err = fsm
            .apply(&Proposal::LeaseAcquire { lease: contender.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "lease_not_acquired");

        // After expiry the contender succeeds
        let late = ReplicationLease {
            acquired_at: now + chrono::Duration::seconds(61),
            expires_at: now + chrono::Duration::seconds(121),
            ..contender
        };
        fsm.apply(&Proposal::LeaseAcquire { lease: late }).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_renew_and_release_token_match() {
        let (fsm, db) = fsm().await;
        let now = Utc::now();
        let lease = ReplicationLease {
            policy_id: 3,
            owner_node_id: "n1".to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            token: "tok".to_string(),
        };
        fsm.apply(&Proposal::LeaseAcquire { lease }).await.unwrap();

        let err = fsm
            .apply(&Proposal::LeaseRenew {
                policy_id: 3,
                token: "wrong".to_string(),
                expires_at: now + chrono::Duration::seconds(120),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "lease_token_mismatch");

        fsm.apply(&Proposal::LeaseRenew {
            policy_id: 3,
            token: "tok".to_string(),
            expires_at: now + chrono::Duration::seconds(120),
        })
        .await
        .unwrap();

        // Wrong-token release is a converging no-op, not an error
        fsm.apply(&Proposal::LeaseRelease {
            policy_id: 3,
            token: "wrong".to_string(),
        })
        .await
        .unwrap();
        assert!(db::replication_leases::get(db.pool(), 3)
            .await
            .unwrap()
            .is_some());

        fsm.apply(&Proposal::LeaseRelease {
            policy_id: 3,
            token: "tok".to_string(),
        })
        .await
        .unwrap();
        assert!(db::replication_leases::get(db.pool(), 3)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (fsm, _db) = fsm().await;
        fsm.apply(&Proposal::ClusterKeyRotate {
            cluster_key: "secret".to_string(),
        })
        .await
        .unwrap();
        fsm.apply(&Proposal::BackupTargetCreate { target: target(1) })
            .await
            .unwrap();
        fsm.apply(&Proposal::BackupJobCreate { job: job(1, 1) })
            .await
            .unwrap();
        fsm.apply(&Proposal::NodeUpsert {
            node: NodeRecord {
                id: "n1".to_string(),
                hostname: "host1".to_string(),
                raft_addr: "10.0.0.1:8182".to_string(),
                api_addr: "10.0.0.1:8181".to_string(),
                guest_ids: vec![100],
            },
        })
        .await
        .unwrap();

        let snapshot = fsm.snapshot().await.unwrap();

        // A fresh FSM restored from the snapshot matches
        let db2 = Arc::new(Database::open_in_memory().await.unwrap());
        db2.migrate().await.unwrap();
        let fsm2 = ClusterFsm::new(db2);
        fsm2.restore(&snapshot).await.unwrap();

        let restored = fsm2.snapshot().await.unwrap();
        assert_eq!(restored.cluster_key.as_deref(), Some("secret"));
        assert_eq!(restored.targets.len(), 1);
        assert_eq!(restored.jobs.len(), 1);
        assert_eq!(restored.nodes.len(), 1);
    }

    #[test]
    fn test_proposal_serialization_tags() {
        let proposal = Proposal::BackupTargetDelete { id: 4 };
        let json = serde_json::to_string(&proposal).unwrap();
        assert!(json.contains("\"kind\":\"backup_target_delete\""));
        let back: Proposal = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Proposal::BackupTargetDelete { id: 4 }));
    }
}

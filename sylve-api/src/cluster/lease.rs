//! Replication lease manager.
//!
//! Leases are Raft-replicated ownership tokens that gate starting a
//! protected guest on exactly one node. Acquire succeeds only when no
//! live lease exists; renew and release require the holder's token.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::RngCore;
use sylve_common::model::{GuestType, ReplicationLease, ReplicationPolicy};
use sylve_common::{Error, Result};
use tracing::info;

use super::fsm::Proposal;
use super::ClusterService;
use crate::db;

/// Lease TTL floor; clock skew across the mesh is absorbed by generous
/// TTLs rather than tight synchronization.
pub const MIN_LEASE_TTL_SECS: i64 = 60;

/// TTL for one replication run: twice the run period, at least the floor.
pub fn ttl_for_policy(policy: &ReplicationPolicy) -> Duration {
    let secs = policy
        .frequency_seconds
        .map(|f| (f as i64) * 2)
        .unwrap_or(MIN_LEASE_TTL_SECS)
        .max(MIN_LEASE_TTL_SECS);
    Duration::seconds(secs)
}

fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct LeaseManager {
    cluster: Arc<ClusterService>,
}

impl LeaseManager {
    pub fn new(cluster: Arc<ClusterService>) -> Self {
        Self { cluster }
    }

    /// Acquire the lease for a policy on the local node. Fails with
    /// `lease_not_acquired` while another node holds a live lease.
    pub async fn acquire(&self, policy_id: i64, ttl: Duration) -> Result<ReplicationLease> {
        let now = Utc::now();
        let lease = ReplicationLease {
            policy_id,
            owner_node_id: self.cluster.node_id().to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            token: new_token(),
        };

        self.cluster
            .propose(Proposal::LeaseAcquire {
                lease: lease.clone(),
            })
            .await?;

        info!(
            "Acquired replication lease for policy {} until {}",
            policy_id, lease.expires_at
        );
        Ok(lease)
    }

    /// Extend a held lease.
    pub async fn renew(&self, lease: &ReplicationLease, ttl: Duration) -> Result<ReplicationLease> {
        let expires_at = Utc::now() + ttl;
        self.cluster
            .propose(Proposal::LeaseRenew {
                policy_id: lease.policy_id,
                token: lease.token.clone(),
                expires_at,
            })
            .await?;

        Ok(ReplicationLease {
            expires_at,
            ..lease.clone()
        })
    }

    /// Release a held lease. Best-effort: a lost release expires anyway.
    pub async fn release(&self, lease: &ReplicationLease) -> Result<()> {
        self.cluster
            .propose(Proposal::LeaseRelease {
                policy_id: lease.policy_id,
                token: lease.token.clone(),
            })
            .await
    }

    pub async fn get(&self, policy_id: i64) -> Result<Option<ReplicationLease>> {
        db::replication_leases::get(self.cluster.db().pool(), policy_id).await
    }

    /// Gate for starting a protected guest on this node: allowed when the
    /// guest has no replication policy, or when the local node holds a
    /// live lease for it.
    pub async fn check_guest_start(&self, guest_type: GuestType, guest_id: u32) -> Result<()> {
        let pool = self.cluster.db().pool();
        let Some(policy) =
            db::replication_policies::get_by_guest(pool, guest_type, guest_id).await?
        else {
            return Ok(());
        };

        let lease = db::replication_leases::get(pool, policy.id).await?;
        let now = Utc::now();
        match lease {
            Some(lease)
                if lease.owner_node_id == self.cluster.node_id()
                    && !lease.is_expired_at(now) =>
            {
                Ok(())
            }
            Some(lease) if !lease.is_expired_at(now) => Err(Error::conflict(
                "replication_lease_not_owned",
                format!(
                    "{} {} is protected by policy {}; lease held by node {} until {}",
                    guest_type, guest_id, policy.id, lease.owner_node_id, lease.expires_at
                ),
            )),
            // No live lease: the guest may start here, and the next run
            // will contend for a fresh lease.
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SylveConfig;
    use crate::db::Database;
    use sylve_common::model::ReplicationMode;

    async fn manager() -> (LeaseManager, Arc<ClusterService>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let cluster = ClusterService::bootstrap(db, &SylveConfig::default())
            .await
            .unwrap();
        (LeaseManager::new(cluster.clone()), cluster)
    }

    fn policy(id: i64, guest_id: u32) -> ReplicationPolicy {
        ReplicationPolicy {
            id,
            name: format!("policy-{}", id),
            guest_type: GuestType::Vm,
            guest_id,
            source_node_id: "src".to_string(),
            active_node_id: None,
            destination_node_ids: vec!["dst".to_string()],
            mode: ReplicationMode::Push,
            cron_expr: String::new(),
            frequency_seconds: Some(300),
            keep_last: 3,
            enabled: true,
        }
    }

    #[test]
    fn test_ttl_floor_and_doubling() {
        let mut p = policy(1, 100);
        assert_eq!(ttl_for_policy(&p), Duration::seconds(600));

        p.frequency_seconds = Some(10);
        assert_eq!(ttl_for_policy(&p), Duration::seconds(60));

        p.frequency_seconds = None;
        assert_eq!(ttl_for_policy(&p), Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_acquire_renew_release() {
        let (manager, _cluster) = manager().await;

        let lease = manager.acquire(7, Duration::seconds(60)).await.unwrap();
        assert_eq!(lease.token.len(), 32);

        // Second acquire while held fails
        let err = manager.acquire(7, Duration::seconds(60)).await.unwrap_err();
        assert_eq!(err.code(), "lease_not_acquired");

        let renewed = manager.renew(&lease, Duration::seconds(120)).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);

        manager.release(&renewed).await.unwrap();
        assert!(manager.get(7).await.unwrap().is_none());

        // Released lease can be re-acquired
        manager.acquire(7, Duration::seconds(60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_guest_start_gate() {
        let (manager, cluster) = manager().await;
        let pool = cluster.db().pool();

        // No policy: always allowed
        manager
            .check_guest_start(GuestType::Vm, 100)
            .await
            .unwrap();

        db::replication_policies::upsert(pool, &policy(1, 100))
            .await
            .unwrap();

        // Policy exists, no lease: allowed
        manager
            .check_guest_start(GuestType::Vm, 100)
            .await
            .unwrap();

        // Foreign live lease: denied
        let now = Utc::now();
        db::replication_leases::upsert(
            pool,
            &ReplicationLease {
                policy_id: 1,
                owner_node_id: "other-node".to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(60),
                token: "tok".to_string(),
            },
        )
        .await
        .unwrap();
        let err = manager
            .check_guest_start(GuestType::Vm, 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "replication_lease_not_owned");

        // Expired foreign lease: allowed again
        db::replication_leases::upsert(
            pool,
            &ReplicationLease {
                policy_id: 1,
                owner_node_id: "other-node".to_string(),
                acquired_at: now - Duration::seconds(120),
                expires_at: now - Duration::seconds(60),
                token: "tok".to_string(),
            },
        )
        .await
        .unwrap();
        manager
            .check_guest_start(GuestType::Vm, 100)
            .await
            .unwrap();

        // Locally held live lease: allowed
        db::replication_leases::upsert(
            pool,
            &ReplicationLease {
                policy_id: 1,
                owner_node_id: cluster.node_id().to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(60),
                token: "tok2".to_string(),
            },
        )
        .await
        .unwrap();
        manager
            .check_guest_start(GuestType::Vm, 100)
            .await
            .unwrap();
    }
}

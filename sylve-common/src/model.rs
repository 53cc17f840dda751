//! Replicated configuration and per-node state records.
//!
//! Everything in this module is persisted in the relational store. The
//! cluster-replicated entities (nodes, targets, jobs, policies, leases,
//! SSH identities) are only mutated through Raft proposals; events and
//! snapshot records are per-node local state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cluster member. `guest_ids` is the authoritative placement set used
/// by the restore pre-check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub hostname: String,
    pub raft_addr: String,
    pub api_addr: String,
    #[serde(default)]
    pub guest_ids: Vec<u32>,
}

/// SSH-accessible remote storage root that backup jobs push to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTarget {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Private key material; the re-hydration source when the on-disk
    /// file at `ssh_key_path` is missing or rotated.
    pub ssh_key: String,
    #[serde(default)]
    pub ssh_key_path: String,
    pub backup_root: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Dataset,
    Jail,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dataset => write!(f, "dataset"),
            Self::Jail => write!(f, "jail"),
        }
    }
}

impl std::str::FromStr for BackupMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(Self::Dataset),
            "jail" => Ok(Self::Jail),
            other => Err(crate::Error::validation(format!(
                "unknown backup mode: {}",
                other
            ))),
        }
    }
}

/// A scheduled backup of a dataset or a jail to a [`BackupTarget`].
///
/// An empty `runner_node_id` is the legacy "run on the leader" routing;
/// new jobs get `runner_node_id` pinned at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    #[serde(default)]
    pub id: i64,
    pub target_id: i64,
    #[serde(default)]
    pub runner_node_id: String,
    pub mode: BackupMode,
    pub source_dataset: String,
    #[serde(default)]
    pub jail_root_dataset: String,
    #[serde(default)]
    pub dest_suffix: String,
    pub prune_keep_last: u32,
    pub prune_target: bool,
    pub stop_before_backup: bool,
    #[serde(default)]
    pub cron_expr: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Backup,
    Restore,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Running,
    Success,
    Failed,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::validation(format!(
                "unknown event status: {}",
                other
            ))),
        }
    }
}

/// Durable record of one backup or restore run. Append-only; only the
/// currently-running event is updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEvent {
    pub id: i64,
    pub job_id: Option<i64>,
    pub target_id: Option<i64>,
    pub kind: EventKind,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_bytes: Option<i64>,
    pub moved_bytes: Option<i64>,
    pub percent: Option<f64>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub last_snapshot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Vm,
    Jail,
}

impl std::fmt::Display for GuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vm => write!(f, "vm"),
            Self::Jail => write!(f, "jail"),
        }
    }
}

impl std::str::FromStr for GuestType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(Self::Vm),
            "jail" => Ok(Self::Jail),
            other => Err(crate::Error::validation(format!(
                "unknown guest type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Push,
    Pull,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

impl std::str::FromStr for ReplicationMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(crate::Error::validation(format!(
                "unknown replication mode: {}",
                other
            ))),
        }
    }
}

/// Declarative continuous-replication intent for one guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub guest_type: GuestType,
    pub guest_id: u32,
    pub source_node_id: String,
    pub active_node_id: Option<String>,
    pub destination_node_ids: Vec<String>,
    pub mode: ReplicationMode,
    #[serde(default)]
    pub cron_expr: String,
    pub frequency_seconds: Option<u64>,
    pub keep_last: u32,
    pub enabled: bool,
}

/// Durable record of one replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub id: i64,
    pub policy_id: i64,
    pub guest_type: GuestType,
    pub guest_id: u32,
    pub source_node_id: String,
    pub target_node_id: String,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_bytes: Option<i64>,
    pub moved_bytes: Option<i64>,
    pub percent: Option<f64>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub last_snapshot: String,
}

/// Time-bounded ownership token gating starts of a protected guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationLease {
    pub policy_id: i64,
    pub owner_node_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

impl ReplicationLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Replicated public key so peer nodes can authorize each other for
/// `zfs send | ssh` pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSshIdentity {
    pub node_id: String,
    pub public_key: String,
}

/// Side-car record of a local VM snapshot across the VM's root datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshotRecord {
    pub id: i64,
    pub vm_id: i64,
    pub rid: u32,
    pub parent_snapshot_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `sylve_<token>_<unixMillis>` — the `@name` used on every root dataset.
    pub snapshot_name: String,
    pub root_datasets: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// GFS + simple retention knobs for periodic snapshot jobs. Simple
/// (`keep_last`/`max_age_days`) and GFS (`keep_*ly`) are mutually
/// exclusive per job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRetention {
    #[serde(default)]
    pub keep_last: u32,
    #[serde(default)]
    pub max_age_days: u32,
    #[serde(default)]
    pub keep_hourly: u32,
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
    #[serde(default)]
    pub keep_yearly: u32,
}

impl SnapshotRetention {
    pub fn uses_simple(&self) -> bool {
        self.keep_last > 0 || self.max_age_days > 0
    }

    pub fn uses_gfs(&self) -> bool {
        self.keep_hourly > 0
            || self.keep_daily > 0
            || self.keep_weekly > 0
            || self.keep_monthly > 0
            || self.keep_yearly > 0
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.uses_simple() && self.uses_gfs() {
            return Err(crate::Error::validation(
                "simple retention (keep_last/max_age_days) and GFS retention are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Per-dataset periodic snapshot job, keyed by ZFS GUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicSnapshotJob {
    #[serde(default)]
    pub id: i64,
    /// ZFS dataset GUID; survives renames.
    #[serde(default)]
    pub guid: String,
    pub dataset: String,
    pub prefix: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default)]
    pub cron_expr: String,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention: SnapshotRetention,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_exclusivity() {
        let simple = SnapshotRetention {
            keep_last: 5,
            ..Default::default()
        };
        assert!(simple.validate().is_ok());

        let gfs = SnapshotRetention {
            keep_hourly: 2,
            keep_daily: 7,
            ..Default::default()
        };
        assert!(gfs.validate().is_ok());

        let both = SnapshotRetention {
            keep_last: 5,
            keep_daily: 7,
            ..Default::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = ReplicationLease {
            policy_id: 1,
            owner_node_id: "n1".to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            token: "deadbeef".to_string(),
        };
        assert!(!lease.is_expired_at(now + chrono::Duration::seconds(59)));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_backup_mode_round_trip() {
        for mode in [BackupMode::Dataset, BackupMode::Jail] {
            let parsed: BackupMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("tarball".parse::<BackupMode>().is_err());
    }

    #[test]
    fn test_policy_serialization() {
        let policy = ReplicationPolicy {
            id: 3,
            name: "web-vm".to_string(),
            guest_type: GuestType::Vm,
            guest_id: 104,
            source_node_id: "node-a".to_string(),
            active_node_id: None,
            destination_node_ids: vec!["node-b".to_string()],
            mode: ReplicationMode::Push,
            cron_expr: String::new(),
            frequency_seconds: Some(300),
            keep_last: 4,
            enabled: true,
        };
        let json = serde_json::to_string(&policy).unwrap();
        let back: ReplicationPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.guest_id, 104);
        assert_eq!(back.mode, ReplicationMode::Push);
    }
}

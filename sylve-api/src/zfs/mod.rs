//! ZFS command layer
//! Wraps the zfs/zpool CLI surface the data-protection engines depend on:
//! list, snapshot, destroy, rollback, dry-run send sizing and pool stats.

#![allow(dead_code)]

pub mod send;

use sylve_common::{Error, Result};
use tokio::process::Command;
use tracing::{error, info};

/// Snapshot name prefix used by replication and backup runs.
pub const REPL_SNAPSHOT_PREFIX: &str = "sylve_repl_";

/// ZFS dataset info from `zfs list`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub guid: String,
    pub used: u64,
    pub referenced: u64,
    pub volsize: Option<u64>,
    pub mountpoint: Option<String>,
}

/// ZFS snapshot info from `zfs list -t snapshot`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotInfo {
    /// Full `dataset@snap` name
    pub full_name: String,
    /// Dataset part
    pub dataset: String,
    /// Snapshot part after `@`
    pub name: String,
    pub guid: String,
    pub used: u64,
    /// Creation time (unix seconds)
    pub creation: i64,
}

/// ZFS pool info from `zpool list`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub alloc: u64,
    pub size: u64,
    pub free: u64,
    pub fragmentation: String,
    pub dedup_ratio: String,
}

/// ZFS command wrapper
pub struct ZfsManager {}

impl ZfsManager {
    pub fn new() -> Self {
        Self {}
    }

    async fn run(args: &[&str]) -> Result<String> {
        let output = Command::new("zfs")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("Failed to run zfs {:?}: {}", args, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "zfs {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// List datasets (filesystems and volumes), optionally below a root.
    pub async fn list_datasets(&self, root: Option<&str>) -> Result<Vec<DatasetInfo>> {
        let mut args = vec![
            "list", "-H", "-p", "-t", "filesystem,volume", "-o",
            "name,guid,used,referenced,volsize,mountpoint",
        ];
        if let Some(root) = root {
            args.push("-r");
            args.push(root);
        }

        let stdout = Self::run(&args).await?;
        Ok(parse_dataset_list(&stdout))
    }

    /// Find a dataset by its GUID.
    pub async fn dataset_by_guid(&self, guid: &str) -> Result<Option<DatasetInfo>> {
        let datasets = self.list_datasets(None).await?;
        Ok(datasets.into_iter().find(|d| d.guid == guid))
    }

    /// List snapshots of a dataset (recursive lists children too).
    pub async fn list_snapshots(
        &self,
        dataset: &str,
        recursive: bool,
    ) -> Result<Vec<SnapshotInfo>> {
        let mut args = vec![
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,guid,used,creation",
        ];
        if recursive {
            args.push("-r");
        }
        args.push(dataset);

        let stdout = Self::run(&args).await?;
        Ok(parse_snapshot_list(&stdout))
    }

    /// Create a snapshot (`dataset@name`).
    pub async fn snapshot(&self, full_name: &str, recursive: bool) -> Result<()> {
        info!("Creating ZFS snapshot: {}", full_name);

        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(full_name);

        Self::run(&args).await.map(|_| ())
    }

    /// Destroy a snapshot or dataset.
    pub async fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        info!("Destroying ZFS object: {}", name);

        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(name);

        Self::run(&args).await.map(|_| ())
    }

    /// Destroy, treating "does not exist" as success.
    pub async fn destroy_if_exists(&self, name: &str, recursive: bool) -> Result<()> {
        match self.destroy(name, recursive).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Roll a dataset back to `dataset@snap`. With `destroy_more_recent`
    /// the `-r` flag discards newer snapshots instead of refusing.
    pub async fn rollback(&self, full_name: &str, destroy_more_recent: bool) -> Result<()> {
        info!("Rolling back ZFS snapshot: {}", full_name);

        let mut args = vec!["rollback"];
        if destroy_more_recent {
            args.push("-r");
        }
        args.push(full_name);

        Self::run(&args).await.map(|_| ())
    }

    /// Get a dataset's mountpoint.
    pub async fn mountpoint(&self, dataset: &str) -> Result<Option<String>> {
        let stdout = Self::run(&["get", "-H", "-o", "value", "mountpoint", dataset]).await?;
        let value = stdout.trim();
        if value.is_empty() || value == "-" || value == "none" || value == "legacy" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    /// Dry-run size estimation for a send stream. This is the only
    /// reliable expected-byte count; `used`/`referenced` over-count with
    /// snapshots in the chain.
    pub async fn send_size(
        &self,
        snapshot: &str,
        incremental_base: Option<&str>,
        replicate: bool,
    ) -> Result<u64> {
        let mut args = vec!["send", "-n", "-v", "-P"];
        if replicate {
            args.push("-R");
        }
        if let Some(base) = incremental_base {
            args.push("-i");
            args.push(base);
        }
        args.push(snapshot);

        let output = Command::new("zfs")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("Failed to run zfs send -nvP: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("zfs send dry-run failed: {}", stderr.trim());
            return Err(Error::Fatal(format!(
                "zfs send dry-run failed: {}",
                stderr.trim()
            )));
        }

        // -P prints machine-parseable output on both streams depending on
        // the platform; scan both.
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        parse_send_size(&stdout)
            .or_else(|| parse_send_size(&stderr))
            .ok_or_else(|| Error::Fatal("zfs send dry-run produced no size line".to_string()))
    }

    /// List pools with allocation stats.
    pub async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let output = Command::new("zpool")
            .args([
                "list", "-H", "-p", "-o", "name,alloc,size,free,fragmentation,dedupratio",
            ])
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("Failed to run zpool list: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "zpool list failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_pool_list(&stdout))
    }
}

pub(crate) fn parse_dataset_list(stdout: &str) -> Vec<DatasetInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split('\t').collect();
            if parts.len() >= 6 {
                Some(DatasetInfo {
                    name: parts[0].to_string(),
                    guid: parts[1].to_string(),
                    used: parts[2].parse().unwrap_or(0),
                    referenced: parts[3].parse().unwrap_or(0),
                    volsize: parts[4].parse().ok(),
                    mountpoint: match parts[5] {
                        "-" | "none" | "legacy" => None,
                        mp => Some(mp.to_string()),
                    },
                })
            } else {
                None
            }
        })
        .collect()
}

pub(crate) fn parse_snapshot_list(stdout: &str) -> Vec<SnapshotInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split('\t').collect();
            if parts.len() >= 4 {
                let full_name = parts[0].to_string();
                let (dataset, name) = full_name.split_once('@')?;
                Some(SnapshotInfo {
                    dataset: dataset.to_string(),
                    name: name.to_string(),
                    full_name: full_name.clone(),
                    guid: parts[1].to_string(),
                    used: parts[2].parse().unwrap_or(0),
                    creation: parts[3].parse().unwrap_or(0),
                })
            } else {
                None
            }
        })
        .collect()
}

pub(crate) fn parse_send_size(output: &str) -> Option<u64> {
    // `zfs send -nvP` emits a final line of the form `size\t<bytes>`.
    output.lines().rev().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("size"), Some(bytes)) => bytes.parse().ok(),
            _ => None,
        }
    })
}

pub(crate) fn parse_pool_list(stdout: &str) -> Vec<PoolInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.split('\t').collect();
            if parts.len() >= 6 {
                Some(PoolInfo {
                    name: parts[0].to_string(),
                    alloc: parts[1].parse().unwrap_or(0),
                    size: parts[2].parse().unwrap_or(0),
                    free: parts[3].parse().unwrap_or(0),
                    fragmentation: parts[4].to_string(),
                    dedup_ratio: parts[5].to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Pick the newest snapshot name carrying the replication prefix that is
/// present on both sides (exact name match). Returns `None` when an
/// initial full send is needed.
pub fn common_base_snapshot(source: &[SnapshotInfo], dest: &[SnapshotInfo]) -> Option<String> {
    let dest_names: std::collections::HashSet<&str> = dest
        .iter()
        .filter(|s| s.name.starts_with(REPL_SNAPSHOT_PREFIX))
        .map(|s| s.name.as_str())
        .collect();

    source
        .iter()
        .filter(|s| s.name.starts_with(REPL_SNAPSHOT_PREFIX))
        .filter(|s| dest_names.contains(s.name.as_str()))
        .max_by_key(|s| (s.creation, s.name.clone()))
        .map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_list() {
        let out = "tank/ds1\t1234567890\t1048576\t524288\t-\t/tank/ds1\n\
                   tank/vol0\t987654\t2097152\t2097152\t10737418240\t-\n";
        let datasets = parse_dataset_list(out);
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].name, "tank/ds1");
        assert_eq!(datasets[0].used, 1048576);
        assert_eq!(datasets[0].volsize, None);
        assert_eq!(datasets[0].mountpoint.as_deref(), Some("/tank/ds1"));
        assert_eq!(datasets[1].volsize, Some(10737418240));
        assert!(datasets[1].mountpoint.is_none());
    }

    #[test]
    fn test_parse_snapshot_list() {
        let out = "tank/ds1@sylve_repl_1700000000000\t111\t0\t1700000000\n\
                   tank/ds1@manual\t222\t8192\t1700000100\n";
        let snaps = parse_snapshot_list(out);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].dataset, "tank/ds1");
        assert_eq!(snaps[0].name, "sylve_repl_1700000000000");
        assert_eq!(snaps[1].creation, 1700000100);
    }

    #[test]
    fn test_parse_send_size() {
        let out = "full\ttank/ds1@sylve_repl_1700000000000\t123456789\nsize\t123456789\n";
        assert_eq!(parse_send_size(out), Some(123456789));

        let incr = "incremental\tsylve_repl_1\ttank/ds1@sylve_repl_2\t4096\nsize\t4096\n";
        assert_eq!(parse_send_size(incr), Some(4096));

        assert_eq!(parse_send_size("no size here\n"), None);
    }

    #[test]
    fn test_common_base_picks_newest_shared() {
        let snap = |name: &str, creation: i64| SnapshotInfo {
            full_name: format!("tank/ds@{}", name),
            dataset: "tank/ds".to_string(),
            name: name.to_string(),
            guid: String::new(),
            used: 0,
            creation,
        };

        let source = vec![
            snap("sylve_repl_100", 100),
            snap("sylve_repl_200", 200),
            snap("sylve_repl_300", 300),
            snap("manual", 400),
        ];
        let dest = vec![snap("sylve_repl_100", 100), snap("sylve_repl_200", 200)];

        assert_eq!(
            common_base_snapshot(&source, &dest),
            Some("sylve_repl_200".to_string())
        );

        // No shared replication snapshot: initial full send
        let dest = vec![snap("manual", 400)];
        assert_eq!(common_base_snapshot(&source, &dest), None);
    }

    #[test]
    fn test_parse_pool_list() {
        let out = "tank\t5000000\t10000000\t5000000\t3\t1.00\n";
        let pools = parse_pool_list(out);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, "tank");
        assert_eq!(pools[0].free, 5000000);
    }
}

//! VM snapshot and rollback.
//!
//! ZFS-only: every root dataset of the VM is snapshotted under one
//! `sylve_<token>_<unixMillis>` name, with a `.sylve/` side-car carrying
//! the VM model (plus nvram/TPM/log files) written immediately before, so
//! ZFS atomicity covers the metadata for free. Rollback stops the guest,
//! rolls children before parents, restores the side-car, reconciles the
//! stored model and prunes newer snapshot records.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use sylve_common::guest::Vm;
use sylve_common::model::{GuestType, VmSnapshotRecord};
use sylve_common::{Error, Result};
use tracing::{info, warn};

use crate::db::{self, Database};
use crate::driver::{stop_and_wait, GuestDriver};
use crate::zfs::ZfsManager;

const SIDECAR_DIR: &str = ".sylve";
const ROLLBACK_STOP_WAIT: Duration = Duration::from_secs(45);

/// New snapshot name: `sylve_<token>_<unixMillis>`.
pub fn new_snapshot_name() -> String {
    let mut token = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut token);
    format!("sylve_{}_{}", hex::encode(token), Utc::now().timestamp_millis())
}

/// Children before parents: descending dataset name sorts
/// `tank/a/b@s` ahead of `tank/a@s`.
pub fn sort_rollback_targets(mut targets: Vec<String>) -> Vec<String> {
    targets.sort_by(|a, b| b.cmp(a));
    targets
}

/// Merge a side-car VM model back over the current record: identity
/// (`id`, `rid`) is preserved, host-reality conflicts become structured
/// warnings instead of hard failures.
pub fn reconcile_vm_model(current: &Vm, sidecar: &Vm, host_cpus: u32) -> (Vm, Vec<String>) {
    let mut warnings = Vec::new();
    let mut merged = sidecar.clone();
    merged.id = current.id;
    merged.rid = current.rid;

    let valid_pins: Vec<u32> = merged
        .cpu_pinning
        .iter()
        .copied()
        .filter(|cpu| {
            if *cpu >= host_cpus {
                warnings.push(format!(
                    "cpu pin {} exceeds host cpu count {}; dropped",
                    cpu, host_cpus
                ));
                false
            } else {
                true
            }
        })
        .collect();
    merged.cpu_pinning = valid_pins;

    let present: std::collections::HashSet<&String> = current.pci_devices.iter().collect();
    let kept: Vec<String> = merged
        .pci_devices
        .iter()
        .filter(|dev| {
            if present.contains(dev) {
                true
            } else {
                warnings.push(format!(
                    "pci device {} from snapshot is no longer attached; dropped",
                    dev
                ));
                false
            }
        })
        .cloned()
        .collect();
    merged.pci_devices = kept;

    let current_switches: std::collections::HashSet<&String> =
        current.networks.iter().map(|n| &n.switch_name).collect();
    for network in &merged.networks {
        if !current_switches.contains(&network.switch_name) {
            warnings.push(format!(
                "network switch {} referenced by snapshot is not configured",
                network.switch_name
            ));
        }
    }

    (merged, warnings)
}

fn sidecar_path(mountpoint: &str) -> PathBuf {
    Path::new(mountpoint).join(SIDECAR_DIR)
}

async fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let target = dst.join(entry.file_name());
        if entry.file_type().await?.is_dir() {
            Box::pin(copy_dir(&entry.path(), &target)).await?;
        } else {
            tokio::fs::copy(entry.path(), target).await?;
        }
    }
    Ok(())
}

/// Guest state side files worth carrying into the snapshot: UEFI vars,
/// TPM state and the console log.
fn is_aux_file(name: &str) -> bool {
    name.ends_with("_vars.fd") || name == "vm.log"
}

async fn copy_aux_files(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        return Ok(());
    }
    tokio::fs::create_dir_all(to).await?;
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await?.is_dir() {
            if name == "tpm" {
                copy_dir(&entry.path(), &to.join("tpm")).await?;
            }
        } else if is_aux_file(&name) {
            tokio::fs::copy(entry.path(), to.join(&name)).await?;
        }
    }
    Ok(())
}

/// Write the side-car into a root dataset's mountpoint.
pub async fn write_sidecar(mountpoint: &str, vm: &Vm, guest_state_dir: &Path) -> Result<()> {
    let dir = sidecar_path(mountpoint);
    tokio::fs::create_dir_all(&dir).await?;
    let payload = serde_json::to_vec_pretty(vm)?;
    tokio::fs::write(dir.join("vm.json"), payload).await?;
    copy_aux_files(&guest_state_dir.join(vm.rid.to_string()), &dir).await?;
    Ok(())
}

/// Read the side-car model back out of a rolled-back mountpoint.
pub async fn read_sidecar(mountpoint: &str) -> Result<Vm> {
    let path = sidecar_path(mountpoint).join("vm.json");
    let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::Fatal(format!("snapshot side-car {} unreadable: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Copy the aux files from the side-car back into the guest state dir.
pub async fn restore_sidecar_files(
    mountpoint: &str,
    rid: u32,
    guest_state_dir: &Path,
) -> Result<()> {
    let dir = sidecar_path(mountpoint);
    if !dir.exists() {
        return Ok(());
    }
    let state_dir = guest_state_dir.join(rid.to_string());
    tokio::fs::create_dir_all(&state_dir).await?;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await?.is_dir() {
            if name == "tpm" {
                copy_dir(&entry.path(), &state_dir.join("tpm")).await?;
            }
        } else if is_aux_file(&name) {
            tokio::fs::copy(entry.path(), state_dir.join(&name)).await?;
        }
    }
    Ok(())
}

/// VM snapshot manager
pub struct VmSnapshotManager {
    db: Arc<Database>,
    zfs: Arc<ZfsManager>,
    driver: Arc<dyn GuestDriver>,
    guest_state_dir: PathBuf,
    host_cpus: u32,
}

impl VmSnapshotManager {
    pub fn new(
        db: Arc<Database>,
        zfs: Arc<ZfsManager>,
        driver: Arc<dyn GuestDriver>,
        guest_state_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            zfs,
            driver,
            guest_state_dir,
            host_cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }

    pub async fn list_snapshots(&self, vm_id: i64) -> Result<Vec<VmSnapshotRecord>> {
        db::vm_snapshots::list_for_vm(self.db.pool(), vm_id).await
    }

    pub async fn get_snapshot(&self, id: i64) -> Result<Option<VmSnapshotRecord>> {
        db::vm_snapshots::get(self.db.pool(), id).await
    }

    /// Create a snapshot of every root dataset of the VM. Guest disk
    /// consistency is the guest's problem; no quiesce. Any failure
    /// destroys the snapshots already created in this call.
    pub async fn create_snapshot(
        &self,
        rid: u32,
        name: &str,
        description: &str,
    ) -> Result<VmSnapshotRecord> {
        let vm = db::guests::get_vm(self.db.pool(), rid)
            .await?
            .ok_or_else(|| Error::not_found("vm_not_found", format!("vm {} not found", rid)))?;

        if vm.has_unsnapshotable_storage() {
            return Err(Error::validation(
                "vm has raw disk images outside ZFS; cannot snapshot",
            ));
        }
        let roots = vm.root_datasets();
        if roots.is_empty() {
            return Err(Error::validation("vm has no ZFS root datasets"));
        }

        let snapshot_name = new_snapshot_name();
        info!("Creating VM snapshot {} for vm {}", snapshot_name, rid);

        // Side-cars first, so the snapshot captures them.
        for root in &roots {
            if let Some(mountpoint) = self.zfs.mountpoint(root).await? {
                write_sidecar(&mountpoint, &vm, &self.guest_state_dir).await?;
            }
        }

        let mut created: Vec<String> = Vec::new();
        for root in &roots {
            let full = format!("{}@{}", root, snapshot_name);
            match self.zfs.snapshot(&full, true).await {
                Ok(()) => created.push(full),
                Err(e) => {
                    for done in &created {
                        if let Err(undo) = self.zfs.destroy_if_exists(done, true).await {
                            warn!("Failed to undo partial snapshot {}: {}", done, undo);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let parent_snapshot_id = db::vm_snapshots::list_for_vm(self.db.pool(), vm.id)
            .await?
            .last()
            .map(|s| s.id);

        let mut record = VmSnapshotRecord {
            id: 0,
            vm_id: vm.id,
            rid,
            parent_snapshot_id,
            name: name.to_string(),
            description: description.to_string(),
            snapshot_name,
            root_datasets: roots,
            created_at: Utc::now(),
        };
        record.id = db::vm_snapshots::insert(self.db.pool(), &record).await?;
        Ok(record)
    }

    /// Roll the VM back to a snapshot. Returns reconciliation warnings.
    pub async fn rollback(
        &self,
        snapshot_id: i64,
        destroy_more_recent: bool,
    ) -> Result<Vec<String>> {
        let record = self
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("snapshot_not_found", format!("snapshot {}", snapshot_id))
            })?;
        let current = db::guests::get_vm(self.db.pool(), record.rid)
            .await?
            .ok_or_else(|| {
                Error::not_found("vm_not_found", format!("vm {} not found", record.rid))
            })?;

        let was_running = stop_and_wait(
            self.driver.as_ref(),
            GuestType::Vm,
            record.rid,
            ROLLBACK_STOP_WAIT,
        )
        .await?;

        // Collect every dataset carrying the snapshot, children first.
        let mut targets = Vec::new();
        for root in &record.root_datasets {
            let snapshots = self.zfs.list_snapshots(root, true).await?;
            targets.extend(
                snapshots
                    .into_iter()
                    .filter(|s| s.name == record.snapshot_name)
                    .map(|s| s.full_name),
            );
        }
        if targets.is_empty() {
            return Err(Error::not_found(
                "snapshot_not_found",
                format!("no datasets carry snapshot {}", record.snapshot_name),
            ));
        }
        let targets = sort_rollback_targets(targets);

        info!(
            "Rolling back vm {} to {} across {} datasets",
            record.rid,
            record.snapshot_name,
            targets.len()
        );
        for target in &targets {
            self.zfs.rollback(target, destroy_more_recent).await?;
        }

        // Side-car restore + model reconciliation from the first root
        // that has one.
        let mut warnings = Vec::new();
        let mut reconciled = None;
        for root in &record.root_datasets {
            if let Some(mountpoint) = self.zfs.mountpoint(root).await? {
                restore_sidecar_files(&mountpoint, record.rid, &self.guest_state_dir).await?;
                if reconciled.is_none() {
                    let sidecar = read_sidecar(&mountpoint).await?;
                    let (merged, mut merge_warnings) =
                        reconcile_vm_model(&current, &sidecar, self.host_cpus);
                    warnings.append(&mut merge_warnings);
                    reconciled = Some(merged);
                }
            }
        }
        if let Some(merged) = &reconciled {
            db::guests::upsert_vm(self.db.pool(), merged).await?;
            self.driver.redefine_vm(merged).await?;
        }

        db::vm_snapshots::prune_newer(
            self.db.pool(),
            record.vm_id,
            record.created_at,
            record.id,
        )
        .await?;

        if was_running {
            self.driver.start(GuestType::Vm, record.rid).await?;
        }

        Ok(warnings)
    }

    /// Destroy the snapshot on every root dataset (tolerating already
    /// missing ones), then drop the record.
    pub async fn delete_snapshot(&self, snapshot_id: i64) -> Result<()> {
        let record = self
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("snapshot_not_found", format!("snapshot {}", snapshot_id))
            })?;

        for root in &record.root_datasets {
            let full = format!("{}@{}", root, record.snapshot_name);
            self.zfs.destroy_if_exists(&full, true).await?;
        }

        db::vm_snapshots::delete(self.db.pool(), snapshot_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sylve_common::guest::{GuestNetwork, GuestStorage, StorageKind};

    fn vm(rid: u32) -> Vm {
        Vm {
            id: 1,
            rid,
            name: "web".to_string(),
            cpu_cores: 2,
            memory_mb: 2048,
            cpu_pinning: vec![0, 1],
            pci_devices: vec!["ppt0".to_string()],
            storages: vec![GuestStorage {
                pool: "tank".to_string(),
                kind: StorageKind::Zvol,
                dataset_name: format!("sylve/virtual-machines/{}/disk0", rid),
                size: 10 << 30,
                boot_order: 0,
            }],
            networks: vec![GuestNetwork {
                switch_name: "public".to_string(),
                mac: "58:9c:fc:00:00:01".to_string(),
                emulation: "virtio".to_string(),
            }],
            cloud_init: None,
        }
    }

    #[test]
    fn test_snapshot_name_shape() {
        let name = new_snapshot_name();
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sylve");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[2].parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_rollback_target_ordering_children_first() {
        let targets = vec![
            "tank/sylve/virtual-machines/100@s".to_string(),
            "tank/sylve/virtual-machines/100/disk0@s".to_string(),
            "tank/sylve/virtual-machines/100/disk0/nested@s".to_string(),
        ];
        let sorted = sort_rollback_targets(targets);
        assert_eq!(sorted[0], "tank/sylve/virtual-machines/100/disk0/nested@s");
        assert_eq!(sorted[2], "tank/sylve/virtual-machines/100@s");
    }

    #[test]
    fn test_reconcile_preserves_identity_and_warns() {
        let mut current = vm(100);
        current.id = 42;
        current.pci_devices = vec!["ppt1".to_string()];
        current.networks[0].switch_name = "dmz".to_string();

        let mut sidecar = vm(100);
        sidecar.id = 7; // stale identity in the side-car
        sidecar.cpu_pinning = vec![0, 63];

        let (merged, warnings) = reconcile_vm_model(&current, &sidecar, 4);

        assert_eq!(merged.id, 42);
        assert_eq!(merged.rid, 100);
        // Pin 63 dropped, pin 0 kept
        assert_eq!(merged.cpu_pinning, vec![0]);
        // ppt0 from the snapshot is gone on the host
        assert!(merged.pci_devices.is_empty());
        // Switch mismatch warned but network kept
        assert_eq!(merged.networks.len(), 1);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("cpu pin 63")));
        assert!(warnings.iter().any(|w| w.contains("ppt0")));
        assert!(warnings.iter().any(|w| w.contains("switch public")));
    }

    #[tokio::test]
    async fn test_sidecar_write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mountpoint = dir.path().join("dataset");
        tokio::fs::create_dir_all(&mountpoint).await.unwrap();

        let state_dir = dir.path().join("guests");
        let vm_state = state_dir.join("100");
        tokio::fs::create_dir_all(&vm_state).await.unwrap();
        tokio::fs::write(vm_state.join("uefi_vars.fd"), b"nvram")
            .await
            .unwrap();
        tokio::fs::write(vm_state.join("vm.log"), b"log line")
            .await
            .unwrap();
        tokio::fs::write(vm_state.join("disk.img"), b"not copied")
            .await
            .unwrap();

        let model = vm(100);
        write_sidecar(mountpoint.to_str().unwrap(), &model, &state_dir)
            .await
            .unwrap();

        let sidecar = mountpoint.join(".sylve");
        assert!(sidecar.join("vm.json").exists());
        assert!(sidecar.join("uefi_vars.fd").exists());
        assert!(sidecar.join("vm.log").exists());
        assert!(!sidecar.join("disk.img").exists());

        let back = read_sidecar(mountpoint.to_str().unwrap()).await.unwrap();
        assert_eq!(back, model);

        // Restore into a fresh guest state dir
        let restore_dir = dir.path().join("guests-restored");
        restore_sidecar_files(mountpoint.to_str().unwrap(), 100, &restore_dir)
            .await
            .unwrap();
        assert!(restore_dir.join("100").join("uefi_vars.fd").exists());
    }
}

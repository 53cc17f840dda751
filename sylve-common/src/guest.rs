//! Guest (VM and jail) models.
//!
//! These are the shapes dumped into `.sylve/vm.json` and `.sylve/jail.json`
//! side-cars at snapshot time, and the shapes reconciled back into the
//! store on rollback/restore. Field names are stable wire format.

use serde::{Deserialize, Serialize};

/// Storage kind backing one guest disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageKind {
    Raw,
    Zvol,
    DiskImage,
}

/// One storage attachment of a guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestStorage {
    pub pool: String,
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub dataset_name: String,
    pub size: u64,
    pub boot_order: u32,
}

impl GuestStorage {
    /// Full dataset path (`<pool>/<datasetName>`). Empty dataset names
    /// (raw images on non-ZFS paths) yield `None`.
    pub fn dataset(&self) -> Option<String> {
        if self.dataset_name.is_empty() {
            None
        } else {
            Some(format!("{}/{}", self.pool, self.dataset_name))
        }
    }
}

/// One network attachment of a guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestNetwork {
    pub switch_name: String,
    pub mac: String,
    #[serde(default)]
    pub emulation: String,
}

/// Cloud-init payloads attached to a VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloudInit {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub network: String,
}

/// Virtual machine model, as persisted and as dumped into `vm.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: i64,
    /// Resource ID; the stable identity used for placement and datasets.
    pub rid: u32,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_pinning: Vec<u32>,
    #[serde(default)]
    pub pci_devices: Vec<String>,
    pub storages: Vec<GuestStorage>,
    pub networks: Vec<GuestNetwork>,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
}

/// Jail mount entry recorded in `jail.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JailMount {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Jail model, as persisted and as dumped into `jail.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Jail {
    pub id: i64,
    pub rid: u32,
    pub name: String,
    pub root_dataset: String,
    #[serde(default)]
    pub storages: Vec<GuestStorage>,
    #[serde(default)]
    pub networks: Vec<GuestNetwork>,
    #[serde(default)]
    pub mounts: Vec<JailMount>,
}

impl Vm {
    /// Root datasets holding this VM's storage, one per pool:
    /// `<pool>/sylve/virtual-machines/<rid>`.
    pub fn root_datasets(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .storages
            .iter()
            .filter(|s| s.kind != StorageKind::Raw || !s.dataset_name.is_empty())
            .map(|s| format!("{}/sylve/virtual-machines/{}", s.pool, self.rid))
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    /// Disks that cannot be snapshotted (raw images hosted outside ZFS).
    pub fn has_unsnapshotable_storage(&self) -> bool {
        self.storages
            .iter()
            .any(|s| s.kind == StorageKind::Raw && s.dataset_name.is_empty())
    }
}

impl Jail {
    pub fn root_dataset_for_pool(pool: &str, rid: u32) -> String {
        format!("{}/sylve/jails/{}", pool, rid)
    }
}

/// Guest run state reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Running,
    Shutoff,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(pool: &str, rid: u32) -> GuestStorage {
        GuestStorage {
            pool: pool.to_string(),
            kind: StorageKind::Zvol,
            dataset_name: format!("sylve/virtual-machines/{}/disk0", rid),
            size: 10 << 30,
            boot_order: 0,
        }
    }

    #[test]
    fn test_root_datasets_dedup_per_pool() {
        let vm = Vm {
            id: 1,
            rid: 104,
            name: "web".to_string(),
            cpu_cores: 2,
            memory_mb: 2048,
            cpu_pinning: vec![],
            pci_devices: vec![],
            storages: vec![storage("tank", 104), storage("tank", 104), storage("fast", 104)],
            networks: vec![],
            cloud_init: None,
        };

        let roots = vm.root_datasets();
        assert_eq!(
            roots,
            vec![
                "fast/sylve/virtual-machines/104".to_string(),
                "tank/sylve/virtual-machines/104".to_string(),
            ]
        );
    }

    #[test]
    fn test_unsnapshotable_raw_disk() {
        let mut vm = Vm {
            id: 1,
            rid: 7,
            name: "legacy".to_string(),
            cpu_cores: 1,
            memory_mb: 512,
            cpu_pinning: vec![],
            pci_devices: vec![],
            storages: vec![GuestStorage {
                pool: String::new(),
                kind: StorageKind::Raw,
                dataset_name: String::new(),
                size: 0,
                boot_order: 0,
            }],
            networks: vec![],
            cloud_init: None,
        };
        assert!(vm.has_unsnapshotable_storage());

        vm.storages = vec![storage("tank", 7)];
        assert!(!vm.has_unsnapshotable_storage());
    }

    #[test]
    fn test_vm_json_round_trip() {
        let vm = Vm {
            id: 9,
            rid: 200,
            name: "db".to_string(),
            cpu_cores: 4,
            memory_mb: 8192,
            cpu_pinning: vec![0, 1],
            pci_devices: vec!["ppt0".to_string()],
            storages: vec![storage("tank", 200)],
            networks: vec![GuestNetwork {
                switch_name: "public".to_string(),
                mac: "58:9c:fc:00:00:01".to_string(),
                emulation: "virtio".to_string(),
            }],
            cloud_init: Some(CloudInit::default()),
        };

        let json = serde_json::to_string_pretty(&vm).unwrap();
        let back: Vm = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vm);
    }
}

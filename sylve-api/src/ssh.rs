//! SSH plumbing for backup targets and cluster peers.
//!
//! Connections are short-lived: one dial per job run keeps the failure
//! blast radius local. Key material for backup targets lives in a private
//! secret directory (0700, files 0600, written via temp-file + rename)
//! and is re-hydrated from the stored key when the file is missing.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use sylve_common::model::{BackupTarget, ClusterSshIdentity};
use sylve_common::{Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// A resolved SSH destination with its key material on disk.
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: String,
    pub connect_timeout_secs: u64,
}

impl SshEndpoint {
    pub fn from_target(target: &BackupTarget, connect_timeout_secs: u64) -> Self {
        Self {
            host: target.ssh_host.clone(),
            port: target.ssh_port,
            user: target.ssh_user.clone(),
            key_path: target.ssh_key_path.clone(),
            connect_timeout_secs,
        }
    }

    /// Peer-to-peer endpoint for replication sends; authorization comes
    /// from the replicated cluster SSH identities.
    pub fn for_peer(host: impl Into<String>, key_path: impl Into<String>, connect_timeout_secs: u64) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: "root".to_string(),
            key_path: key_path.into(),
            connect_timeout_secs,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.key_path.is_empty() {
            args.push("-i".to_string());
            args.push(self.key_path.clone());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=accept-new".to_string());
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout_secs));
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    /// Build an ssh command executing `remote_cmd` on the endpoint.
    pub fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args());
        cmd.arg(remote_cmd);
        cmd
    }

    /// Run a remote command and return its stdout.
    pub async fn run(&self, remote_cmd: &str) -> Result<String> {
        let output = self
            .command(remote_cmd)
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("Failed to spawn ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ssh_error(stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Dial the endpoint and run a no-op to prove reachability and auth.
    pub async fn check(&self) -> Result<()> {
        self.run("true").await.map(|_| ())
    }
}

/// Classify SSH stderr into retryable vs terminal failures. Connection
/// resets and timeouts retry with backoff; authentication problems fail
/// fast.
pub fn classify_ssh_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let transient = [
        "connection reset",
        "connection refused",
        "connection closed",
        "timed out",
        "timeout",
        "temporary failure",
        "broken pipe",
    ];
    let fatal_auth = [
        "permission denied",
        "authentication",
        "host key verification failed",
        "no supported authentication",
    ];

    if fatal_auth.iter().any(|m| lower.contains(m)) {
        Error::Fatal(format!("ssh authentication failed: {}", stderr))
    } else if transient.iter().any(|m| lower.contains(m)) {
        Error::Transient(format!("ssh: {}", stderr))
    } else {
        Error::Fatal(format!("ssh: {}", stderr))
    }
}

/// Private secret directory for backup-target key material.
pub struct SecretStore {
    dir: PathBuf,
}

impl SecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn key_path(&self, target_id: i64) -> PathBuf {
        self.dir.join(format!("target-{}.key", target_id))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        set_mode(&self.dir, 0o700).await?;
        Ok(())
    }

    /// Write key material via temp-file + rename, mode 0600.
    pub async fn write_key(&self, target_id: i64, material: &str) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let path = self.key_path(target_id);
        let tmp = self.dir.join(format!(".target-{}.key.tmp", target_id));

        tokio::fs::write(&tmp, material.as_bytes()).await?;
        set_mode(&tmp, 0o600).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("Wrote SSH key material for target {} to {:?}", target_id, path);
        Ok(path)
    }

    /// Make sure the target's key file exists and matches the stored
    /// material; the `ssh_key` field is the re-hydration source when the
    /// file is missing or rotated.
    pub async fn ensure_target_key(&self, target: &BackupTarget) -> Result<PathBuf> {
        let path = if target.ssh_key_path.is_empty() {
            self.key_path(target.id)
        } else {
            PathBuf::from(&target.ssh_key_path)
        };

        let on_disk = tokio::fs::read_to_string(&path).await.ok();
        if on_disk.as_deref() != Some(target.ssh_key.as_str()) {
            return self.write_key(target.id, &target.ssh_key).await;
        }
        Ok(path)
    }

    /// Remove on-disk key material when its target is deleted.
    pub async fn remove_key(&self, target_id: i64, key_path: &str) -> Result<()> {
        let path = if key_path.is_empty() {
            self.key_path(target_id)
        } else {
            PathBuf::from(key_path)
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove key material {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Rewrite an authorized_keys file from the replicated identity table,
/// via temp-file + rename. Lines outside the sylve marker block survive.
pub async fn reconcile_authorized_keys(
    path: &Path,
    identities: &[ClusterSshIdentity],
) -> Result<()> {
    const BEGIN: &str = "# BEGIN sylve cluster identities";
    const END: &str = "# END sylve cluster identities";

    let existing = tokio::fs::read_to_string(path).await.unwrap_or_default();

    let mut kept = Vec::new();
    let mut in_block = false;
    for line in existing.lines() {
        if line == BEGIN {
            in_block = true;
            continue;
        }
        if line == END {
            in_block = false;
            continue;
        }
        if !in_block {
            kept.push(line.to_string());
        }
    }

    let mut out = kept.join("\n");
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(BEGIN);
    out.push('\n');
    for identity in identities {
        out.push_str(&format!("{} sylve-{}\n", identity.public_key.trim(), identity.node_id));
    }
    out.push_str(END);
    out.push('\n');

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("sylve.tmp");
    tokio::fs::write(&tmp, out.as_bytes()).await?;
    set_mode(&tmp, 0o600).await?;
    tokio::fs::rename(&tmp, path).await?;

    info!("Reconciled {} cluster identities into {:?}", identities.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(classify_ssh_error("Connection reset by peer").is_transient());
        assert!(classify_ssh_error("ssh: connect to host x port 22: Operation timed out").is_transient());
        assert!(!classify_ssh_error("root@host: Permission denied (publickey)").is_transient());
        assert!(!classify_ssh_error("Host key verification failed.").is_transient());
        // Unknown failures are terminal, not retried forever
        assert!(!classify_ssh_error("cannot receive new filesystem stream").is_transient());
    }

    #[tokio::test]
    async fn test_secret_store_write_and_rehydrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path().join("secrets"));

        let target = BackupTarget {
            id: 3,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY MATERIAL v1".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp".to_string(),
            description: String::new(),
            enabled: true,
        };

        let path = store.ensure_target_key(&target).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "KEY MATERIAL v1"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Rotated material re-hydrates the file
        let mut rotated = target.clone();
        rotated.ssh_key = "KEY MATERIAL v2".to_string();
        rotated.ssh_key_path = path.to_string_lossy().to_string();
        let path2 = store.ensure_target_key(&rotated).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&path2).await.unwrap(),
            "KEY MATERIAL v2"
        );

        store
            .remove_key(rotated.id, &rotated.ssh_key_path)
            .await
            .unwrap();
        assert!(!path2.exists());
    }

    #[tokio::test]
    async fn test_reconcile_authorized_keys_preserves_foreign_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(&path, "ssh-ed25519 AAAA... operator@laptop\n")
            .await
            .unwrap();

        let identities = vec![
            ClusterSshIdentity {
                node_id: "n1".to_string(),
                public_key: "ssh-ed25519 BBBB...".to_string(),
            },
            ClusterSshIdentity {
                node_id: "n2".to_string(),
                public_key: "ssh-ed25519 CCCC...".to_string(),
            },
        ];

        reconcile_authorized_keys(&path, &identities).await.unwrap();
        reconcile_authorized_keys(&path, &identities).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("operator@laptop"));
        assert_eq!(contents.matches("BBBB").count(), 1);
        assert_eq!(contents.matches("BEGIN sylve cluster identities").count(), 1);
    }
}

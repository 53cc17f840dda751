//! Guest driver seam.
//!
//! The VM/jail lifecycle belongs to external drivers (bhyve via the VM
//! manager, jail(8) for jails); the data-protection engines only need
//! state, stop/kill/start and domain redefinition. The shell driver is
//! the production implementation; tests substitute their own.

#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use sylve_common::guest::{GuestState, Vm};
use sylve_common::model::GuestType;
use sylve_common::{Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

#[async_trait]
pub trait GuestDriver: Send + Sync {
    async fn state(&self, guest_type: GuestType, rid: u32) -> Result<GuestState>;
    /// Graceful shutdown request; returns immediately.
    async fn stop(&self, guest_type: GuestType, rid: u32) -> Result<()>;
    /// Hard stop.
    async fn kill(&self, guest_type: GuestType, rid: u32) -> Result<()>;
    async fn start(&self, guest_type: GuestType, rid: u32) -> Result<()>;
    /// Rebuild the hypervisor-side definition after a rollback changed
    /// the on-disk model.
    async fn redefine_vm(&self, vm: &Vm) -> Result<()>;
}

/// Driver shelling out to the host tooling.
pub struct ShellGuestDriver {}

impl ShellGuestDriver {
    pub fn new() -> Self {
        Self {}
    }

    async fn run(program: &str, args: &[String]) -> Result<std::process::Output> {
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("Failed to run {}: {}", program, e)))
    }

    fn guest_name(guest_type: GuestType, rid: u32) -> String {
        match guest_type {
            GuestType::Vm => format!("sylve-vm-{}", rid),
            GuestType::Jail => format!("sylve-jail-{}", rid),
        }
    }
}

#[async_trait]
impl GuestDriver for ShellGuestDriver {
    async fn state(&self, guest_type: GuestType, rid: u32) -> Result<GuestState> {
        let name = Self::guest_name(guest_type, rid);
        let output = match guest_type {
            GuestType::Vm => {
                // A live bhyve guest has a /dev/vmm node
                let path = format!("/dev/vmm/{}", name);
                return Ok(if std::path::Path::new(&path).exists() {
                    GuestState::Running
                } else {
                    GuestState::Shutoff
                });
            }
            GuestType::Jail => Self::run("jls", &["-j".to_string(), name]).await?,
        };
        Ok(if output.status.success() {
            GuestState::Running
        } else {
            GuestState::Shutoff
        })
    }

    async fn stop(&self, guest_type: GuestType, rid: u32) -> Result<()> {
        let name = Self::guest_name(guest_type, rid);
        info!("Stopping {} {}", guest_type, rid);
        let output = match guest_type {
            GuestType::Vm => {
                Self::run(
                    "bhyvectl",
                    &[format!("--vm={}", name), "--force-poweroff".to_string()],
                )
                .await?
            }
            GuestType::Jail => Self::run("jail", &["-r".to_string(), name]).await?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "Failed to stop {} {}: {}",
                guest_type,
                rid,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn kill(&self, guest_type: GuestType, rid: u32) -> Result<()> {
        let name = Self::guest_name(guest_type, rid);
        warn!("Killing {} {}", guest_type, rid);
        let output = match guest_type {
            GuestType::Vm => {
                Self::run("bhyvectl", &[format!("--vm={}", name), "--destroy".to_string()])
                    .await?
            }
            GuestType::Jail => {
                Self::run("jail", &["-R".to_string(), name]).await?
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "Failed to kill {} {}: {}",
                guest_type,
                rid,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn start(&self, guest_type: GuestType, rid: u32) -> Result<()> {
        let name = Self::guest_name(guest_type, rid);
        info!("Starting {} {}", guest_type, rid);
        let output = match guest_type {
            GuestType::Vm => Self::run("sylve-vmctl", &["start".to_string(), name]).await?,
            GuestType::Jail => Self::run("jail", &["-c".to_string(), name]).await?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "Failed to start {} {}: {}",
                guest_type,
                rid,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn redefine_vm(&self, vm: &Vm) -> Result<()> {
        // The VM manager regenerates its domain definition from the store;
        // poke it through the control tool.
        let output =
            Self::run("sylve-vmctl", &["redefine".to_string(), vm.rid.to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "Failed to redefine vm {}: {}",
                vm.rid,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Stop a guest and wait for `shutoff`, escalating to a kill when the
/// wait expires. Returns whether the guest was running beforehand.
pub async fn stop_and_wait(
    driver: &dyn GuestDriver,
    guest_type: GuestType,
    rid: u32,
    wait: Duration,
) -> Result<bool> {
    if driver.state(guest_type, rid).await? != GuestState::Running {
        return Ok(false);
    }

    driver.stop(guest_type, rid).await?;

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if driver.state(guest_type, rid).await? == GuestState::Shutoff {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "{} {} did not shut down within {:?}, killing",
                guest_type, rid, wait
            );
            driver.kill(guest_type, rid).await?;
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory driver for engine tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockGuestDriver {
        pub states: Mutex<HashMap<(GuestType, u32), GuestState>>,
        pub stops: Mutex<Vec<u32>>,
        pub kills: Mutex<Vec<u32>>,
        pub starts: Mutex<Vec<u32>>,
        pub redefines: Mutex<Vec<u32>>,
        /// When set, `stop` leaves the guest running (forces the kill path).
        pub ignore_stop: bool,
    }

    impl MockGuestDriver {
        pub fn with_state(guest_type: GuestType, rid: u32, state: GuestState) -> Self {
            let driver = Self::default();
            driver.states.lock().unwrap().insert((guest_type, rid), state);
            driver
        }
    }

    #[async_trait]
    impl GuestDriver for MockGuestDriver {
        async fn state(&self, guest_type: GuestType, rid: u32) -> Result<GuestState> {
            Ok(self
                .states
                .lock()
                .unwrap()
                .get(&(guest_type, rid))
                .copied()
                .unwrap_or(GuestState::Shutoff))
        }

        async fn stop(&self, guest_type: GuestType, rid: u32) -> Result<()> {
            self.stops.lock().unwrap().push(rid);
            if !self.ignore_stop {
                self.states
                    .lock()
                    .unwrap()
                    .insert((guest_type, rid), GuestState::Shutoff);
            }
            Ok(())
        }

        async fn kill(&self, guest_type: GuestType, rid: u32) -> Result<()> {
            self.kills.lock().unwrap().push(rid);
            self.states
                .lock()
                .unwrap()
                .insert((guest_type, rid), GuestState::Shutoff);
            Ok(())
        }

        async fn start(&self, guest_type: GuestType, rid: u32) -> Result<()> {
            self.starts.lock().unwrap().push(rid);
            self.states
                .lock()
                .unwrap()
                .insert((guest_type, rid), GuestState::Running);
            Ok(())
        }

        async fn redefine_vm(&self, vm: &Vm) -> Result<()> {
            self.redefines.lock().unwrap().push(vm.rid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockGuestDriver;
    use super::*;

    #[tokio::test]
    async fn test_stop_and_wait_not_running() {
        let driver = MockGuestDriver::default();
        let was_running = stop_and_wait(&driver, GuestType::Jail, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!was_running);
        assert!(driver.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_wait_graceful() {
        let driver = MockGuestDriver::with_state(GuestType::Jail, 5, GuestState::Running);
        let was_running = stop_and_wait(&driver, GuestType::Jail, 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(was_running);
        assert_eq!(driver.stops.lock().unwrap().as_slice(), &[5]);
        assert!(driver.kills.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_wait_escalates_to_kill() {
        let mut driver = MockGuestDriver::with_state(GuestType::Jail, 5, GuestState::Running);
        driver.ignore_stop = true;
        let was_running = stop_and_wait(&driver, GuestType::Jail, 5, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(was_running);
        assert_eq!(driver.kills.lock().unwrap().as_slice(), &[5]);
    }
}

//! Lifecycle state machine for one virtual machine.
//!
//! A [`Machine`] is a cache over the manager's authoritative state: its
//! fields may be stale until [`Machine::sync`] re-reads them. One handle per
//! logical VM; concurrent callers must serialize externally.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ssh::{Session, SshAuth, SshConfig, wait_for_ssh};
use crate::vbox::{NatRule, OptValue, Vbox};

/// Canonical name of the shell forwarding rule.
pub const SHELL_RULE: &str = "ssh";
/// Guest-side port the shell rule forwards to.
pub const SHELL_PORT: u16 = 22;

/// Host-side ports are drawn from this range when the caller does not pick
/// one.
const PORT_RANGE: Range<u16> = 10000..30000;

/// Forwarding slots are scanned in order; the first missing slot ends the
/// scan.
const FORWARD_SLOTS: usize = 100;

/// Bound on waiting for the manager to report a VM gone after poweroff.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Machine {
    name: String,
    port: Option<u16>,
    cpus: Option<u32>,
    memory: Option<u32>,
    vbox: Vbox,
    ssh: SshConfig,
}

impl Machine {
    /// Import an appliance image, producing a fresh synced handle.
    pub async fn load(vbox: Vbox, ssh: SshConfig, image: &Path) -> Result<Self> {
        let name = vbox.import_image(image).await?;
        info!("Imported {} as {name}", image.display());
        let mut machine = Self::bare(name, vbox, ssh);
        machine.sync().await?;
        Ok(machine)
    }

    /// Look up an existing catalog entry.
    pub async fn find(vbox: Vbox, ssh: SshConfig, name: &str) -> Result<Self> {
        if !vbox.vms().await?.iter().any(|n| n == name) {
            return Err(Error::NotFound {
                what: format!("virtual machine {name}"),
            });
        }
        let mut machine = Self::bare(name.to_string(), vbox, ssh);
        machine.sync().await?;
        Ok(machine)
    }

    fn bare(name: String, vbox: Vbox, ssh: SshConfig) -> Self {
        Self {
            name,
            port: None,
            cpus: None,
            memory: None,
            vbox,
            ssh,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-side forwarded shell port. Present iff the machine was observed
    /// running with an active shell forwarding rule.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn cpus(&self) -> Option<u32> {
        self.cpus
    }

    /// Memory allocation in MB.
    pub fn memory(&self) -> Option<u32> {
        self.memory
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.vbox.running().await?.iter().any(|n| n == &self.name))
    }

    pub async fn is_loaded(&self) -> Result<bool> {
        Ok(self.vbox.vms().await?.iter().any(|n| n == &self.name))
    }

    /// Boot the machine headless and wait for its shell service.
    ///
    /// Already running is a no-op. Otherwise a shell forwarding rule for
    /// `requested_port` (or a random port from the ephemeral range) is
    /// installed before boot, and an active SSH readiness probe bounded by
    /// `ssh.ready_timeout` replaces any fixed settle delay. A `None`
    /// ready timeout skips the probe.
    pub async fn start(&mut self, requested_port: Option<u16>) -> Result<()> {
        debug!("Starting {} at {:?}", self.name, self.port);
        if self.is_running().await? {
            debug!("{} already running at {:?}", self.name, self.port);
            return Ok(());
        }

        let port = match requested_port.or(self.port) {
            Some(p) => p,
            None => rand::rng().random_range(PORT_RANGE),
        };
        self.set_port(Some(port)).await?;
        self.vbox.start(&self.name).await?;

        if let Some(ready_timeout) = self.ssh.ready_timeout {
            wait_for_ssh("127.0.0.1", port, ready_timeout, self.ssh.poll_interval).await?;
        }
        info!("Started {} on port {port}", self.name);
        Ok(())
    }

    /// Power the machine off and wait until the manager stops listing it as
    /// running, so callers can rely on the shutdown having completed.
    ///
    /// Already stopped is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }
        self.vbox.poweroff(&self.name).await?;

        let now = Instant::now();
        while self.is_running().await? {
            if now.elapsed() > STOP_TIMEOUT {
                return Err(Error::Gateway {
                    command: format!("controlvm {} poweroff", self.name),
                    output: format!(
                        "{} still listed as running after {STOP_TIMEOUT:?}",
                        self.name
                    ),
                });
            }
            tokio::time::sleep(self.ssh.poll_interval).await;
        }

        self.port = None;
        info!("Stopped {}", self.name);
        Ok(())
    }

    /// Replace, install or delete the shell forwarding rule.
    ///
    /// Never leaves two rules installed: an existing rule is deleted before a
    /// new one goes in. Only legal while stopped.
    pub async fn set_port(&mut self, port: Option<u16>) -> Result<()> {
        if port == self.port {
            return Ok(());
        }
        if self.port.is_some() {
            self.vbox
                .modify(
                    &self.name,
                    vec![("natpf1".into(), OptValue::pair("delete", SHELL_RULE))],
                )
                .await?;
        }
        if let Some(port) = port {
            self.vbox
                .modify(
                    &self.name,
                    vec![(
                        "natpf1".into(),
                        OptValue::value(format!("{SHELL_RULE},tcp,,{port},,{SHELL_PORT}")),
                    )],
                )
                .await?;
        }
        self.port = port;
        Ok(())
    }

    /// Set the CPU allocation. Fails with [`Error::Precondition`] while the
    /// machine is running; the in-memory value changes only on success.
    pub async fn set_cpus(&mut self, cpus: u32) -> Result<()> {
        if self.cpus == Some(cpus) {
            return Ok(());
        }
        self.vbox
            .modify(
                &self.name,
                vec![("cpus".into(), OptValue::value(cpus.to_string()))],
            )
            .await?;
        self.cpus = Some(cpus);
        Ok(())
    }

    /// Set the memory allocation in MB. Same contract as [`Self::set_cpus`].
    pub async fn set_memory(&mut self, memory: u32) -> Result<()> {
        if self.memory == Some(memory) {
            return Ok(());
        }
        self.vbox
            .modify(
                &self.name,
                vec![("memory".into(), OptValue::value(memory.to_string()))],
            )
            .await?;
        self.memory = Some(memory);
        Ok(())
    }

    /// Stop if running, then remove from the catalog with its files. Both
    /// steps are idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        self.stop().await?;
        if self.is_loaded().await? {
            self.vbox.unregister(&self.name, true).await?;
            info!("Destroyed {}", self.name);
        }
        Ok(())
    }

    pub async fn export(&self, output: &Path) -> Result<()> {
        self.vbox.export(&self.name, output).await
    }

    /// Authoritative refresh from manager info: forwarded port, cpus and
    /// memory. Call after anything that may have changed external state.
    pub async fn sync(&mut self) -> Result<()> {
        let info = self.vbox.info(&self.name).await?;
        self.port = recover_port(&info);
        self.cpus = info.get("cpus").and_then(|v| v.parse().ok());
        self.memory = info.get("memory").and_then(|v| v.parse().ok());
        debug!(
            "Synced {}: port={:?} cpus={:?} memory={:?}",
            self.name, self.port, self.cpus, self.memory
        );
        Ok(())
    }

    /// A remote session on the forwarded shell port.
    pub fn session(&self, auth: SshAuth) -> Result<Session> {
        let port = self.port.ok_or_else(|| {
            Error::Precondition(format!(
                "{} has no forwarded shell port; start it first",
                self.name
            ))
        })?;
        Ok(Session::new("127.0.0.1", port, auth, self.ssh.clone()))
    }
}

/// Scan `Forwarding(0)..` slots for the shell rule. The first rule named
/// [`SHELL_RULE`] or forwarding to the guest shell port wins; the first
/// missing slot ends the scan.
fn recover_port(info: &HashMap<String, String>) -> Option<u16> {
    for slot in 0..FORWARD_SLOTS {
        let value = info.get(&format!("Forwarding({slot})"))?;
        let Ok(rule) = value.parse::<NatRule>() else {
            continue;
        };
        if rule.name == SHELL_RULE || rule.client_port == SHELL_PORT {
            return Some(rule.host_port);
        }
    }
    None
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::model::ReclaimConfig;
use crate::error::StackError;
use crate::orchestrator::finder::{ProcessFinder, ProcessInfo};
use crate::orchestrator::probe::PortProbe;
use crate::platform::{normalize_process_name, ProcessControl};

/// One remediation step for a port held by a zombie, least invasive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Remedy {
    /// Ask the pid to exit.
    Signal,
    /// Kill the pid outright.
    Kill,
    /// Kill the pid and everything it spawned.
    KillTree,
    /// Remove and re-add a TCP exclusion range covering the port.
    CyclePortExclusion,
    /// Reset the host's socket and TCP/IP configuration.
    ResetNetworkStack,
}

impl Remedy {
    pub const LADDER: [Remedy; 5] = [
        Remedy::Signal,
        Remedy::Kill,
        Remedy::KillTree,
        Remedy::CyclePortExclusion,
        Remedy::ResetNetworkStack,
    ];

    /// Steps that change host-wide network configuration and need elevation.
    pub fn is_host_wide(self) -> bool {
        matches!(self, Remedy::CyclePortExclusion | Remedy::ResetNetworkStack)
    }

    fn apply(self, control: &dyn ProcessControl, pid: u32, port: u16) -> anyhow::Result<()> {
        match self {
            Remedy::Signal => control.terminate(pid, false),
            Remedy::Kill => control.terminate(pid, true),
            Remedy::KillTree => control.terminate_tree(pid),
            Remedy::CyclePortExclusion => control.cycle_port_exclusion(port),
            Remedy::ResetNetworkStack => control.reset_network_stack(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupantKind {
    /// One of our own runtimes, or a pid a previous run recorded.
    Family,
    Zombie,
    Foreign,
}

#[derive(Debug, Clone)]
pub struct ReclaimPolicy {
    /// Normalized family names.
    pub family: Vec<String>,
    pub settle: Duration,
    pub max_cycles: u32,
    pub allow_host_network_changes: bool,
}

impl ReclaimPolicy {
    pub fn from_config(cfg: &ReclaimConfig) -> Self {
        Self {
            family: cfg
                .known_processes
                .iter()
                .map(|n| normalize_process_name(n))
                .collect(),
            settle: Duration::from_millis(cfg.settle_ms),
            max_cycles: cfg.max_cycles.max(1),
            allow_host_network_changes: cfg.allow_host_network_changes,
        }
    }
}

/// True if `name` is `known` or `known` followed only by a version suffix
/// (`python3`, `python3.13`).
fn matches_family(name: &str, known: &str) -> bool {
    match name.strip_prefix(known) {
        Some(rest) => rest.chars().all(|c| c.is_ascii_digit() || c == '.'),
        None => false,
    }
}

/// Frees ports by terminating their occupants and verifying the result.
///
/// Success is only ever reported after a settled owner lookup finds nothing
/// and the probe can bind the port.
pub struct ProcessReclaimer {
    control: Arc<dyn ProcessControl>,
    finder: Arc<ProcessFinder>,
    probe: Arc<dyn PortProbe>,
    policy: ReclaimPolicy,
    recorded: Mutex<HashSet<u32>>,
}

impl ProcessReclaimer {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        finder: Arc<ProcessFinder>,
        probe: Arc<dyn PortProbe>,
        policy: ReclaimPolicy,
    ) -> Self {
        Self {
            control,
            finder,
            probe,
            policy,
            recorded: Mutex::new(HashSet::new()),
        }
    }

    /// Treat `pid` as family from now on. Used for processes this tool
    /// launched, in this run or a previous one.
    pub fn remember_pid(&self, pid: u32) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.insert(pid);
        }
    }

    fn is_recorded(&self, pid: u32) -> bool {
        self.recorded
            .lock()
            .map(|r| r.contains(&pid))
            .unwrap_or(false)
    }

    pub fn classify(&self, info: &ProcessInfo) -> OccupantKind {
        if self.is_recorded(info.pid) {
            return OccupantKind::Family;
        }
        if info.zombie {
            return OccupantKind::Zombie;
        }
        let Some(name) = info.name.as_deref() else {
            return OccupantKind::Foreign;
        };
        let name = normalize_process_name(name);
        if self.policy.family.iter().any(|known| matches_family(&name, known)) {
            OccupantKind::Family
        } else {
            OccupantKind::Foreign
        }
    }

    /// Whether this occupant may be reclaimed without the operator asking.
    pub fn can_act(&self, info: &ProcessInfo) -> bool {
        self.classify(info) != OccupantKind::Foreign
    }

    /// Free `port` from `info`. `Ok` only once the port is verified free.
    pub async fn reclaim(
        &self,
        port: u16,
        info: &ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let kind = self.classify(info);
        info!(port, occupant = %info, ?kind, "reclaiming port");
        match kind {
            OccupantKind::Zombie => self.reclaim_zombie(port, info, cancel).await,
            OccupantKind::Family | OccupantKind::Foreign => {
                self.reclaim_live(port, info, kind, cancel).await
            }
        }
    }

    async fn reclaim_live(
        &self,
        port: u16,
        info: &ProcessInfo,
        kind: OccupantKind,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let mut pid = info.pid;
        for cycle in 1..=self.policy.max_cycles {
            for force in [false, true] {
                debug!(port, pid, cycle, force, "terminating occupant");
                if let Err(e) = self.control.terminate(pid, force) {
                    debug!(port, pid, error = %e, "terminate failed");
                }
                match self.settle_and_verify(port, pid, cancel).await? {
                    None => {
                        info!(port, pid, cycle, force, "port reclaimed");
                        return Ok(());
                    }
                    Some(current) => {
                        pid = self.next_target(port, pid, &current, kind)?;
                    }
                }
            }
            warn!(port, pid, cycle, "occupant still holds port");
        }

        error!(port, pid, cycles = self.policy.max_cycles, "could not terminate occupant");
        Err(StackError::ProcessTerminationFailure {
            port,
            pid: Some(pid),
            manual_intervention: false,
        })
    }

    async fn reclaim_zombie(
        &self,
        port: u16,
        info: &ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let mut pid = info.pid;
        for remedy in Remedy::LADDER {
            if remedy.is_host_wide() && !self.policy.allow_host_network_changes {
                warn!(
                    port,
                    ?remedy,
                    "skipping host-wide remediation; enable reclaim.allow_host_network_changes to permit it"
                );
                break;
            }
            debug!(port, pid, ?remedy, "applying remedy");
            if let Err(e) = remedy.apply(self.control.as_ref(), pid, port) {
                debug!(port, pid, ?remedy, error = %e, "remedy failed");
            }
            match self.settle_and_verify(port, pid, cancel).await? {
                None => {
                    info!(port, pid, ?remedy, "zombie port reclaimed");
                    return Ok(());
                }
                Some(current) => {
                    pid = self.next_target(port, pid, &current, OccupantKind::Zombie)?;
                }
            }
        }

        error!(port, pid, "failed to free zombie port; try restarting the host");
        Err(StackError::ProcessTerminationFailure {
            port,
            pid: Some(pid),
            manual_intervention: true,
        })
    }

    /// Pick the pid to act on next. Follows a changed owner unless that would
    /// escalate from a process we may kill to one we may not.
    fn next_target(
        &self,
        port: u16,
        pid: u32,
        current: &ProcessInfo,
        kind: OccupantKind,
    ) -> Result<u32, StackError> {
        if current.pid == pid {
            return Ok(pid);
        }
        if kind != OccupantKind::Foreign && !self.can_act(current) {
            warn!(port, owner = %current, "port was taken over by a foreign process");
            return Err(StackError::ProcessTerminationFailure {
                port,
                pid: Some(current.pid),
                manual_intervention: false,
            });
        }
        debug!(port, old = pid, new = current.pid, "port owner changed");
        Ok(current.pid)
    }

    /// Wait for the settle period, then re-check the port. `None` means it is
    /// verified free; otherwise the current owner, or `last_pid` as a zombie
    /// when the port is busy without a visible owner.
    async fn settle_and_verify(
        &self,
        port: u16,
        last_pid: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessInfo>, StackError> {
        tokio::select! {
            _ = tokio::time::sleep(self.policy.settle) => {}
            _ = cancel.cancelled() => return Err(StackError::Interrupted),
        }
        let owner = tokio::select! {
            owner = self.finder.find_owner_settled(port) => owner,
            _ = cancel.cancelled() => return Err(StackError::Interrupted),
        };
        match owner {
            Some(info) => Ok(Some(info)),
            None if self.probe.is_free(port) => Ok(None),
            None => {
                debug!(port, "no owner visible but port still cannot be bound");
                Ok(Some(ProcessInfo {
                    pid: last_pid,
                    name: None,
                    zombie: true,
                }))
            }
        }
    }
}

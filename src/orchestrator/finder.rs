use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::platform::ProcessControl;

/// Extra lookups made by [`ProcessFinder::find_owner_settled`] before it
/// concludes that a port has no owner.
const SETTLE_RETRIES: u32 = 3;
const SETTLE_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot of the process holding a port. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: Option<String>,
    /// The port is held by a pid that does not resolve to a live, named
    /// process.
    pub zombie: bool,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.zombie) {
            (Some(name), _) => write!(f, "{} (PID {})", name, self.pid),
            (None, true) => write!(f, "zombie (PID {})", self.pid),
            (None, false) => write!(f, "PID {}", self.pid),
        }
    }
}

pub struct ProcessFinder {
    control: Arc<dyn ProcessControl>,
}

impl ProcessFinder {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self { control }
    }

    /// Look up who holds `port` right now.
    ///
    /// Prefers a pid that resolves to a named process; if none of the pids
    /// on the port resolve, the first one is reported as a zombie.
    pub fn find_owner(&self, port: u16) -> Option<ProcessInfo> {
        let own = std::process::id();
        let pids: Vec<u32> = self
            .control
            .list_connections(port)
            .into_iter()
            .filter(|pid| *pid != 0 && *pid != own)
            .collect();
        let first = *pids.first()?;

        for pid in &pids {
            if let Some(name) = self.control.process_name(*pid) {
                return Some(ProcessInfo {
                    pid: *pid,
                    name: Some(name),
                    zombie: false,
                });
            }
        }

        debug!(port, pid = first, "port owner does not resolve to a live process");
        Some(ProcessInfo {
            pid: first,
            name: None,
            zombie: true,
        })
    }

    /// Like [`find_owner`](Self::find_owner), but a "no owner" answer is only
    /// trusted after a few more lookups. Used right after a kill, when the
    /// connection table may lag behind the process table.
    pub async fn find_owner_settled(&self, port: u16) -> Option<ProcessInfo> {
        if let Some(info) = self.find_owner(port) {
            return Some(info);
        }
        for _ in 0..SETTLE_RETRIES {
            tokio::time::sleep(SETTLE_INTERVAL).await;
            if let Some(info) = self.find_owner(port) {
                debug!(port, pid = info.pid, "owner reappeared while settling");
                return Some(info);
            }
        }
        None
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StackError;
use crate::orchestrator::finder::ProcessFinder;
use crate::orchestrator::probe::PortProbe;
use crate::orchestrator::reclaim::ProcessReclaimer;

/// Candidate order: preferred first, then fallbacks, without duplicates.
pub fn candidate_ports(preferred: u16, fallbacks: &[u16]) -> Vec<u16> {
    let mut candidates = vec![preferred];
    for port in fallbacks {
        if !candidates.contains(port) {
            candidates.push(*port);
        }
    }
    candidates
}

/// Picks the first usable port for a service, reclaiming ports held by our
/// own leftovers on the way. Persisting the choice is the caller's job.
pub struct PortAllocator {
    probe: Arc<dyn PortProbe>,
    finder: Arc<ProcessFinder>,
    reclaimer: Arc<ProcessReclaimer>,
}

impl PortAllocator {
    pub fn new(
        probe: Arc<dyn PortProbe>,
        finder: Arc<ProcessFinder>,
        reclaimer: Arc<ProcessReclaimer>,
    ) -> Self {
        Self {
            probe,
            finder,
            reclaimer,
        }
    }

    /// First candidate that is free, or becomes free after reclaiming a
    /// reclaimable occupant. Ports in `exclude` are skipped. `Ok(None)` when
    /// every candidate is unusable; `Err` only on cancellation.
    pub async fn allocate(
        &self,
        preferred: u16,
        fallbacks: &[u16],
        exclude: &HashSet<u16>,
        cancel: &CancellationToken,
    ) -> Result<Option<u16>, StackError> {
        for port in candidate_ports(preferred, fallbacks) {
            if cancel.is_cancelled() {
                return Err(StackError::Interrupted);
            }
            if exclude.contains(&port) {
                debug!(port, "skipping port taken earlier in this run");
                continue;
            }
            if self.probe.is_free(port) {
                debug!(port, "port is free");
                return Ok(Some(port));
            }

            let Some(owner) = self.finder.find_owner(port) else {
                warn!(port, "port is busy but its owner cannot be determined");
                continue;
            };
            if !self.reclaimer.can_act(&owner) {
                info!(port, owner = %owner, "port held by an unrelated process, trying next");
                continue;
            }
            match self.reclaimer.reclaim(port, &owner, cancel).await {
                Ok(()) if self.probe.is_free(port) => return Ok(Some(port)),
                Ok(()) => {
                    warn!(port, "port reclaimed but taken again before use");
                }
                Err(StackError::Interrupted) => return Err(StackError::Interrupted),
                Err(e) => {
                    warn!(port, error = %e, "could not reclaim port, trying next");
                }
            }
        }
        Ok(None)
    }
}

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StackError;
use crate::orchestrator::finder::ProcessFinder;
use crate::orchestrator::reclaim::ProcessReclaimer;
use crate::orchestrator::state::{PipelineState, RunState};

/// Stops everything a pipeline run started, newest first, then sweeps the
/// ports the run allocated for anything of ours still holding them.
pub struct ShutdownCoordinator {
    finder: Arc<ProcessFinder>,
    reclaimer: Arc<ProcessReclaimer>,
    /// Cancels the teardown itself (second Ctrl+C), not the pipeline.
    cancel: CancellationToken,
    state_dir: Option<PathBuf>,
}

impl ShutdownCoordinator {
    pub fn new(
        finder: Arc<ProcessFinder>,
        reclaimer: Arc<ProcessReclaimer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            finder,
            reclaimer,
            cancel,
            state_dir: None,
        }
    }

    /// Remove the run-state file here after a clean teardown.
    pub fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.state_dir = Some(state_dir);
        self
    }

    /// Stop every started service in reverse start order, then reclaim
    /// leftovers on allocated ports. Keeps going past individual failures and
    /// returns the first one at the end. A no-op on an empty state.
    pub async fn teardown(&self, state: &mut PipelineState) -> Result<(), StackError> {
        if state.is_empty() {
            debug!("nothing to tear down");
            return Ok(());
        }
        let mut first_failure: Option<StackError> = None;
        let mut adopted_ports = HashSet::new();

        while let Some(mut supervisor) = state.started.pop() {
            if let Some(handle) = supervisor.handle().filter(|h| h.is_adopted()) {
                adopted_ports.insert(handle.port());
            }
            let grace = supervisor.descriptor().stop_grace;
            if let Err(e) = supervisor.stop(grace).await {
                error!(service = %supervisor.name(), error = %e, "failed to stop");
                first_failure.get_or_insert(e);
            }
        }

        for port in std::mem::take(&mut state.allocated_ports) {
            if adopted_ports.contains(&port) {
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!("teardown interrupted, skipping remaining port sweep");
                break;
            }
            let Some(owner) = self.finder.find_owner(port) else {
                continue;
            };
            if !self.reclaimer.can_act(&owner) {
                info!(port, owner = %owner, "port held by an unrelated process, leaving it");
                continue;
            }
            info!(port, owner = %owner, "reclaiming leftover");
            match self.reclaimer.reclaim(port, &owner, &self.cancel).await {
                Ok(()) => {}
                Err(StackError::Interrupted) => {
                    warn!(port, "teardown interrupted during reclaim");
                    break;
                }
                Err(e) => {
                    error!(port, error = %e, "leftover survived reclamation");
                    first_failure.get_or_insert(e);
                }
            }
        }
        state.completed.clear();

        match first_failure {
            Some(e) => Err(e),
            None => {
                if let Some(dir) = &self.state_dir {
                    if let Err(e) = RunState::remove(dir) {
                        warn!(error = %e, "could not remove run state");
                    }
                }
                Ok(())
            }
        }
    }
}

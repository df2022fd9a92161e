use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{PipelineFailure, StackError};
use crate::orchestrator::preflight::{self, DependencyCheck};
use crate::orchestrator::shutdown::ShutdownCoordinator;
use crate::orchestrator::state::{PipelineState, RunState};
use crate::orchestrator::supervisor::{
    ServiceDescriptor, ServiceSupervisor, StackRuntime, StartContext,
};

/// One unit of startup work.
#[derive(Debug, Clone)]
pub enum Step {
    Preflight,
    Service(Arc<ServiceDescriptor>),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Preflight => "preflight",
            Step::Service(d) => &d.name,
        }
    }
}

/// Delay between start attempts of one service.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Equal-jitter exponential backoff: half of the capped base is fixed, the
/// other half is random.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let base_ms = policy.initial_delay.as_millis() as f64 * 2_f64.powi(retry as i32);
    let capped_ms = base_ms.min(policy.max_delay.as_millis() as f64);
    let half = capped_ms / 2.0;
    let jitter = rand::random::<f64>() * half;
    Duration::from_millis((half + jitter) as u64)
}

/// Runs preflight, then each service in declared order. Stops at the first
/// failing step and rolls back everything started before it.
pub struct Pipeline {
    steps: Vec<Step>,
    checks: Vec<DependencyCheck>,
    runtime: Arc<StackRuntime>,
    retry: RetryPolicy,
    state: PipelineState,
    shutdown: ShutdownCoordinator,
    run_state: Option<(PathBuf, RunState)>,
}

impl Pipeline {
    pub fn new(
        descriptors: Vec<Arc<ServiceDescriptor>>,
        checks: Vec<DependencyCheck>,
        runtime: Arc<StackRuntime>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let mut steps = vec![Step::Preflight];
        steps.extend(descriptors.into_iter().map(Step::Service));
        Self {
            steps,
            checks,
            runtime,
            retry: RetryPolicy::default(),
            state: PipelineState::default(),
            shutdown,
            run_state: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record each ready service in `state_dir/state.json`.
    pub fn with_run_state(mut self, state_dir: PathBuf, run_state: RunState) -> Self {
        self.run_state = Some((state_dir, run_state));
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), PipelineFailure> {
        for step in self.steps.clone() {
            let result = if cancel.is_cancelled() {
                Err(StackError::Interrupted)
            } else {
                match &step {
                    Step::Preflight => preflight::run_all(&self.checks, cancel).await.map(|_| ()),
                    Step::Service(d) => self.start_service(d.clone(), cancel).await,
                }
            };

            match result {
                Ok(()) => self.state.completed.push(step.name().to_string()),
                Err(source) => {
                    error!(step = %step.name(), error = %source, "startup failed, rolling back");
                    let rollback = self.teardown().await.err();
                    if let Some(e) = &rollback {
                        error!(error = %e, "rollback did not complete cleanly");
                    }
                    return Err(PipelineFailure {
                        step: step.name().to_string(),
                        source,
                        rollback,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop everything this pipeline started.
    pub async fn teardown(&mut self) -> Result<(), StackError> {
        self.shutdown.teardown(&mut self.state).await
    }

    async fn start_service(
        &mut self,
        descriptor: Arc<ServiceDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let max_attempts = descriptor.max_start_retries.max(1);
        let mut supervisor = ServiceSupervisor::new(descriptor.clone(), self.runtime.clone());
        let mut attempt = 1;

        loop {
            let started = self.state.started_ports();
            let exclude: HashSet<u16> = started.iter().map(|(_, port)| *port).collect();
            let result = supervisor
                .start(StartContext {
                    attempt,
                    exclude: &exclude,
                    started: &started,
                    cancel,
                })
                .await
                .map(|_| ());
            if let Some(port) = supervisor.last_port() {
                self.state.note_port(port);
            }

            match result {
                Ok(()) => {
                    self.record(&supervisor);
                    self.state.started.push(supervisor);
                    return Ok(());
                }
                Err(StackError::Interrupted) => return Err(StackError::Interrupted),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = backoff_delay(&self.retry, attempt - 1);
                    warn!(
                        service = %descriptor.name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "start attempt failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StackError::Interrupted),
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn record(&mut self, supervisor: &ServiceSupervisor) {
        let Some((dir, run_state)) = self.run_state.as_mut() else {
            return;
        };
        let Some(record) = supervisor.record() else {
            return;
        };
        run_state.services.insert(supervisor.name().to_string(), record);
        match run_state.save(dir) {
            Ok(()) => info!(service = %supervisor.name(), "recorded in run state"),
            Err(e) => warn!(error = %e, "could not write run state"),
        }
    }
}

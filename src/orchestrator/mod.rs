pub mod finder;
pub mod health;
pub mod pipeline;
pub mod ports;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod reclaim;
pub mod shutdown;
pub mod state;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config;
use crate::config::model::StackConfig;
use crate::config::persist::TomlPortStore;
use crate::config::resolve::ConfigLocation;
use crate::discovery::env::service_url;
use crate::error::StackError;
use crate::platform::{ProcessControl, SystemProcesses};
use crate::ui::summary::{print_startup_summary, RunningService};

use finder::ProcessFinder;
use health::HttpHealthCheck;
use pipeline::Pipeline;
use ports::PortAllocator;
use preflight::DependencyCheck;
use probe::{LocalProbe, PortProbe};
use process::ProcessLauncher;
use reclaim::{ProcessReclaimer, ReclaimPolicy};
use shutdown::ShutdownCoordinator;
use state::RunState;
use supervisor::{ServiceDescriptor, StackRuntime};

/// How often a running stack is checked for services that exited on their own.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Loads the config, wires the OS-backed collaborators and drives one
/// session: preflight, ordered startup, wait, teardown.
pub struct Orchestrator {
    config: StackConfig,
    location: ConfigLocation,
    probe: Arc<dyn PortProbe>,
    finder: Arc<ProcessFinder>,
    reclaimer: Arc<ProcessReclaimer>,
    runtime: Arc<StackRuntime>,
}

impl Orchestrator {
    pub fn from_config(location: ConfigLocation) -> Result<Self> {
        let config = config::load_validated(&location.config_path)
            .with_context(|| format!("loading config from {}", location.config_path.display()))?;

        let control: Arc<dyn ProcessControl> = Arc::new(SystemProcesses);
        let probe: Arc<dyn PortProbe> = Arc::new(LocalProbe::for_host(&config.project.host));
        let finder = Arc::new(ProcessFinder::new(control.clone()));
        let reclaimer = Arc::new(ProcessReclaimer::new(
            control,
            finder.clone(),
            probe.clone(),
            ReclaimPolicy::from_config(&config.reclaim),
        ));
        let runtime = Arc::new(StackRuntime {
            project: config.project.name.clone(),
            host: config.project.host.clone(),
            global_env: config.env.clone(),
            finder: finder.clone(),
            reclaimer: reclaimer.clone(),
            allocator: PortAllocator::new(probe.clone(), finder.clone(), reclaimer.clone()),
            launcher: Arc::new(ProcessLauncher),
            health: Arc::new(HttpHealthCheck::new()?),
            store: Arc::new(TomlPortStore::new(&location.config_path)),
        });

        Ok(Self {
            config,
            location,
            probe,
            finder,
            reclaimer,
            runtime,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn probe(&self) -> &dyn PortProbe {
        self.probe.as_ref()
    }

    pub fn finder(&self) -> &ProcessFinder {
        &self.finder
    }

    pub fn reclaimer(&self) -> &ProcessReclaimer {
        &self.reclaimer
    }

    pub fn descriptors(&self) -> Result<Vec<Arc<ServiceDescriptor>>> {
        self.config
            .services
            .iter()
            .map(|svc| {
                ServiceDescriptor::from_config(svc, &self.config, self.location.project_dir())
                    .map(Arc::new)
            })
            .collect()
    }

    pub fn dependency_checks(&self) -> Vec<DependencyCheck> {
        self.config
            .dependencies
            .iter()
            .map(|dep| DependencyCheck::from_config(dep, self.location.project_dir()))
            .collect()
    }

    /// Treat processes a previous run launched as our own, so leftovers of a
    /// crashed session are reclaimed without asking.
    pub fn remember_previous_run(&self) {
        let Some(previous) = RunState::load(&self.location.state_dir) else {
            return;
        };
        let pids: Vec<u32> = previous.launched_pids().collect();
        for pid in &pids {
            self.reclaimer.remember_pid(*pid);
        }
        if !pids.is_empty() {
            info!(
                started_at = %previous.started_at,
                pids = ?pids,
                "previous run did not shut down cleanly"
            );
        }
    }

    /// Bring the stack up, wait for Ctrl+C or for a service to exit, then
    /// tear everything down.
    pub async fn run(&self) -> Result<()> {
        self.remember_previous_run();

        let cancel = CancellationToken::new();
        let teardown_cancel = CancellationToken::new();
        let shutdown = ShutdownCoordinator::new(
            self.finder.clone(),
            self.reclaimer.clone(),
            teardown_cancel.clone(),
        )
        .with_state_dir(self.location.state_dir.clone());
        let run_state = RunState::new(&self.config.project.name, &self.location.config_path);
        let mut pipeline = Pipeline::new(
            self.descriptors()?,
            self.dependency_checks(),
            self.runtime.clone(),
            shutdown,
        )
        .with_run_state(self.location.state_dir.clone(), run_state);

        let watcher = spawn_interrupt_watcher(cancel.clone(), Some(teardown_cancel));

        if let Err(failure) = pipeline.run(&cancel).await {
            watcher.abort();
            if matches!(failure.source, StackError::Interrupted) && failure.rollback.is_none() {
                eprintln!("Interrupted during startup; everything started so far was stopped");
                return Ok(());
            }
            return Err(failure.into());
        }

        let services: Vec<RunningService> = pipeline
            .state()
            .started
            .iter()
            .filter_map(|sup| {
                let handle = sup.handle()?;
                Some(RunningService {
                    name: sup.name().to_string(),
                    url: service_url(&self.config.project.host, handle.port()),
                    pid: handle.pid(),
                    adopted: handle.is_adopted(),
                })
            })
            .collect();
        print_startup_summary(&self.config.project.name, &services);

        let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
        let exited = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    eprintln!("\nShutting down...");
                    break None;
                }
                _ = ticker.tick() => {
                    if let Some(exit) = pipeline.state_mut().poll_exited() {
                        break Some(exit);
                    }
                }
            }
        };
        if let Some((name, report)) = &exited {
            error!(service = %name, "{}", report.describe());
            eprintln!("\n{} {}, shutting down", name, report.describe());
        }

        let result = pipeline.teardown().await;
        watcher.abort();
        result.context("teardown did not complete cleanly")?;
        info!("all services stopped");

        if let Some((name, report)) = exited {
            bail!("service {} {}", name, report.describe());
        }
        Ok(())
    }
}

/// First Ctrl+C cancels `cancel`; a second one cancels `teardown`.
pub fn spawn_interrupt_watcher(
    cancel: CancellationToken,
    teardown: Option<CancellationToken>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        cancel.cancel();
        let Some(teardown) = teardown else {
            return;
        };
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, skipping remaining cleanup");
            teardown.cancel();
        }
    })
}

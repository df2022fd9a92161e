use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::interpolate::{build_template_vars, resolve_template};
use crate::config::model::{ServiceConfig, StackConfig, StringOrList};
use crate::config::persist::PortStore;
use crate::discovery::env::build_service_env;
use crate::error::StackError;
use crate::orchestrator::finder::ProcessFinder;
use crate::orchestrator::health::HealthCheck;
use crate::orchestrator::ports::{candidate_ports, PortAllocator};
use crate::orchestrator::process::{ExitReport, LaunchSpec, Launcher, ManagedProcess};
use crate::orchestrator::reclaim::ProcessReclaimer;
use crate::orchestrator::state::ServiceRecord;
use crate::platform::expand_home;

// ---------------------------------------------------------------------------
// ServiceDescriptor
// ---------------------------------------------------------------------------

/// Static declaration of one manageable service. Built from config before the
/// pipeline runs and never mutated.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port_key: String,
    pub port: u16,
    pub fallback_ports: Vec<u16>,
    pub command: StringOrList,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Health URL, may contain templates.
    pub health: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub max_start_retries: u32,
    pub stop_grace: Duration,
    pub adopt_existing: bool,
}

impl ServiceDescriptor {
    /// The port recorded under `[ports]` wins over the declared one; the
    /// declared port then becomes the first fallback.
    pub fn from_config(
        svc: &ServiceConfig,
        config: &StackConfig,
        project_dir: &Path,
    ) -> anyhow::Result<Self> {
        let persisted = config.ports.get(svc.port_key()).copied();
        let port = match (persisted, svc.port) {
            (Some(p), _) | (None, Some(p)) => p,
            (None, None) => bail!(
                "service {} has no port; set `port` or `ports.{}`",
                svc.name,
                svc.port_key()
            ),
        };
        let mut fallbacks = Vec::new();
        if let Some(declared) = svc.port.filter(|p| *p != port) {
            fallbacks.push(declared);
        }
        fallbacks.extend(svc.fallback_ports.iter().copied());

        let working_dir = svc.path.as_deref().map(|p| {
            let path = PathBuf::from(expand_home(p));
            if path.is_absolute() {
                path
            } else {
                project_dir.join(path)
            }
        });

        Ok(Self {
            name: svc.name.clone(),
            port_key: svc.port_key().to_string(),
            port,
            fallback_ports: fallbacks,
            command: svc.command.clone(),
            working_dir,
            env: svc.env.clone(),
            health: svc.health.clone(),
            startup_timeout: Duration::from_secs(svc.startup_timeout_secs),
            poll_interval: Duration::from_millis(svc.poll_interval_ms),
            health_timeout: Duration::from_millis(svc.health_timeout_ms),
            max_start_retries: svc.max_start_retries,
            stop_grace: Duration::from_secs(svc.stop_grace_secs),
            adopt_existing: svc.adopt_existing,
        })
    }

    pub fn candidates(&self) -> Vec<u16> {
        candidate_ports(self.port, &self.fallback_ports)
    }
}

// ---------------------------------------------------------------------------
// ServicePhase / ServiceHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePhase {
    Starting,
    HealthChecking,
    Ready,
    Failed { reason: String },
}

impl ServicePhase {
    /// Phases only move forward within one start attempt.
    pub fn can_advance_to(&self, next: &ServicePhase) -> bool {
        matches!(
            (self, next),
            (ServicePhase::Starting, ServicePhase::HealthChecking)
                | (ServicePhase::Starting, ServicePhase::Failed { .. })
                | (ServicePhase::HealthChecking, ServicePhase::Ready)
                | (ServicePhase::HealthChecking, ServicePhase::Failed { .. })
        )
    }
}

/// Runtime record of one started service instance.
pub struct ServiceHandle {
    process: Option<Box<dyn ManagedProcess>>,
    port: u16,
    phase: ServicePhase,
    adopted: bool,
}

impl ServiceHandle {
    fn starting(port: u16) -> Self {
        Self {
            process: None,
            port,
            phase: ServicePhase::Starting,
            adopted: false,
        }
    }

    fn adopted(port: u16) -> Self {
        Self {
            process: None,
            port,
            phase: ServicePhase::Ready,
            adopted: true,
        }
    }

    fn advance(&mut self, next: ServicePhase) {
        debug_assert!(
            self.phase.can_advance_to(&next),
            "invalid phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn phase(&self) -> &ServicePhase {
        &self.phase
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    pub fn is_adopted(&self) -> bool {
        self.adopted
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("port", &self.port)
            .field("phase", &self.phase)
            .field("pid", &self.pid())
            .field("adopted", &self.adopted)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StackRuntime
// ---------------------------------------------------------------------------

/// Collaborators shared by every supervisor of a run.
pub struct StackRuntime {
    pub project: String,
    pub host: String,
    pub global_env: BTreeMap<String, String>,
    pub finder: Arc<ProcessFinder>,
    pub reclaimer: Arc<ProcessReclaimer>,
    pub allocator: PortAllocator,
    pub launcher: Arc<dyn Launcher>,
    pub health: Arc<dyn HealthCheck>,
    pub store: Arc<dyn PortStore>,
}

/// Inputs to one start attempt.
pub struct StartContext<'a> {
    pub attempt: u32,
    /// Ports already bound by services started earlier in this run.
    pub exclude: &'a HashSet<u16>,
    /// `(name, port)` of services started earlier, for templates and env.
    pub started: &'a [(String, u16)],
    pub cancel: &'a CancellationToken,
}

enum Unready {
    Interrupted,
    Crashed(ExitReport),
    TimedOut { last_error: Option<String> },
}

// ---------------------------------------------------------------------------
// ServiceSupervisor
// ---------------------------------------------------------------------------

/// Starts one service, waits for it to become healthy and owns its handle.
pub struct ServiceSupervisor {
    descriptor: Arc<ServiceDescriptor>,
    runtime: Arc<StackRuntime>,
    handle: Option<ServiceHandle>,
    last_port: Option<u16>,
}

impl ServiceSupervisor {
    pub fn new(descriptor: Arc<ServiceDescriptor>, runtime: Arc<StackRuntime>) -> Self {
        Self {
            descriptor,
            runtime,
            handle: None,
            last_port: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    /// Port of the live handle.
    pub fn port(&self) -> Option<u16> {
        self.handle.as_ref().map(|h| h.port)
    }

    /// Port picked by the most recent attempt, successful or not.
    pub fn last_port(&self) -> Option<u16> {
        self.last_port
    }

    pub fn record(&self) -> Option<ServiceRecord> {
        self.handle.as_ref().map(|h| ServiceRecord {
            pid: h.pid(),
            port: h.port,
            adopted: h.adopted,
        })
    }

    /// Exit report if the live process has exited on its own.
    pub fn try_exit(&mut self) -> Option<ExitReport> {
        self.handle.as_mut()?.process.as_mut()?.try_exit()
    }

    fn failure(&self, attempt: u32, reason: String) -> StackError {
        StackError::StartupFailure {
            service: self.descriptor.name.clone(),
            attempt,
            max_attempts: self.descriptor.max_start_retries,
            reason,
        }
    }

    /// One start attempt: allocate, persist, launch, wait for health.
    ///
    /// A failed attempt leaves no process and no handle behind.
    pub async fn start(&mut self, ctx: StartContext<'_>) -> Result<&ServiceHandle, StackError> {
        if self.handle.is_some() {
            return Err(self.failure(ctx.attempt, "an instance is already running".into()));
        }
        let descriptor = self.descriptor.clone();
        let runtime = self.runtime.clone();

        if descriptor.adopt_existing {
            if let Some(handle) = self.try_adopt(&ctx).await? {
                self.last_port = Some(handle.port);
                return Ok(self.handle.insert(handle));
            }
        }

        let port = runtime
            .allocator
            .allocate(descriptor.port, &descriptor.fallback_ports, ctx.exclude, ctx.cancel)
            .await?
            .ok_or_else(|| StackError::PortUnavailable {
                service: descriptor.name.clone(),
                candidates: descriptor.candidates(),
            })?;
        self.last_port = Some(port);

        if let Err(e) = runtime.store.persist(&descriptor.port_key, port) {
            warn!(service = %descriptor.name, port, error = %e, "continuing without persisting port");
        }

        let vars = build_template_vars(&runtime.project, &runtime.host, port, ctx.started);
        let (spec, health_url) = self
            .render(&vars, port, ctx.started)
            .map_err(|reason| self.failure(ctx.attempt, reason))?;

        info!(
            service = %descriptor.name,
            port,
            attempt = ctx.attempt,
            max_attempts = descriptor.max_start_retries,
            "starting: {}",
            spec.command.display()
        );
        let mut handle = ServiceHandle::starting(port);
        let process = match runtime.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                let reason = format!("launch failed: {:#}", e);
                handle.advance(ServicePhase::Failed {
                    reason: reason.clone(),
                });
                return Err(self.failure(ctx.attempt, reason));
            }
        };
        if let Some(pid) = process.pid() {
            runtime.reclaimer.remember_pid(pid);
        }
        handle.process = Some(process);
        handle.advance(ServicePhase::HealthChecking);

        let started_at = Instant::now();
        let outcome = match handle.process.as_deref_mut() {
            Some(process) => self.await_healthy(process, &health_url, ctx.cancel).await,
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                handle.advance(ServicePhase::Ready);
                info!(
                    service = %descriptor.name,
                    port,
                    pid = ?handle.pid(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "ready"
                );
                Ok(self.handle.insert(handle))
            }
            Err(unready) => {
                if let Some(mut process) = handle.process.take() {
                    if !process.stop(descriptor.stop_grace).await {
                        warn!(service = %descriptor.name, pid = ?process.pid(), "failed attempt left a process behind");
                    }
                }
                let err = match unready {
                    Unready::Interrupted => StackError::Interrupted,
                    Unready::Crashed(report) => self.failure(
                        ctx.attempt,
                        format!("process {} before becoming healthy", report.describe()),
                    ),
                    Unready::TimedOut { last_error } => self.failure(
                        ctx.attempt,
                        match last_error {
                            Some(e) => format!(
                                "not healthy after {:?} (last error: {})",
                                descriptor.startup_timeout, e
                            ),
                            None => format!("not healthy after {:?}", descriptor.startup_timeout),
                        },
                    ),
                };
                handle.advance(ServicePhase::Failed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Reuse an instance already answering on the preferred port.
    async fn try_adopt(&self, ctx: &StartContext<'_>) -> Result<Option<ServiceHandle>, StackError> {
        let d = &self.descriptor;
        if ctx.exclude.contains(&d.port) {
            return Ok(None);
        }
        let vars = build_template_vars(&self.runtime.project, &self.runtime.host, d.port, ctx.started);
        let Ok(url) = resolve_template(&d.health, &vars, "health") else {
            return Ok(None);
        };
        let healthy = tokio::select! {
            r = tokio::time::timeout(d.health_timeout, self.runtime.health.check(&url, d.health_timeout)) => matches!(r, Ok(Ok(()))),
            _ = ctx.cancel.cancelled() => return Err(StackError::Interrupted),
        };
        if !healthy {
            debug!(service = %d.name, url = %url, "no existing instance to adopt");
            return Ok(None);
        }
        info!(service = %d.name, port = d.port, "using existing instance");
        if let Err(e) = self.runtime.store.persist(&d.port_key, d.port) {
            warn!(service = %d.name, error = %e, "continuing without persisting port");
        }
        Ok(Some(ServiceHandle::adopted(d.port)))
    }

    /// Expand templates in command, env and health URL.
    fn render(
        &self,
        vars: &HashMap<String, String>,
        port: u16,
        started: &[(String, u16)],
    ) -> Result<(LaunchSpec, String), String> {
        let d = &self.descriptor;
        let mut errors = Vec::new();
        let mut expand = |value: &str, field: String| match resolve_template(value, vars, &field) {
            Ok(v) => v,
            Err(errs) => {
                errors.extend(errs.into_iter().map(|e| e.to_string()));
                String::new()
            }
        };

        let command = match &d.command {
            StringOrList::Shell(line) => {
                StringOrList::Shell(expand(line, format!("service.{}.command", d.name)))
            }
            StringOrList::Argv(argv) => StringOrList::Argv(
                argv.iter()
                    .map(|a| expand(a, format!("service.{}.command", d.name)))
                    .collect(),
            ),
        };
        let global: BTreeMap<String, String> = self
            .runtime
            .global_env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v, format!("env.{k}"))))
            .collect();
        let own: BTreeMap<String, String> = d
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v, format!("service.{}.env.{k}", d.name))))
            .collect();
        let health = expand(&d.health, format!("service.{}.health", d.name));

        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        let env = build_service_env(&global, &own, &self.runtime.host, port, started);
        Ok((
            LaunchSpec {
                service: d.name.clone(),
                command,
                working_dir: d.working_dir.clone(),
                env,
            },
            health,
        ))
    }

    /// Poll health every `poll_interval` until `startup_timeout` has passed.
    async fn await_healthy(
        &self,
        process: &mut dyn ManagedProcess,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Unready> {
        let d = &self.descriptor;
        let deadline = Instant::now() + d.startup_timeout;
        let mut last_error = None;

        loop {
            if let Some(report) = process.try_exit() {
                return Err(Unready::Crashed(report));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Unready::TimedOut { last_error });
            }

            let per_attempt = d.health_timeout.min(deadline - now);
            let result = tokio::select! {
                r = tokio::time::timeout(per_attempt, self.runtime.health.check(url, per_attempt)) => r,
                _ = cancel.cancelled() => return Err(Unready::Interrupted),
            };
            match result {
                Ok(Ok(())) => {
                    // The answer may come from someone else if our process died.
                    if let Some(report) = process.try_exit() {
                        return Err(Unready::Crashed(report));
                    }
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(service = %d.name, error = %format!("{e:#}"), "not healthy yet");
                    last_error = Some(format!("{e:#}"));
                }
                Err(_) => {
                    debug!(service = %d.name, "health check timed out");
                    last_error = Some(format!("health check timed out after {:?}", per_attempt));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                continue;
            }
            let pause = d.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                report = process.wait_exit() => return Err(Unready::Crashed(report)),
                _ = cancel.cancelled() => return Err(Unready::Interrupted),
            }
        }
    }

    /// Stop the live instance, graceful first. Adopted instances are left
    /// running. No-op without a handle.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), StackError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if handle.adopted {
            info!(service = %self.descriptor.name, port = handle.port, "leaving adopted instance running");
            return Ok(());
        }
        let Some(mut process) = handle.process.take() else {
            return Ok(());
        };
        let pid = process.pid();
        info!(service = %self.descriptor.name, pid = ?pid, "stopping");
        let reaped = process.stop(grace).await;
        if reaped && !process.is_alive() {
            debug!(service = %self.descriptor.name, "stopped");
            Ok(())
        } else {
            Err(StackError::ProcessTerminationFailure {
                port: handle.port,
                pid,
                manual_intervention: false,
            })
        }
    }
}

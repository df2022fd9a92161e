//! In-memory stand-ins for the OS, subprocesses, health endpoints and the
//! config file, shared by the orchestrator unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::model::{ReclaimConfig, StringOrList};
use crate::config::persist::PortStore;
use crate::error::StackError;
use crate::orchestrator::finder::ProcessFinder;
use crate::orchestrator::health::HealthCheck;
use crate::orchestrator::ports::PortAllocator;
use crate::orchestrator::probe::PortProbe;
use crate::orchestrator::process::{ExitReport, LaunchSpec, Launcher, ManagedProcess};
use crate::orchestrator::reclaim::{ProcessReclaimer, ReclaimPolicy, Remedy};
use crate::orchestrator::supervisor::{ServiceDescriptor, StackRuntime};
use crate::platform::ProcessControl;

// ---------------------------------------------------------------------------
// FakeHost: connection table, process table and port probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Terminate { pid: u32, force: bool },
    TerminateTree { pid: u32 },
    CyclePortExclusion { port: u16 },
    ResetNetworkStack,
}

#[derive(Debug, Clone)]
struct Occupant {
    pid: u32,
    name: Option<String>,
    /// Weakest remedy that removes this occupant; `None` survives everything.
    dies_on: Option<Remedy>,
}

#[derive(Default)]
struct HostState {
    ports: HashMap<u16, Vec<Occupant>>,
    blocked: HashSet<u16>,
    successors: HashMap<u16, Occupant>,
    calls: Vec<HostCall>,
    lookups: HashMap<u16, usize>,
}

#[derive(Clone, Copy)]
enum Target {
    Pid(u32),
    Port(u16),
    Everything,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, port: u16, pid: u32, name: Option<&str>, dies_on: Option<Remedy>) {
        let mut state = self.state.lock().unwrap();
        state.ports.entry(port).or_default().push(Occupant {
            pid,
            name: name.map(String::from),
            dies_on,
        });
    }

    /// An occupant that exits on the first polite request.
    pub fn occupy(&self, port: u16, pid: u32, name: Option<&str>) {
        self.insert(port, pid, name, Some(Remedy::Signal));
    }

    /// An occupant that only goes away once `remedy` (or something stronger)
    /// is applied.
    pub fn occupy_until(&self, port: u16, pid: u32, name: Option<&str>, remedy: Remedy) {
        self.insert(port, pid, name, Some(remedy));
    }

    pub fn occupy_forever(&self, port: u16, pid: u32, name: Option<&str>) {
        self.insert(port, pid, name, None);
    }

    /// Make the port unbindable without any visible owner.
    pub fn block_port(&self, port: u16) {
        self.state.lock().unwrap().blocked.insert(port);
    }

    /// Once `port` is vacated, an unkillable `pid` grabs it.
    pub fn on_release(&self, port: u16, pid: u32, name: Option<&str>) {
        self.state.lock().unwrap().successors.insert(
            port,
            Occupant {
                pid,
                name: name.map(String::from),
                dies_on: None,
            },
        );
    }

    pub fn is_free_now(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap();
        !state.blocked.contains(&port) && state.ports.get(&port).is_none_or(|o| o.is_empty())
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn lookups(&self, port: u16) -> usize {
        self.state.lock().unwrap().lookups.get(&port).copied().unwrap_or(0)
    }

    fn apply(&self, call: HostCall, remedy: Remedy, target: Target) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        let mut vacated = Vec::new();
        for (port, occupants) in state.ports.iter_mut() {
            let before = occupants.len();
            occupants.retain(|o| {
                let targeted = match target {
                    Target::Pid(pid) => o.pid == pid,
                    Target::Port(p) => p == *port,
                    Target::Everything => true,
                };
                !(targeted && o.dies_on.is_some_and(|d| remedy >= d))
            });
            if before > 0 && occupants.is_empty() {
                vacated.push(*port);
            }
        }
        for port in vacated {
            if let Some(next) = state.successors.remove(&port) {
                state.ports.entry(port).or_default().push(next);
            }
        }
    }
}

impl PortProbe for FakeHost {
    fn is_free(&self, port: u16) -> bool {
        self.is_free_now(port)
    }
}

impl ProcessControl for FakeHost {
    fn list_connections(&self, port: u16) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        *state.lookups.entry(port).or_default() += 1;
        state
            .ports
            .get(&port)
            .map(|o| o.iter().map(|o| o.pid).collect())
            .unwrap_or_default()
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .ports
            .values()
            .flatten()
            .find(|o| o.pid == pid)
            .and_then(|o| o.name.clone())
    }

    fn terminate(&self, pid: u32, force: bool) -> anyhow::Result<()> {
        let remedy = if force { Remedy::Kill } else { Remedy::Signal };
        self.apply(HostCall::Terminate { pid, force }, remedy, Target::Pid(pid));
        Ok(())
    }

    fn terminate_tree(&self, pid: u32) -> anyhow::Result<()> {
        self.apply(HostCall::TerminateTree { pid }, Remedy::KillTree, Target::Pid(pid));
        Ok(())
    }

    fn cycle_port_exclusion(&self, port: u16) -> anyhow::Result<()> {
        self.apply(
            HostCall::CyclePortExclusion { port },
            Remedy::CyclePortExclusion,
            Target::Port(port),
        );
        Ok(())
    }

    fn reset_network_stack(&self) -> anyhow::Result<()> {
        self.apply(
            HostCall::ResetNetworkStack,
            Remedy::ResetNetworkStack,
            Target::Everything,
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeLauncher / FakeProcess
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    Runs,
    ExitsAfter {
        after: Duration,
        code: i32,
        output: Vec<String>,
    },
    FailsToSpawn,
    IgnoresStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Launched { service: String, port: u16 },
    Stopped { service: String },
}

#[derive(Default)]
struct LauncherState {
    behaviors: HashMap<String, LaunchBehavior>,
    events: Vec<LaunchEvent>,
    specs: HashMap<String, LaunchSpec>,
    alive: HashMap<u32, bool>,
    next_pid: u32,
}

#[derive(Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn set_behavior(&self, service: &str, behavior: LaunchBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(service.to_string(), behavior);
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Services in the order their stop was requested.
    pub fn stop_order(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LaunchEvent::Stopped { service } => Some(service),
                _ => None,
            })
            .collect()
    }

    pub fn launched(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LaunchEvent::Launched { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }

    pub fn last_spec(&self, service: &str) -> Option<LaunchSpec> {
        self.state.lock().unwrap().specs.get(service).cloned()
    }

    pub fn alive_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .alive
            .values()
            .filter(|alive| **alive)
            .count()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ManagedProcess>> {
        let mut state = self.state.lock().unwrap();
        let behavior = state
            .behaviors
            .get(&spec.service)
            .cloned()
            .unwrap_or(LaunchBehavior::Runs);
        if matches!(behavior, LaunchBehavior::FailsToSpawn) {
            anyhow::bail!("No such file or directory (os error 2)");
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let port = spec.env.get("PORT").and_then(|p| p.parse().ok()).unwrap_or(0);
        state.events.push(LaunchEvent::Launched {
            service: spec.service.clone(),
            port,
        });
        state.specs.insert(spec.service.clone(), spec.clone());
        state.alive.insert(pid, true);

        let (exit, stubborn) = match behavior {
            LaunchBehavior::ExitsAfter { after, code, output } => (
                Some((
                    Instant::now() + after,
                    ExitReport {
                        code: Some(code),
                        output_tail: output,
                    },
                )),
                false,
            ),
            LaunchBehavior::IgnoresStop => (None, true),
            _ => (None, false),
        };
        Ok(Box::new(FakeProcess {
            service: spec.service.clone(),
            pid,
            launcher: self.state.clone(),
            exit,
            stubborn,
        }))
    }
}

struct FakeProcess {
    service: String,
    pid: u32,
    launcher: Arc<Mutex<LauncherState>>,
    exit: Option<(Instant, ExitReport)>,
    stubborn: bool,
}

impl FakeProcess {
    fn alive(&self) -> bool {
        self.launcher
            .lock()
            .unwrap()
            .alive
            .get(&self.pid)
            .copied()
            .unwrap_or(false)
    }

    fn mark_dead(&self) {
        self.launcher.lock().unwrap().alive.insert(self.pid, false);
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&mut self) -> Option<ExitReport> {
        match &self.exit {
            Some((at, report)) if Instant::now() >= *at => {
                self.mark_dead();
                Some(report.clone())
            }
            _ if !self.alive() => Some(ExitReport {
                code: None,
                output_tail: Vec::new(),
            }),
            _ => None,
        }
    }

    async fn wait_exit(&mut self) -> ExitReport {
        match self.exit.clone() {
            Some((at, report)) => {
                tokio::time::sleep_until(at).await;
                self.mark_dead();
                report
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self, _grace: Duration) -> bool {
        self.launcher.lock().unwrap().events.push(LaunchEvent::Stopped {
            service: self.service.clone(),
        });
        if self.stubborn {
            return false;
        }
        self.mark_dead();
        true
    }

    fn is_alive(&mut self) -> bool {
        self.try_exit().is_none()
    }
}

// ---------------------------------------------------------------------------
// FakeHealth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum HealthRule {
    Always,
    Never,
    /// Healthy from the n-th check on.
    AfterChecks(u32),
    /// Never answers.
    Hang,
}

/// Rules are keyed by the last path segment of the health URL.
#[derive(Default)]
pub struct FakeHealth {
    rules: Mutex<HashMap<String, HealthRule>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeHealth {
    pub fn set(&self, key: &str, rule: HealthRule) {
        self.rules.lock().unwrap().insert(key.to_string(), rule);
    }

    pub fn calls(&self, key: &str) -> u32 {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn check(&self, url: &str, _timeout: Duration) -> anyhow::Result<()> {
        let key = url.rsplit('/').next().unwrap_or_default().to_string();
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(key.clone()).or_default();
            *count += 1;
            *count
        };
        let rule = self
            .rules
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(HealthRule::Always);
        match rule {
            HealthRule::Always => Ok(()),
            HealthRule::Never => anyhow::bail!("connection refused"),
            HealthRule::AfterChecks(n) if count >= n => Ok(()),
            HealthRule::AfterChecks(_) => anyhow::bail!("connection refused"),
            HealthRule::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryPortStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPortStore {
    writes: Mutex<Vec<(String, u16)>>,
    fail: Mutex<bool>,
}

impl MemoryPortStore {
    pub fn persisted(&self) -> Vec<(String, u16)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_writes(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

impl PortStore for MemoryPortStore {
    fn persist(&self, key: &str, port: u16) -> Result<(), StackError> {
        if *self.fail.lock().unwrap() {
            return Err(StackError::ConfigPersist {
                path: PathBuf::from("llmstack.toml"),
                reason: "read-only file system".into(),
            });
        }
        self.writes.lock().unwrap().push((key.to_string(), port));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub host: Arc<FakeHost>,
    pub launcher: Arc<FakeLauncher>,
    pub health: Arc<FakeHealth>,
    pub store: Arc<MemoryPortStore>,
    pub runtime: Arc<StackRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        let host = FakeHost::new();
        let launcher = Arc::new(FakeLauncher::default());
        let health = Arc::new(FakeHealth::default());
        let store = Arc::new(MemoryPortStore::default());

        let finder = Arc::new(ProcessFinder::new(host.clone()));
        let reclaimer = Arc::new(ProcessReclaimer::new(
            host.clone(),
            finder.clone(),
            host.clone(),
            ReclaimPolicy::from_config(&ReclaimConfig::default()),
        ));
        let allocator = PortAllocator::new(host.clone(), finder.clone(), reclaimer.clone());
        let runtime = Arc::new(StackRuntime {
            project: "local-llm".into(),
            host: "localhost".into(),
            global_env: BTreeMap::new(),
            finder,
            reclaimer,
            allocator,
            launcher: launcher.clone(),
            health: health.clone(),
            store: store.clone(),
        });

        Self {
            host,
            launcher,
            health,
            store,
            runtime,
        }
    }
}

/// A descriptor whose health URL ends in `/<name>`, so [`FakeHealth`] rules
/// can be set per service.
pub fn descriptor(name: &str, port: u16) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        port_key: name.to_string(),
        port,
        fallback_ports: Vec::new(),
        command: StringOrList::Shell(format!("run-{name}")),
        working_dir: None,
        env: BTreeMap::new(),
        health: format!("http://{{{{ host }}}}:{{{{ port }}}}/health/{name}"),
        startup_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_secs(1),
        health_timeout: Duration::from_secs(2),
        max_start_retries: 1,
        stop_grace: Duration::from_secs(5),
        adopt_existing: false,
    }
}

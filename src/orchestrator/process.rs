use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::model::StringOrList;
use crate::platform;

/// Lines of combined stdout/stderr kept for failure reports.
const OUTPUT_TAIL_LINES: usize = 40;

/// How long to wait for the output readers after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything needed to spawn one service instance. Templates are already
/// expanded.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service: String,
    pub command: StringOrList,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub output_tail: Vec<String>,
}

impl ExitReport {
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exited with code {}", code),
            None => "was terminated by a signal".to_string(),
        };
        if self.output_tail.is_empty() {
            status
        } else {
            format!("{}; last output:\n  {}", status, self.output_tail.join("\n  "))
        }
    }
}

/// Spawns service processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ManagedProcess>>;
}

/// A running service process owned by exactly one supervisor.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> Option<ExitReport>;

    /// Resolves once the process has exited.
    async fn wait_exit(&mut self) -> ExitReport;

    /// Terminate gracefully, forcing after `grace`. Returns true once the
    /// process is confirmed gone.
    async fn stop(&mut self, grace: Duration) -> bool;

    fn is_alive(&mut self) -> bool;
}

/// [`Launcher`] that spawns real child processes on tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ManagedProcess>> {
        let mut cmd = match &spec.command {
            StringOrList::Shell(line) => {
                debug!(service = %spec.service, "spawning: {} {:?}", platform::shell_name(), line);
                platform::shell_command(line)
            }
            StringOrList::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .with_context(|| format!("service {} has an empty command", spec.service))?;
                debug!(service = %spec.service, "spawning: {:?}", argv);
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        platform::configure_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn service {}", spec.service))?;
        let pid = child.id();
        debug!(service = %spec.service, pid = ?pid, "child spawned");

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, spec.service.clone(), "stdout", tail.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, spec.service.clone(), "stderr", tail.clone()));
        }

        Ok(Box::new(ChildProcess {
            service: spec.service.clone(),
            child,
            pid,
            tail,
            readers,
            exited: None,
        }))
    }
}

/// Forward each output line to tracing and keep the most recent ones.
fn spawn_reader<R>(
    stream: R,
    service: String,
    stream_name: &'static str,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let text = line.trim_end_matches(['\r', '\n']).to_string();
                    debug!(service = %service, stream = stream_name, "{}", text);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == OUTPUT_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(text);
                    }
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "{} read error", stream_name);
                    break;
                }
            }
        }
    })
}

struct ChildProcess {
    service: String,
    child: Child,
    pid: Option<u32>,
    tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
    exited: Option<ExitReport>,
}

impl ChildProcess {
    fn snapshot_tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                // A grandchild still holds the pipe open.
                debug!(service = %self.service, "output reader did not finish");
            }
        }
    }

    fn record_exit(&mut self, code: Option<i32>) -> ExitReport {
        let report = ExitReport {
            code,
            output_tail: self.snapshot_tail(),
        };
        self.exited = Some(report.clone());
        report
    }
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> Option<ExitReport> {
        if let Some(report) = &self.exited {
            return Some(report.clone());
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Some(self.record_exit(status.code())),
            Ok(None) => None,
            Err(e) => {
                warn!(service = %self.service, error = %e, "try_wait failed");
                None
            }
        }
    }

    async fn wait_exit(&mut self) -> ExitReport {
        if let Some(report) = &self.exited {
            return report.clone();
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(service = %self.service, error = %e, "wait() failed");
                None
            }
        };
        self.drain_readers().await;
        self.record_exit(code)
    }

    async fn stop(&mut self, grace: Duration) -> bool {
        if self.exited.is_some() {
            return true;
        }
        let reaped = platform::terminate_child(&mut self.child, self.pid, grace).await;
        self.drain_readers().await;
        let code = self.child.try_wait().ok().flatten().and_then(|s| s.code());
        self.record_exit(code);
        reaped
    }

    fn is_alive(&mut self) -> bool {
        if self.exited.is_some() {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }
}

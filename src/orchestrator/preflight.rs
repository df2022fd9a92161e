use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::model::{DependencyConfig, StringOrList};
use crate::error::StackError;
use crate::platform;

/// A command that must exit 0 before any service is started.
#[derive(Debug, Clone)]
pub struct DependencyCheck {
    pub name: String,
    pub command: StringOrList,
    pub timeout: Duration,
    pub working_dir: PathBuf,
}

impl DependencyCheck {
    pub fn from_config(cfg: &DependencyConfig, project_dir: &Path) -> Self {
        Self {
            name: cfg.name.clone(),
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            working_dir: project_dir.to_path_buf(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> StackError {
        StackError::DependencyCheck {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Run the check. On success returns the first line of its output
    /// (usually a version string).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<String, StackError> {
        let mut cmd = match &self.command {
            StringOrList::Shell(line) => platform::shell_command(line),
            StringOrList::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| self.failed("empty command"))?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(check = %self.name, command = %self.command.display(), "running dependency check");
        let output = tokio::select! {
            r = tokio::time::timeout(self.timeout, cmd.output()) => match r {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(self.failed(format!("could not run `{}`: {}", self.command.display(), e))),
                Err(_) => return Err(self.failed(format!("timed out after {:?}", self.timeout))),
            },
            _ = cancel.cancelled() => return Err(StackError::Interrupted),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = stderr.trim().lines().last().unwrap_or_default().to_string();
            return Err(self.failed(match output.status.code() {
                Some(code) if detail.is_empty() => format!("exited with code {}", code),
                Some(code) => format!("exited with code {}: {}", code, detail),
                None => "terminated by a signal".to_string(),
            }));
        }

        // Some tools print their version on stderr.
        let first = stdout
            .lines()
            .chain(stderr.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        info!(check = %self.name, "{}", if first.is_empty() { "ok" } else { first.as_str() });
        Ok(first)
    }
}

/// Run every check in order, stopping at the first failure.
pub async fn run_all(
    checks: &[DependencyCheck],
    cancel: &CancellationToken,
) -> Result<Vec<(String, String)>, StackError> {
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let detail = check.run(cancel).await?;
        results.push((check.name.clone(), detail));
    }
    Ok(results)
}

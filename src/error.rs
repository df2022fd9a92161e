use std::path::PathBuf;

use thiserror::Error;

/// Failures of the service lifecycle core.
///
/// `PortUnavailable`, `StartupFailure`, `DependencyCheck` and `Interrupted`
/// abort the pipeline and trigger a rollback. `ProcessTerminationFailure` is
/// logged per service during teardown. `ConfigPersist` is never fatal.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("no usable port for `{service}` (tried {candidates:?})")]
    PortUnavailable {
        service: String,
        candidates: Vec<u16>,
    },

    #[error("`{service}` failed to start (attempt {attempt}/{max_attempts}): {reason}")]
    StartupFailure {
        service: String,
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },

    #[error("could not free port {port}{}{}", pid.map(|p| format!(" held by PID {p}")).unwrap_or_default(), if *manual_intervention { "; manual intervention required (try restarting the host)" } else { "" })]
    ProcessTerminationFailure {
        port: u16,
        pid: Option<u32>,
        manual_intervention: bool,
    },

    #[error("failed to persist ports to {}: {reason}", path.display())]
    ConfigPersist { path: PathBuf, reason: String },

    #[error("dependency check `{name}` failed: {reason}")]
    DependencyCheck { name: String, reason: String },

    #[error("interrupted")]
    Interrupted,
}

impl StackError {
    /// True for errors that must abort the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StackError::ConfigPersist { .. })
    }
}

/// A pipeline run that stopped at `step`. `rollback` holds the first error of
/// the teardown that followed, if it did not complete cleanly.
#[derive(Debug, Error)]
#[error("step `{step}` failed: {source}{}", rollback.as_ref().map(|e| format!("; rollback failed: {e}")).unwrap_or_default())]
pub struct PipelineFailure {
    pub step: String,
    #[source]
    pub source: StackError,
    pub rollback: Option<StackError>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::orchestrator::process::ExitReport;
use crate::orchestrator::supervisor::ServiceSupervisor;

/// In-memory progress of one pipeline run, used for reverse-order rollback.
#[derive(Default)]
pub struct PipelineState {
    /// Names of steps that finished, in order.
    pub completed: Vec<String>,
    /// Supervisors of started services, in start order.
    pub started: Vec<ServiceSupervisor>,
    /// Every port this run allocated, including ones from failed attempts.
    pub allocated_ports: Vec<u16>,
}

impl PipelineState {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.started.is_empty() && self.allocated_ports.is_empty()
    }

    pub fn note_port(&mut self, port: u16) {
        if !self.allocated_ports.contains(&port) {
            self.allocated_ports.push(port);
        }
    }

    /// `(name, port)` of each started service, in start order.
    pub fn started_ports(&self) -> Vec<(String, u16)> {
        self.started
            .iter()
            .filter_map(|s| s.port().map(|p| (s.name().to_string(), p)))
            .collect()
    }

    /// First started service whose process has exited on its own.
    pub fn poll_exited(&mut self) -> Option<(String, ExitReport)> {
        self.started
            .iter_mut()
            .find_map(|s| s.try_exit().map(|report| (s.name().to_string(), report)))
    }
}

/// What a run left on disk, so the next run can reclaim its leftovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub project: String,
    pub config_path: String,
    pub started_at: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(default)]
    pub adopted: bool,
}

impl RunState {
    pub fn new(project: &str, config_path: &Path) -> Self {
        Self {
            project: project.to_string(),
            config_path: config_path.display().to_string(),
            started_at: Utc::now(),
            services: BTreeMap::new(),
        }
    }

    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join("state.json");
        let content = serde_json::to_string_pretty(self)?;
        // Atomic write: write to tmp file then rename
        let tmp_path = state_dir.join("state.json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn load(state_dir: &Path) -> Option<Self> {
        let path = state_dir.join("state.json");
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove(state_dir: &Path) -> anyhow::Result<()> {
        let path = state_dir.join("state.json");
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        // Try to remove the directory if it's empty
        let _ = std::fs::remove_dir(state_dir);
        Ok(())
    }

    pub fn state_dir_for(project_dir: &Path) -> PathBuf {
        project_dir.join(".llmstack")
    }

    /// Pids of processes this run launched itself.
    pub fn launched_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.services
            .values()
            .filter(|s| !s.adopted)
            .filter_map(|s| s.pid)
    }
}

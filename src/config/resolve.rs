use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "llmstack.toml";

/// Where the config lives and where run state for it is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLocation {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
}

impl ConfigLocation {
    pub fn new(config_path: PathBuf) -> Self {
        let state_dir = config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".llmstack");
        Self {
            config_path,
            state_dir,
        }
    }

    /// Directory relative service paths are resolved against.
    pub fn project_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Walk up from `start` until a directory containing `filename` is found.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Resolve the config location from an explicit `-f` path or by searching
/// upward from the working directory.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<ConfigLocation> {
    if let Some(path) = cli_file {
        if !path.is_file() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        return Ok(ConfigLocation::new(path.canonicalize()?));
    }

    let cwd = std::env::current_dir()?;
    find_config(&cwd, CONFIG_FILENAME)
        .map(ConfigLocation::new)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No {} found in {} or any parent directory",
                CONFIG_FILENAME,
                cwd.display()
            )
        })
}

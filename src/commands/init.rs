use anyhow::Result;
use std::path::Path;

use crate::config::resolve::CONFIG_FILENAME;

pub fn run() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let config_path = cwd.join(CONFIG_FILENAME);

    if config_path.exists() {
        anyhow::bail!("{} already exists in {}", CONFIG_FILENAME, cwd.display());
    }

    let project_name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "local-llm".to_string());

    std::fs::write(&config_path, starter_config(&project_name, &cwd))?;
    println!("Created {} in {}", CONFIG_FILENAME, cwd.display());
    println!();
    println!("  Project: {}", project_name);
    println!();
    println!("Edit the file, then run `llmstack up` to begin.");
    Ok(())
}

/// The UI command depends on which framework the project uses.
fn detect_ui_command(dir: &Path) -> &'static str {
    if dir.join("ui").join("app.py").exists() {
        "streamlit run ui/app.py --server.port {{ port }} --server.headless true"
    } else if dir.join("ui").join("package.json").exists() {
        "npm --prefix ui run dev -- --port {{ port }}"
    } else {
        "python -m http.server {{ port }} --directory ui"
    }
}

fn starter_config(project_name: &str, dir: &Path) -> String {
    let ui_command = detect_ui_command(dir);
    format!(
        r#"[project]
name = "{project_name}"
# host = "localhost"

# -- Global env vars shared by all services --
# [env]
# LOG_LEVEL = "info"

# -- Port reclamation --
# Processes with these names are treated as leftovers of this stack and
# stopped when they hold a port it needs.
# [reclaim]
# known_processes = ["python", "uvicorn", "streamlit", "ollama"]
# settle_ms = 2000
# allow_host_network_changes = false  # needs admin rights

# -- Checks run before anything starts --
[[dependency]]
name = "python"
command = ["python", "--version"]

# -- Services, started in this order and stopped in reverse --
[[service]]
name = "ollama"
command = "ollama serve"
port = 11434
health = "http://{{{{ host }}}}:{{{{ port }}}}/api/tags"
adopt_existing = true
startup_timeout_secs = 60

[service.env]
OLLAMA_HOST = "{{{{ host }}}}:{{{{ port }}}}"

[[service]]
name = "api"
command = ["uvicorn", "api.main:app", "--port", "{{{{ port }}}}"]
port = 8000
fallback_ports = [8001, 8002]
health = "http://{{{{ host }}}}:{{{{ port }}}}/health"

[service.env]
OLLAMA_URL = "http://{{{{ host }}}}:{{{{ services.ollama.port }}}}"

[[service]]
name = "ui"
command = "{ui_command}"
port = 8501
fallback_ports = [8502, 8503]
health = "http://{{{{ host }}}}:{{{{ port }}}}/"

[service.env]
API_URL = "http://{{{{ host }}}}:{{{{ services.api.port }}}}"

# Ports picked at runtime are written back here.
# [ports]
"#
    )
}

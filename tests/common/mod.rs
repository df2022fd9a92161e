#![allow(dead_code)]
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestProject {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProject {
    pub fn new(config_toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("llmstack.toml");
        std::fs::write(&config_path, config_toml).unwrap();
        Self { dir, config_path }
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.path().join(".llmstack").join("state.json")
    }

    /// Current `[ports]` table of the config file.
    pub fn persisted_port(&self, key: &str) -> Option<u16> {
        let content = std::fs::read_to_string(&self.config_path).ok()?;
        let doc: toml::Table = content.parse().ok()?;
        doc.get("ports")?
            .get(key)?
            .as_integer()
            .and_then(|p| u16::try_from(p).ok())
    }
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn free_ports(count: usize) -> Vec<u16> {
    // Bind all at once to avoid reuse, then drop
    let listeners: Vec<_> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports: Vec<_> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    drop(listeners);
    ports
}

pub async fn wait_for_port(port: u16, timeout: std::time::Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}

pub async fn wait_for_port_release(port: u16, timeout: std::time::Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}

/// A config with one `python3 -m http.server` service per port.
pub fn http_server_stack(ports: &[(&str, u16, &[u16])]) -> String {
    let mut config = String::from(
        r#"
[project]
name = "it"
host = "127.0.0.1"
"#,
    );
    for (name, port, fallbacks) in ports {
        config.push_str(&format!(
            r#"
[[service]]
name = "{name}"
command = ["python3", "-m", "http.server", "{{{{ port }}}}", "--bind", "127.0.0.1"]
port = {port}
fallback_ports = {fallbacks:?}
health = "http://{{{{ host }}}}:{{{{ port }}}}/"
startup_timeout_secs = 15
poll_interval_ms = 200
"#
        ));
    }
    config
}

/// Send SIGINT to a running llmstack, as Ctrl+C would.
#[cfg(unix)]
pub fn interrupt(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        )
        .ok();
    }
}

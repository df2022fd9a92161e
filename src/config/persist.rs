use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StackError;

/// Records the port a service was given so the next run prefers it.
pub trait PortStore: Send + Sync {
    fn persist(&self, key: &str, port: u16) -> Result<(), StackError>;
}

/// Writes `ports.<key>` back into the TOML config file.
///
/// Only the `[ports]` table is touched. The rest of the file, comments
/// included, is kept as written unless `ports` is spelled as an inline or
/// dotted table, in which case the whole document is re-rendered.
pub struct TomlPortStore {
    path: PathBuf,
}

impl TomlPortStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_err(&self, reason: impl ToString) -> StackError {
        StackError::ConfigPersist {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl PortStore for TomlPortStore {
    fn persist(&self, key: &str, port: u16) -> Result<(), StackError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.persist_err(e))?;
        let mut doc: toml::Table = content.parse().map_err(|e| self.persist_err(e))?;

        let ports = doc
            .entry("ports")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let ports = ports
            .as_table_mut()
            .ok_or_else(|| self.persist_err("`ports` is not a table"))?;

        if ports.get(key).and_then(|v| v.as_integer()) == Some(i64::from(port)) {
            debug!(key, port, "port already recorded");
            return Ok(());
        }
        ports.insert(key.to_string(), toml::Value::Integer(i64::from(port)));

        let rendered = match edit_ports_section(&content, key, port) {
            Some(edited) if records_port(&edited, key, port) => edited,
            _ => {
                debug!(path = %self.path.display(), "re-rendering config to record port");
                toml::to_string_pretty(&doc).map_err(|e| self.persist_err(e))?
            }
        };

        // Atomic write: write to tmp file then rename
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, rendered).map_err(|e| self.persist_err(e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.persist_err(e))?;
        debug!(key, port, path = %self.path.display(), "port persisted");
        Ok(())
    }
}

fn records_port(content: &str, key: &str, port: u16) -> bool {
    content
        .parse::<toml::Table>()
        .ok()
        .and_then(|doc| doc.get("ports")?.get(key)?.as_integer())
        == Some(i64::from(port))
}

fn toml_key(key: &str) -> String {
    if !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        key.to_string()
    } else {
        format!("{key:?}")
    }
}

/// Name of the table a header line opens, or `None` for any other line.
fn table_header(line: &str) -> Option<&str> {
    let line = line.trim();
    let line = line.split_once('#').map_or(line, |(head, _)| head).trim_end();
    if line.starts_with("[[") {
        return Some("");
    }
    line.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

/// Set `key = port` in the `[ports]` section of `content` without touching
/// any other line. Appends a `[ports]` section when there is none.
fn edit_ports_section(content: &str, key: &str, port: u16) -> Option<String> {
    let key = toml_key(key);
    let entry = format!("{key} = {port}");
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    let mut header = None;
    let mut last_entry = None;
    let mut section: Option<&str> = None;
    for (i, line) in content.lines().enumerate() {
        if let Some(name) = table_header(line) {
            section = Some(name);
            if name == "ports" {
                header = Some(i);
            }
            continue;
        }
        if section != Some("ports") {
            continue;
        }
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        last_entry = Some(i);
        let Some((k, _)) = trimmed.split_once('=') else {
            continue;
        };
        if k.trim() == key {
            let indent = &line[..line.len() - trimmed.len()];
            lines[i] = format!("{indent}{entry}");
            return Some(join_lines(lines, content));
        }
    }

    match (header, last_entry) {
        (Some(_), Some(after)) | (Some(after), None) => lines.insert(after + 1, entry),
        (None, _) => {
            if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                lines.push(String::new());
            }
            lines.push("[ports]".to_string());
            lines.push(entry);
        }
    }
    Some(join_lines(lines, content))
}

fn join_lines(lines: Vec<String>, original: &str) -> String {
    let newline = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = lines.join(newline);
    out.push_str(newline);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::StackConfig;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[project]
name = "local-llm"

[ports]
ui = 8501

[[service]]
name = "api"
command = "uvicorn api.main:app"
port = 8000
health = "http://localhost:8000/health"
"#;

    #[test]
    fn writes_port_and_keeps_other_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmstack.toml");
        std::fs::write(&path, CONFIG).unwrap();

        TomlPortStore::new(&path).persist("api", 8002).unwrap();

        let config: StackConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.ports["api"], 8002);
        assert_eq!(config.ports["ui"], 8501);
        assert_eq!(config.project.name, "local-llm");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].port, Some(8000));
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn creates_ports_table_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmstack.toml");
        std::fs::write(&path, "[project]\nname = \"x\"\n").unwrap();

        TomlPortStore::new(&path).persist("ui", 8502).unwrap();

        let config: StackConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.ports["ui"], 8502);
    }

    #[test]
    fn comments_and_layout_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmstack.toml");
        let original = "# local stack\n[project]\nname = \"x\" # shown in the summary\n\n[ports]\n# picked at runtime\nui = 8501\n\n[[service]]\nname = \"api\"\ncommand = \"uvicorn api.main:app\"\nport = 8000\nhealth = \"http://localhost:8000/health\"\n";
        std::fs::write(&path, original).unwrap();

        let store = TomlPortStore::new(&path);
        store.persist("api", 8002).unwrap();
        store.persist("ui", 8502).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            original.replace("ui = 8501\n", "ui = 8502\napi = 8002\n")
        );
    }

    #[test]
    fn commented_out_ports_table_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmstack.toml");
        let original = "[project]\nname = \"x\"\n\n# Ports picked at runtime are written back here.\n# [ports]\n";
        std::fs::write(&path, original).unwrap();

        TomlPortStore::new(&path).persist("api", 8001).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(original), "got: {written}");
        assert!(written.ends_with("\n[ports]\napi = 8001\n"), "got: {written}");
    }

    #[test]
    fn inline_ports_table_falls_back_to_rendering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llmstack.toml");
        std::fs::write(&path, "ports = { ui = 8501 }\n[project]\nname = \"x\"\n").unwrap();

        TomlPortStore::new(&path).persist("api", 8001).unwrap();

        let config: StackConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.ports["api"], 8001);
        assert_eq!(config.ports["ui"], 8501);
    }

    #[test]
    fn missing_file_is_a_persist_error() {
        let dir = TempDir::new().unwrap();
        let store = TomlPortStore::new(dir.path().join("absent.toml"));
        let err = store.persist("api", 8000).unwrap_err();
        assert!(matches!(err, StackError::ConfigPersist { .. }));
        assert!(!err.is_fatal());
    }
}

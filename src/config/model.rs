use serde::{de, Deserialize, Deserializer};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct StackConfig {
    pub project: ProjectConfig,
    /// Ports assigned by previous runs, keyed by each service's `port_key`.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<DependencyConfig>,
    /// Services in start order.
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_known_processes() -> Vec<String> {
    ["python", "pythonw", "uvicorn", "streamlit", "ollama"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_max_cycles() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReclaimConfig {
    /// Process names this stack launches itself; occupants matching one of
    /// these are terminated without asking.
    #[serde(default = "default_known_processes")]
    pub known_processes: Vec<String>,
    /// Wait after each remediation before re-checking the port.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Graceful/forced cycles for a live occupant.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Permit host-wide remediation (port exclusion ranges, network stack
    /// reset) for zombie ports. Needs elevated privileges.
    #[serde(default)]
    pub allow_host_network_changes: bool,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            known_processes: default_known_processes(),
            settle_ms: default_settle_ms(),
            max_cycles: default_max_cycles(),
            allow_host_network_changes: false,
        }
    }
}

fn default_dependency_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DependencyConfig {
    pub name: String,
    pub command: StringOrList,
    #[serde(default = "default_dependency_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_health_timeout_ms() -> u64 {
    2000
}

fn default_max_start_retries() -> u32 {
    3
}

fn default_stop_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Key under `[ports]` the assigned port is written back to. Defaults to
    /// the service name.
    #[serde(default)]
    pub port_key: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub fallback_ports: Vec<u16>,
    pub command: StringOrList,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub health: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_max_start_retries")]
    pub max_start_retries: u32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Reuse an instance that is already healthy on the preferred port.
    #[serde(default)]
    pub adopt_existing: bool,
}

impl ServiceConfig {
    pub fn port_key(&self) -> &str {
        self.port_key.as_deref().unwrap_or(&self.name)
    }
}

/// A value that can be either a single string or a list of strings.
/// A single string is run through the platform shell; a list is executed
/// directly with the first element as the program.
#[derive(Debug, Clone, PartialEq)]
pub enum StringOrList {
    Shell(String),
    Argv(Vec<String>),
}

impl StringOrList {
    pub fn is_empty(&self) -> bool {
        match self {
            StringOrList::Shell(s) => s.trim().is_empty(),
            StringOrList::Argv(v) => v.first().is_none_or(|p| p.trim().is_empty()),
        }
    }

    /// Human-readable form for log messages.
    pub fn display(&self) -> String {
        match self {
            StringOrList::Shell(s) => s.clone(),
            StringOrList::Argv(v) => v.join(" "),
        }
    }
}

impl<'de> Deserialize<'de> for StringOrList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringOrListVisitor;

        impl<'de> de::Visitor<'de> for StringOrListVisitor {
            type Value = StringOrList;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string or a list of strings")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<StringOrList, E> {
                Ok(StringOrList::Shell(value.to_string()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<StringOrList, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    values.push(value);
                }
                Ok(StringOrList::Argv(values))
            }
        }

        deserializer.deserialize_any(StringOrListVisitor)
    }
}

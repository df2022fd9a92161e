use std::collections::BTreeMap;

/// Base URL of a service reachable on `host:port`.
pub fn service_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// `LLMSTACK_<NAME>` prefix for a service; dashes and dots become
/// underscores so the result is a valid variable name.
fn env_prefix(service: &str) -> String {
    let upper: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("LLMSTACK_{}", upper)
}

/// Build the environment for one service launch.
///
/// The layering order (later overrides earlier):
/// 1. Global env from `[env]`
/// 2. `LLMSTACK_<NAME>_{HOST,PORT,URL}` for every service started before this one
/// 3. `PORT` and `HOST` for the service itself
/// 4. Service-specific env (explicit overrides)
///
/// Values are expected to be template-expanded already.
pub fn build_service_env(
    global: &BTreeMap<String, String>,
    service_env: &BTreeMap<String, String>,
    host: &str,
    port: u16,
    started: &[(String, u16)],
) -> BTreeMap<String, String> {
    let mut env = global.clone();

    for (name, other_port) in started {
        let prefix = env_prefix(name);
        env.insert(format!("{}_HOST", prefix), host.to_string());
        env.insert(format!("{}_PORT", prefix), other_port.to_string());
        env.insert(format!("{}_URL", prefix), service_url(host, *other_port));
    }

    env.insert("PORT".to_string(), port.to_string());
    env.insert("HOST".to_string(), host.to_string());

    for (k, v) in service_env {
        env.insert(k.clone(), v.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn own_port_and_host() {
        let env = build_service_env(&BTreeMap::new(), &BTreeMap::new(), "localhost", 8000, &[]);
        assert_eq!(env["PORT"], "8000");
        assert_eq!(env["HOST"], "localhost");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn earlier_services_are_discoverable() {
        let started = vec![("ollama".to_string(), 11434), ("api-gw".to_string(), 8001)];
        let env = build_service_env(&BTreeMap::new(), &BTreeMap::new(), "127.0.0.1", 8501, &started);
        assert_eq!(env["LLMSTACK_OLLAMA_HOST"], "127.0.0.1");
        assert_eq!(env["LLMSTACK_OLLAMA_PORT"], "11434");
        assert_eq!(env["LLMSTACK_OLLAMA_URL"], "http://127.0.0.1:11434");
        assert_eq!(env["LLMSTACK_API_GW_PORT"], "8001");
    }

    #[test]
    fn service_env_overrides_global_and_generated() {
        let global = map(&[("LOG_LEVEL", "info"), ("MODEL", "llama3")]);
        let own = map(&[("LOG_LEVEL", "debug"), ("HOST", "0.0.0.0")]);
        let env = build_service_env(&global, &own, "localhost", 8000, &[]);
        assert_eq!(env["LOG_LEVEL"], "debug");
        assert_eq!(env["MODEL"], "llama3");
        assert_eq!(env["HOST"], "0.0.0.0");
    }
}

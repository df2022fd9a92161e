use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::config::interpolate::template_references;
use crate::config::model::{StackConfig, StringOrList};

/// Minimum Jaro-Winkler score for a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("service name `{name}` is declared more than once")]
    DuplicateService { name: String },

    #[error("service `{service}` has an empty command")]
    EmptyCommand { service: String },

    #[error("dependency check `{name}` has an empty command")]
    EmptyDependencyCommand { name: String },

    #[error("port {port} is the preferred port of multiple services: {services:?}")]
    DuplicatePort { port: u16, services: Vec<String> },

    #[error("service `{service}` has no port; set `port` or `ports.{port_key}`")]
    MissingPort { service: String, port_key: String },

    #[error("service `{service}` uses port 0")]
    ZeroPort { service: String },

    #[error("service `{service}` has a health target that is not an http(s) URL: `{url}`")]
    InvalidHealthUrl { service: String, url: String },

    #[error("service `{service}` sets `{field}` to 0")]
    ZeroDuration { service: String, field: &'static str },

    #[error("service `{service}` has max_start_retries = 0; at least one attempt is required")]
    NoStartAttempts { service: String },

    #[error("`{{{{ {variable} }}}}` in {field} does not refer to a service started earlier{}", suggestion.as_ref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default())]
    UnknownTemplateVariable {
        field: String,
        variable: String,
        suggestion: Option<String>,
    },
}

fn find_closest_match<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let score = strsim::jaro_winkler(name, candidate);
        if score >= SUGGESTION_THRESHOLD && best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate.as_str(), score));
        }
    }
    best.map(|(c, _)| c)
}

/// Validate a parsed config, collecting every problem instead of stopping at
/// the first one.
pub fn validate(config: &StackConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let mut seen_names = HashSet::new();
    for svc in &config.services {
        if !seen_names.insert(svc.name.as_str()) {
            errors.push(ConfigError::DuplicateService {
                name: svc.name.clone(),
            });
        }
    }

    for dep in &config.dependencies {
        if dep.command.is_empty() {
            errors.push(ConfigError::EmptyDependencyCommand {
                name: dep.name.clone(),
            });
        }
    }

    let mut preferred: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    // Template variables are only available for services that start earlier.
    let mut known_vars: Vec<String> = vec!["project.name".into(), "host".into(), "port".into()];

    for svc in &config.services {
        if svc.command.is_empty() {
            errors.push(ConfigError::EmptyCommand {
                service: svc.name.clone(),
            });
        }

        let effective = config.ports.get(svc.port_key()).copied().or(svc.port);
        if let Some(port) = effective {
            preferred.entry(port).or_default().push(svc.name.clone());
        }
        if effective == Some(0) || svc.fallback_ports.contains(&0) {
            errors.push(ConfigError::ZeroPort {
                service: svc.name.clone(),
            });
        }

        if !(svc.health.starts_with("http://") || svc.health.starts_with("https://")) {
            errors.push(ConfigError::InvalidHealthUrl {
                service: svc.name.clone(),
                url: svc.health.clone(),
            });
        }

        for (field, value) in [
            ("startup_timeout_secs", svc.startup_timeout_secs),
            ("poll_interval_ms", svc.poll_interval_ms),
            ("health_timeout_ms", svc.health_timeout_ms),
        ] {
            if value == 0 {
                errors.push(ConfigError::ZeroDuration {
                    service: svc.name.clone(),
                    field,
                });
            }
        }

        if svc.max_start_retries == 0 {
            errors.push(ConfigError::NoStartAttempts {
                service: svc.name.clone(),
            });
        }

        let mut fields: Vec<(String, &str)> = vec![(format!("service.{}.health", svc.name), &svc.health)];
        match &svc.command {
            StringOrList::Shell(s) => {
                fields.push((format!("service.{}.command", svc.name), s));
            }
            StringOrList::Argv(argv) => {
                for arg in argv {
                    fields.push((format!("service.{}.command", svc.name), arg));
                }
            }
        }
        for (k, v) in &svc.env {
            fields.push((format!("service.{}.env.{k}", svc.name), v));
        }
        for (field, value) in fields {
            for variable in template_references(value) {
                if !known_vars.contains(&variable) {
                    let suggestion = find_closest_match(&variable, &known_vars).map(String::from);
                    errors.push(ConfigError::UnknownTemplateVariable {
                        field: field.clone(),
                        variable,
                        suggestion,
                    });
                }
            }
        }

        known_vars.push(format!("services.{}.port", svc.name));
        known_vars.push(format!("services.{}.url", svc.name));
    }

    for svc in &config.services {
        if config.ports.get(svc.port_key()).or(svc.port.as_ref()).is_none() {
            errors.push(ConfigError::MissingPort {
                service: svc.name.clone(),
                port_key: svc.port_key().to_string(),
            });
        }
    }

    for (port, services) in preferred {
        if services.len() > 1 {
            errors.push(ConfigError::DuplicatePort { port, services });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Minimum Jaro-Winkler score to consider a template variable a close match.
const TEMPLATE_SUGGESTION_THRESHOLD: f64 = 0.8;

/// Compiled pattern matching `{{ path.to.value }}` template expressions.
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("template regex must compile"));

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved variable '{{{{{{ {variable} }}}}}}' in {field}{}", suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default())]
    UnresolvedVariable {
        field: String,
        variable: String,
        suggestion: Option<String>,
    },
}

/// Find the closest matching template variable name using Jaro-Winkler similarity.
fn find_closest_template_var<'a>(name: &str, vars: &'a HashMap<String, String>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for key in vars.keys() {
        let score = strsim::jaro_winkler(name, key);
        if score >= TEMPLATE_SUGGESTION_THRESHOLD && best.is_none_or(|(_, s)| score > s) {
            best = Some((key.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

/// Names of all `{{ var }}` references in `input`, in order of appearance.
pub fn template_references(input: &str) -> Vec<String> {
    TEMPLATE_RE
        .captures_iter(input)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Resolve all `{{ var }}` expressions in `input` using `vars`.
///
/// Every unresolved reference is reported, not just the first one.
pub fn resolve_template(
    input: &str,
    vars: &HashMap<String, String>,
    field_context: &str,
) -> Result<String, Vec<TemplateError>> {
    let errors: Vec<TemplateError> = template_references(input)
        .into_iter()
        .filter(|variable| !vars.contains_key(variable))
        .map(|variable| {
            let suggestion = find_closest_template_var(&variable, vars).map(String::from);
            TemplateError::UnresolvedVariable {
                field: field_context.to_string(),
                variable,
                suggestion,
            }
        })
        .collect();

    if !errors.is_empty() {
        return Err(errors);
    }

    let resolved = TEMPLATE_RE
        .replace_all(input, |cap: &regex::Captures| {
            let key = &cap[1];
            vars.get(key).cloned().unwrap_or_default()
        })
        .into_owned();

    Ok(resolved)
}

/// Build the lookup table for one service launch.
///
/// Produced keys:
///   - `project.name`, `host`, `port` (the port just allocated)
///   - `services.{name}.port` and `services.{name}.url` for every service
///     that is already up
pub fn build_template_vars(
    project: &str,
    host: &str,
    port: u16,
    started: &[(String, u16)],
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("project.name".to_string(), project.to_string());
    vars.insert("host".to_string(), host.to_string());
    vars.insert("port".to_string(), port.to_string());

    for (name, svc_port) in started {
        vars.insert(format!("services.{name}.port"), svc_port.to_string());
        vars.insert(
            format!("services.{name}.url"),
            crate::discovery::env::service_url(host, *svc_port),
        );
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vars() -> HashMap<String, String> {
        build_template_vars(
            "local-llm",
            "localhost",
            8501,
            &[("ollama".to_string(), 11434), ("api".to_string(), 8001)],
        )
    }

    #[test]
    fn basic_substitution() {
        let vars = make_vars();
        let result = resolve_template("--port={{ port }}", &vars, "test_field").unwrap();
        assert_eq!(result, "--port=8501");
    }

    #[test]
    fn multiple_substitutions() {
        let vars = make_vars();
        let input = "http://{{ host }}:{{ services.api.port }}/v1";
        let result = resolve_template(input, &vars, "test_field").unwrap();
        assert_eq!(result, "http://localhost:8001/v1");
    }

    #[test]
    fn service_url_var() {
        let vars = make_vars();
        let result = resolve_template("{{ services.ollama.url }}", &vars, "f").unwrap();
        assert_eq!(result, "http://localhost:11434");
    }

    #[test]
    fn unresolved_variable_error() {
        let vars = make_vars();
        let result = resolve_template("{{ services.ui.port }}", &vars, "service.api.env.UI");
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            TemplateError::UnresolvedVariable {
                field, variable, ..
            } => {
                assert_eq!(field, "service.api.env.UI");
                assert_eq!(variable, "services.ui.port");
            }
        }
    }

    #[test]
    fn unresolved_variable_suggests_close_match() {
        let vars = make_vars();
        let errors = resolve_template("{{ services.api.prot }}", &vars, "f").unwrap_err();
        match &errors[0] {
            TemplateError::UnresolvedVariable { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("services.api.port"));
            }
        }
    }

    #[test]
    fn no_templates_is_noop() {
        let vars = make_vars();
        let input = "plain string with no templates";
        assert_eq!(resolve_template(input, &vars, "f").unwrap(), input);
    }

    #[test]
    fn whitespace_in_braces() {
        let vars = make_vars();
        let result = resolve_template("{{   port   }}", &vars, "f").unwrap();
        assert_eq!(result, "8501");
    }

    #[test]
    fn references_are_listed_in_order() {
        let refs = template_references("{{ host }}:{{ services.api.port }}");
        assert_eq!(refs, vec!["host", "services.api.port"]);
    }
}

pub mod interpolate;
pub mod model;
pub mod persist;
pub mod resolve;
pub mod validate;

use std::path::Path;

use anyhow::bail;

use model::StackConfig;

pub fn load_config(path: &Path) -> anyhow::Result<StackConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: StackConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
    Ok(config)
}

/// Load and validate, reporting every validation problem at once.
pub fn load_validated(path: &Path) -> anyhow::Result<StackConfig> {
    let config = load_config(path)?;
    if let Err(errors) = validate::validate(&config) {
        let mut msg = String::from("Configuration errors:\n");
        for err in &errors {
            msg.push_str(&format!("  - {}\n", err));
        }
        bail!("{}", msg.trim_end());
    }
    Ok(config)
}

use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config;
use crate::config::resolve::resolve_config;
use crate::config::validate::validate;

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let location = resolve_config(config_file)?;
    let config = config::load_config(&location.config_path)?;

    let filename = location
        .config_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| config::resolve::CONFIG_FILENAME.to_string());

    match validate(&config) {
        Ok(()) => {
            println!(
                "  {} {} is valid ({} services, {} dependency checks)",
                "\u{2713}".green(),
                filename,
                config.services.len(),
                config.dependencies.len(),
            );
            Ok(())
        }
        Err(errors) => {
            for err in &errors {
                eprintln!("  {} {}", "\u{2717}".red(), err);
            }
            bail!("{} has {} problem(s)", filename, errors.len());
        }
    }
}

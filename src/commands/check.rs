use anyhow::{bail, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::resolve::resolve_config;
use crate::error::StackError;
use crate::orchestrator::{spawn_interrupt_watcher, Orchestrator};

/// Run every configured dependency check and report each one.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let orchestrator = Orchestrator::from_config(resolve_config(config_file)?)?;
    let checks = orchestrator.dependency_checks();

    println!("llmstack check");
    println!("==============");
    println!();
    if checks.is_empty() {
        println!("No dependency checks configured.");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let watcher = spawn_interrupt_watcher(cancel.clone(), None);
    let mut failed = 0;

    for check in &checks {
        match check.run(&cancel).await {
            Ok(detail) => println!("  [ok] {:<16} {}", check.name, detail),
            Err(StackError::Interrupted) => {
                watcher.abort();
                bail!("interrupted");
            }
            Err(StackError::DependencyCheck { reason, .. }) => {
                println!("  [!!] {:<16} {}", check.name, reason);
                failed += 1;
            }
            Err(e) => {
                println!("  [!!] {:<16} {}", check.name, e);
                failed += 1;
            }
        }
    }
    watcher.abort();

    println!();
    if failed > 0 {
        bail!("{} of {} dependency checks failed", failed, checks.len());
    }
    println!("All dependency checks passed.");
    Ok(())
}

use anyhow::{bail, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::resolve::resolve_config;
use crate::error::StackError;
use crate::orchestrator::reclaim::OccupantKind;
use crate::orchestrator::{spawn_interrupt_watcher, Orchestrator};

/// Free the given ports. Processes that are not ours are only touched with
/// `force`.
pub async fn run(config_file: Option<&Path>, ports: &[u16], force: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(resolve_config(config_file)?)?;
    orchestrator.remember_previous_run();

    let cancel = CancellationToken::new();
    let watcher = spawn_interrupt_watcher(cancel.clone(), None);
    let mut failed = 0;

    for &port in ports {
        let Some(owner) = orchestrator.finder().find_owner(port) else {
            if orchestrator.probe().is_free(port) {
                println!("  [ok] port {:<6} already free", port);
            } else {
                println!("  [!!] port {:<6} in use, but its owner cannot be determined", port);
                failed += 1;
            }
            continue;
        };

        let kind = orchestrator.reclaimer().classify(&owner);
        if kind == OccupantKind::Foreign && !force {
            println!(
                "  [!!] port {:<6} held by {}, which llmstack did not start (use --force)",
                port, owner
            );
            failed += 1;
            continue;
        }

        match orchestrator.reclaimer().reclaim(port, &owner, &cancel).await {
            Ok(()) => println!("  [ok] port {:<6} freed ({})", port, owner),
            Err(StackError::Interrupted) => {
                watcher.abort();
                bail!("interrupted");
            }
            Err(e) => {
                println!("  [!!] port {:<6} {}", port, e);
                failed += 1;
            }
        }
    }
    watcher.abort();

    if failed > 0 {
        bail!("{} of {} ports could not be freed", failed, ports.len());
    }
    Ok(())
}

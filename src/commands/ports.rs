use anyhow::Result;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, ContentArrangement, Table};
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::orchestrator::finder::ProcessInfo;
use crate::orchestrator::reclaim::OccupantKind;
use crate::orchestrator::Orchestrator;

/// What currently holds a port, as shown in the table.
fn occupancy(free: bool, owner: Option<&ProcessInfo>, kind: Option<OccupantKind>) -> String {
    match (free, owner, kind) {
        (true, _, _) => "free".to_string(),
        (false, None, _) => "in use (owner unknown)".to_string(),
        (false, Some(owner), Some(OccupantKind::Family)) => format!("{} (ours)", owner),
        (false, Some(owner), Some(OccupantKind::Zombie)) => format!("{} (stale)", owner),
        (false, Some(owner), _) => format!("{} (other)", owner),
    }
}

/// Show each service's configured ports and who holds them right now.
pub fn run(config_file: Option<&Path>) -> Result<()> {
    let orchestrator = Orchestrator::from_config(resolve_config(config_file)?)?;
    orchestrator.remember_previous_run();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Service", "Key", "Port", "Occupant"]);

    for descriptor in orchestrator.descriptors()? {
        for (i, port) in descriptor.candidates().into_iter().enumerate() {
            let free = orchestrator.probe().is_free(port);
            let owner = if free {
                None
            } else {
                orchestrator.finder().find_owner(port)
            };
            let kind = owner.as_ref().map(|o| orchestrator.reclaimer().classify(o));
            let (name, key) = if i == 0 {
                (descriptor.name.clone(), descriptor.port_key.clone())
            } else {
                (String::new(), "fallback".to_string())
            };
            table.add_row(vec![
                Cell::new(name),
                Cell::new(key),
                Cell::new(port),
                Cell::new(occupancy(free, owner.as_ref(), kind)),
            ]);
        }
    }

    println!();
    for line in table.to_string().lines() {
        println!("  {}", line);
    }
    println!();
    Ok(())
}

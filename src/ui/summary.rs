use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

pub struct RunningService {
    pub name: String,
    pub url: String,
    pub pid: Option<u32>,
    pub adopted: bool,
}

fn render_table(services: &[RunningService], use_color: bool) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Service").set_alignment(CellAlignment::Left),
        Cell::new("URL").set_alignment(CellAlignment::Left),
        Cell::new("PID").set_alignment(CellAlignment::Right),
        Cell::new("Status").set_alignment(CellAlignment::Center),
    ]);

    for svc in services {
        let status = if svc.adopted { "existing" } else { "ready" };
        let status_text = if use_color {
            if svc.adopted {
                format!("{} {}", "\u{25cf}".cyan(), status.cyan())
            } else {
                format!("{} {}", "\u{25cf}".green(), status.green())
            }
        } else {
            format!("\u{25cf} {}", status)
        };
        let pid = svc
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&svc.name),
            Cell::new(&svc.url),
            Cell::new(pid),
            Cell::new(&status_text),
        ]);
    }
    table.to_string()
}

/// Print the ready services. The last one in start order is the UI.
pub fn print_startup_summary(project: &str, services: &[RunningService]) {
    let use_color = std::io::stdout().is_terminal();

    println!();
    if use_color {
        println!("  {} {}", "llmstack".bold(), project.cyan());
    } else {
        println!("  llmstack {}", project);
    }
    println!();

    // Indent the table by 2 spaces
    for line in render_table(services, use_color).lines() {
        println!("  {}", line);
    }

    if let Some(ui) = services.last() {
        println!();
        if use_color {
            println!("  Open {}", ui.url.bold().underline());
        } else {
            println!("  Open {}", ui.url);
        }
    }

    println!();
    if use_color {
        println!("  Press {} to stop", "Ctrl+C".bold());
    } else {
        println!("  Press Ctrl+C to stop");
    }
    println!();
}

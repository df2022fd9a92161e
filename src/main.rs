use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use llmstack::cli::{Cli, Commands};
use llmstack::commands;
use llmstack::config::resolve::resolve_config;
use llmstack::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_file = cli.global.config_file.as_deref();

    let result = match cli.command {
        Commands::Up => run_up(config_file).await,
        Commands::Check => commands::check::run(config_file).await,
        Commands::Ports => commands::ports::run(config_file),
        Commands::Reclaim { ports, force } => {
            commands::reclaim::run(config_file, &ports, force).await
        }
        Commands::Validate => commands::validate::run(config_file),
        Commands::Init => commands::init::run(),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "llmstack", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_up(config_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let location = resolve_config(config_file)?;
    let orchestrator = Orchestrator::from_config(location)?;
    orchestrator.run().await
}

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use wgbridge::cli::{commands, Cli, Commands};
use wgbridge::launcher::RunMode;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The foreground worker installs its own subscriber from --log-level
    let is_worker =
        matches!(cli.command, Commands::Add(_)) && RunMode::from_env() == RunMode::Foreground;
    if !is_worker {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str().to_lowercase()));

        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Add(args) => commands::cmd_add(args).await,
        Commands::Down { interface, flavor } => commands::cmd_down(interface, flavor).await,
        Commands::Status { interface } => commands::cmd_status(interface).await,
        Commands::Genkey => {
            commands::cmd_genkey();
            Ok(())
        }
        Commands::Pubkey => commands::cmd_pubkey(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

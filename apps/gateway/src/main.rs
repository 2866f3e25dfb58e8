use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use valheim_gateway::config::Config;

#[derive(Parser, Debug)]
#[command(name = "valheim-gateway")]
#[command(about = "Chat interaction gateway and auto-shutdown sweeper for an on-demand Valheim server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve interactions and run the sweeper in-process (default).
    Serve,
    /// Run a single auto-shutdown sweep and exit.
    Sweep,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => valheim_gateway::serve(config).await,
        Command::Sweep => {
            valheim_gateway::run_sweep_once(config).await?;
            Ok(())
        }
    }
}

use chain_sentinel::cli::{self, Cli, Commands};
use chain_sentinel::error::Result;
use clap::Parser;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Retry { id }) => {
            init_logging_simple();
            let config = cli::load_config(&cli.config)?;
            cli::retry(config, id).await?;
        }
        Some(Commands::RpcHealth) => {
            init_logging_simple();
            let config = cli::load_config(&cli.config)?;
            cli::rpc_health(&config).await?;
        }
        Some(Commands::Status) => {
            init_logging_simple();
            let config = cli::load_config(&cli.config)?;
            cli::status(&config)?;
        }
        Some(Commands::Run) | None => {
            let config = cli::load_config(&cli.config)?;
            init_logging(&config.logging);
            cli::run(config).await?;
        }
    }

    Ok(())
}

//! `hyperfenced`: the node daemon binary.

mod cli;
mod run;
mod sampler;
mod tasks;

use clap::Parser;
use cli::{Cli, Commands};
use hyperfence_config::Config;
use std::path::PathBuf;

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load_config(config)?;
            init_logging(&config);
            run::run(config).await
        }
        Commands::Flush { config } => {
            let config = load_config(config)?;
            init_logging(&config);
            run::flush(config).await
        }
        Commands::Ready { config } => {
            let config = load_config(config)?;
            init_logging(&config);
            run::ready(config).await
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config)?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

use anyhow::Result;
use clap::Parser;
use prob_unet::candle_unet_config::ProbUnetConfig;
use prob_unet::cli::{train, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
        Commands::Config => {
            println!("{}", ProbUnetConfig::default().to_json_string()?);
        }
    }

    Ok(())
}

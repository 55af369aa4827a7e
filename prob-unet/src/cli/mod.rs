pub mod train;

use clap::{Parser, Subcommand};

pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "prob-unet")]
#[command(about = "Hierarchical probabilistic U-Net for ambiguous segmentation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train on synthetic ambiguous disks and report sample diversity
    Train(TrainArgs),
    /// Print the default model configuration as JSON
    Config,
}

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;

use crate::candle_inference::TrainConfig;
use crate::candle_prob_unet::{pixelwise_sample_stats, HierarchicalProbUnet};
use crate::candle_segmentation_data::synthetic_ambiguous_disks;
use crate::candle_unet_config::{ActivationKind, ProbUnetConfig};
use crate::candle_unet_inference::train_prob_unet;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(short, long, help = "Model configuration (JSON); defaults otherwise")]
    pub config: Option<PathBuf>,

    #[arg(long, value_delimiter = ',', help = "Encoder channels per scale, e.g. 8,16,32,32")]
    pub channels: Option<Vec<usize>>,

    #[arg(long, value_delimiter = ',', help = "Latent dimension per scale, e.g. 1,1")]
    pub latent_dims: Option<Vec<usize>>,

    #[arg(long)]
    pub activation: Option<ActivationKind>,

    #[arg(long, help = "KL weight")]
    pub beta: Option<f64>,

    #[arg(long, default_value = "64", help = "Number of synthetic images")]
    pub num_images: usize,

    #[arg(long, default_value = "32", help = "Synthetic image height and width")]
    pub image_size: usize,

    #[arg(long, default_value = "20")]
    pub epochs: usize,

    #[arg(long, default_value = "8")]
    pub batch_size: usize,

    #[arg(long, default_value = "0.001")]
    pub lr: f32,

    #[arg(long, default_value = "16", help = "Prior draws for the diversity report")]
    pub num_draws: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(short, long, help = "Save trained weights (safetensors)")]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn load_config(args: &TrainArgs) -> Result<ProbUnetConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ProbUnetConfig::from_json_str(&std::fs::read_to_string(path)?)?
        }
        None => ProbUnetConfig {
            channels_per_block: vec![8, 16, 32, 32],
            latent_dims: vec![1, 1],
            convs_per_block: 2,
            blocks_per_level: 1,
            ..Default::default()
        },
    };

    if let Some(channels) = &args.channels {
        config.channels_per_block = channels.clone();
        config.down_channels_per_block = None;
    }
    if let Some(latent_dims) = &args.latent_dims {
        config.latent_dims = latent_dims.clone();
    }
    if let Some(activation) = args.activation {
        config.activation = activation;
    }
    if let Some(beta) = args.beta {
        config.loss.beta = beta;
    }

    config.validate()?;
    Ok(config)
}

fn select_device(gpu: bool) -> Device {
    if gpu {
        #[cfg(feature = "metal")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(all(feature = "cuda", not(feature = "metal")))]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    let config = load_config(args)?;
    info!("{}", config.to_json_string()?);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut data = synthetic_ambiguous_disks(args.num_images, args.image_size, &mut rng)?;
    info!(
        "Generated {} ambiguous disks of size {}x{}",
        data.num_samples(),
        args.image_size,
        args.image_size
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = HierarchicalProbUnet::new(&config, vb)?;

    let train_config = TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let trace = train_prob_unet(&mut model, &varmap, &mut data, &train_config)?;

    if let (Some(loss), Some(kl)) = (trace.loss.last(), trace.kl.last()) {
        info!("Final loss: {:.4}, KL: {:.4}", loss, kl);
    }

    let eval = data.head(4, &device)?;
    let samples = model.sample_n(&eval.image, args.num_draws.max(1))?;
    let (_, var_prob) = pixelwise_sample_stats(&samples)?;
    let mean_var = var_prob.mean_all()?.to_scalar::<f32>()?;
    let max_var = var_prob.max_all()?.to_scalar::<f32>()?;
    info!(
        "Sample diversity over {} draws: mean pixel variance {:.5}, max {:.5}",
        args.num_draws.max(1),
        mean_var,
        max_var
    );

    if let Some(output) = &args.output {
        varmap.save(output)?;
        info!("Saved weights to {:?}", output);
    }

    Ok(())
}

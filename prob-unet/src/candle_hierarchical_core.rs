use crate::candle_aux_layers::StackLayers;
use crate::candle_latent::{LatentControl, LatentGaussian};
use crate::candle_model_traits::ParameterizedT;
use crate::candle_res_block::{res_level, ResBlock};
use crate::candle_resample::{resize_down, resize_up};
use crate::candle_scale_schedule::ScaleSchedule;
use crate::candle_unet_config::BlockConfig;
use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Module, VarBuilder};

/// Everything a hierarchical core pass produces
#[derive(Clone, Debug)]
pub struct HierarchicalPass {
    /// output of the truncated decoder
    pub decoder_features: Tensor,
    /// encoder output of every scale, outermost first
    pub encoder_features: Vec<Tensor>,
    /// predicted latent distribution per hierarchy level, coarsest first
    pub distributions: Vec<LatentGaussian>,
    /// latent actually injected at each level
    pub used_latents: Vec<Tensor>,
}

/// A U-Net with a full encoder and a truncated decoder.
///
/// The decoder has one level per latent scale; at each of them a
/// per-pixel Gaussian is predicted from the current decoder features,
/// a latent is drawn (or injected), concatenated, upsampled and fused
/// with the encoder output of the next finer scale.
///
/// The same structure serves as prior (image only) and posterior
/// (image and label stacked on the channel axis).
pub struct HierarchicalCore {
    input_channels: usize,
    latent_dims: Vec<usize>,
    schedule: ScaleSchedule,
    encoder_levels: Vec<StackLayers<ResBlock>>,
    mu_logsigma_blocks: Vec<Conv2d>,
    decoder_levels: Vec<StackLayers<ResBlock>>,
}

impl ParameterizedT for HierarchicalCore {
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        self.encoder_levels.append_parameters(params);
        for (mu_logsigma, decoder) in self.mu_logsigma_blocks.iter().zip(&self.decoder_levels) {
            mu_logsigma.append_parameters(params);
            decoder.append_parameters(params);
        }
    }
}

impl HierarchicalCore {
    /// Will create a hierarchical core with these variables:
    ///
    /// * `enc.{s}.block.{j}.*` residual blocks of encoder scale `s`
    /// * `latent.{l}.mu_logsigma.*` 1x1 conv predicting the Gaussian
    /// * `dec.{l}.block.{j}.*` residual blocks of decoder level `l`
    ///
    /// # Arguments
    /// * `input_channels` - channels of the input tensor
    /// * `latent_dims` - latent dimension per hierarchy level
    /// * `schedule` - channel schedule over encoder scales
    /// * `block` - residual block settings
    /// * `vs` - variable builder
    pub fn new(
        input_channels: usize,
        latent_dims: &[usize],
        schedule: &ScaleSchedule,
        block: &BlockConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let num_scales = schedule.num_scales();
        let num_latent_levels = latent_dims.len();

        if num_latent_levels >= num_scales {
            candle_core::bail!(
                "{} latent scales leave no decoder scale for stitching ({} encoder scales)",
                num_latent_levels,
                num_scales
            );
        }
        if latent_dims.iter().any(|&d| d == 0) {
            candle_core::bail!("zero latent dimension in {:?}", latent_dims);
        }

        // (1) descending encoder
        let mut encoder_levels = Vec::with_capacity(num_scales);
        let mut prev_dim = input_channels;
        for scale in 0..num_scales {
            encoder_levels.push(res_level(
                prev_dim,
                schedule.channels(scale),
                schedule.down_channels(scale),
                block,
                vs.pp(format!("enc.{}", scale)),
            )?);
            prev_dim = schedule.channels(scale);
        }

        // (2) ascending truncated decoder
        let mut mu_logsigma_blocks = Vec::with_capacity(num_latent_levels);
        let mut decoder_levels = Vec::with_capacity(num_latent_levels);
        for (level, &latent_dim) in latent_dims.iter().enumerate() {
            let here = schedule.decoder_channels(level)?;
            let next = schedule.decoder_channels(level + 1)?;

            mu_logsigma_blocks.push(candle_nn::conv2d(
                here,
                2 * latent_dim,
                1,
                Default::default(),
                vs.pp(format!("latent.{}.mu_logsigma", level)),
            )?);

            decoder_levels.push(res_level(
                next + here + latent_dim,
                next,
                schedule.decoder_down_channels(level + 1)?,
                block,
                vs.pp(format!("dec.{}", level)),
            )?);
        }

        Ok(Self {
            input_channels,
            latent_dims: latent_dims.to_vec(),
            schedule: schedule.clone(),
            encoder_levels,
            mu_logsigma_blocks,
            decoder_levels,
        })
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// number of latent scales
    pub fn depth(&self) -> usize {
        self.latent_dims.len()
    }

    pub fn latent_dims(&self) -> &[usize] {
        &self.latent_dims
    }

    pub fn schedule(&self) -> &ScaleSchedule {
        &self.schedule
    }

    /// Run the encoder and the latent-injecting decoder
    ///
    /// # Arguments
    /// * `x_bchw` - images (prior) or images stacked with labels
    ///   (posterior)
    /// * `control` - per-scale mean flags, or external latents that
    ///   replace sampling entirely
    pub fn forward(&self, x_bchw: &Tensor, control: &LatentControl) -> Result<HierarchicalPass> {
        let (_, c, h, w) = x_bchw.dims4()?;
        if c != self.input_channels {
            candle_core::bail!("expected {} input channels, got {}", self.input_channels, c);
        }
        self.schedule.check_extent(h, w)?;

        if control.depth() != self.depth() {
            candle_core::bail!(
                "latent control covers {} scales, the hierarchy has {}",
                control.depth(),
                self.depth()
            );
        }

        let num_scales = self.schedule.num_scales();

        let mut encoder_features = Vec::with_capacity(num_scales);
        let mut h_bchw = x_bchw.clone();
        for (scale, level) in self.encoder_levels.iter().enumerate() {
            h_bchw = level.forward(&h_bchw)?;
            encoder_features.push(h_bchw.clone());
            if scale + 1 < num_scales {
                h_bchw = resize_down(&h_bchw, 2)?;
            }
        }

        let mut distributions = Vec::with_capacity(self.depth());
        let mut used_latents = Vec::with_capacity(self.depth());

        let mut decoder_features = h_bchw;
        for (level, &latent_dim) in self.latent_dims.iter().enumerate() {
            let mu_logsigma = self.mu_logsigma_blocks[level].forward(&decoder_features)?;
            let dist = LatentGaussian::from_mu_logsigma(&mu_logsigma, latent_dim)?;

            let z = control.resolve(level, &dist)?;

            let lo = Tensor::cat(&[&z, &decoder_features], 1)?;
            let hi = resize_up(&lo, 2)?;
            let skip = &encoder_features[self.schedule.decoder_scale(level + 1)?];
            decoder_features = self.decoder_levels[level].forward(&Tensor::cat(&[&hi, skip], 1)?)?;

            distributions.push(dist);
            used_latents.push(z);
        }

        Ok(HierarchicalPass {
            decoder_features,
            encoder_features,
            distributions,
            used_latents,
        })
    }
}

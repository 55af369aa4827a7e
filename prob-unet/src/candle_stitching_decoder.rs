use crate::candle_aux_layers::StackLayers;
use crate::candle_model_traits::{ParameterizedT, StitchingDecoderT};
use crate::candle_res_block::{res_level, ResBlock};
use crate::candle_resample::resize_up;
use crate::candle_scale_schedule::ScaleSchedule;
use crate::candle_unet_config::BlockConfig;
use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Module, VarBuilder};

/// Completes the truncated decoder of a `HierarchicalCore` so that the
/// two together form a symmetric U-Net, then maps to class logits
pub struct StitchingDecoder {
    num_classes: usize,
    start_level: usize,
    schedule: ScaleSchedule,
    decoder_levels: Vec<StackLayers<ResBlock>>,
    final_layer: Conv2d,
}

impl ParameterizedT for StitchingDecoder {
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        self.decoder_levels.append_parameters(params);
        self.final_layer.append_parameters(params);
    }
}

impl StitchingDecoderT for StitchingDecoder {
    fn forward(&self, encoder_features: &[Tensor], decoder_features: &Tensor) -> Result<Tensor> {
        if encoder_features.len() != self.schedule.num_scales() {
            candle_core::bail!(
                "expected {} encoder scales, got {}",
                self.schedule.num_scales(),
                encoder_features.len()
            );
        }

        let mut h_bchw = decoder_features.clone();
        for (j, level) in self.decoder_levels.iter().enumerate() {
            let skip = &encoder_features[self.schedule.decoder_scale(self.start_level + j)?];
            let hi = resize_up(&h_bchw, 2)?;
            h_bchw = level.forward(&Tensor::cat(&[&hi, skip], 1)?)?;
        }
        self.final_layer.forward(&h_bchw)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl StitchingDecoder {
    /// Will create a stitching decoder with these variables:
    ///
    /// * `dec.{l}.block.{j}.*` for decoder levels `l` not covered by
    ///   the latent hierarchy
    /// * `final.*` 1x1 conv to class logits
    ///
    /// # Arguments
    /// * `num_latent_levels` - depth of the latent hierarchy
    /// * `schedule` - channel schedule over encoder scales
    /// * `num_classes` - number of output channels
    /// * `block` - residual block settings
    /// * `vs` - variable builder
    pub fn new(
        num_latent_levels: usize,
        schedule: &ScaleSchedule,
        num_classes: usize,
        block: &BlockConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let num_scales = schedule.num_scales();
        if num_latent_levels >= num_scales {
            candle_core::bail!(
                "{} latent scales leave nothing to stitch ({} encoder scales)",
                num_latent_levels,
                num_scales
            );
        }

        // the hierarchical core already produced decoder level K
        let start_level = num_latent_levels + 1;

        let mut decoder_levels = vec![];
        for level in start_level..num_scales {
            let prev = schedule.decoder_channels(level - 1)?;
            let here = schedule.decoder_channels(level)?;
            decoder_levels.push(res_level(
                prev + here,
                here,
                schedule.decoder_down_channels(level)?,
                block,
                vs.pp(format!("dec.{}", level)),
            )?);
        }

        // the last decoder level always sits at the outermost scale
        let final_layer = candle_nn::conv2d(
            schedule.channels(0),
            num_classes,
            1,
            Default::default(),
            vs.pp("final"),
        )?;

        Ok(Self {
            num_classes,
            start_level,
            schedule: schedule.clone(),
            decoder_levels,
            final_layer,
        })
    }

    /// number of decoder levels added on top of the core
    pub fn num_levels(&self) -> usize {
        self.decoder_levels.len()
    }
}

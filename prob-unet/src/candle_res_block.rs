use crate::candle_aux_layers::StackLayers;
use crate::candle_model_traits::ParameterizedT;
use crate::candle_unet_config::BlockConfig;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Module, VarBuilder};

/// Pre-activated residual block
///
/// ```text
/// skip     = x                         (in == out)
///          = conv1x1(x)                (in != out)
/// residual = [conv3x3 -> act]* conv3x3 (-> conv1x1 if down != out)
///            applied to act(x)
/// y        = skip + residual
/// ```
pub struct ResBlock {
    in_channels: usize,
    out_channels: usize,
    activation: Activation,
    layers: StackLayers<Conv2d>,
    resize_skip: Option<Conv2d>,
}

impl Module for ResBlock {
    fn forward(&self, x_bchw: &Tensor) -> Result<Tensor> {
        let residual = self.activation.forward(x_bchw)?;
        let residual = self.layers.forward(&residual)?;

        let skip = match &self.resize_skip {
            Some(resize) => resize.forward(x_bchw)?,
            None => x_bchw.clone(),
        };
        skip + residual
    }
}

impl ParameterizedT for ResBlock {
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        self.layers.append_parameters(params);
        if let Some(resize) = &self.resize_skip {
            resize.append_parameters(params);
        }
    }
}

impl ResBlock {
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn has_skip_projection(&self) -> bool {
        self.resize_skip.is_some()
    }

    /// Will create a residual block with these variables:
    ///
    /// * `conv.{j}.weight`, `conv.{j}.bias` for 3x3 convolutions
    /// * `resize.out.*` when `down_channels != out_channels`
    /// * `resize.skip.*` when `in_channels != out_channels`
    ///
    /// # Arguments
    /// * `in_channels` - channels of the input feature map
    /// * `out_channels` - channels of the output feature map
    /// * `down_channels` - bottleneck channels (`None` = `out_channels`)
    /// * `convs_per_block` - number of 3x3 convolutions
    /// * `activation` - pre-activation and interleaved nonlinearity
    /// * `vs` - variable builder
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        down_channels: Option<usize>,
        convs_per_block: usize,
        activation: Activation,
        vs: VarBuilder,
    ) -> Result<Self> {
        if convs_per_block == 0 {
            candle_core::bail!("a residual block needs at least one convolution");
        }

        let down_channels = down_channels.unwrap_or(out_channels);

        let same_padding = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut layers = StackLayers::<Conv2d>::new();
        let mut prev_dim = in_channels;
        for j in 0..convs_per_block {
            let conv = candle_nn::conv2d(
                prev_dim,
                down_channels,
                3,
                same_padding,
                vs.pp(format!("conv.{}", j)),
            )?;
            if j + 1 < convs_per_block {
                layers.push_with_act(conv, activation.clone());
            } else {
                layers.push(conv);
            }
            prev_dim = down_channels;
        }

        if down_channels != out_channels {
            layers.push(candle_nn::conv2d(
                down_channels,
                out_channels,
                1,
                Default::default(),
                vs.pp("resize.out"),
            )?);
        }

        let resize_skip = if in_channels != out_channels {
            Some(candle_nn::conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vs.pp("resize.skip"),
            )?)
        } else {
            None
        };

        Ok(Self {
            in_channels,
            out_channels,
            activation,
            layers,
            resize_skip,
        })
    }
}

/// Stack `blocks_per_level` residual blocks for one U-Net level; only
/// the first block changes the channel count
///
/// * `vs` - variable builder; blocks live under `block.{j}`
pub fn res_level(
    in_channels: usize,
    out_channels: usize,
    down_channels: usize,
    block: &BlockConfig,
    vs: VarBuilder,
) -> Result<StackLayers<ResBlock>> {
    let mut level = StackLayers::new();
    let mut prev_dim = in_channels;
    for j in 0..block.blocks_per_level {
        level.push(ResBlock::new(
            prev_dim,
            out_channels,
            Some(down_channels),
            block.convs_per_block,
            block.activation.clone(),
            vs.pp(format!("block.{}", j)),
        )?);
        prev_dim = out_channels;
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vs(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_output_shape_with_projections() -> Result<()> {
        let varmap = VarMap::new();
        let block = ResBlock::new(3, 8, Some(4), 3, Activation::Relu, vs(&varmap))?;
        assert!(block.has_skip_projection());

        let x = Tensor::randn(0f32, 1f32, (2, 3, 16, 16), &Device::Cpu)?;
        let y = block.forward(&x)?;
        assert_eq!(y.dims(), &[2, 8, 16, 16]);

        // 3 convs + resize.out + resize.skip, each weight and bias
        assert_eq!(block.parameters().len(), 10);
        Ok(())
    }

    #[test]
    fn test_pure_residual_unit() -> Result<()> {
        let varmap = VarMap::new();
        let block = ResBlock::new(4, 4, None, 2, Activation::Relu, vs(&varmap))?;
        assert!(!block.has_skip_projection());
        assert_eq!(block.parameters().len(), 4);

        // residual of a non-positive input is the conv stack applied
        // to zeros, i.e. bias only; zero the biases and y == x
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.ends_with("bias") {
                var.set(&var.zeros_like()?)?;
            }
        }
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &Device::Cpu)?.relu()?.neg()?;
        let y = block.forward(&x)?;
        let diff = (y - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_zero_convs_rejected() {
        let varmap = VarMap::new();
        assert!(ResBlock::new(4, 4, None, 0, Activation::Relu, vs(&varmap)).is_err());
    }

    #[test]
    fn test_level_changes_channels_once() -> Result<()> {
        let varmap = VarMap::new();
        let block = BlockConfig {
            convs_per_block: 1,
            blocks_per_level: 3,
            activation: Activation::Relu,
        };
        let level = res_level(5, 6, 3, &block, vs(&varmap))?;
        let blocks: Vec<&ResBlock> = level.layers().collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].in_channels(), 5);
        assert!(blocks[0].has_skip_projection());
        assert!(blocks[1..].iter().all(|b| b.in_channels() == 6 && !b.has_skip_projection()));

        let x = Tensor::randn(0f32, 1f32, (1, 5, 4, 4), &Device::Cpu)?;
        assert_eq!(level.forward(&x)?.dims(), &[1, 6, 4, 4]);
        Ok(())
    }
}

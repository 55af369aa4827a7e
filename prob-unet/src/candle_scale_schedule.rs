use crate::candle_unet_config::ProbUnetConfig;
use candle_core::Result;

/// Channel layout of the U-Net, one entry per encoder scale from the
/// outermost (full resolution) to the innermost (coarsest).
///
/// The decoder walks the same scales in reverse. Instead of indexing
/// a reversed list, decoder level `l` reads encoder scale
/// `decoder_scale(l) = num_scales - 1 - l`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleSchedule {
    channels: Vec<usize>,
    down_channels: Vec<usize>,
}

impl ScaleSchedule {
    pub fn new(channels: Vec<usize>, down_channels: Vec<usize>) -> Result<Self> {
        if channels.is_empty() {
            candle_core::bail!("empty channel schedule");
        }
        if channels.len() != down_channels.len() {
            candle_core::bail!(
                "bottleneck schedule has {} scales, channel schedule has {}",
                down_channels.len(),
                channels.len()
            );
        }
        Ok(Self {
            channels,
            down_channels,
        })
    }

    pub fn from_config(config: &ProbUnetConfig) -> Result<Self> {
        Self::new(config.channels_per_block.clone(), config.down_channels())
    }

    pub fn num_scales(&self) -> usize {
        self.channels.len()
    }

    /// Encoder scale consumed by decoder level `level`, where level 0
    /// is the innermost scale
    pub fn decoder_scale(&self, level: usize) -> Result<usize> {
        let n = self.num_scales();
        if level >= n {
            candle_core::bail!("decoder level {} out of {} scales", level, n);
        }
        Ok(n - 1 - level)
    }

    /// output channels of encoder scale `scale`
    pub fn channels(&self, scale: usize) -> usize {
        self.channels[scale]
    }

    /// bottleneck channels of encoder scale `scale`
    pub fn down_channels(&self, scale: usize) -> usize {
        self.down_channels[scale]
    }

    /// output channels at decoder level `level`
    pub fn decoder_channels(&self, level: usize) -> Result<usize> {
        Ok(self.channels[self.decoder_scale(level)?])
    }

    pub fn decoder_down_channels(&self, level: usize) -> Result<usize> {
        Ok(self.down_channels[self.decoder_scale(level)?])
    }

    /// Spatial extents must survive `num_scales - 1` halvings
    pub fn check_extent(&self, height: usize, width: usize) -> Result<()> {
        let halvings = (self.num_scales() - 1) as u32;
        let factor = match 1usize.checked_shl(halvings) {
            Some(f) => f,
            None => candle_core::bail!("{} scales cannot be halved", self.num_scales()),
        };
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            candle_core::bail!(
                "input extent {}x{} is not divisible by {} ({} scales)",
                height,
                width,
                factor,
                self.num_scales()
            );
        }
        Ok(())
    }
}

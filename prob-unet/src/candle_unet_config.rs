use candle_core::Result;
use candle_nn::Activation;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

const BASE_CHANNELS: usize = 24;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    Relu,
    Silu,
    Gelu,
}

impl ActivationKind {
    pub fn activation(&self) -> Activation {
        match self {
            ActivationKind::Relu => Activation::Relu,
            ActivationKind::Silu => Activation::Silu,
            ActivationKind::Gelu => Activation::Gelu,
        }
    }
}

/// Training objective.
///
/// `Elbo` is the only implemented objective. `Geco` names the
/// constrained (reconstruction-threshold + Lagrange multiplier)
/// variant; its hyper-parameters are carried in [`LossConfig`] so a
/// configuration can already select it, and `loss()` rejects it until
/// the moving-average and multiplier state is added to the model.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveKind {
    #[default]
    Elbo,
    Geco,
}

impl std::fmt::Display for ObjectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectiveKind::Elbo => write!(f, "elbo"),
            ObjectiveKind::Geco => write!(f, "geco"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    #[serde(rename = "type")]
    pub kind: ObjectiveKind,
    /// KL weight in the ELBO
    pub beta: f64,
    /// reserved: reconstruction threshold per valid pixel (geco)
    pub kappa: f64,
    /// reserved: moving-average decay of the reconstruction (geco)
    pub decay: f64,
    /// reserved: Lagrange multiplier learning rate (geco)
    pub rate: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: ObjectiveKind::Elbo,
            beta: 1.0,
            kappa: 0.05,
            decay: 0.99,
            rate: 1e-2,
        }
    }
}

/// Per-block settings shared by every level of the network
#[derive(Clone, Debug)]
pub struct BlockConfig {
    pub convs_per_block: usize,
    pub blocks_per_level: usize,
    pub activation: Activation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbUnetConfig {
    /// channels of the input image (1 for greyscale, 3 for RGB)
    pub input_channels: usize,
    /// number of segmentation classes (label channels)
    pub num_classes: usize,
    /// output channels of each encoder scale, outermost first
    pub channels_per_block: Vec<usize>,
    /// bottleneck channels of each encoder scale; half of
    /// `channels_per_block` when missing
    pub down_channels_per_block: Option<Vec<usize>>,
    /// latent dimension of each hierarchy scale, coarsest first
    pub latent_dims: Vec<usize>,
    pub convs_per_block: usize,
    pub blocks_per_level: usize,
    pub activation: ActivationKind,
    pub loss: LossConfig,
}

impl Default for ProbUnetConfig {
    fn default() -> Self {
        let b = BASE_CHANNELS;
        Self {
            input_channels: 1,
            num_classes: 2,
            channels_per_block: vec![b, 2 * b, 4 * b, 8 * b, 8 * b, 8 * b, 8 * b, 8 * b],
            down_channels_per_block: None,
            latent_dims: vec![1, 1, 1, 1],
            convs_per_block: 3,
            blocks_per_level: 3,
            activation: ActivationKind::Relu,
            loss: LossConfig::default(),
        }
    }
}

impl ProbUnetConfig {
    /// bottleneck schedule after filling in the default
    pub fn down_channels(&self) -> Vec<usize> {
        match &self.down_channels_per_block {
            Some(down) => down.clone(),
            None => self
                .channels_per_block
                .iter()
                .map(|&c| (c / 2).max(1))
                .collect(),
        }
    }

    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            convs_per_block: self.convs_per_block,
            blocks_per_level: self.blocks_per_level,
            activation: self.activation.activation(),
        }
    }

    /// number of latent scales in the hierarchy
    pub fn depth(&self) -> usize {
        self.latent_dims.len()
    }

    /// Check every structural invariant before any parameter is
    /// allocated
    pub fn validate(&self) -> Result<()> {
        let num_scales = self.channels_per_block.len();

        if self.input_channels == 0 || self.num_classes == 0 {
            candle_core::bail!("input channels and classes must be positive");
        }
        if num_scales == 0 {
            candle_core::bail!("empty channel schedule");
        }
        if self.channels_per_block.iter().any(|&c| c == 0) {
            candle_core::bail!("zero channels in {:?}", self.channels_per_block);
        }
        if self.latent_dims.len() >= num_scales {
            candle_core::bail!(
                "{} latent scales need at least {} encoder scales, found {}",
                self.latent_dims.len(),
                self.latent_dims.len() + 1,
                num_scales
            );
        }
        if self.latent_dims.iter().any(|&d| d == 0) {
            candle_core::bail!("zero latent dimension in {:?}", self.latent_dims);
        }

        let down = self.down_channels();
        if down.len() != num_scales {
            candle_core::bail!(
                "bottleneck schedule has {} scales, channel schedule has {}",
                down.len(),
                num_scales
            );
        }
        if down.iter().any(|&c| c == 0) {
            candle_core::bail!("zero bottleneck channels in {:?}", down);
        }
        if self.convs_per_block == 0 || self.blocks_per_level == 0 {
            candle_core::bail!("need at least one convolution and one block per level");
        }
        if self.loss.beta < 0.0 || !self.loss.beta.is_finite() {
            candle_core::bail!("invalid KL weight beta = {}", self.loss.beta);
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

use crate::candle_loss_functions::gaussian_kl_divergence;
use candle_core::{Result, Tensor};

/// Diagonal Gaussian over a `(b, k, h, w)` latent feature map.
///
/// The log-scale is unconstrained; `scale = exp(log_scale)` is
/// always strictly positive. Per-instance quantities treat the
/// latent channel and both spatial axes as one event.
#[derive(Clone, Debug)]
pub struct LatentGaussian {
    mean: Tensor,
    log_scale: Tensor,
}

impl LatentGaussian {
    pub fn new(mean: Tensor, log_scale: Tensor) -> Result<Self> {
        if mean.dims() != log_scale.dims() {
            candle_core::bail!(
                "mean {:?} and log-scale {:?} differ in shape",
                mean.dims(),
                log_scale.dims()
            );
        }
        Ok(Self { mean, log_scale })
    }

    /// Split the `2k` channels predicted by a 1x1 convolution into the
    /// mean (first `k`) and log-scale (last `k`)
    pub fn from_mu_logsigma(mu_logsigma: &Tensor, latent_dim: usize) -> Result<Self> {
        let (_, c, _, _) = mu_logsigma.dims4()?;
        if c != 2 * latent_dim {
            candle_core::bail!("expected {} channels, got {}", 2 * latent_dim, c);
        }
        let mean = mu_logsigma.narrow(1, 0, latent_dim)?;
        let log_scale = mu_logsigma.narrow(1, latent_dim, latent_dim)?;
        Self::new(mean, log_scale)
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn log_scale(&self) -> &Tensor {
        &self.log_scale
    }

    pub fn scale(&self) -> Result<Tensor> {
        self.log_scale.exp()
    }

    pub fn dims(&self) -> &[usize] {
        self.mean.dims()
    }

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    pub fn sample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        self.mean.add(&self.scale()?.mul(&eps)?)
    }

    /// KL(self || other) per instance, summed over latent channels and
    /// space
    ///
    /// # Returns `kl_b` (b,)
    pub fn kl_divergence(&self, other: &LatentGaussian) -> Result<Tensor> {
        if self.dims() != other.dims() {
            candle_core::bail!(
                "KL between latents of shape {:?} and {:?}",
                self.dims(),
                other.dims()
            );
        }
        gaussian_kl_divergence(&self.mean, &self.log_scale, &other.mean, &other.log_scale)?
            .sum((1, 2, 3))
    }
}

/// Whether to use the distribution mean instead of a draw, one flag
/// per latent scale (coarsest first)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeanFlags(Vec<bool>);

impl MeanFlags {
    /// the same flag at every one of `depth` scales
    pub fn broadcast(use_mean: bool, depth: usize) -> Self {
        Self(vec![use_mean; depth])
    }

    pub fn per_scale(flags: Vec<bool>) -> Self {
        Self(flags)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn use_mean(&self, level: usize) -> bool {
        self.0[level]
    }
}

impl From<Vec<bool>> for MeanFlags {
    fn from(flags: Vec<bool>) -> Self {
        Self(flags)
    }
}

/// How the hierarchical core picks the latent at each scale.
///
/// External latents take precedence over everything else: when
/// `External` is given no mean flag exists to consult, so the prior can
/// replay posterior latents verbatim.
#[derive(Clone, Debug)]
pub enum LatentControl {
    /// draw, or take the mean where the flag is set
    Resolve(MeanFlags),
    /// use these latents as-is, one per scale
    External(Vec<Tensor>),
}

impl LatentControl {
    pub fn sampled(depth: usize) -> Self {
        LatentControl::Resolve(MeanFlags::broadcast(false, depth))
    }

    pub fn mean(depth: usize) -> Self {
        LatentControl::Resolve(MeanFlags::broadcast(true, depth))
    }

    /// number of scales this control covers
    pub fn depth(&self) -> usize {
        match self {
            LatentControl::Resolve(flags) => flags.len(),
            LatentControl::External(latents) => latents.len(),
        }
    }

    /// Pick the latent for one scale
    /// * `level` - hierarchy level, coarsest first
    /// * `dist` - distribution predicted at this level
    pub fn resolve(&self, level: usize, dist: &LatentGaussian) -> Result<Tensor> {
        match self {
            LatentControl::External(latents) => {
                let z = &latents[level];
                if z.dims() != dist.dims() {
                    candle_core::bail!(
                        "external latent {:?} at scale {} does not match {:?}",
                        z.dims(),
                        level,
                        dist.dims()
                    );
                }
                Ok(z.clone())
            }
            LatentControl::Resolve(flags) if flags.use_mean(level) => Ok(dist.mean().clone()),
            LatentControl::Resolve(_) => dist.sample(),
        }
    }
}

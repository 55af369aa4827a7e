use crate::candle_hierarchical_core::{HierarchicalCore, HierarchicalPass};
use crate::candle_latent::LatentControl;
use crate::candle_loss_functions::{objective_loss, reconstruction_loss, ReconstructionLoss};
use crate::candle_model_cache::ModelCache;
use crate::candle_model_traits::{ParameterizedT, StitchingDecoderT};
use crate::candle_scale_schedule::ScaleSchedule;
use crate::candle_stitching_decoder::StitchingDecoder;
use crate::candle_unet_config::ProbUnetConfig;
use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};
use log::{debug, info};
use std::collections::BTreeMap;

/// Training objective together with its monitoring terms
pub struct UnetLoss {
    /// scalar to minimize
    pub loss: Tensor,
    /// `rec_loss_mean`, `rec_loss_sum`, `kl_sum`, `kl_{level}`,
    /// and the objective's own entry (`elbo_loss`)
    pub diagnostics: BTreeMap<String, Tensor>,
}

/// Hierarchical probabilistic U-Net (Kohl et al. 2019).
///
/// A prior core sees the image, a posterior core sees the image with the
/// label stacked on the channel axis, and a shared stitching decoder
/// turns either one's truncated decoder output into class logits.
///
/// Training-time passes are memoized per `(image, label)` pair so that
/// `reconstruct`, `kl` and `loss` evaluated on the same pair always see
/// the same latents. Methods touching the cache take `&mut self`; an
/// instance cannot be shared between concurrent training steps.
pub struct HierarchicalProbUnet {
    config: ProbUnetConfig,
    prior: HierarchicalCore,
    posterior: HierarchicalCore,
    stitching: StitchingDecoder,
    cache: Option<ModelCache>,
}

impl ParameterizedT for HierarchicalProbUnet {
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        self.prior.append_parameters(params);
        self.posterior.append_parameters(params);
        self.stitching.append_parameters(params);
    }
}

impl HierarchicalProbUnet {
    /// Will create the model with variables under `prior.*`,
    /// `posterior.*` and `stitch.*`
    ///
    /// # Arguments
    /// * `config` - validated before anything is allocated
    /// * `vs` - variable builder
    pub fn new(config: &ProbUnetConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;

        let schedule = ScaleSchedule::from_config(config)?;
        let block = config.block_config();

        let prior = HierarchicalCore::new(
            config.input_channels,
            &config.latent_dims,
            &schedule,
            &block,
            vs.pp("prior"),
        )?;

        let posterior = HierarchicalCore::new(
            config.input_channels + config.num_classes,
            &config.latent_dims,
            &schedule,
            &block,
            vs.pp("posterior"),
        )?;

        let stitching = StitchingDecoder::new(
            config.depth(),
            &schedule,
            config.num_classes,
            &block,
            vs.pp("stitch"),
        )?;

        let model = Self {
            config: config.clone(),
            prior,
            posterior,
            stitching,
            cache: None,
        };

        info!(
            "hierarchical prob. U-Net: {} scales, {} latent scales, {} parameters",
            schedule.num_scales(),
            config.depth(),
            model.num_parameters()
        );

        Ok(model)
    }

    pub fn config(&self) -> &ProbUnetConfig {
        &self.config
    }

    /// number of latent scales
    pub fn depth(&self) -> usize {
        self.config.depth()
    }

    pub fn prior(&self) -> &HierarchicalCore {
        &self.prior
    }

    pub fn posterior(&self) -> &HierarchicalCore {
        &self.posterior
    }

    pub fn cache(&self) -> Option<&ModelCache> {
        self.cache.as_ref()
    }

    /// Drop the memoized passes. Needed whenever the parameters change
    /// while the inputs stay the same (e.g. after an optimizer step).
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    fn check_pair(&self, image: &Tensor, label: &Tensor) -> Result<()> {
        let (b, c, h, w) = image.dims4()?;
        let (lb, lc, lh, lw) = label.dims4()?;
        if c != self.config.input_channels {
            candle_core::bail!(
                "image has {} channels, expected {}",
                c,
                self.config.input_channels
            );
        }
        if lc != self.config.num_classes {
            candle_core::bail!(
                "label has {} channels, expected {} classes",
                lc,
                self.config.num_classes
            );
        }
        if (b, h, w) != (lb, lh, lw) {
            candle_core::bail!(
                "image {:?} and label {:?} are not aligned",
                image.dims(),
                label.dims()
            );
        }
        Ok(())
    }

    /// Run the five training-time passes for `(image, label)` unless
    /// they are already cached
    ///
    /// 1. posterior, sampled latents
    /// 2. posterior, mean latents
    /// 3. prior, sampled latents
    /// 4. prior replaying the latents of (1)
    /// 5. prior replaying the latents of (2)
    pub fn refresh(&mut self, image: &Tensor, label: &Tensor) -> Result<&ModelCache> {
        self.update_cache(image, label)?;
        self.cached()
    }

    fn cached(&self) -> Result<&ModelCache> {
        match &self.cache {
            Some(cache) => Ok(cache),
            None => candle_core::bail!("no cached passes"),
        }
    }

    fn update_cache(&mut self, image: &Tensor, label: &Tensor) -> Result<()> {
        self.check_pair(image, label)?;

        let hit = match &self.cache {
            Some(cache) => cache.matches(image, label)?,
            None => false,
        };

        if !hit {
            debug!("refreshing prior/posterior passes for {:?}", image.dims());

            let depth = self.depth();
            let image_label = Tensor::cat(&[image, label], 1)?;

            let posterior_sampled = self
                .posterior
                .forward(&image_label, &LatentControl::sampled(depth))?;
            let posterior_mean = self
                .posterior
                .forward(&image_label, &LatentControl::mean(depth))?;
            let prior_sampled = self.prior.forward(image, &LatentControl::sampled(depth))?;
            let prior_from_posterior_sampled = self.prior.forward(
                image,
                &LatentControl::External(posterior_sampled.used_latents.clone()),
            )?;
            let prior_from_posterior_mean = self.prior.forward(
                image,
                &LatentControl::External(posterior_mean.used_latents.clone()),
            )?;

            self.cache = Some(ModelCache::new(
                image,
                label,
                posterior_sampled,
                posterior_mean,
                prior_sampled,
                prior_from_posterior_sampled,
                prior_from_posterior_mean,
            ));
        }
        Ok(())
    }

    fn stitch(&self, pass: &HierarchicalPass) -> Result<Tensor> {
        self.stitching
            .forward(&pass.encoder_features, &pass.decoder_features)
    }

    /// Segmentation logits from the prior alone; no label, no cache
    ///
    /// * `image` - `(b, input_channels, h, w)`
    /// * `mean` - use the latent means at every scale instead of drawing
    pub fn sample(&self, image: &Tensor, mean: bool) -> Result<Tensor> {
        let control = if mean {
            LatentControl::mean(self.depth())
        } else {
            LatentControl::sampled(self.depth())
        };
        self.sample_with(image, &control)
    }

    /// Like [`sample`](Self::sample) with per-scale mean flags, or with
    /// external latents that take precedence over any mean flag
    pub fn sample_with(&self, image: &Tensor, control: &LatentControl) -> Result<Tensor> {
        let pass = self.prior.forward(image, control)?;
        self.stitch(&pass)
    }

    /// `num_samples` independent prior draws stacked on a new leading
    /// axis: `(s, b, num_classes, h, w)`
    pub fn sample_n(&self, image: &Tensor, num_samples: usize) -> Result<Tensor> {
        if num_samples == 0 {
            candle_core::bail!("need at least one sample");
        }
        let samples = (0..num_samples)
            .map(|_| self.sample(image, false))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&samples, 0)
    }

    /// Reconstruct the label through the prior driven by posterior
    /// latents
    ///
    /// * `mean` - replay the posterior means instead of its draws
    pub fn reconstruct(&mut self, image: &Tensor, label: &Tensor, mean: bool) -> Result<Tensor> {
        self.update_cache(image, label)?;
        let cache = self.cached()?;
        let pass = if mean {
            &cache.prior_from_posterior_mean
        } else {
            &cache.prior_from_posterior_sampled
        };
        self.stitch(pass)
    }

    /// KL(posterior || prior) for each latent scale, summed over latent
    /// channels and space, averaged over the batch
    ///
    /// The prior is the one replaying the sampled posterior latents.
    /// platipy's hierarchical prob. U-Net reports the reverse direction,
    /// KL(prior || posterior), so its logged KL and trained weights are
    /// not directly comparable.
    pub fn kl(&mut self, image: &Tensor, label: &Tensor) -> Result<BTreeMap<usize, Tensor>> {
        self.update_cache(image, label)?;
        let cache = self.cached()?;

        let q_dists = &cache.posterior_sampled.distributions;
        let p_dists = &cache.prior_from_posterior_sampled.distributions;

        let mut kl = BTreeMap::new();
        for (level, (q, p)) in q_dists.iter().zip(p_dists.iter()).enumerate() {
            let kl_b = q.kl_divergence(p)?;
            kl.insert(level, kl_b.mean(0)?);
        }
        Ok(kl)
    }

    /// Cross-entropy of the sampled reconstruction against the label
    pub fn rec_loss(&mut self, image: &Tensor, label: &Tensor) -> Result<ReconstructionLoss> {
        let recon = self.reconstruct(image, label, false)?;
        reconstruction_loss(&recon, label)
    }

    /// The full training objective plus its monitoring terms
    pub fn loss(&mut self, image: &Tensor, label: &Tensor) -> Result<UnetLoss> {
        let rec = self.rec_loss(image, label)?;
        let kl = self.kl(image, label)?;

        let mut kl_sum = Tensor::zeros((), rec.sum.dtype(), rec.sum.device())?;
        for kl_level in kl.values() {
            kl_sum = kl_sum.add(kl_level)?;
        }

        let loss = objective_loss(&self.config.loss, &rec.sum, &kl_sum)?;

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("rec_loss_mean".to_string(), rec.mean);
        diagnostics.insert("rec_loss_sum".to_string(), rec.sum);
        diagnostics.insert("kl_sum".to_string(), kl_sum);
        for (level, kl_level) in kl.into_iter() {
            diagnostics.insert(format!("kl_{}", level), kl_level);
        }
        diagnostics.insert(format!("{}_loss", self.config.loss.kind), loss.clone());

        Ok(UnetLoss { loss, diagnostics })
    }
}

/// Per-pixel mean and variance of class probabilities across samples
///
/// * `samples` - logits `(s, b, c, h, w)` as returned by `sample_n`
///
/// # Returns `(mean_bchw, var_bchw)` of `sigmoid(samples)`
pub fn pixelwise_sample_stats(samples: &Tensor) -> Result<(Tensor, Tensor)> {
    let prob = ops::sigmoid(samples)?;
    let mean = prob.mean(0)?;
    let var = prob.broadcast_sub(&mean.unsqueeze(0)?)?.sqr()?.mean(0)?;
    Ok((mean, var))
}

use crate::candle_inference::TrainConfig;
use crate::candle_prob_unet::HierarchicalProbUnet;
use crate::candle_segmentation_data::SegmentationDataLoader;

use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};

/// Per-epoch averages over minibatches
#[derive(Clone, Debug, Default)]
pub struct TrainTrace {
    pub loss: Vec<f32>,
    pub rec_loss: Vec<f32>,
    pub kl: Vec<f32>,
}

/// Train a hierarchical prob. U-Net by minimizing its configured
/// objective
///
/// * `model` - model whose variables live in `variable_map`
/// * `variable_map` - all trainable variables
/// * `data` - data loader should have `minibatch_data`
/// * `train_config` - training configuration
///
/// The memoized passes are dropped after every optimizer step.
pub fn train_prob_unet<DataL>(
    model: &mut HierarchicalProbUnet,
    variable_map: &VarMap,
    data: &mut DataL,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainTrace>
where
    DataL: SegmentationDataLoader,
{
    let device = &train_config.device;
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = TrainTrace::default();

    data.shuffle_minibatch(train_config.batch_size)?;

    let num_minibatches = data.num_minibatch();
    if num_minibatches == 0 {
        return Err(anyhow::anyhow!("no minibatches to train on"));
    }

    let minibatch_vec = (0..num_minibatches)
        .map(|b| data.minibatch_data(b, device))
        .collect::<anyhow::Result<Vec<_>>>()?;

    for epoch in 0..train_config.num_epochs {
        let mut loss_tot = 0f32;
        let mut rec_tot = 0f32;
        let mut kl_tot = 0f32;

        for mb in minibatch_vec.iter() {
            let out = model.loss(&mb.image, &mb.label)?;
            adam.backward_step(&out.loss)?;
            model.invalidate_cache();

            let loss_val = out.loss.to_scalar::<f32>()?;
            if !loss_val.is_finite() {
                warn!("[{}] non-finite loss {}", epoch + 1, loss_val);
            }
            loss_tot += loss_val;
            if let Some(rec) = out.diagnostics.get("rec_loss_sum") {
                rec_tot += rec.to_scalar::<f32>()?;
            }
            if let Some(kl) = out.diagnostics.get("kl_sum") {
                kl_tot += kl.to_scalar::<f32>()?;
            }
        }

        let denom = num_minibatches as f32;
        trace.loss.push(loss_tot / denom);
        trace.rec_loss.push(rec_tot / denom);
        trace.kl.push(kl_tot / denom);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {}, rec: {}, kl: {}",
                epoch + 1,
                loss_tot / denom,
                rec_tot / denom,
                kl_tot / denom
            );
        }
    }
    pb.finish_and_clear();
    Ok(trace)
}

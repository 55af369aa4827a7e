pub mod candle_aux_layers;
pub mod candle_hierarchical_core;
pub mod candle_inference;
pub mod candle_latent;
pub mod candle_loss_functions;
pub mod candle_model_cache;
pub mod candle_model_traits;
pub mod candle_prob_unet;
pub mod candle_res_block;
pub mod candle_resample;
pub mod candle_scale_schedule;
pub mod candle_segmentation_data;
pub mod candle_stitching_decoder;
pub mod candle_unet_config;
pub mod candle_unet_inference;
pub mod cli;

pub use candle_core;
pub use candle_nn;

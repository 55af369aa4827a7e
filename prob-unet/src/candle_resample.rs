use candle_core::{Result, Tensor};

/// Downsample a `(b, c, h, w)` feature map by average pooling over
/// non-overlapping `scale x scale` windows
pub fn resize_down(x_bchw: &Tensor, scale: usize) -> Result<Tensor> {
    let (_, _, h, w) = x_bchw.dims4()?;
    if scale == 0 || h % scale != 0 || w % scale != 0 {
        candle_core::bail!("cannot downsample {}x{} by a factor of {}", h, w, scale);
    }
    x_bchw.avg_pool2d(scale)
}

/// Upsample a `(b, c, h, w)` feature map by nearest-neighbour
/// interpolation
pub fn resize_up(x_bchw: &Tensor, scale: usize) -> Result<Tensor> {
    let (_, _, h, w) = x_bchw.dims4()?;
    if scale == 0 {
        candle_core::bail!("upsampling factor must be positive");
    }
    x_bchw.upsample_nearest2d(h * scale, w * scale)
}

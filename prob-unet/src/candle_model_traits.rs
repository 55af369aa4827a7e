use candle_core::{Result, Tensor};
use candle_nn::Conv2d;

/// Explicit parameter registry for a network segment.
///
/// Every block owns its tensors and pushes them in construction
/// order.
pub trait ParameterizedT {
    /// Append all trainable tensors of this module
    /// * `params` - accumulator, visited in construction order
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>);

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![];
        self.append_parameters(&mut params);
        params
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|t| t.elem_count()).sum()
    }
}

impl ParameterizedT for Conv2d {
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        params.push(self.weight());
        if let Some(bias) = self.bias() {
            params.push(bias);
        }
    }
}

impl<M> ParameterizedT for Vec<M>
where
    M: ParameterizedT,
{
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        for m in self.iter() {
            m.append_parameters(params);
        }
    }
}

/// A network segment that turns the truncated decoder output of a
/// hierarchical core back into full-resolution class logits
pub trait StitchingDecoderT {
    /// * `encoder_features` - encoder pyramid (outermost to innermost)
    /// * `decoder_features` - output of the truncated decoder
    ///
    /// # Returns logits `(b, num_classes, h, w)`
    fn forward(&self, encoder_features: &[Tensor], decoder_features: &Tensor) -> Result<Tensor>;

    fn num_classes(&self) -> usize;
}

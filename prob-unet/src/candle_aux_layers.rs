use crate::candle_model_traits::ParameterizedT;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = &M> {
        self.module_layers.iter()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ParameterizedT for StackLayers<M>
where
    M: Module + ParameterizedT,
{
    fn append_parameters<'a>(&'a self, params: &mut Vec<&'a Tensor>) {
        for m in self.module_layers.iter() {
            m.append_parameters(params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Conv2dConfig, VarBuilder, VarMap};

    #[test]
    fn test_stack_applies_activation_between_layers() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let mut stack = StackLayers::new();
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        stack.push_with_act(candle_nn::conv2d(2, 4, 3, cfg, vs.pp("conv.0"))?, Activation::Relu);
        stack.push(candle_nn::conv2d(4, 3, 3, cfg, vs.pp("conv.1"))?);

        assert_eq!(stack.len(), 2);
        let x = Tensor::randn(0f32, 1f32, (2, 2, 8, 8), &dev)?;
        let y = stack.forward(&x)?;
        assert_eq!(y.dims(), &[2, 3, 8, 8]);

        // two weights and two biases, in push order
        let params = stack.parameters();
        assert_eq!(params.len(), 4);
        assert_eq!(params[0].dims(), &[4, 2, 3, 3]);
        assert_eq!(params[2].dims(), &[3, 4, 3, 3]);
        Ok(())
    }
}

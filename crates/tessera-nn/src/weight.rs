//! Trainable parameters owned by the execution context.

use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::{Result, Tensor};

/// Penalty applied to a weight's gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightRegularizer {
    #[default]
    None,
    L2Norm,
}

/// How long a requested scratch tensor must stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLifespan {
    /// Only during the forward call.
    Forward,
    /// Only during derivative and gradient calls.
    Backward,
    /// From forward through gradient within one iteration.
    #[default]
    Iteration,
    /// Whole lifetime of the model.
    Max,
}

/// A parameter tensor, its optional gradient and the update settings that
/// apply to it.
pub struct Weight {
    var: Tensor,
    grad: Option<Tensor>,
    regularizer: WeightRegularizer,
    regularizer_constant: f32,
    decay: f32,
    output_axis: usize,
}

impl Weight {
    pub fn new(
        var: Tensor,
        grad: Option<Tensor>,
        regularizer: WeightRegularizer,
        regularizer_constant: f32,
        decay: f32,
        output_axis: usize,
    ) -> Self {
        Self {
            var,
            grad,
            regularizer,
            regularizer_constant,
            decay,
            output_axis,
        }
    }

    pub fn var(&self) -> &Tensor {
        &self.var
    }

    pub fn var_mut(&mut self) -> &mut Tensor {
        &mut self.var
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Tensor> {
        self.grad.as_mut()
    }

    pub fn is_trainable(&self) -> bool {
        self.grad.is_some()
    }

    pub fn regularizer(&self) -> WeightRegularizer {
        self.regularizer
    }

    pub fn regularizer_constant(&self) -> f32 {
        self.regularizer_constant
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Axis holding the output features; quantization scales run along it.
    pub fn output_axis(&self) -> usize {
        self.output_axis
    }

    /// `grad += c · W` for an L2 regularizer.
    pub fn calc_regularization_gradient(&mut self) -> Result<()> {
        if self.regularizer != WeightRegularizer::L2Norm {
            return Ok(());
        }
        let c = self.regularizer_constant;
        self.add_scaled_var(c)
    }

    /// `grad += decay · W`.
    pub fn calc_weight_decay_gradient(&mut self) -> Result<()> {
        if self.decay <= 0.0 {
            return Ok(());
        }
        let decay = self.decay;
        self.add_scaled_var(decay)
    }

    /// Quantized vars are dequantized to the gradient's dtype first.
    fn add_scaled_var(&mut self, alpha: f32) -> Result<()> {
        let Some(grad) = self.grad.as_mut() else {
            return Ok(());
        };
        if self.var.data_type().is_quantized() {
            let var = self.var.dequantized(grad.data_type(), self.output_axis)?;
            grad.add_i_scaled(&var, alpha)
        } else {
            grad.add_i_scaled(&self.var, alpha)
        }
    }
}

impl fmt::Debug for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weight")
            .field("var", &self.var)
            .field("trainable", &self.is_trainable())
            .field("regularizer", &self.regularizer)
            .field("decay", &self.decay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tessera_core::{DataType, TensorDim};

    use super::*;

    fn weight(regularizer: WeightRegularizer, constant: f32, decay: f32) -> Weight {
        let dim = TensorDim::new(1, 1, 1, 3);
        let var = Tensor::from_vec(dim, vec![1.0f32, -2.0, 4.0]).unwrap();
        let grad = Tensor::zeros(dim, "grad").unwrap();
        Weight::new(var, Some(grad), regularizer, constant, decay, 3)
    }

    #[test]
    fn test_l2_regularization_gradient() {
        let mut w = weight(WeightRegularizer::L2Norm, 0.5, 0.0);
        w.calc_regularization_gradient().unwrap();
        assert_eq!(w.grad().unwrap().to_f32_vec().unwrap(), vec![0.5, -1.0, 2.0]);
        w.calc_weight_decay_gradient().unwrap();
        assert_eq!(w.grad().unwrap().to_f32_vec().unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_weight_decay_gradient() {
        let mut w = weight(WeightRegularizer::None, 1.0, 0.25);
        w.calc_regularization_gradient().unwrap();
        w.calc_weight_decay_gradient().unwrap();
        assert_eq!(w.grad().unwrap().to_f32_vec().unwrap(), vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn test_penalties_on_quantized_var() {
        let dim = TensorDim::new(1, 1, 2, 2);
        let var = Tensor::from_vec(dim, vec![127.0f32, -254.0, -127.0, 126.0])
            .unwrap()
            .quantize(DataType::QInt8, 3)
            .unwrap();
        let grad = Tensor::zeros(dim, "grad").unwrap();
        let mut w = Weight::new(var, Some(grad), WeightRegularizer::L2Norm, 0.5, 0.1, 3);
        w.calc_regularization_gradient().unwrap();
        w.calc_weight_decay_gradient().unwrap();
        let got = w.grad().unwrap().to_f32_vec().unwrap();
        for (g, e) in got.iter().zip([76.2f32, -152.4, -76.2, 75.6]) {
            assert!((g - e).abs() < 1e-3, "{g} vs {e}");
        }
        assert_eq!(w.grad().unwrap().data_type(), DataType::Fp32);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&WeightRegularizer::L2Norm).unwrap(), "\"l2_norm\"");
        assert_eq!(serde_json::to_string(&TensorLifespan::Iteration).unwrap(), "\"iteration\"");
    }
}

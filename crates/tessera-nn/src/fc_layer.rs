//! Fully-connected layer with an optional LoRA path.
//!
//! `y = x · W + bias`, where the matrix view of `x` folds every non-unit axis
//! into rows. With a positive `lora_rank` the layer also owns factors
//! `A: [in, rank]` and `B: [rank, unit]` and folds their product into `W`
//! before each forward.
//!
//! The fold is written into the stored weight, so repeated forwards keep
//! adding `A·B` to `W`. [`calc_derivative`](Layer::calc_derivative) uses the
//! stored weight as it stands, which equals the effective forward weight only
//! while that convention holds.

use std::fmt;

use tessera_core::{DataType, Format, Initializer, Result, Tensor, TensorDim, TensorType, TesseraError};

use crate::config::FullyConnectedConfig;
use crate::context::{InitLayerContext, RunLayerContext, TensorHandle, WeightHandle};
use crate::layer::Layer;
use crate::weight::{TensorLifespan, WeightRegularizer};

/// Handles for the low-rank factors and the fused product `A·B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraHandles {
    pub a: WeightHandle,
    pub b: WeightHandle,
    pub product: TensorHandle,
}

#[derive(Debug, Clone)]
pub struct FullyConnectedLayer {
    config: FullyConnectedConfig,
    weight: Option<WeightHandle>,
    bias: Option<WeightHandle>,
    lora: Option<LoraHandles>,
}

impl FullyConnectedLayer {
    pub fn new(config: FullyConnectedConfig) -> Self {
        Self {
            config,
            weight: None,
            bias: None,
            lora: None,
        }
    }

    pub fn config(&self) -> &FullyConnectedConfig {
        &self.config
    }

    pub fn weight_handle(&self) -> Option<WeightHandle> {
        self.weight
    }

    pub fn bias_handle(&self) -> Option<WeightHandle> {
        self.bias
    }

    pub fn lora_handles(&self) -> Option<LoraHandles> {
        self.lora
    }

    fn weight_or_err(&self) -> Result<WeightHandle> {
        self.weight
            .ok_or_else(|| TesseraError::UninitializedHandle("fully_connected weight: layer is not finalized".into()))
    }

    /// Float copy of a quantized weight at `dtype`; `None` when `W` is already float.
    fn dequantized_weight(&self, ctx: &RunLayerContext, handle: WeightHandle, dtype: DataType) -> Result<Option<Tensor>> {
        let w = ctx.weight_object(handle)?;
        if !w.var().data_type().is_quantized() {
            return Ok(None);
        }
        tracing::trace!("dequantizing '{}' to {}", w.var().name(), dtype);
        w.var().dequantized(dtype, w.output_axis()).map(Some)
    }
}

/// Matrix `[rows, cols]` laid out so its matrix view is exactly that.
fn matrix_dim(t_type: TensorType, rows: usize, cols: usize) -> TensorDim {
    match t_type.format {
        Format::Nchw => TensorDim::with_type(1, 1, rows, cols, t_type),
        Format::Nhwc => TensorDim::with_type(1, cols, 1, rows, t_type),
    }
}

/// Every axis except the unit axis.
fn bias_axes(format: Format) -> [usize; 3] {
    match format {
        Format::Nchw => [0, 1, 2],
        Format::Nhwc => [0, 2, 3],
    }
}

/// Number of leading steps to process for the window `[from, to)`.
///
/// A window that starts past zero is a single decode step whose data sits at
/// step 0 of the buffers.
fn step_span(from: usize, to: usize, height: usize) -> Result<usize> {
    if to <= from {
        return Err(TesseraError::InvalidArgument(format!("empty step window [{from}, {to})")));
    }
    let span = if from > 0 {
        if to - from != 1 {
            return Err(TesseraError::InvalidArgument(format!(
                "incremental step [{from}, {to}) must cover exactly one step"
            )));
        }
        1
    } else {
        to
    };
    if span > height {
        return Err(TesseraError::InvalidArgument(format!(
            "step window of {span} exceeds sequence length {height}"
        )));
    }
    Ok(span)
}

impl Layer for FullyConnectedLayer {
    fn layer_type(&self) -> &'static str {
        "fully_connected"
    }

    fn finalize(&mut self, ctx: &mut InitLayerContext) -> Result<()> {
        self.config.validate()?;
        if ctx.num_inputs() != 1 {
            return Err(TesseraError::InvalidArgument(format!(
                "fully connected layer takes exactly one input, got {}",
                ctx.num_inputs()
            )));
        }
        let cfg = &self.config;
        let format = ctx.format();
        let unit_axis = format.unit_axis();

        let in_dim = ctx.input_dimensions()[0];
        let in_features = in_dim.dim(unit_axis)?;
        let mut out_dim = in_dim;
        out_dim.set_dim(unit_axis, cfg.unit)?;
        ctx.set_output_dimensions(vec![out_dim]);

        let weight_dtype = ctx.weight_data_type();
        let float_dtype = if weight_dtype.is_quantized() {
            ctx.activation_data_type()
        } else {
            weight_dtype
        };
        let weight_type = TensorType::new(format, weight_dtype);
        let float_type = TensorType::new(format, float_dtype);

        let weight_dim = matrix_dim(weight_type, in_features, cfg.unit);
        self.weight = Some(ctx.request_weight(
            weight_dim,
            cfg.weight_initializer,
            cfg.weight_regularizer,
            cfg.weight_regularizer_constant,
            cfg.weight_decay,
            "weight",
            true,
        ));

        self.bias = if cfg.disable_bias {
            None
        } else {
            let mut bias_dim = TensorDim::with_type(1, 1, 1, 1, float_type);
            bias_dim.set_dim(unit_axis, cfg.unit)?;
            Some(ctx.request_weight(
                bias_dim,
                cfg.bias_initializer,
                WeightRegularizer::None,
                1.0,
                cfg.bias_decay,
                "bias",
                true,
            ))
        };

        self.lora = if cfg.lora_rank > 0 {
            let rank = cfg.lora_rank;
            let a = ctx.request_weight(
                matrix_dim(float_type, in_features, rank),
                cfg.weight_initializer,
                cfg.weight_regularizer,
                cfg.weight_regularizer_constant,
                cfg.weight_decay,
                "loraA",
                true,
            );
            let b = ctx.request_weight(
                matrix_dim(float_type, rank, cfg.unit),
                cfg.weight_initializer,
                cfg.weight_regularizer,
                cfg.weight_regularizer_constant,
                cfg.weight_decay,
                "loraB",
                true,
            );
            let product = ctx.request_tensor(
                matrix_dim(float_type, in_features, cfg.unit),
                "weight_lora",
                Initializer::None,
                true,
                TensorLifespan::Iteration,
            );
            tracing::debug!("'{}' LoRA enabled with rank {}", ctx.name(), rank);
            Some(LoraHandles { a, b, product })
        } else {
            None
        };

        tracing::debug!(
            "'{}' finalized: {} -> {} (weight {}, bias={})",
            ctx.name(),
            in_dim,
            out_dim,
            weight_dim,
            self.bias.is_some()
        );
        Ok(())
    }

    // =========================================================================
    // Forward
    // =========================================================================

    fn forwarding(&self, ctx: &mut RunLayerContext, _training: bool) -> Result<()> {
        let wh = self.weight_or_err()?;
        let act = ctx.input(0)?.data_type();
        let mut dequant = self.dequantized_weight(ctx, wh, act)?;

        if let Some(lora) = self.lora {
            let mut product = ctx.tensor(lora.product)?.share()?;
            ctx.weight(lora.a)?.dot(ctx.weight(lora.b)?, &mut product, false, false, 0.0)?;
            match dequant.as_mut() {
                Some(w) => w.add_i(&product)?,
                None => ctx.weight(wh)?.share()?.add_i(&product)?,
            }
            tracing::trace!("'{}' folded LoRA product into weight", ctx.name());
        }

        let mut out = ctx.output(0)?.share()?;
        let weight = match &dequant {
            Some(w) => w,
            None => ctx.weight(wh)?,
        };
        ctx.input(0)?.dot(weight, &mut out, false, false, 0.0)?;
        if let Some(bh) = self.bias {
            out.add_i(ctx.weight(bh)?)?;
        }
        tracing::trace!("'{}' forward -> {}", ctx.name(), out.dim());
        Ok(())
    }

    fn incremental_forwarding(&self, ctx: &mut RunLayerContext, from: usize, to: usize, _training: bool) -> Result<()> {
        let wh = self.weight_or_err()?;
        let span = step_span(from, to, ctx.input(0)?.height())?;

        let mut in_step = ctx.input(0)?.dim();
        in_step.set_height(span);
        let mut out_step = ctx.output(0)?.dim();
        out_step.set_height(span);
        let input = ctx.input(0)?.get_shared_data_tensor(in_step, 0, false, "input_step")?;
        let mut out = ctx.output(0)?.get_shared_data_tensor(out_step, 0, false, "output_step")?;

        let dequant = self.dequantized_weight(ctx, wh, input.data_type())?;
        let weight = match &dequant {
            Some(w) => w,
            None => ctx.weight(wh)?,
        };
        input.dot(weight, &mut out, false, false, 0.0)?;
        if let Some(bh) = self.bias {
            out.add_i(ctx.weight(bh)?)?;
        }
        tracing::trace!("'{}' incremental forward [{}, {}) over {} step(s)", ctx.name(), from, to, span);
        Ok(())
    }

    // =========================================================================
    // Backward
    // =========================================================================

    fn calc_derivative(&self, ctx: &mut RunLayerContext) -> Result<()> {
        let wh = self.weight_or_err()?;
        let mut out_deriv = ctx.outgoing_derivative(0)?.share()?;
        let dequant = self.dequantized_weight(ctx, wh, out_deriv.data_type())?;
        let weight = match &dequant {
            Some(w) => w,
            None => ctx.weight(wh)?,
        };
        out_deriv.dot_deriv_wrt_1(weight, ctx.incoming_derivative(0)?, false, false, false)?;
        tracing::trace!("'{}' derivative -> {}", ctx.name(), out_deriv.dim());
        Ok(())
    }

    fn calc_gradient(&self, ctx: &mut RunLayerContext) -> Result<()> {
        let wh = self.weight_or_err()?;
        let input = ctx.input(0)?.share()?;
        let deriv = ctx.incoming_derivative(0)?.share()?;

        let Some(lora) = self.lora else {
            let accumulate = !ctx.is_gradient_first_access(wh)?;
            input.dot_deriv_wrt_2(ctx.weight_grad_mut(wh)?, &deriv, false, false, accumulate)?;
            ctx.mark_gradient_accessed(wh)?;

            if let Some(bh) = self.bias {
                let beta = if ctx.is_gradient_first_access(bh)? { 0.0 } else { 1.0 };
                deriv.sum(&bias_axes(deriv.format()), ctx.weight_grad_mut(bh)?, 1.0, beta)?;
                ctx.mark_gradient_accessed(bh)?;
            }
            tracing::trace!("'{}' weight gradient (accumulate={})", ctx.name(), accumulate);
            return Ok(());
        };

        // dL/d(A·B)
        let accumulate = !ctx.is_tensor_gradient_first_access(lora.product)?;
        input.dot_deriv_wrt_2(ctx.tensor_grad_mut(lora.product)?, &deriv, false, false, accumulate)?;
        ctx.mark_tensor_gradient_accessed(lora.product)?;
        let product_grad = ctx.tensor_grad(lora.product)?.share()?;

        // dL/dB = Aᵀ · dL/d(A·B)
        let a = ctx.weight(lora.a)?.share()?;
        let accumulate = !ctx.is_gradient_first_access(lora.b)?;
        a.dot_deriv_wrt_2(ctx.weight_grad_mut(lora.b)?, &product_grad, false, false, accumulate)?;
        ctx.mark_gradient_accessed(lora.b)?;

        // dL/dA = dL/d(A·B) · Bᵀ
        let b = ctx.weight(lora.b)?.share()?;
        let accumulate = !ctx.is_gradient_first_access(lora.a)?;
        ctx.weight_grad_mut(lora.a)?
            .dot_batched_deriv_wrt_1(&b, &product_grad, false, false, accumulate)?;
        ctx.mark_gradient_accessed(lora.a)?;

        tracing::trace!("'{}' LoRA gradients", ctx.name());
        Ok(())
    }
}

impl fmt::Display for FullyConnectedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FullyConnected(unit={}, rank={}, bias={})",
            self.config.unit, self.config.lora_rank, !self.config.disable_bias,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized(cfg: FullyConnectedConfig, inputs: Vec<TensorDim>, format: Format, weight: DataType) -> (FullyConnectedLayer, InitLayerContext) {
        let mut layer = FullyConnectedLayer::new(cfg);
        let mut init = InitLayerContext::new(inputs, format, weight, DataType::Fp32, "fc");
        layer.finalize(&mut init).unwrap();
        (layer, init)
    }

    #[test]
    fn test_finalize_nchw_shapes() {
        let (layer, init) = finalized(
            FullyConnectedConfig::new(5).with_lora_rank(2),
            vec![TensorDim::new(2, 1, 3, 4)],
            Format::Nchw,
            DataType::Fp32,
        );
        assert_eq!(init.output_dimensions()[0].dims(), [2, 1, 3, 5]);
        let ctx = RunLayerContext::new(&init).unwrap();
        let lora = layer.lora_handles().unwrap();
        assert_eq!(ctx.weight(layer.weight_handle().unwrap()).unwrap().dim().dims(), [1, 1, 4, 5]);
        assert_eq!(ctx.weight(layer.bias_handle().unwrap()).unwrap().dim().dims(), [1, 1, 1, 5]);
        assert_eq!(ctx.weight(lora.a).unwrap().dim().dims(), [1, 1, 4, 2]);
        assert_eq!(ctx.weight(lora.b).unwrap().dim().dims(), [1, 1, 2, 5]);
        assert_eq!(ctx.tensor(lora.product).unwrap().dim().dims(), [1, 1, 4, 5]);
        assert_eq!(ctx.weight(lora.a).unwrap().name(), "fc:loraA");
    }

    #[test]
    fn test_finalize_nhwc_shapes() {
        let t = TensorType::new(Format::Nhwc, DataType::Fp32);
        let (layer, init) = finalized(
            FullyConnectedConfig::new(3).with_lora_rank(2),
            vec![TensorDim::with_type(1, 4, 2, 1, t)],
            Format::Nhwc,
            DataType::Fp32,
        );
        assert_eq!(init.output_dimensions()[0].dims(), [1, 3, 2, 1]);
        let ctx = RunLayerContext::new(&init).unwrap();
        let lora = layer.lora_handles().unwrap();
        assert_eq!(ctx.weight(layer.weight_handle().unwrap()).unwrap().dim().dims(), [1, 3, 1, 4]);
        assert_eq!(ctx.weight(layer.bias_handle().unwrap()).unwrap().dim().dims(), [1, 3, 1, 1]);
        assert_eq!(ctx.weight(lora.b).unwrap().dim().dims(), [1, 3, 1, 2]);
    }

    #[test]
    fn test_quantized_weight_keeps_float_companions() {
        let (layer, init) = finalized(
            FullyConnectedConfig::new(2).with_lora_rank(1),
            vec![TensorDim::new(1, 1, 1, 3)],
            Format::Nchw,
            DataType::QInt8,
        );
        let ctx = RunLayerContext::new(&init).unwrap();
        let wh = layer.weight_handle().unwrap();
        assert_eq!(ctx.weight(wh).unwrap().data_type(), DataType::QInt8);
        assert_eq!(ctx.weight_grad(wh).unwrap().data_type(), DataType::Fp32);
        assert_eq!(ctx.weight(layer.bias_handle().unwrap()).unwrap().data_type(), DataType::Fp32);
        assert_eq!(ctx.weight(layer.lora_handles().unwrap().a).unwrap().data_type(), DataType::Fp32);
    }

    #[test]
    fn test_finalize_requires_one_input() {
        for inputs in [vec![], vec![TensorDim::new(1, 1, 1, 2); 2]] {
            let mut layer = FullyConnectedLayer::new(FullyConnectedConfig::new(2));
            let mut init = InitLayerContext::new(inputs, Format::Nchw, DataType::Fp32, DataType::Fp32, "fc");
            assert!(matches!(layer.finalize(&mut init), Err(TesseraError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_unfinalized_layer_is_state_error() {
        let layer = FullyConnectedLayer::new(FullyConnectedConfig::new(2));
        let init = InitLayerContext::new(vec![TensorDim::new(1, 1, 1, 2)], Format::Nchw, DataType::Fp32, DataType::Fp32, "fc");
        let mut ctx = RunLayerContext::new(&init).unwrap();
        let err = layer.forwarding(&mut ctx, false).unwrap_err();
        assert!(matches!(err, TesseraError::UninitializedHandle(_)));
    }

    #[test]
    fn test_step_span() {
        assert_eq!(step_span(0, 3, 4).unwrap(), 3);
        assert_eq!(step_span(7, 8, 1).unwrap(), 1);
        assert!(step_span(2, 4, 4).is_err());
        assert!(step_span(0, 5, 4).is_err());
        assert!(step_span(3, 3, 4).is_err());
    }

    #[test]
    fn test_display() {
        let layer = FullyConnectedLayer::new(FullyConnectedConfig::new(8).with_lora_rank(4));
        assert_eq!(layer.to_string(), "FullyConnected(unit=8, rank=4, bias=true)");
        assert_eq!(layer.layer_type(), "fully_connected");
    }
}

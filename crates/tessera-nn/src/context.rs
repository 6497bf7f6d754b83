//! Execution context: owns every tensor a layer touches and hands the layer
//! typed handles to reach them.
//!
//! Layers never own storage. During [`finalize`](crate::Layer::finalize) they
//! describe what they need through an [`InitLayerContext`]; the
//! [`RunLayerContext`] built from it allocates inputs, outputs, derivatives,
//! weights and scratch tensors and resolves handles on every call.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tessera_core::{DataType, Format, Initializer, Result, Tensor, TensorDim, TensorType, TesseraError};

use crate::weight::{TensorLifespan, Weight, WeightRegularizer};

/// Handle to a weight requested during finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightHandle(usize);

/// Handle to a scratch tensor requested during finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(usize);

#[derive(Debug, Clone)]
struct WeightRequest {
    dim: TensorDim,
    initializer: Initializer,
    regularizer: WeightRegularizer,
    regularizer_constant: f32,
    decay: f32,
    name: String,
    trainable: bool,
}

#[derive(Debug, Clone)]
struct TensorRequest {
    dim: TensorDim,
    name: String,
    initializer: Initializer,
    trainable: bool,
    lifespan: TensorLifespan,
}

/// Collects a layer's shape decisions and storage requests.
#[derive(Debug, Clone)]
pub struct InitLayerContext {
    name: String,
    format: Format,
    weight_dtype: DataType,
    activation_dtype: DataType,
    input_dims: Vec<TensorDim>,
    output_dims: Vec<TensorDim>,
    weights: Vec<WeightRequest>,
    tensors: Vec<TensorRequest>,
}

impl InitLayerContext {
    /// Input dimensions are retagged with `format` and `activation_dtype`.
    pub fn new(
        input_dims: Vec<TensorDim>,
        format: Format,
        weight_dtype: DataType,
        activation_dtype: DataType,
        name: &str,
    ) -> Self {
        let t_type = TensorType::new(format, activation_dtype);
        let input_dims = input_dims
            .into_iter()
            .map(|mut d| {
                d.set_tensor_type(t_type);
                d
            })
            .collect();
        Self {
            name: name.to_string(),
            format,
            weight_dtype,
            activation_dtype,
            input_dims,
            output_dims: Vec::new(),
            weights: Vec::new(),
            tensors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn weight_data_type(&self) -> DataType {
        self.weight_dtype
    }

    pub fn activation_data_type(&self) -> DataType {
        self.activation_dtype
    }

    pub fn num_inputs(&self) -> usize {
        self.input_dims.len()
    }

    pub fn input_dimensions(&self) -> &[TensorDim] {
        &self.input_dims
    }

    pub fn output_dimensions(&self) -> &[TensorDim] {
        &self.output_dims
    }

    pub fn set_output_dimensions(&mut self, dims: Vec<TensorDim>) {
        self.output_dims = dims;
    }

    /// Request a persistent parameter; its gradient is allocated when `trainable`.
    #[allow(clippy::too_many_arguments)]
    pub fn request_weight(
        &mut self,
        dim: TensorDim,
        initializer: Initializer,
        regularizer: WeightRegularizer,
        regularizer_constant: f32,
        decay: f32,
        name: &str,
        trainable: bool,
    ) -> WeightHandle {
        let name = format!("{}:{}", self.name, name);
        tracing::debug!("'{}' requests weight '{}' {}", self.name, name, dim);
        self.weights.push(WeightRequest {
            dim,
            initializer,
            regularizer,
            regularizer_constant,
            decay,
            name,
            trainable,
        });
        WeightHandle(self.weights.len() - 1)
    }

    /// Request a scratch tensor; its gradient is allocated when `trainable`.
    pub fn request_tensor(
        &mut self,
        dim: TensorDim,
        name: &str,
        initializer: Initializer,
        trainable: bool,
        lifespan: TensorLifespan,
    ) -> TensorHandle {
        let name = format!("{}:{}", self.name, name);
        tracing::debug!("'{}' requests tensor '{}' {} ({:?})", self.name, name, dim, lifespan);
        self.tensors.push(TensorRequest {
            dim,
            name,
            initializer,
            trainable,
            lifespan,
        });
        TensorHandle(self.tensors.len() - 1)
    }
}

struct TensorSlot {
    var: Tensor,
    grad: Option<Tensor>,
    lifespan: TensorLifespan,
}

/// Owns all storage for one finalized layer and resolves its handles.
pub struct RunLayerContext {
    name: String,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    incoming_derivatives: Vec<Tensor>,
    outgoing_derivatives: Vec<Tensor>,
    weights: Vec<Weight>,
    tensors: Vec<TensorSlot>,
    weight_grad_accessed: Vec<bool>,
    tensor_grad_accessed: Vec<bool>,
}

impl RunLayerContext {
    /// Materialize every request in `init`, with an entropy-seeded `StdRng` for initializers.
    pub fn new(init: &InitLayerContext) -> Result<Self> {
        Self::build(init, &mut StdRng::from_entropy())
    }

    /// Like [`new`](Self::new) with reproducible initial values.
    pub fn new_seeded(init: &InitLayerContext, seed: u64) -> Result<Self> {
        Self::build(init, &mut StdRng::seed_from_u64(seed))
    }

    fn build(init: &InitLayerContext, rng: &mut StdRng) -> Result<Self> {
        let name = init.name.clone();
        let alloc = |dim: &TensorDim, slot: &str| Tensor::zeros(*dim, &format!("{name}:{slot}"));

        let inputs = init.input_dims.iter().map(|d| alloc(d, "input")).collect::<Result<Vec<_>>>()?;
        let outgoing_derivatives = init
            .input_dims
            .iter()
            .map(|d| alloc(d, "outgoing_derivative"))
            .collect::<Result<Vec<_>>>()?;
        let outputs = init.output_dims.iter().map(|d| alloc(d, "output")).collect::<Result<Vec<_>>>()?;
        let incoming_derivatives = init
            .output_dims
            .iter()
            .map(|d| alloc(d, "incoming_derivative"))
            .collect::<Result<Vec<_>>>()?;

        let mut weights = Vec::with_capacity(init.weights.len());
        for req in &init.weights {
            let mut var = Tensor::new(req.dim, true, Initializer::None, &req.name)?;
            var.initialize_with(req.initializer, rng)?;
            let grad = if req.trainable {
                Some(Tensor::zeros(grad_dim(req.dim, init.activation_dtype), &format!("{}:grad", req.name))?)
            } else {
                None
            };
            weights.push(Weight::new(
                var,
                grad,
                req.regularizer,
                req.regularizer_constant,
                req.decay,
                req.dim.format().unit_axis(),
            ));
        }

        let mut tensors = Vec::with_capacity(init.tensors.len());
        for req in &init.tensors {
            let mut var = Tensor::new(req.dim, true, Initializer::None, &req.name)?;
            var.initialize_with(req.initializer, rng)?;
            let grad = if req.trainable {
                Some(Tensor::zeros(grad_dim(req.dim, init.activation_dtype), &format!("{}:grad", req.name))?)
            } else {
                None
            };
            tensors.push(TensorSlot {
                var,
                grad,
                lifespan: req.lifespan,
            });
        }

        tracing::debug!(
            "context '{}' ready: {} weight(s), {} tensor(s)",
            name,
            weights.len(),
            tensors.len()
        );
        Ok(Self {
            weight_grad_accessed: vec![false; weights.len()],
            tensor_grad_accessed: vec![false; tensors.len()],
            name,
            inputs,
            outputs,
            incoming_derivatives,
            outgoing_derivatives,
            weights,
            tensors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    // =========================================================================
    // Slots
    // =========================================================================

    pub fn input(&self, idx: usize) -> Result<&Tensor> {
        slot(&self.inputs, idx, "input")
    }

    pub fn input_mut(&mut self, idx: usize) -> Result<&mut Tensor> {
        slot_mut(&mut self.inputs, idx, "input")
    }

    pub fn output(&self, idx: usize) -> Result<&Tensor> {
        slot(&self.outputs, idx, "output")
    }

    pub fn output_mut(&mut self, idx: usize) -> Result<&mut Tensor> {
        slot_mut(&mut self.outputs, idx, "output")
    }

    pub fn incoming_derivative(&self, idx: usize) -> Result<&Tensor> {
        slot(&self.incoming_derivatives, idx, "incoming derivative")
    }

    pub fn incoming_derivative_mut(&mut self, idx: usize) -> Result<&mut Tensor> {
        slot_mut(&mut self.incoming_derivatives, idx, "incoming derivative")
    }

    pub fn outgoing_derivative(&self, idx: usize) -> Result<&Tensor> {
        slot(&self.outgoing_derivatives, idx, "outgoing derivative")
    }

    pub fn outgoing_derivative_mut(&mut self, idx: usize) -> Result<&mut Tensor> {
        slot_mut(&mut self.outgoing_derivatives, idx, "outgoing derivative")
    }

    // =========================================================================
    // Weights
    // =========================================================================

    pub fn weight_object(&self, handle: WeightHandle) -> Result<&Weight> {
        self.weights
            .get(handle.0)
            .ok_or_else(|| unknown(&self.name, "weight", handle.0))
    }

    pub fn weight_object_mut(&mut self, handle: WeightHandle) -> Result<&mut Weight> {
        let name = &self.name;
        self.weights
            .get_mut(handle.0)
            .ok_or_else(|| unknown(name, "weight", handle.0))
    }

    pub fn weight(&self, handle: WeightHandle) -> Result<&Tensor> {
        self.weight_object(handle).map(Weight::var)
    }

    pub fn weight_mut(&mut self, handle: WeightHandle) -> Result<&mut Tensor> {
        self.weight_object_mut(handle).map(Weight::var_mut)
    }

    pub fn weight_grad(&self, handle: WeightHandle) -> Result<&Tensor> {
        let w = self.weight_object(handle)?;
        w.grad().ok_or_else(|| no_grad(w.var().name()))
    }

    pub fn weight_grad_mut(&mut self, handle: WeightHandle) -> Result<&mut Tensor> {
        let w = self.weight_object_mut(handle)?;
        let name = w.var().name().to_string();
        w.grad_mut().ok_or_else(|| no_grad(&name))
    }

    /// Whether the gradient of `handle` has not been written yet this iteration.
    pub fn is_gradient_first_access(&self, handle: WeightHandle) -> Result<bool> {
        self.weight_grad_accessed
            .get(handle.0)
            .map(|accessed| !accessed)
            .ok_or_else(|| unknown(&self.name, "weight", handle.0))
    }

    pub fn mark_gradient_accessed(&mut self, handle: WeightHandle) -> Result<()> {
        let name = &self.name;
        let flag = self
            .weight_grad_accessed
            .get_mut(handle.0)
            .ok_or_else(|| unknown(name, "weight", handle.0))?;
        *flag = true;
        Ok(())
    }

    /// Apply L2 regularization and weight decay to every trainable weight
    /// whose gradient was written since the last [`begin_iteration`](Self::begin_iteration).
    pub fn apply_gradient_penalties(&mut self) -> Result<()> {
        let written = self
            .weights
            .iter_mut()
            .zip(&self.weight_grad_accessed)
            .filter(|(w, accessed)| **accessed && w.is_trainable())
            .map(|(w, _)| w);
        for w in written {
            w.calc_regularization_gradient()?;
            w.calc_weight_decay_gradient()?;
        }
        Ok(())
    }

    // =========================================================================
    // Tensors
    // =========================================================================

    fn tensor_slot(&self, handle: TensorHandle) -> Result<&TensorSlot> {
        self.tensors
            .get(handle.0)
            .ok_or_else(|| unknown(&self.name, "tensor", handle.0))
    }

    fn tensor_slot_mut(&mut self, handle: TensorHandle) -> Result<&mut TensorSlot> {
        let name = &self.name;
        self.tensors
            .get_mut(handle.0)
            .ok_or_else(|| unknown(name, "tensor", handle.0))
    }

    pub fn tensor(&self, handle: TensorHandle) -> Result<&Tensor> {
        self.tensor_slot(handle).map(|s| &s.var)
    }

    pub fn tensor_mut(&mut self, handle: TensorHandle) -> Result<&mut Tensor> {
        self.tensor_slot_mut(handle).map(|s| &mut s.var)
    }

    pub fn tensor_grad(&self, handle: TensorHandle) -> Result<&Tensor> {
        let s = self.tensor_slot(handle)?;
        s.grad.as_ref().ok_or_else(|| no_grad(s.var.name()))
    }

    pub fn tensor_grad_mut(&mut self, handle: TensorHandle) -> Result<&mut Tensor> {
        let s = self.tensor_slot_mut(handle)?;
        let name = s.var.name().to_string();
        s.grad.as_mut().ok_or_else(|| no_grad(&name))
    }

    pub fn tensor_lifespan(&self, handle: TensorHandle) -> Result<TensorLifespan> {
        self.tensor_slot(handle).map(|s| s.lifespan)
    }

    pub fn is_tensor_gradient_first_access(&self, handle: TensorHandle) -> Result<bool> {
        self.tensor_grad_accessed
            .get(handle.0)
            .map(|accessed| !accessed)
            .ok_or_else(|| unknown(&self.name, "tensor", handle.0))
    }

    pub fn mark_tensor_gradient_accessed(&mut self, handle: TensorHandle) -> Result<()> {
        let name = &self.name;
        let flag = self
            .tensor_grad_accessed
            .get_mut(handle.0)
            .ok_or_else(|| unknown(name, "tensor", handle.0))?;
        *flag = true;
        Ok(())
    }

    /// Start a new iteration: every gradient is overwritten on its next write.
    pub fn begin_iteration(&mut self) {
        self.weight_grad_accessed.fill(false);
        self.tensor_grad_accessed.fill(false);
    }
}

/// Gradients of quantized parameters are kept at the activation precision.
fn grad_dim(mut dim: TensorDim, activation_dtype: DataType) -> TensorDim {
    if dim.data_type().is_quantized() {
        dim.set_data_type(activation_dtype);
    }
    dim
}

fn slot<'a>(tensors: &'a [Tensor], idx: usize, kind: &str) -> Result<&'a Tensor> {
    let len = tensors.len();
    tensors
        .get(idx)
        .ok_or_else(|| TesseraError::InvalidArgument(format!("{kind} {idx} out of {len}")))
}

fn slot_mut<'a>(tensors: &'a mut [Tensor], idx: usize, kind: &str) -> Result<&'a mut Tensor> {
    let len = tensors.len();
    tensors
        .get_mut(idx)
        .ok_or_else(|| TesseraError::InvalidArgument(format!("{kind} {idx} out of {len}")))
}

fn unknown(layer: &str, kind: &str, idx: usize) -> TesseraError {
    TesseraError::UninitializedHandle(format!("{kind} #{idx} of '{layer}'"))
}

fn no_grad(name: &str) -> TesseraError {
    TesseraError::UninitializedHandle(format!("'{name}' is not trainable and has no gradient"))
}

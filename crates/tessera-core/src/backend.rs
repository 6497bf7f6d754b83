use std::any::Any;
use std::fmt;

use rand::RngCore;

use crate::dtype::DataType;
use crate::error::TesseraError;
use crate::init::{self, Fill, Initializer};
use crate::shape::{TensorDim, MAXDIM};
use crate::Result;

/// Storage backend behind a [`Tensor`](crate::Tensor).
///
/// Each element type has one implementation: [`FloatTensor`](crate::FloatTensor)
/// for fp32, [`HalfTensor`](crate::HalfTensor) for fp16 and
/// [`QuantizedTensor`](crate::QuantizedTensor) for the integer weight formats.
/// Operations taking a second backend downcast it to their own concrete type
/// and fail with [`TesseraError::DTypeMismatch`] when the types differ.
///
/// Values always cross this boundary as `f32` in the layout's memory order;
/// narrower backends convert on the way in and out.
pub trait TensorBackend: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn as_dyn(&self) -> &dyn TensorBackend;
    fn as_backend_mut(&mut self) -> &mut dyn TensorBackend;

    // =========================================================================
    // Metadata
    // =========================================================================

    fn dim(&self) -> &TensorDim;

    /// Per-axis element strides in logical (b, c, h, w) order.
    fn strides(&self) -> [usize; MAXDIM];

    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);

    fn initializer(&self) -> Initializer;
    fn set_initializer(&mut self, init: Initializer);

    fn data_type(&self) -> DataType {
        self.dim().data_type()
    }

    fn size(&self) -> usize {
        self.dim().len()
    }

    fn bytes(&self) -> usize {
        self.dim().bytes()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate zeroed storage and apply the recorded initializer.
    /// A no-op on an already allocated backend.
    fn allocate(&mut self) -> Result<()>;

    /// Release storage. Idempotent; views of this backend become unusable.
    fn deallocate(&mut self);

    fn is_allocated(&self) -> bool;

    /// Whether this backend borrows another backend's storage.
    fn is_view(&self) -> bool;

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Linear element offset of `(b, c, h, w)` under this backend's strides.
    fn get_index(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        TensorDim::offset_of([b, c, h, w], self.strides())
    }

    fn is_contiguous(&self) -> bool {
        self.strides() == self.dim().canonical_strides()
    }

    /// Whether axis `np2` sits directly inside `np1` in memory.
    fn check_continuous(&self, np1: usize, np2: usize) -> Result<bool> {
        self.dim().check_continuous(np1, np2)
    }

    fn check_bounds(&self, b: usize, c: usize, h: usize, w: usize) -> Result<()> {
        let dims = self.dim().dims();
        let index = [b, c, h, w];
        if index.iter().zip(dims.iter()).any(|(i, d)| i >= d) {
            return Err(TesseraError::IndexOutOfRange { index, dim: dims });
        }
        Ok(())
    }

    // =========================================================================
    // Element access and fills
    // =========================================================================

    fn get_value(&self, b: usize, c: usize, h: usize, w: usize) -> Result<f32>;

    /// Fill every element with `value`.
    fn set_value(&mut self, value: f32) -> Result<()>;

    fn set_value_at(&mut self, b: usize, c: usize, h: usize, w: usize, value: f32) -> Result<()>;

    fn set_zero(&mut self) -> Result<()> {
        self.set_value(0.0)
    }

    /// All elements in memory order, widened to f32.
    fn to_f32_vec(&self) -> Result<Vec<f32>>;

    /// Overwrite all elements from f32 values given in memory order.
    fn copy_from_f32(&mut self, values: &[f32]) -> Result<()>;

    fn set_rand_normal(&mut self, rng: &mut dyn RngCore, mean: f32, stddev: f32) -> Result<()> {
        let values = init::sample_normal(rng, self.size(), mean, stddev);
        self.copy_from_f32(&values)
    }

    fn set_rand_uniform(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) -> Result<()> {
        let values = init::sample_uniform(rng, self.size(), min, max);
        self.copy_from_f32(&values)
    }

    fn set_rand_bernoulli(&mut self, rng: &mut dyn RngCore, probability: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(TesseraError::InvalidArgument(format!(
                "bernoulli probability {probability} outside [0, 1]"
            )));
        }
        let values = init::sample_bernoulli(rng, self.size(), probability);
        self.copy_from_f32(&values)
    }

    /// Record `init` and fill the allocated storage accordingly.
    fn initialize(&mut self, init: Initializer, rng: &mut dyn RngCore) -> Result<()> {
        self.set_initializer(init);
        match init.fill_for(self.dim()) {
            Fill::Keep => Ok(()),
            Fill::Constant(v) => self.set_value(v),
            Fill::Normal { mean, stddev } => self.set_rand_normal(rng, mean, stddev),
            Fill::Uniform { min, max } => self.set_rand_uniform(rng, min, max),
        }
    }

    /// Element-for-element copy from a backend of the same concrete type.
    fn copy_from(&mut self, src: &dyn TensorBackend) -> Result<()>;

    // =========================================================================
    // Views
    // =========================================================================

    /// Non-owning view of `dim` starting `offset` elements into this backend.
    ///
    /// With `reset_stride` the view gets dense strides for `dim`; otherwise it
    /// keeps this backend's strides so it can address a strided sub-block.
    fn shared_data(
        &self,
        dim: TensorDim,
        offset: usize,
        reset_stride: bool,
        name: &str,
    ) -> Result<Box<dyn TensorBackend>>;

    // =========================================================================
    // Compute
    // =========================================================================

    /// `out = op(self) · op(m) + beta · out` over the matrix views.
    fn dot(
        &self,
        m: &dyn TensorBackend,
        out: &mut dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<()>;

    /// Per-batch [`dot`](Self::dot). `m` may have batch 1, in which case it
    /// is reused for every batch entry of `self`.
    fn dot_batched(
        &self,
        m: &dyn TensorBackend,
        out: &mut dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<()>;

    /// Derivative of `out = self · m` with respect to `self`, written into `self`.
    fn dot_deriv_wrt_1(
        &mut self,
        m: &dyn TensorBackend,
        output_deriv: &dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        if trans {
            return Err(TesseraError::InvalidArgument(
                "derivative of a transposed left operand".into(),
            ));
        }
        let beta = if accumulate { 1.0 } else { 0.0 };
        output_deriv.dot(m, self.as_backend_mut(), false, !trans_m, beta)
    }

    /// Derivative of `out = self · m` with respect to `m`, written into `m_deriv`.
    fn dot_deriv_wrt_2(
        &self,
        m_deriv: &mut dyn TensorBackend,
        output_deriv: &dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        let beta = if accumulate { 1.0 } else { 0.0 };
        match (trans, trans_m) {
            (false, false) => self.dot(output_deriv, m_deriv, true, false, beta),
            (false, true) => output_deriv.dot(self.as_dyn(), m_deriv, true, false, beta),
            _ => Err(TesseraError::InvalidArgument(
                "derivative of a transposed left operand".into(),
            )),
        }
    }

    /// Per-batch [`dot_deriv_wrt_1`](Self::dot_deriv_wrt_1).
    fn dot_batched_deriv_wrt_1(
        &mut self,
        m: &dyn TensorBackend,
        output_deriv: &dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        if trans {
            return Err(TesseraError::InvalidArgument(
                "derivative of a transposed left operand".into(),
            ));
        }
        let beta = if accumulate { 1.0 } else { 0.0 };
        output_deriv.dot_batched(m, self.as_backend_mut(), false, !trans_m, beta)
    }

    /// `self += alpha · other`, broadcasting `other` along its size-1 axes.
    fn add_i(&mut self, other: &dyn TensorBackend, alpha: f32) -> Result<()>;

    /// `out = alpha · Σ_axes self + beta · out`.
    fn sum(&self, axes: &[usize], out: &mut dyn TensorBackend, alpha: f32, beta: f32) -> Result<()>;

    /// Expand stored values into a float backend of the same dimensions.
    fn dequantize(&self, _out: &mut dyn TensorBackend, _axis: usize) -> Result<()> {
        Err(TesseraError::UnsupportedDType(self.data_type()))
    }

    /// Same concrete type, dimension, strides and bitwise-equal contents.
    fn data_eq(&self, other: &dyn TensorBackend) -> bool;
}

/// Downcast a peer backend to `T`, reporting its dtype on failure.
pub(crate) fn downcast<'a, T: 'static>(
    peer: &'a dyn TensorBackend,
    expected: DataType,
) -> Result<&'a T> {
    let got = peer.data_type();
    peer.as_any()
        .downcast_ref::<T>()
        .ok_or(TesseraError::DTypeMismatch { expected, got })
}

pub(crate) fn downcast_mut<'a, T: 'static>(
    peer: &'a mut dyn TensorBackend,
    expected: DataType,
) -> Result<&'a mut T> {
    let got = peer.data_type();
    peer.as_any_mut()
        .downcast_mut::<T>()
        .ok_or(TesseraError::DTypeMismatch { expected, got })
}

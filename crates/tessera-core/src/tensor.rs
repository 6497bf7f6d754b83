use std::fmt;

use rand::RngCore;

use crate::backend::TensorBackend;
use crate::dense::{DenseTensor, Element, FloatTensor};
use crate::dtype::{DataType, Format, TensorType};
use crate::error::TesseraError;
use crate::init::Initializer;
use crate::quantized::QuantizedTensor;
use crate::shape::{TensorDim, MAXDIM};
use crate::Result;

/// A four-axis tensor with a dtype-specific storage backend.
///
/// `Tensor` is move-only: sharing storage is always explicit, through
/// [`share`](Self::share) or
/// [`get_shared_data_tensor`](Self::get_shared_data_tensor). Views borrow
/// their owner's buffer without keeping it alive.
///
/// # Examples
///
/// ```
/// use tessera_core::{Tensor, TensorDim};
///
/// let x = Tensor::from_vec(TensorDim::new(1, 1, 2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
/// let mut row = x.get_shared_data_tensor(TensorDim::new(1, 1, 1, 2), 2, true, "row").unwrap();
/// row.set_value(0.0).unwrap();
/// assert_eq!(x.to_f32_vec().unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
/// ```
pub struct Tensor {
    itensor: Box<dyn TensorBackend>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Empty, unallocated tensor of the given layout and dtype.
    pub fn new_empty(name: &str, format: Format, data_type: DataType) -> Result<Self> {
        let dim = TensorDim::with_type(0, 0, 0, 0, TensorType::new(format, data_type));
        Self::new(dim, false, Initializer::None, name)
    }

    /// Tensor for `dim`; allocated and filled by `init` when `alloc_now`.
    pub fn new(dim: TensorDim, alloc_now: bool, init: Initializer, name: &str) -> Result<Self> {
        let itensor: Box<dyn TensorBackend> = match dim.data_type() {
            DataType::Fp32 => Box::new(FloatTensor::with_dim(dim, alloc_now, init, name)?),
            DataType::Fp16 => half_backend(dim, alloc_now, init, name)?,
            DataType::QInt8 | DataType::QInt4 => {
                let mut q = QuantizedTensor::new(dim, dim.format().unit_axis(), init, name)?;
                if alloc_now {
                    q.allocate()?;
                }
                Box::new(q)
            }
        };
        Ok(Self { itensor })
    }

    /// Allocated tensor of zeros.
    pub fn zeros(dim: TensorDim, name: &str) -> Result<Self> {
        Self::new(dim, true, Initializer::Zeros, name)
    }

    /// Adopt `data` (memory order) without copying. `T` must match the
    /// dtype recorded in `dim`.
    pub fn from_vec<T: Element>(dim: TensorDim, data: Vec<T>) -> Result<Self> {
        let backend = DenseTensor::<T>::from_vec(dim, data)?;
        Ok(Self {
            itensor: Box::new(backend),
        })
    }

    /// Build from nested data in the layout's memory order.
    pub fn from_nested<T: Element>(data: Vec<Vec<Vec<Vec<T>>>>, t_type: TensorType) -> Result<Self> {
        if t_type.data_type != T::DTYPE {
            return Err(TesseraError::DTypeMismatch {
                expected: t_type.data_type,
                got: T::DTYPE,
            });
        }
        let backend = DenseTensor::<T>::from_nested(data, t_type.format)?;
        Ok(Self {
            itensor: Box::new(backend),
        })
    }

    /// Wrap an existing backend.
    pub fn from_backend(itensor: Box<dyn TensorBackend>) -> Self {
        Self { itensor }
    }

    pub fn backend(&self) -> &dyn TensorBackend {
        &*self.itensor
    }

    pub fn backend_mut(&mut self) -> &mut dyn TensorBackend {
        &mut *self.itensor
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn dim(&self) -> TensorDim {
        *self.itensor.dim()
    }

    pub fn batch(&self) -> usize {
        self.itensor.dim().batch()
    }

    pub fn channel(&self) -> usize {
        self.itensor.dim().channel()
    }

    pub fn height(&self) -> usize {
        self.itensor.dim().height()
    }

    pub fn width(&self) -> usize {
        self.itensor.dim().width()
    }

    pub fn size(&self) -> usize {
        self.itensor.size()
    }

    pub fn bytes(&self) -> usize {
        self.itensor.bytes()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn format(&self) -> Format {
        self.itensor.dim().format()
    }

    pub fn data_type(&self) -> DataType {
        self.itensor.data_type()
    }

    pub fn strides(&self) -> [usize; MAXDIM] {
        self.itensor.strides()
    }

    pub fn name(&self) -> &str {
        self.itensor.name()
    }

    pub fn set_name(&mut self, name: &str) {
        self.itensor.set_name(name);
    }

    pub fn initializer(&self) -> Initializer {
        self.itensor.initializer()
    }

    pub fn get_index(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        self.itensor.get_index(b, c, h, w)
    }

    pub fn is_contiguous(&self) -> bool {
        self.itensor.is_contiguous()
    }

    pub fn check_continuous(&self, np1: usize, np2: usize) -> Result<bool> {
        self.itensor.check_continuous(np1, np2)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn allocate(&mut self) -> Result<()> {
        self.itensor.allocate()
    }

    pub fn deallocate(&mut self) {
        self.itensor.deallocate();
    }

    pub fn is_allocated(&self) -> bool {
        self.itensor.is_allocated()
    }

    pub fn is_view(&self) -> bool {
        self.itensor.is_view()
    }

    // =========================================================================
    // Element access and fills
    // =========================================================================

    pub fn get_value(&self, b: usize, c: usize, h: usize, w: usize) -> Result<f32> {
        self.itensor.get_value(b, c, h, w)
    }

    pub fn set_value(&mut self, value: f32) -> Result<()> {
        self.itensor.set_value(value)
    }

    pub fn set_value_at(&mut self, b: usize, c: usize, h: usize, w: usize, value: f32) -> Result<()> {
        self.itensor.set_value_at(b, c, h, w, value)
    }

    pub fn set_zero(&mut self) -> Result<()> {
        self.itensor.set_zero()
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.itensor.to_f32_vec()
    }

    /// Overwrite every element from f32 values in memory order.
    pub fn copy_from_f32(&mut self, values: &[f32]) -> Result<()> {
        self.itensor.copy_from_f32(values)
    }

    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        self.itensor.copy_from(src.backend())
    }

    pub fn set_rand_normal(&mut self, mean: f32, stddev: f32) -> Result<()> {
        self.set_rand_normal_with(&mut rand::thread_rng(), mean, stddev)
    }

    pub fn set_rand_normal_with(&mut self, rng: &mut dyn RngCore, mean: f32, stddev: f32) -> Result<()> {
        self.itensor.set_rand_normal(rng, mean, stddev)
    }

    pub fn set_rand_uniform(&mut self, min: f32, max: f32) -> Result<()> {
        self.set_rand_uniform_with(&mut rand::thread_rng(), min, max)
    }

    pub fn set_rand_uniform_with(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) -> Result<()> {
        self.itensor.set_rand_uniform(rng, min, max)
    }

    pub fn set_rand_bernoulli(&mut self, probability: f32) -> Result<()> {
        self.set_rand_bernoulli_with(&mut rand::thread_rng(), probability)
    }

    pub fn set_rand_bernoulli_with(&mut self, rng: &mut dyn RngCore, probability: f32) -> Result<()> {
        self.itensor.set_rand_bernoulli(rng, probability)
    }

    /// Re-apply the recorded initializer.
    pub fn initialize(&mut self) -> Result<()> {
        let init = self.initializer();
        self.initialize_with(init, &mut rand::thread_rng())
    }

    pub fn initialize_with(&mut self, init: Initializer, rng: &mut dyn RngCore) -> Result<()> {
        self.itensor.initialize(init, rng)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// View of `dim` starting `offset` elements into this tensor's storage.
    ///
    /// With `reset_stride == false` the view keeps this tensor's strides, which
    /// is how a single row of every batch entry is addressed at once.
    pub fn get_shared_data_tensor(
        &self,
        dim: TensorDim,
        offset: usize,
        reset_stride: bool,
        name: &str,
    ) -> Result<Tensor> {
        let itensor = self.itensor.shared_data(dim, offset, reset_stride, name)?;
        Ok(Self { itensor })
    }

    /// Full-size view with the same dimension and strides.
    pub fn share(&self) -> Result<Tensor> {
        self.get_shared_data_tensor(self.dim(), 0, false, self.name())
    }

    // =========================================================================
    // Compute
    // =========================================================================

    pub fn dot(&self, m: &Tensor, out: &mut Tensor, trans: bool, trans_m: bool, beta: f32) -> Result<()> {
        self.itensor.dot(m.backend(), out.backend_mut(), trans, trans_m, beta)
    }

    /// `self · m` into a newly allocated tensor.
    pub fn dot_new(&self, m: &Tensor, trans: bool, trans_m: bool) -> Result<Tensor> {
        let (r1, c1) = self.dim().matrix_dims();
        let (r2, c2) = m.dim().matrix_dims();
        let rows = if trans { c1 } else { r1 };
        let cols = if trans_m { r2 } else { c2 };
        let t_type = self.dim().tensor_type();
        let dim = match t_type.format {
            Format::Nchw => TensorDim::with_type(1, 1, rows, cols, t_type),
            Format::Nhwc => TensorDim::with_type(1, cols, 1, rows, t_type),
        };
        let mut out = Tensor::new(dim, true, Initializer::None, "")?;
        self.dot(m, &mut out, trans, trans_m, 0.0)?;
        Ok(out)
    }

    pub fn dot_batched(&self, m: &Tensor, out: &mut Tensor, trans: bool, trans_m: bool, beta: f32) -> Result<()> {
        self.itensor.dot_batched(m.backend(), out.backend_mut(), trans, trans_m, beta)
    }

    /// Gradient of `out = self · m` with respect to `self`, stored into `self`.
    pub fn dot_deriv_wrt_1(
        &mut self,
        m: &Tensor,
        output_deriv: &Tensor,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        self.itensor
            .dot_deriv_wrt_1(m.backend(), output_deriv.backend(), trans, trans_m, accumulate)
    }

    /// Gradient of `out = self · m` with respect to `m`, stored into `m_deriv`.
    pub fn dot_deriv_wrt_2(
        &self,
        m_deriv: &mut Tensor,
        output_deriv: &Tensor,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        self.itensor.dot_deriv_wrt_2(
            m_deriv.backend_mut(),
            output_deriv.backend(),
            trans,
            trans_m,
            accumulate,
        )
    }

    pub fn dot_batched_deriv_wrt_1(
        &mut self,
        m: &Tensor,
        output_deriv: &Tensor,
        trans: bool,
        trans_m: bool,
        accumulate: bool,
    ) -> Result<()> {
        self.itensor
            .dot_batched_deriv_wrt_1(m.backend(), output_deriv.backend(), trans, trans_m, accumulate)
    }

    /// `self += other`, broadcasting `other` along its size-1 axes.
    pub fn add_i(&mut self, other: &Tensor) -> Result<()> {
        self.add_i_scaled(other, 1.0)
    }

    pub fn add_i_scaled(&mut self, other: &Tensor, alpha: f32) -> Result<()> {
        self.itensor.add_i(other.backend(), alpha)
    }

    pub fn sum(&self, axes: &[usize], out: &mut Tensor, alpha: f32, beta: f32) -> Result<()> {
        self.itensor.sum(axes, out.backend_mut(), alpha, beta)
    }

    /// Sum over `axes` into a newly allocated tensor.
    pub fn sum_new(&self, axes: &[usize]) -> Result<Tensor> {
        let axes = self.dim().normalize_axes(axes)?;
        let dim = self.dim().reduced(&axes)?;
        let mut out = Tensor::new(dim, true, Initializer::None, "")?;
        self.sum(&axes, &mut out, 1.0, 0.0)?;
        Ok(out)
    }

    // =========================================================================
    // Quantization
    // =========================================================================

    /// Symmetric per-channel quantization along `axis`.
    pub fn quantize(&self, data_type: DataType, axis: usize) -> Result<Tensor> {
        if !data_type.is_quantized() {
            return Err(TesseraError::InvalidArgument(format!(
                "cannot quantize to {data_type}"
            )));
        }
        if self.data_type().is_quantized() {
            return Err(TesseraError::UnsupportedDType(self.data_type()));
        }
        let values = self.to_f32_vec()?;
        let mut dim = self.dim();
        dim.set_data_type(data_type);
        let q = QuantizedTensor::from_f32(dim, axis, &values, self.name())?;
        Ok(Self { itensor: Box::new(q) })
    }

    /// Dequantize into `out`, which must be a float tensor of the same dimension.
    pub fn dequantize(&self, out: &mut Tensor, axis: usize) -> Result<()> {
        self.itensor.dequantize(out.backend_mut(), axis)
    }

    /// Dequantize into a newly allocated float tensor of `data_type`.
    pub fn dequantized(&self, data_type: DataType, axis: usize) -> Result<Tensor> {
        let mut dim = self.dim();
        dim.set_data_type(data_type);
        let mut out = Tensor::new(dim, true, Initializer::None, self.name())?;
        self.dequantize(&mut out, axis)?;
        Ok(out)
    }
}

#[cfg(feature = "fp16")]
fn half_backend(dim: TensorDim, alloc_now: bool, init: Initializer, name: &str) -> Result<Box<dyn TensorBackend>> {
    Ok(Box::new(crate::dense::HalfTensor::with_dim(dim, alloc_now, init, name)?))
}

#[cfg(not(feature = "fp16"))]
fn half_backend(_dim: TensorDim, _alloc_now: bool, _init: Initializer, _name: &str) -> Result<Box<dyn TensorBackend>> {
    Err(TesseraError::InvalidConfig(
        "fp16 tensors require the `fp16` feature".into(),
    ))
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.itensor.data_eq(other.backend())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(name={:?}, dim={}, strides={:?}, allocated={}, view={})",
            self.name(),
            self.dim(),
            self.strides(),
            self.is_allocated(),
            self.is_view(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_f32_vec() {
            Ok(data) if data.len() <= 20 => write!(f, "tensor({:?}, dim={})", data, self.dim()),
            Ok(data) if !data.is_empty() => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], dim={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.dim()
            ),
            _ => write!(f, "tensor(dim={}, unallocated)", self.dim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_new_empty() {
        let t = Tensor::new_empty("x", Format::Nhwc, DataType::Fp32).unwrap();
        assert!(t.empty());
        assert!(!t.is_allocated());
        assert_eq!(t.format(), Format::Nhwc);
    }

    #[test]
    fn test_new_routes_by_dtype() {
        let mut dim = TensorDim::new(1, 1, 2, 4);
        dim.set_data_type(DataType::QInt4);
        let q = Tensor::new(dim, true, Initializer::None, "q").unwrap();
        assert_eq!(q.bytes(), 4);
        assert!(q.backend().as_any().downcast_ref::<QuantizedTensor>().is_some());

        let f = Tensor::new(TensorDim::new(1, 1, 2, 4), true, Initializer::Ones, "f").unwrap();
        assert_eq!(f.bytes(), 32);
        assert_eq!(f.to_f32_vec().unwrap(), vec![1.0; 8]);
    }

    #[test]
    fn test_from_vec_checks_dtype() {
        let mut dim = TensorDim::new(1, 1, 1, 2);
        dim.set_data_type(DataType::Fp16);
        assert!(matches!(
            Tensor::from_vec(dim, vec![1.0f32, 2.0]),
            Err(TesseraError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_share_aliases_storage() {
        let t = Tensor::from_vec(TensorDim::new(1, 1, 1, 3), vec![1.0f32, 2.0, 3.0]).unwrap();
        let mut v = t.share().unwrap();
        assert!(v.is_view());
        v.set_value_at(0, 0, 0, 1, 9.0).unwrap();
        assert_eq!(t.get_value(0, 0, 0, 1).unwrap(), 9.0);
        assert_eq!(t, v);
    }

    #[test]
    fn test_dot_new_and_sum_new() {
        let a = Tensor::from_vec(TensorDim::new(1, 1, 2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(TensorDim::new(1, 1, 2, 1), vec![1.0f32, 1.0]).unwrap();
        let c = a.dot_new(&b, false, false).unwrap();
        assert_eq!(c.dim().dims(), [1, 1, 2, 1]);
        assert_eq!(c.to_f32_vec().unwrap(), vec![3.0, 7.0]);

        let s = a.sum_new(&[2]).unwrap();
        assert_eq!(s.to_f32_vec().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_seeded_fill_is_reproducible() {
        let dim = TensorDim::new(1, 1, 4, 4);
        let mut a = Tensor::zeros(dim, "a").unwrap();
        let mut b = Tensor::zeros(dim, "b").unwrap();
        a.initialize_with(Initializer::XavierNormal, &mut StdRng::seed_from_u64(11)).unwrap();
        b.initialize_with(Initializer::XavierNormal, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.initializer(), Initializer::XavierNormal);
    }

    #[test]
    fn test_bernoulli_rejects_bad_probability() {
        let mut t = Tensor::zeros(TensorDim::new(1, 1, 1, 4), "t").unwrap();
        assert!(matches!(t.set_rand_bernoulli(1.5), Err(TesseraError::InvalidArgument(_))));
        t.set_rand_bernoulli(0.0).unwrap();
        assert_eq!(t.to_f32_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_quantize_roundtrip() {
        let t = Tensor::from_vec(TensorDim::new(1, 1, 2, 2), vec![0.5f32, -1.0, 1.0, 2.0]).unwrap();
        let mut q = t.quantize(DataType::QInt8, 3).unwrap();
        assert_eq!(q.data_type(), DataType::QInt8);
        assert!(matches!(q.add_i(&t), Err(TesseraError::UnsupportedDType(DataType::QInt8))));
        let back = q.dequantized(DataType::Fp32, 3).unwrap();
        for (a, b) in back.to_f32_vec().unwrap().iter().zip(t.to_f32_vec().unwrap()) {
            assert!((a - b).abs() < 0.02);
        }
        assert!(t.quantize(DataType::Fp16, 3).is_err());
    }

    #[test]
    fn test_display() {
        let t = Tensor::from_vec(TensorDim::new(1, 1, 1, 2), vec![1.0f32, 2.0]).unwrap();
        assert_eq!(format!("{t}"), "tensor([1.0, 2.0], dim=[1, 1, 1, 2] NCHW fp32)");
    }
}

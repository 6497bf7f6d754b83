use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use crate::backend::{downcast, downcast_mut, TensorBackend};
use crate::dtype::{DataType, Format, TensorType};
use crate::error::TesseraError;
use crate::init::Initializer;
use crate::shape::{TensorDim, MAXDIM};
use crate::storage::Storage;
use crate::Result;

/// Scalar type with a dense storage backend.
pub trait Element: bytemuck::Pod + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DataType;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;

    /// Widen a contiguous run to f32, borrowing when no conversion is needed.
    fn widen(src: &[Self]) -> Cow<'_, [f32]> {
        Cow::Owned(src.iter().map(|v| v.to_f32()).collect())
    }

    /// Narrow f32 values into `dst`; lengths must match.
    fn narrow(src: &[f32], dst: &mut [Self]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = Self::from_f32(*s);
        }
    }
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Fp32;

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    fn widen(src: &[f32]) -> Cow<'_, [f32]> {
        Cow::Borrowed(src)
    }

    fn narrow(src: &[f32], dst: &mut [f32]) {
        dst.copy_from_slice(src);
    }
}

#[cfg(feature = "fp16")]
impl Element for half::f16 {
    const DTYPE: DataType = DataType::Fp16;

    #[inline]
    fn from_f32(v: f32) -> Self {
        half::f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    fn widen(src: &[half::f16]) -> Cow<'_, [f32]> {
        use half::slice::HalfFloatSliceExt;
        Cow::Owned(src.to_f32_vec())
    }

    fn narrow(src: &[f32], dst: &mut [half::f16]) {
        use half::slice::HalfFloatSliceExt;
        dst.convert_from_f32_slice(src);
    }
}

/// Dense backend storing one `T` per element.
pub struct DenseTensor<T: Element> {
    pub(crate) dim: TensorDim,
    pub(crate) strides: [usize; MAXDIM],
    pub(crate) name: String,
    initializer: Initializer,
    storage: Storage<T>,
}

/// Single-precision backend.
pub type FloatTensor = DenseTensor<f32>;

/// Half-precision backend.
#[cfg(feature = "fp16")]
pub type HalfTensor = DenseTensor<half::f16>;

impl<T: Element> DenseTensor<T> {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Empty, unallocated backend with the given layout.
    pub fn new(name: &str, format: Format) -> Self {
        let dim = TensorDim::with_type(0, 0, 0, 0, TensorType::new(format, T::DTYPE));
        Self::unallocated(dim, Initializer::None, name)
    }

    /// Backend for `dim`, optionally allocated and initialized right away.
    pub fn with_dim(dim: TensorDim, alloc_now: bool, init: Initializer, name: &str) -> Result<Self> {
        check_dtype::<T>(&dim)?;
        let mut t = Self::unallocated(dim, init, name);
        if alloc_now {
            t.allocate()?;
        }
        Ok(t)
    }

    /// Adopt `data` (memory order) as the storage for `dim` without copying.
    pub fn from_vec(dim: TensorDim, data: Vec<T>) -> Result<Self> {
        check_dtype::<T>(&dim)?;
        if data.len() != dim.len() {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![dim.len()],
                got: vec![data.len()],
            });
        }
        let mut t = Self::unallocated(dim, Initializer::None, "");
        t.storage = Storage::from_vec(data);
        Ok(t)
    }

    /// Build from nested data given in the layout's memory order:
    /// `[b][c][h][w]` for NCHW, `[b][h][w][c]` for NHWC.
    pub fn from_nested(data: Vec<Vec<Vec<Vec<T>>>>, format: Format) -> Result<Self> {
        let d0 = data.len();
        let d1 = data.first().map_or(0, |x| x.len());
        let d2 = data.first().and_then(|x| x.first()).map_or(0, |x| x.len());
        let d3 = data
            .first()
            .and_then(|x| x.first())
            .and_then(|x| x.first())
            .map_or(0, |x| x.len());

        let mut flat = Vec::with_capacity(d0 * d1 * d2 * d3);
        for outer in data {
            if outer.len() != d1 {
                return Err(ragged());
            }
            for mid in outer {
                if mid.len() != d2 {
                    return Err(ragged());
                }
                for inner in mid {
                    if inner.len() != d3 {
                        return Err(ragged());
                    }
                    flat.extend(inner);
                }
            }
        }

        let t_type = TensorType::new(format, T::DTYPE);
        let dim = match format {
            Format::Nchw => TensorDim::with_type(d0, d1, d2, d3, t_type),
            Format::Nhwc => TensorDim::with_type(d0, d3, d1, d2, t_type),
        };
        Self::from_vec(dim, flat)
    }

    fn unallocated(dim: TensorDim, initializer: Initializer, name: &str) -> Self {
        Self {
            strides: dim.canonical_strides(),
            dim,
            name: name.to_string(),
            initializer,
            storage: Storage::Unallocated,
        }
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    /// Offsets of every element in memory order, plus the span they cover.
    fn physical_offsets(&self) -> (Vec<usize>, usize) {
        let offsets: Vec<usize> = self
            .dim
            .coords()
            .map(|c| TensorDim::offset_of(c, self.strides))
            .collect();
        let span = offsets.iter().max().map_or(0, |m| m + 1);
        (offsets, span)
    }

    fn short_buffer(&self, need: usize, have: usize) -> TesseraError {
        TesseraError::StorageError(format!(
            "'{}' needs {need} elements but its buffer holds {have}",
            self.name
        ))
    }

    /// Elements in memory order, converted with `f`.
    fn gather<U>(&self, f: impl Fn(&[T]) -> Vec<U>, g: impl Fn(T) -> U) -> Result<Vec<U>> {
        let len = self.dim.len();
        if self.is_contiguous() {
            return self
                .storage
                .read(&self.name, |d| {
                    if d.len() < len {
                        Err(self.short_buffer(len, d.len()))
                    } else {
                        Ok(f(&d[..len]))
                    }
                })?;
        }
        let (offsets, span) = self.physical_offsets();
        self.storage.read(&self.name, |d| {
            if d.len() < span {
                return Err(self.short_buffer(span, d.len()));
            }
            Ok(offsets.iter().map(|&o| g(d[o])).collect())
        })?
    }

    /// Write `values` (memory order) through this backend's strides.
    fn scatter<U: Copy>(&self, values: &[U], f: impl Fn(&[U], &mut [T]), g: impl Fn(U) -> T) -> Result<()> {
        let len = self.dim.len();
        if values.len() != len {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![len],
                got: vec![values.len()],
            });
        }
        if self.is_contiguous() {
            return self.storage.write(&self.name, |d| {
                if d.len() < len {
                    return Err(self.short_buffer(len, d.len()));
                }
                f(values, &mut d[..len]);
                Ok(())
            })?;
        }
        let (offsets, span) = self.physical_offsets();
        self.storage.write(&self.name, |d| {
            if d.len() < span {
                return Err(self.short_buffer(span, d.len()));
            }
            for (&o, &v) in offsets.iter().zip(values) {
                d[o] = g(v);
            }
            Ok(())
        })?
    }

    /// Raw elements in memory order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.gather(|d| d.to_vec(), |v| v)
    }

    pub(crate) fn read_f32(&self) -> Result<Vec<f32>> {
        self.gather(|d| T::widen(d).into_owned(), T::to_f32)
    }

    pub(crate) fn write_f32(&self, values: &[f32]) -> Result<()> {
        self.scatter(values, T::narrow, T::from_f32)
    }

    fn write_raw(&self, values: &[T]) -> Result<()> {
        self.scatter(values, |s, d| d.copy_from_slice(s), |v| v)
    }
}

fn check_dtype<T: Element>(dim: &TensorDim) -> Result<()> {
    if dim.data_type() != T::DTYPE {
        return Err(TesseraError::DTypeMismatch {
            expected: T::DTYPE,
            got: dim.data_type(),
        });
    }
    Ok(())
}

fn ragged() -> TesseraError {
    TesseraError::InvalidArgument("nested data is ragged".into())
}

impl<T: Element> TensorBackend for DenseTensor<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_dyn(&self) -> &dyn TensorBackend {
        self
    }

    fn as_backend_mut(&mut self) -> &mut dyn TensorBackend {
        self
    }

    fn dim(&self) -> &TensorDim {
        &self.dim
    }

    fn strides(&self) -> [usize; MAXDIM] {
        self.strides
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn initializer(&self) -> Initializer {
        self.initializer
    }

    fn set_initializer(&mut self, init: Initializer) {
        self.initializer = init;
    }

    fn allocate(&mut self) -> Result<()> {
        if self.storage.is_allocated() {
            return Ok(());
        }
        if self.storage.is_view() {
            return Err(TesseraError::StorageError(format!(
                "view '{}' cannot allocate storage of its own",
                self.name
            )));
        }
        tracing::debug!("allocating '{}' {}", self.name, self.dim);
        self.storage = Storage::zeros(self.dim.len());
        let init = self.initializer;
        self.initialize(init, &mut rand::thread_rng())
    }

    fn deallocate(&mut self) {
        let views = self.storage.live_views();
        if views > 0 {
            tracing::warn!("deallocating '{}' with {} live view(s)", self.name, views);
        }
        self.storage = Storage::Unallocated;
    }

    fn is_allocated(&self) -> bool {
        self.storage.is_allocated()
    }

    fn is_view(&self) -> bool {
        self.storage.is_view()
    }

    fn get_value(&self, b: usize, c: usize, h: usize, w: usize) -> Result<f32> {
        self.check_bounds(b, c, h, w)?;
        let idx = self.get_index(b, c, h, w);
        self.storage.read(&self.name, |d| {
            d.get(idx).map(|v| v.to_f32()).ok_or_else(|| self.short_buffer(idx + 1, d.len()))
        })?
    }

    fn set_value(&mut self, value: f32) -> Result<()> {
        let v = T::from_f32(value);
        if self.is_contiguous() {
            let len = self.dim.len();
            return self.storage.write(&self.name, |d| {
                if d.len() < len {
                    return Err(self.short_buffer(len, d.len()));
                }
                d[..len].fill(v);
                Ok(())
            })?;
        }
        self.write_raw(&vec![v; self.dim.len()])
    }

    fn set_value_at(&mut self, b: usize, c: usize, h: usize, w: usize, value: f32) -> Result<()> {
        self.check_bounds(b, c, h, w)?;
        let idx = self.get_index(b, c, h, w);
        self.storage.write(&self.name, |d| match d.get_mut(idx) {
            Some(slot) => {
                *slot = T::from_f32(value);
                Ok(())
            }
            None => Err(self.short_buffer(idx + 1, d.len())),
        })?
    }

    fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.read_f32()
    }

    fn copy_from_f32(&mut self, values: &[f32]) -> Result<()> {
        self.write_f32(values)
    }

    fn copy_from(&mut self, src: &dyn TensorBackend) -> Result<()> {
        let src = downcast::<Self>(src, T::DTYPE)?;
        if src.dim.len() != self.dim.len() {
            return Err(TesseraError::ShapeMismatch {
                expected: self.dim.dims().to_vec(),
                got: src.dim.dims().to_vec(),
            });
        }
        let values = src.to_vec()?;
        self.write_raw(&values)
    }

    fn shared_data(
        &self,
        dim: TensorDim,
        offset: usize,
        reset_stride: bool,
        name: &str,
    ) -> Result<Box<dyn TensorBackend>> {
        if dim.tensor_type() != self.dim.tensor_type() {
            return Err(TesseraError::InvalidArgument(format!(
                "view of '{}' must keep its type {:?}, got {:?}",
                self.name,
                self.dim.tensor_type(),
                dim.tensor_type()
            )));
        }
        let strides = if reset_stride {
            dim.canonical_strides()
        } else {
            self.strides
        };
        let span = if dim.is_empty() {
            0
        } else {
            TensorDim::offset_of(dim.dims().map(|d| d - 1), strides) + 1
        };
        let available = self.storage.available();
        if offset + span > available {
            return Err(TesseraError::InvalidArgument(format!(
                "view {} at offset {offset} exceeds the {available} elements of '{}'",
                dim, self.name
            )));
        }
        let storage = self.storage.share(offset, &self.name)?;
        tracing::trace!("view '{}' of '{}' at offset {}", name, self.name, offset);
        Ok(Box::new(Self {
            dim,
            strides,
            name: name.to_string(),
            initializer: Initializer::None,
            storage,
        }))
    }

    fn dot(
        &self,
        m: &dyn TensorBackend,
        out: &mut dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<()> {
        let m = downcast::<Self>(m, T::DTYPE)?;
        let out = downcast_mut::<Self>(out, T::DTYPE)?;
        self.dot_into(m, out, trans, trans_m, beta)
    }

    fn dot_batched(
        &self,
        m: &dyn TensorBackend,
        out: &mut dyn TensorBackend,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<()> {
        let m = downcast::<Self>(m, T::DTYPE)?;
        let out = downcast_mut::<Self>(out, T::DTYPE)?;
        self.dot_batched_into(m, out, trans, trans_m, beta)
    }

    fn add_i(&mut self, other: &dyn TensorBackend, alpha: f32) -> Result<()> {
        let other = downcast::<Self>(other, T::DTYPE)?;
        self.add_scaled(other, alpha)
    }

    fn sum(&self, axes: &[usize], out: &mut dyn TensorBackend, alpha: f32, beta: f32) -> Result<()> {
        let out = downcast_mut::<Self>(out, T::DTYPE)?;
        self.sum_into(axes, out, alpha, beta)
    }

    fn data_eq(&self, other: &dyn TensorBackend) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return false;
        };
        if self.dim != other.dim || self.strides != other.strides {
            return false;
        }
        match (self.is_allocated(), other.is_allocated()) {
            (false, false) => true,
            (true, true) => match (self.to_vec(), other.to_vec()) {
                (Ok(a), Ok(b)) => {
                    bytemuck::cast_slice::<T, u8>(&a) == bytemuck::cast_slice::<T, u8>(&b)
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl<T: Element> fmt::Debug for DenseTensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenseTensor")
            .field("name", &self.name)
            .field("dim", &self.dim)
            .field("strides", &self.strides)
            .field("allocated", &self.is_allocated())
            .field("view", &self.is_view())
            .finish()
    }
}

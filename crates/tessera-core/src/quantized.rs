//! Symmetric per-channel integer weights.
//!
//! `QInt8` stores one signed byte per element; `QInt4` packs two signed
//! nibbles per byte, low nibble first. Each slice along the quantization
//! axis carries one f32 scale, and a stored code `q` decodes to `q · scale`.

use std::any::Any;
use std::fmt;

use crate::backend::{downcast, TensorBackend};
use crate::dtype::DataType;
use crate::error::TesseraError;
use crate::init::Initializer;
use crate::shape::{TensorDim, MAXDIM};
use crate::storage::Storage;
use crate::Result;

/// Storage-only backend for quantized dtypes. Arithmetic is rejected with
/// [`TesseraError::UnsupportedDType`]; values are read by dequantizing into a
/// float backend.
pub struct QuantizedTensor {
    dim: TensorDim,
    name: String,
    initializer: Initializer,
    axis: usize,
    scales: Vec<f32>,
    codes: Storage<u8>,
}

impl QuantizedTensor {
    /// Unallocated quantized backend; scales live along `axis`.
    pub fn new(dim: TensorDim, axis: usize, init: Initializer, name: &str) -> Result<Self> {
        if !dim.data_type().is_quantized() {
            return Err(TesseraError::InvalidConfig(format!(
                "{} is not a quantized dtype",
                dim.data_type()
            )));
        }
        let channels = dim.dim(axis)?;
        Ok(Self {
            dim,
            name: name.to_string(),
            initializer: init,
            axis,
            scales: vec![1.0; channels],
            codes: Storage::Unallocated,
        })
    }

    /// Quantize `values` (memory order) with symmetric absmax scaling per
    /// slice of `axis`.
    pub fn from_f32(dim: TensorDim, axis: usize, values: &[f32], name: &str) -> Result<Self> {
        let mut t = Self::new(dim, axis, Initializer::None, name)?;
        t.codes = Storage::zeros(t.dim.bytes());
        t.copy_from_f32(values)?;
        Ok(t)
    }

    /// Axis the scales are defined along.
    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    fn qmax(&self) -> f32 {
        match self.dim.data_type() {
            DataType::QInt4 => 7.0,
            _ => 127.0,
        }
    }

    fn channel_of(&self) -> impl Iterator<Item = usize> + '_ {
        self.dim.coords().map(move |c| c[self.axis])
    }

    fn decode(&self, bytes: &[u8], i: usize) -> i8 {
        match self.dim.data_type() {
            DataType::QInt4 => {
                let byte = bytes[i / 2];
                let nibble = if i % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                ((nibble << 4) as i8) >> 4
            }
            _ => bytes[i] as i8,
        }
    }

    fn encode(&self, bytes: &mut [u8], i: usize, q: i8) {
        match self.dim.data_type() {
            DataType::QInt4 => {
                let nibble = (q as u8) & 0x0f;
                let byte = &mut bytes[i / 2];
                *byte = if i % 2 == 0 {
                    (*byte & 0xf0) | nibble
                } else {
                    (*byte & 0x0f) | (nibble << 4)
                };
            }
            _ => bytes[i] = q as u8,
        }
    }

    fn check_len(&self, bytes: &[u8]) -> Result<()> {
        let need = self.dim.bytes();
        if bytes.len() < need {
            return Err(TesseraError::StorageError(format!(
                "'{}' needs {need} bytes but its buffer holds {}",
                self.name,
                bytes.len()
            )));
        }
        Ok(())
    }
}

impl TensorBackend for QuantizedTensor {
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
        self.dim.canonical_strides()
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
        if self.codes.is_allocated() {
            return Ok(());
        }
        tracing::debug!("allocating quantized '{}' {}", self.name, self.dim);
        self.codes = Storage::zeros(self.dim.bytes());
        let init = self.initializer;
        self.initialize(init, &mut rand::thread_rng())
    }

    fn deallocate(&mut self) {
        self.codes = Storage::Unallocated;
    }

    fn is_allocated(&self) -> bool {
        self.codes.is_allocated()
    }

    fn is_view(&self) -> bool {
        false
    }

    fn get_value(&self, b: usize, c: usize, h: usize, w: usize) -> Result<f32> {
        self.check_bounds(b, c, h, w)?;
        let idx = self.get_index(b, c, h, w);
        let scale = self.scales[[b, c, h, w][self.axis]];
        self.codes.read(&self.name, |bytes| {
            self.check_len(bytes)?;
            Ok(self.decode(bytes, idx) as f32 * scale)
        })?
    }

    fn set_value(&mut self, value: f32) -> Result<()> {
        let values = vec![value; self.dim.len()];
        self.copy_from_f32(&values)
    }

    /// Requantizes the whole tensor around the new element.
    fn set_value_at(&mut self, b: usize, c: usize, h: usize, w: usize, value: f32) -> Result<()> {
        self.check_bounds(b, c, h, w)?;
        let mut values = self.to_f32_vec()?;
        values[self.get_index(b, c, h, w)] = value;
        self.copy_from_f32(&values)
    }

    fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.codes.read(&self.name, |bytes| {
            self.check_len(bytes)?;
            Ok(self
                .channel_of()
                .enumerate()
                .map(|(i, ch)| self.decode(bytes, i) as f32 * self.scales[ch])
                .collect())
        })?
    }

    fn copy_from_f32(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.dim.len() {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![self.dim.len()],
                got: vec![values.len()],
            });
        }
        let qmax = self.qmax();
        let mut absmax = vec![0.0f32; self.scales.len()];
        for (v, ch) in values.iter().zip(self.channel_of()) {
            absmax[ch] = absmax[ch].max(v.abs());
        }
        let scales: Vec<f32> = absmax
            .iter()
            .map(|&m| if m > 0.0 { m / qmax } else { 1.0 })
            .collect();

        let channels: Vec<usize> = self.channel_of().collect();
        self.codes.write(&self.name, |bytes| {
            self.check_len(bytes)?;
            for (i, (v, ch)) in values.iter().zip(channels).enumerate() {
                let q = (v / scales[ch]).round().clamp(-qmax, qmax) as i8;
                self.encode(bytes, i, q);
            }
            Ok::<(), TesseraError>(())
        })??;
        self.scales = scales;
        Ok(())
    }

    fn copy_from(&mut self, src: &dyn TensorBackend) -> Result<()> {
        let src = downcast::<Self>(src, self.dim.data_type())?;
        if src.dim != self.dim || src.axis != self.axis {
            return Err(TesseraError::ShapeMismatch {
                expected: self.dim.dims().to_vec(),
                got: src.dim.dims().to_vec(),
            });
        }
        let bytes = src.codes.read(&src.name, |b| b.to_vec())?;
        self.codes.write(&self.name, |dst| {
            let n = dst.len().min(bytes.len());
            dst[..n].copy_from_slice(&bytes[..n]);
        })?;
        self.scales = src.scales.clone();
        Ok(())
    }

    fn shared_data(
        &self,
        _dim: TensorDim,
        _offset: usize,
        _reset_stride: bool,
        _name: &str,
    ) -> Result<Box<dyn TensorBackend>> {
        Err(TesseraError::UnsupportedDType(self.dim.data_type()))
    }

    fn dot(
        &self,
        _m: &dyn TensorBackend,
        _out: &mut dyn TensorBackend,
        _trans: bool,
        _trans_m: bool,
        _beta: f32,
    ) -> Result<()> {
        Err(TesseraError::UnsupportedDType(self.dim.data_type()))
    }

    fn dot_batched(
        &self,
        _m: &dyn TensorBackend,
        _out: &mut dyn TensorBackend,
        _trans: bool,
        _trans_m: bool,
        _beta: f32,
    ) -> Result<()> {
        Err(TesseraError::UnsupportedDType(self.dim.data_type()))
    }

    fn add_i(&mut self, _other: &dyn TensorBackend, _alpha: f32) -> Result<()> {
        Err(TesseraError::UnsupportedDType(self.dim.data_type()))
    }

    fn sum(&self, _axes: &[usize], _out: &mut dyn TensorBackend, _alpha: f32, _beta: f32) -> Result<()> {
        Err(TesseraError::UnsupportedDType(self.dim.data_type()))
    }

    fn dequantize(&self, out: &mut dyn TensorBackend, axis: usize) -> Result<()> {
        if axis != self.axis {
            return Err(TesseraError::InvalidArgument(format!(
                "'{}' is quantized along axis {}, not {axis}",
                self.name, self.axis
            )));
        }
        if !out.data_type().is_float() {
            return Err(TesseraError::UnsupportedDType(out.data_type()));
        }
        if out.dim().dims() != self.dim.dims() || out.dim().format() != self.dim.format() {
            return Err(TesseraError::ShapeMismatch {
                expected: self.dim.dims().to_vec(),
                got: out.dim().dims().to_vec(),
            });
        }
        let values = self.to_f32_vec()?;
        out.copy_from_f32(&values)
    }

    fn data_eq(&self, other: &dyn TensorBackend) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return false;
        };
        if self.dim != other.dim || self.axis != other.axis {
            return false;
        }
        let scales_eq = bytemuck::cast_slice::<f32, u8>(&self.scales)
            == bytemuck::cast_slice::<f32, u8>(&other.scales);
        match (self.is_allocated(), other.is_allocated()) {
            (false, false) => true,
            (true, true) => {
                let a = self.codes.read(&self.name, |b| b.to_vec());
                let b = other.codes.read(&other.name, |b| b.to_vec());
                matches!((a, b), (Ok(a), Ok(b)) if a == b) && scales_eq
            }
            _ => false,
        }
    }
}

impl fmt::Debug for QuantizedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantizedTensor")
            .field("name", &self.name)
            .field("dim", &self.dim)
            .field("axis", &self.axis)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

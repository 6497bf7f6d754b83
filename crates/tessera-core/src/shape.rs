use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dtype::{DataType, Format, TensorType};
use crate::error::TesseraError;
use crate::Result;

/// Number of logical axes: batch, channel, height, width.
pub const MAXDIM: usize = 4;

/// Four-axis tensor dimension (batch, channel, height, width) with its
/// layout and element type.
///
/// Axes are always addressed in logical order (b=0, c=1, h=2, w=3); the
/// layout tag only decides how they are laid out in memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDim {
    dims: [usize; MAXDIM],
    t_type: TensorType,
}

impl TensorDim {
    /// NCHW / fp32 dimension.
    pub fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self {
        Self::with_type(batch, channel, height, width, TensorType::default())
    }

    pub fn with_type(batch: usize, channel: usize, height: usize, width: usize, t_type: TensorType) -> Self {
        Self {
            dims: [batch, channel, height, width],
            t_type,
        }
    }

    pub fn from_dims(dims: [usize; MAXDIM], t_type: TensorType) -> Self {
        Self { dims, t_type }
    }

    pub fn batch(&self) -> usize {
        self.dims[0]
    }

    pub fn channel(&self) -> usize {
        self.dims[1]
    }

    pub fn height(&self) -> usize {
        self.dims[2]
    }

    pub fn width(&self) -> usize {
        self.dims[3]
    }

    pub fn set_batch(&mut self, v: usize) {
        self.dims[0] = v;
    }

    pub fn set_channel(&mut self, v: usize) {
        self.dims[1] = v;
    }

    pub fn set_height(&mut self, v: usize) {
        self.dims[2] = v;
    }

    pub fn set_width(&mut self, v: usize) {
        self.dims[3] = v;
    }

    /// Extents in logical order.
    pub fn dims(&self) -> [usize; MAXDIM] {
        self.dims
    }

    /// Extent of a single axis.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.dims.get(axis).copied().ok_or(TesseraError::InvalidAxis {
            axis,
            ndim: MAXDIM,
        })
    }

    pub fn set_dim(&mut self, axis: usize, value: usize) -> Result<()> {
        let slot = self.dims.get_mut(axis).ok_or(TesseraError::InvalidAxis {
            axis,
            ndim: MAXDIM,
        })?;
        *slot = value;
        Ok(())
    }

    pub fn tensor_type(&self) -> TensorType {
        self.t_type
    }

    pub fn set_tensor_type(&mut self, t_type: TensorType) {
        self.t_type = t_type;
    }

    pub fn format(&self) -> Format {
        self.t_type.format
    }

    pub fn data_type(&self) -> DataType {
        self.t_type.data_type
    }

    pub fn set_data_type(&mut self, data_type: DataType) {
        self.t_type.data_type = data_type;
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes needed to hold every element in this dimension's dtype.
    pub fn bytes(&self) -> usize {
        self.data_type().storage_bytes(self.len())
    }

    /// Dense strides for this layout, reported in logical axis order.
    pub fn canonical_strides(&self) -> [usize; MAXDIM] {
        let mut strides = [0usize; MAXDIM];
        let mut stride = 1;
        for &axis in self.format().memory_order().iter().rev() {
            strides[axis] = stride;
            stride *= self.dims[axis];
        }
        strides
    }

    /// Linear offset of `(b, c, h, w)` under dense strides.
    pub fn index(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        let s = self.canonical_strides();
        b * s[0] + c * s[1] + h * s[2] + w * s[3]
    }

    /// Logical coordinates of every element, in this layout's memory order.
    pub fn coords(&self) -> impl Iterator<Item = [usize; MAXDIM]> {
        let dims = self.dims;
        let order = self.format().memory_order();
        (0..self.len()).map(move |mut i| {
            let mut coord = [0usize; MAXDIM];
            for &axis in order.iter().rev() {
                coord[axis] = i % dims[axis];
                i /= dims[axis];
            }
            coord
        })
    }

    /// Physical offset of `coord` under `strides`.
    pub fn offset_of(coord: [usize; MAXDIM], strides: [usize; MAXDIM]) -> usize {
        coord.iter().zip(strides.iter()).map(|(c, s)| c * s).sum()
    }

    /// Two-dimensional view used by contractions: the unit axis becomes the
    /// columns and every other axis is folded into the rows.
    pub fn matrix_dims(&self) -> (usize, usize) {
        let unit = self.format().unit_axis();
        let cols = self.dims[unit];
        let rows = (0..MAXDIM).filter(|&a| a != unit).map(|a| self.dims[a]).product();
        (rows, cols)
    }

    /// Matrix view per batch entry: `(batch, rows, cols)`.
    pub fn batched_matrix_dims(&self) -> (usize, usize, usize) {
        let unit = self.format().unit_axis();
        let cols = self.dims[unit];
        let rows = (1..MAXDIM).filter(|&a| a != unit).map(|a| self.dims[a]).product();
        (self.dims[0], rows, cols)
    }

    /// This dimension with every axis in `axes` collapsed to 1.
    pub fn reduced(&self, axes: &[usize]) -> Result<TensorDim> {
        let mut out = *self;
        for &axis in axes {
            out.set_dim(axis, 1)?;
        }
        Ok(out)
    }

    /// Whether `np1` and `np2` are adjacent in memory (`np2` directly inside `np1`).
    pub fn check_continuous(&self, np1: usize, np2: usize) -> Result<bool> {
        for axis in [np1, np2] {
            if axis >= MAXDIM {
                return Err(TesseraError::InvalidAxis { axis, ndim: MAXDIM });
            }
        }
        let order = self.format().memory_order();
        let position = |axis: usize| order.iter().position(|&a| a == axis).unwrap_or(MAXDIM);
        Ok(position(np2) == position(np1) + 1)
    }

    /// Validate and sort an axis list for reductions.
    pub fn normalize_axes(&self, axes: &[usize]) -> Result<SmallVec<[usize; MAXDIM]>> {
        let mut out: SmallVec<[usize; MAXDIM]> = SmallVec::new();
        for &axis in axes {
            if axis >= MAXDIM {
                return Err(TesseraError::InvalidAxis { axis, ndim: MAXDIM });
            }
            if !out.contains(&axis) {
                out.push(axis);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

impl Default for TensorDim {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

impl fmt::Debug for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorDim({:?}, {}, {})", self.dims, self.format(), self.data_type())
    }
}

impl fmt::Display for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "] {} {}", self.format(), self.data_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nhwc(b: usize, c: usize, h: usize, w: usize) -> TensorDim {
        TensorDim::with_type(b, c, h, w, TensorType::new(Format::Nhwc, DataType::Fp32))
    }

    #[test]
    fn test_basic_dim() {
        let d = TensorDim::new(2, 3, 4, 5);
        assert_eq!(d.len(), 120);
        assert_eq!(d.bytes(), 480);
        assert_eq!(d.dim(2).unwrap(), 4);
        assert!(d.dim(4).is_err());
        assert!(TensorDim::default().is_empty());
    }

    #[test]
    fn test_canonical_strides() {
        assert_eq!(TensorDim::new(2, 3, 4, 5).canonical_strides(), [60, 20, 5, 1]);
        // NHWC: channel is unit-stride, width next, then height
        assert_eq!(nhwc(2, 3, 4, 5).canonical_strides(), [60, 1, 15, 3]);
    }

    #[test]
    fn test_index() {
        let d = TensorDim::new(2, 3, 4, 5);
        assert_eq!(d.index(1, 2, 3, 4), 119);
        let n = nhwc(2, 3, 4, 5);
        assert_eq!(n.index(0, 1, 0, 0), 1);
        assert_eq!(n.index(0, 0, 0, 1), 3);
        assert_eq!(n.index(1, 2, 3, 4), 60 + 2 + 45 + 12);
    }

    #[test]
    fn test_coords_follow_memory_order() {
        let n = nhwc(1, 2, 1, 2);
        let coords: Vec<_> = n.coords().collect();
        assert_eq!(coords, vec![[0, 0, 0, 0], [0, 1, 0, 0], [0, 0, 0, 1], [0, 1, 0, 1]]);
        for (i, c) in n.coords().enumerate() {
            assert_eq!(TensorDim::offset_of(c, n.canonical_strides()), i);
        }
        assert_eq!(TensorDim::default().coords().count(), 0);
    }

    #[test]
    fn test_check_continuous() {
        let d = TensorDim::new(2, 3, 4, 5);
        assert!(d.check_continuous(2, 3).unwrap());
        assert!(d.check_continuous(0, 1).unwrap());
        assert!(!d.check_continuous(1, 3).unwrap());

        let n = nhwc(2, 3, 4, 5);
        assert!(n.check_continuous(3, 1).unwrap());
        assert!(n.check_continuous(2, 3).unwrap());
        assert!(n.check_continuous(0, 2).unwrap());
        assert!(!n.check_continuous(2, 1).unwrap());

        assert!(matches!(d.check_continuous(0, 4), Err(TesseraError::InvalidAxis { axis: 4, .. })));
    }

    #[test]
    fn test_matrix_dims() {
        assert_eq!(TensorDim::new(2, 1, 3, 4).matrix_dims(), (6, 4));
        assert_eq!(nhwc(2, 4, 3, 5).matrix_dims(), (30, 4));
        assert_eq!(TensorDim::new(2, 1, 3, 4).batched_matrix_dims(), (2, 3, 4));
        assert_eq!(nhwc(2, 4, 3, 5).batched_matrix_dims(), (2, 15, 4));
    }

    #[test]
    fn test_reduced_and_axes() {
        let d = TensorDim::new(2, 3, 4, 5);
        assert_eq!(d.reduced(&[0, 1, 2]).unwrap().dims(), [1, 1, 1, 5]);
        assert_eq!(d.normalize_axes(&[2, 0, 2]).unwrap().as_slice(), &[0, 2]);
        assert!(d.normalize_axes(&[7]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", TensorDim::new(1, 2, 3, 4)), "[1, 2, 3, 4] NCHW fp32");
    }
}

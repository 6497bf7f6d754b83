//! In-place broadcast accumulation.

use rayon::prelude::*;

use crate::dense::{DenseTensor, Element};
use crate::error::TesseraError;
use crate::ops::PAR_THRESHOLD;
use crate::shape::MAXDIM;
use crate::Result;

impl<T: Element> DenseTensor<T> {
    /// `self += alpha · other`. Every axis of `other` must equal the
    /// matching axis of `self` or be 1.
    pub fn add_scaled(&mut self, other: &Self, alpha: f32) -> Result<()> {
        let dims = self.dim.dims();
        let other_dims = other.dim.dims();
        if dims.iter().zip(other_dims.iter()).any(|(d, o)| o != d && *o != 1) {
            return Err(TesseraError::BroadcastError {
                a: dims.to_vec(),
                b: other_dims.to_vec(),
            });
        }

        let src = other.read_f32()?;
        let mut dst = self.read_f32()?;

        if dims == other_dims && self.dim.format() == other.dim.format() {
            if dst.len() >= PAR_THRESHOLD {
                dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, s)| *d += alpha * s);
            } else {
                dst.iter_mut().zip(&src).for_each(|(d, s)| *d += alpha * s);
            }
        } else {
            let other_strides = other.dim.canonical_strides();
            for (d, coord) in dst.iter_mut().zip(self.dim.coords()) {
                let mut idx = 0;
                for axis in 0..MAXDIM {
                    if other_dims[axis] != 1 {
                        idx += coord[axis] * other_strides[axis];
                    }
                }
                *d += alpha * src[idx];
            }
        }

        self.write_f32(&dst)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::TensorBackend;
    use crate::dense::FloatTensor;
    use crate::dtype::{DataType, Format, TensorType};
    use crate::shape::TensorDim;

    use super::*;

    fn tensor(dim: TensorDim, data: &[f32]) -> FloatTensor {
        FloatTensor::from_vec(dim, data.to_vec()).unwrap()
    }

    #[test]
    fn test_add_same_shape() {
        let mut a = tensor(TensorDim::new(1, 1, 1, 3), &[1., 2., 3.]);
        let b = tensor(TensorDim::new(1, 1, 1, 3), &[10., 20., 30.]);
        a.add_scaled(&b, 0.5).unwrap();
        assert_eq!(a.to_f32_vec().unwrap(), vec![6., 12., 18.]);
    }

    #[test]
    fn test_add_broadcast_bias_rows() {
        let mut a = tensor(TensorDim::new(2, 1, 2, 2), &[0.; 8]);
        let bias = tensor(TensorDim::new(1, 1, 1, 2), &[1., 2.]);
        a.add_scaled(&bias, 1.0).unwrap();
        assert_eq!(a.to_f32_vec().unwrap(), vec![1., 2., 1., 2., 1., 2., 1., 2.]);
    }

    #[test]
    fn test_add_broadcast_nhwc_channel_bias() {
        let t = TensorType::new(Format::Nhwc, DataType::Fp32);
        let mut a = tensor(TensorDim::with_type(1, 3, 1, 2, t), &[0.; 6]);
        let bias = tensor(TensorDim::with_type(1, 3, 1, 1, t), &[1., 2., 3.]);
        a.add_scaled(&bias, 1.0).unwrap();
        assert_eq!(a.to_f32_vec().unwrap(), vec![1., 2., 3., 1., 2., 3.]);
    }

    #[test]
    fn test_add_rejects_incompatible() {
        let mut a = tensor(TensorDim::new(1, 1, 2, 2), &[0.; 4]);
        let b = tensor(TensorDim::new(1, 1, 1, 3), &[0.; 3]);
        assert!(matches!(a.add_scaled(&b, 1.0), Err(TesseraError::BroadcastError { .. })));
    }

    #[test]
    fn test_add_large_parallel() {
        let n = PAR_THRESHOLD * 2;
        let mut a = tensor(TensorDim::new(1, 1, 1, n), &vec![1.0; n]);
        let b = tensor(TensorDim::new(1, 1, 1, n), &vec![2.0; n]);
        a.add_scaled(&b, -1.0).unwrap();
        assert!(a.to_f32_vec().unwrap().iter().all(|&v| v == -1.0));
    }
}

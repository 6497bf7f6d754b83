//! Axis reductions.

use rayon::prelude::*;

use crate::dense::{DenseTensor, Element};
use crate::error::TesseraError;
use crate::ops::PAR_THRESHOLD;
use crate::Result;

impl<T: Element> DenseTensor<T> {
    /// `out = alpha · Σ_axes self + beta · out`, where `out` has every
    /// reduced axis collapsed to 1. With `beta == 0` the previous contents
    /// of `out` are ignored.
    pub fn sum_into(&self, axes: &[usize], out: &mut Self, alpha: f32, beta: f32) -> Result<()> {
        let axes = self.dim.normalize_axes(axes)?;
        let expected = self.dim.reduced(&axes)?;
        if out.dim.dims() != expected.dims() {
            return Err(TesseraError::ShapeMismatch {
                expected: expected.dims().to_vec(),
                got: out.dim.dims().to_vec(),
            });
        }

        let src = self.read_f32()?;
        let mut acc = if expected.len() == 1 {
            let total: f32 = if src.len() >= PAR_THRESHOLD {
                src.par_iter().sum()
            } else {
                src.iter().sum()
            };
            vec![total]
        } else {
            let out_strides = out.dim.canonical_strides();
            let mut acc = vec![0.0f32; expected.len()];
            for (v, mut coord) in src.iter().zip(self.dim.coords()) {
                for &axis in axes.iter() {
                    coord[axis] = 0;
                }
                let idx: usize = coord.iter().zip(out_strides.iter()).map(|(c, s)| c * s).sum();
                acc[idx] += v;
            }
            acc
        };

        if beta != 0.0 {
            let prev = out.read_f32()?;
            for (a, p) in acc.iter_mut().zip(prev) {
                *a = alpha * *a + beta * p;
            }
        } else if alpha != 1.0 {
            acc.iter_mut().for_each(|a| *a *= alpha);
        }
        out.write_f32(&acc)
    }
}

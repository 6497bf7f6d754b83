//! Matrix products over the unit-axis matrix view.

use tessera_kernels::sgemm;

use crate::dense::{DenseTensor, Element};
use crate::error::TesseraError;
use crate::Result;

/// Resolve `op(a)` `[m, k1]` and `op(b)` `[k2, n]` and check the inner extents.
fn gemm_dims(
    (r1, c1): (usize, usize),
    (r2, c2): (usize, usize),
    trans: bool,
    trans_m: bool,
) -> Result<(usize, usize, usize)> {
    let (m, k1) = if trans { (c1, r1) } else { (r1, c1) };
    let (k2, n) = if trans_m { (c2, r2) } else { (r2, c2) };
    if k1 != k2 {
        return Err(TesseraError::MatmulDimMismatch { m, k1, k2, n });
    }
    Ok((m, k1, n))
}

impl<T: Element> DenseTensor<T> {
    /// `out = op(self) · op(m) + beta · out`.
    ///
    /// Rows of the matrix view fold every non-unit axis, so a
    /// `[b, 1, h, in]` input against an `[1, 1, in, out]` weight contracts
    /// all `b·h` rows at once.
    pub fn dot_into(&self, m: &Self, out: &mut Self, trans: bool, trans_m: bool, beta: f32) -> Result<()> {
        let (rows, k, cols) = gemm_dims(self.dim.matrix_dims(), m.dim.matrix_dims(), trans, trans_m)?;
        let out_dims = out.dim.matrix_dims();
        if out_dims != (rows, cols) {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![out_dims.0, out_dims.1],
            });
        }
        tracing::trace!("dot '{}' x '{}' -> '{}' [{}x{}x{}]", self.name, m.name, out.name, rows, k, cols);

        let a = self.read_f32()?;
        let b = m.read_f32()?;
        let mut c = if beta != 0.0 {
            out.read_f32()?
        } else {
            vec![0.0; rows * cols]
        };
        sgemm(trans, trans_m, rows, cols, k, 1.0, &a, &b, beta, &mut c)?;
        out.write_f32(&c)
    }

    /// Batched `dot_into`: entry `i` of `self` contracts with entry `i` of
    /// `m`, or with its only entry when `m` has batch 1.
    pub fn dot_batched_into(
        &self,
        m: &Self,
        out: &mut Self,
        trans: bool,
        trans_m: bool,
        beta: f32,
    ) -> Result<()> {
        let (batch, r1, c1) = self.dim.batched_matrix_dims();
        let (m_batch, r2, c2) = m.dim.batched_matrix_dims();
        if m_batch != batch && m_batch != 1 {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![batch],
                got: vec![m_batch],
            });
        }
        let (rows, k, cols) = gemm_dims((r1, c1), (r2, c2), trans, trans_m)?;
        let (out_batch, out_r, out_c) = out.dim.batched_matrix_dims();
        if (out_batch, out_r, out_c) != (batch, rows, cols) {
            return Err(TesseraError::ShapeMismatch {
                expected: vec![batch, rows, cols],
                got: vec![out_batch, out_r, out_c],
            });
        }

        let a = self.read_f32()?;
        let b = m.read_f32()?;
        let mut c = if beta != 0.0 {
            out.read_f32()?
        } else {
            vec![0.0; batch * rows * cols]
        };

        let (a_step, b_step, c_step) = (r1 * c1, if m_batch == 1 { 0 } else { r2 * c2 }, rows * cols);
        for i in 0..batch {
            let a_i = &a[i * a_step..(i + 1) * a_step];
            let b_i = &b[i * b_step..i * b_step + r2 * c2];
            let c_i = &mut c[i * c_step..(i + 1) * c_step];
            sgemm(trans, trans_m, rows, cols, k, 1.0, a_i, b_i, beta, c_i)?;
        }
        out.write_f32(&c)
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

    fn zeros(dim: TensorDim) -> FloatTensor {
        FloatTensor::from_vec(dim, vec![0.0; dim.len()]).unwrap()
    }

    #[test]
    fn test_dot_basic() {
        let a = tensor(TensorDim::new(1, 1, 2, 3), &[1., 2., 3., 4., 5., 6.]);
        let b = tensor(TensorDim::new(1, 1, 3, 2), &[7., 8., 9., 10., 11., 12.]);
        let mut c = zeros(TensorDim::new(1, 1, 2, 2));
        a.dot_into(&b, &mut c, false, false, 0.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![58., 64., 139., 154.]);

        // beta = 1 accumulates
        a.dot_into(&b, &mut c, false, false, 1.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![116., 128., 278., 308.]);
    }

    #[test]
    fn test_dot_transposed() {
        // aᵀ · a for a = [[1, 2], [3, 4]]
        let a = tensor(TensorDim::new(1, 1, 2, 2), &[1., 2., 3., 4.]);
        let mut c = zeros(TensorDim::new(1, 1, 2, 2));
        a.dot_into(&a, &mut c, true, false, 0.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![10., 14., 14., 20.]);
        a.dot_into(&a, &mut c, false, true, 0.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![5., 11., 11., 25.]);
    }

    #[test]
    fn test_dot_folds_batch_into_rows() {
        let x = tensor(TensorDim::new(2, 1, 1, 2), &[1., 2., 3., 4.]);
        let w = tensor(TensorDim::new(1, 1, 2, 1), &[1., 1.]);
        let mut y = zeros(TensorDim::new(2, 1, 1, 1));
        x.dot_into(&w, &mut y, false, false, 0.0).unwrap();
        assert_eq!(y.to_f32_vec().unwrap(), vec![3., 7.]);
    }

    #[test]
    fn test_dot_nhwc_uses_channel_as_columns() {
        let t = TensorType::new(Format::Nhwc, DataType::Fp32);
        // input: one row with two channels
        let x = tensor(TensorDim::with_type(1, 2, 1, 1, t), &[1., 2.]);
        // weight (1, unit=3, 1, in=2) is an [in, unit] matrix
        let w = tensor(TensorDim::with_type(1, 3, 1, 2, t), &[1., 0., 0., 1., 1., 1.]);
        assert_eq!(w.dim().matrix_dims(), (2, 3));
        let mut y = zeros(TensorDim::with_type(1, 3, 1, 1, t));
        x.dot_into(&w, &mut y, false, false, 0.0).unwrap();
        // w's memory is [w=0: c0..c2][w=1: c0..c2] = [[1,0,0],[1,1,1]]
        assert_eq!(y.to_f32_vec().unwrap(), vec![3., 2., 2.]);
    }

    #[test]
    fn test_dot_errors() {
        let a = zeros(TensorDim::new(1, 1, 2, 3));
        let b = zeros(TensorDim::new(1, 1, 2, 2));
        let mut c = zeros(TensorDim::new(1, 1, 2, 2));
        assert!(matches!(
            a.dot_into(&b, &mut c, false, false, 0.0),
            Err(TesseraError::MatmulDimMismatch { k1: 3, k2: 2, .. })
        ));
        let b = zeros(TensorDim::new(1, 1, 3, 2));
        let mut bad = zeros(TensorDim::new(1, 1, 3, 2));
        assert!(matches!(
            a.dot_into(&b, &mut bad, false, false, 0.0),
            Err(TesseraError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dot_batched_broadcasts_single_rhs() {
        let a = tensor(TensorDim::new(2, 1, 1, 2), &[1., 2., 3., 4.]);
        let b = tensor(TensorDim::new(1, 1, 2, 2), &[1., 0., 0., 2.]);
        let mut c = zeros(TensorDim::new(2, 1, 1, 2));
        a.dot_batched_into(&b, &mut c, false, false, 0.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![1., 4., 3., 8.]);

        let b3 = zeros(TensorDim::new(3, 1, 2, 2));
        assert!(a.dot_batched_into(&b3, &mut c, false, false, 0.0).is_err());
    }

    #[test]
    fn test_dot_batched_per_entry() {
        let a = tensor(TensorDim::new(2, 1, 1, 1), &[2., 3.]);
        let b = tensor(TensorDim::new(2, 1, 1, 2), &[1., 1., 10., 20.]);
        let mut c = zeros(TensorDim::new(2, 1, 1, 2));
        a.dot_batched_into(&b, &mut c, false, false, 0.0).unwrap();
        assert_eq!(c.to_f32_vec().unwrap(), vec![2., 2., 30., 60.]);
    }
}

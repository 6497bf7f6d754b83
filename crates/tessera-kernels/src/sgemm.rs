//! Single-precision GEMM with an AVX2/FMA column-strip kernel.
//!
//! Computes `C = alpha * op(A) * op(B) + beta * C` over row-major slices.
//! `op(A)` is packed row-major with `alpha` folded in, and `op(B)` is packed
//! row-major when transposed, so both kernels see plain `[m, k] · [k, n]`.
//! Large products are split into row panels on the rayon pool.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::simd::{GemmPath, SimdCapability};

/// Rows of `C` handed to one rayon task.
const PANEL_ROWS: usize = 32;
/// Depth of one pass over `B` in the scalar kernel.
const K_BLOCK: usize = 128;
/// f32 lanes in a 256-bit register.
const LANES: usize = 8;

/// Multiply-add count above which row panels run on the rayon pool.
const PAR_THRESHOLD: usize = 1 << 18;

/// Shape errors reported by the GEMM entry point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GemmError {
    #[error("operand {operand} holds {got} elements, expected {expected}")]
    OperandSize {
        operand: &'static str,
        expected: usize,
        got: usize,
    },
}

/// `c_rows += a_rows · b` for a panel of whole rows.
type PanelKernel = fn(a_rows: &[f32], b: &[f32], c_rows: &mut [f32], n: usize, k: usize);

/// General matrix multiply: `C = alpha * op(A) @ op(B) + beta * C`.
///
/// `op(A)` is `[m, k]` and `op(B)` is `[k, n]`. With `trans_a` the slice `a`
/// holds `A` stored as `[k, m]`; with `trans_b` the slice `b` holds `B`
/// stored as `[n, k]`. When `beta == 0` the previous contents of `c` are
/// ignored entirely (NaN in `c` does not leak into the result).
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) -> Result<(), GemmError> {
    check_len("a", m * k, a.len())?;
    check_len("b", k * n, b.len())?;
    check_len("c", m * n, c.len())?;

    if beta == 0.0 {
        c.fill(0.0);
    } else if beta != 1.0 {
        c.iter_mut().for_each(|v| *v *= beta);
    }
    if m == 0 || n == 0 || k == 0 || alpha == 0.0 {
        return Ok(());
    }

    let a = pack_a(a, trans_a, m, k, alpha);
    let b: Cow<'_, [f32]> = if trans_b {
        Cow::Owned(transpose(b, n, k))
    } else {
        Cow::Borrowed(b)
    };
    let (a, b) = (a.as_ref(), b.as_ref());

    let kernel: PanelKernel = match SimdCapability::detect().gemm_path() {
        GemmPath::Avx2Fma => panel_avx2,
        GemmPath::Scalar => panel_scalar,
    };

    if m * n * k >= PAR_THRESHOLD && m > PANEL_ROWS {
        c.par_chunks_mut(PANEL_ROWS * n)
            .zip(a.par_chunks(PANEL_ROWS * k))
            .for_each(|(c_rows, a_rows)| kernel(a_rows, b, c_rows, n, k));
    } else {
        kernel(a, b, c, n, k);
    }

    Ok(())
}

fn check_len(operand: &'static str, expected: usize, got: usize) -> Result<(), GemmError> {
    if expected != got {
        return Err(GemmError::OperandSize {
            operand,
            expected,
            got,
        });
    }
    Ok(())
}

/// Row-major `alpha · op(A)`, borrowed when no work is needed.
fn pack_a(a: &[f32], trans_a: bool, m: usize, k: usize, alpha: f32) -> Cow<'_, [f32]> {
    match (trans_a, alpha == 1.0) {
        (false, true) => Cow::Borrowed(a),
        (false, false) => Cow::Owned(a.iter().map(|v| alpha * v).collect()),
        (true, _) => {
            let mut packed = transpose(a, k, m);
            if alpha != 1.0 {
                packed.iter_mut().for_each(|v| *v *= alpha);
            }
            Cow::Owned(packed)
        }
    }
}

/// Row-major `[rows, cols]` → row-major `[cols, rows]`.
fn transpose(src: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut dst = vec![0.0f32; rows * cols];
    for (r, row) in src.chunks_exact(cols).enumerate() {
        for (c, &v) in row.iter().enumerate() {
            dst[c * rows + r] = v;
        }
    }
    dst
}

/// Row-at-a-time axpy: each `a[i, p]` scales row `p` of `B` into row `i` of `C`.
fn panel_scalar(a_rows: &[f32], b: &[f32], c_rows: &mut [f32], n: usize, k: usize) {
    for k0 in (0..k).step_by(K_BLOCK) {
        let k1 = (k0 + K_BLOCK).min(k);
        let b_block = &b[k0 * n..k1 * n];
        for (a_row, c_row) in a_rows.chunks_exact(k).zip(c_rows.chunks_exact_mut(n)) {
            for (&av, b_row) in a_row[k0..k1].iter().zip(b_block.chunks_exact(n)) {
                for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                    *cv += av * bv;
                }
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn panel_avx2(a_rows: &[f32], b: &[f32], c_rows: &mut [f32], n: usize, k: usize) {
    if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
        return panel_scalar(a_rows, b, c_rows, n, k);
    }
    // Safety: AVX2 and FMA were detected above.
    unsafe { panel_avx2_inner(a_rows, b, c_rows, n, k) }
}

/// Each 8-column strip of a row of `C` is accumulated over the full depth in
/// one register and written back once.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn panel_avx2_inner(a_rows: &[f32], b: &[f32], c_rows: &mut [f32], n: usize, k: usize) {
    use std::arch::x86_64::*;

    let strips = n / LANES;
    for (a_row, c_row) in a_rows.chunks_exact(k).zip(c_rows.chunks_exact_mut(n)) {
        for s in 0..strips {
            let j = s * LANES;
            let mut acc = _mm256_setzero_ps();
            for (p, &av) in a_row.iter().enumerate() {
                // in bounds: j + LANES <= n and p < k
                let bv = _mm256_loadu_ps(b.as_ptr().add(p * n + j));
                acc = _mm256_fmadd_ps(_mm256_set1_ps(av), bv, acc);
            }
            let c_ptr = c_row.as_mut_ptr().add(j);
            _mm256_storeu_ps(c_ptr, _mm256_add_ps(_mm256_loadu_ps(c_ptr), acc));
        }
        for j in strips * LANES..n {
            let dot: f32 = a_row.iter().enumerate().map(|(p, &av)| av * b[p * n + j]).sum();
            c_row[j] += dot;
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn panel_avx2(a_rows: &[f32], b: &[f32], c_rows: &mut [f32], n: usize, k: usize) {
    panel_scalar(a_rows, b, c_rows, n, k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    #[test]
    fn test_sgemm_basic() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = [0.0f32; 4];
        sgemm(false, false, 2, 2, 3, 1.0, &a, &b, 0.0, &mut c).unwrap();
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_sgemm_transposed_operands() {
        // A^T stored as [3, 2], B^T stored as [2, 3]
        let a_t = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b_t = [7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let mut c = [0.0f32; 4];
        sgemm(true, true, 2, 2, 3, 1.0, &a_t, &b_t, 0.0, &mut c).unwrap();
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_sgemm_beta_accumulates() {
        let a = [1.0, 0.0, 0.0, 1.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [1.0f32, 1.0, 1.0, 1.0];
        sgemm(false, false, 2, 2, 2, 1.0, &a, &b, 1.0, &mut c).unwrap();
        assert_eq!(c, [6.0, 7.0, 8.0, 9.0]);

        sgemm(false, false, 2, 2, 2, 2.0, &a, &b, 0.5, &mut c).unwrap();
        assert_eq!(c, [13.0, 15.5, 18.0, 20.5]);
    }

    #[test]
    fn test_sgemm_beta_zero_ignores_nan() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let mut c = [f32::NAN];
        sgemm(false, false, 1, 1, 2, 1.0, &a, &b, 0.0, &mut c).unwrap();
        assert_eq!(c, [11.0]);
    }

    #[test]
    fn test_sgemm_large_matches_naive() {
        // Sizes that exercise K blocking, strip tails and the parallel path
        let (m, k, n) = (130, 150, 97);
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 * 0.1).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 11) as f32 * 0.1).collect();
        let mut c = vec![0.0f32; m * n];
        sgemm(false, false, m, n, k, 1.0, &a, &b, 0.0, &mut c).unwrap();

        let reference = naive(&a, &b, m, n, k);
        for (i, (&f, &r)) in c.iter().zip(reference.iter()).enumerate() {
            assert!((f - r).abs() < 1e-3, "Mismatch at index {}: fast={}, ref={}", i, f, r);
        }
    }

    #[test]
    fn test_sgemm_alpha_with_transposed_a_and_ragged_width() {
        // n = 11 leaves a 3-column tail after one 8-wide strip
        let (m, k, n) = (3, 5, 11);
        let a: Vec<f32> = (0..m * k).map(|i| i as f32 * 0.5 - 2.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 9) as f32 - 4.0).collect();
        let a_t = transpose(&a, m, k);
        let mut c = vec![1.0f32; m * n];
        sgemm(true, false, m, n, k, -1.5, &a_t, &b, 2.0, &mut c).unwrap();

        let reference = naive(&a, &b, m, n, k);
        for (i, (&f, &r)) in c.iter().zip(reference.iter()).enumerate() {
            let want = -1.5 * r + 2.0;
            assert!((f - want).abs() < 1e-4, "Mismatch at index {}: got={}, want={}", i, f, want);
        }
    }

    #[test]
    fn test_sgemm_size_mismatch() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 2.0, 3.0];
        let mut c = [0.0f32; 2];
        let err = sgemm(false, false, 2, 1, 2, 1.0, &a, &b, 0.0, &mut c).unwrap_err();
        assert_eq!(
            err,
            GemmError::OperandSize { operand: "b", expected: 2, got: 3 }
        );
    }
}

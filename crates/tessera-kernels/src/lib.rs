//! # tessera-kernels
//!
//! CPU SIMD kernel dispatch for Tessera.
//!
//! Provides:
//! - Runtime SIMD capability detection (AVX2, AVX-512, NEON)
//! - Tiled single-precision GEMM with an AVX2/FMA inner loop

pub mod simd;
pub mod sgemm;

pub use sgemm::{sgemm, GemmError};
pub use simd::{GemmPath, SimdCapability, SimdTier};

//! Compute primitives of the dense backends: contractions, broadcast
//! accumulation and axis reductions.
//!
//! Every operation reads its operands into scratch buffers before writing
//! the destination, so a destination may alias one of its sources.

pub mod arithmetic;
pub mod blas;
pub mod reduction;

/// Element count above which elementwise loops and reductions go parallel.
pub(crate) const PAR_THRESHOLD: usize = 8192;

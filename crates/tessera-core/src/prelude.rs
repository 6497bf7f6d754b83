//! Convenience re-exports for common tessera-core types.
//!
//! ```rust
//! use tessera_core::prelude::*;
//! ```

pub use crate::DataType;
pub use crate::Format;
pub use crate::Initializer;
pub use crate::Result;
pub use crate::Tensor;
pub use crate::TensorDim;
pub use crate::TensorType;
pub use crate::TesseraError;

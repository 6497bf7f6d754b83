//! # tessera-core
//!
//! Multi-precision tensor core for Tessera.
//!
//! Provides:
//! - `TensorDim`: four-axis dimensions with NCHW / NHWC layouts
//! - Dense fp32 and fp16 backends sharing storage through non-owning views
//! - Per-channel QInt8 / QInt4 weight storage with dequantization
//! - The move-only `Tensor` facade routing every call to its backend

pub mod backend;
pub mod dense;
pub mod dtype;
pub mod error;
pub mod init;
pub mod ops;
pub mod prelude;
pub mod quantized;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use backend::TensorBackend;
#[cfg(feature = "fp16")]
pub use dense::HalfTensor;
pub use dense::{DenseTensor, Element, FloatTensor};
pub use dtype::{DataType, Format, TensorType};
pub use error::TesseraError;
pub use init::Initializer;
pub use quantized::QuantizedTensor;
pub use shape::{TensorDim, MAXDIM};
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, TesseraError>;

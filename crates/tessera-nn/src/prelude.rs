//! Convenience re-exports for common tessera-nn types.
//!
//! ```rust
//! use tessera_nn::prelude::*;
//! ```

pub use crate::{FullyConnectedConfig, FullyConnectedLayer, Layer};
pub use crate::{InitLayerContext, RunLayerContext};
pub use crate::{TensorLifespan, WeightRegularizer};

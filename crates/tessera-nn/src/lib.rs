//! # tessera-nn
//!
//! Trainable layers for Tessera.
//!
//! Layers hold only handles; an execution context owns every tensor. The
//! fully-connected layer supports an optional LoRA path that is folded into
//! the dense weight on each forward.

pub mod config;
pub mod context;
pub mod fc_layer;
pub mod layer;
pub mod prelude;
pub mod weight;

pub use config::FullyConnectedConfig;
pub use context::{InitLayerContext, RunLayerContext, TensorHandle, WeightHandle};
pub use fc_layer::{FullyConnectedLayer, LoraHandles};
pub use layer::Layer;
pub use weight::{TensorLifespan, Weight, WeightRegularizer};

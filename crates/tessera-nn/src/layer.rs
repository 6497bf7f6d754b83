use tessera_core::Result;

use crate::context::{InitLayerContext, RunLayerContext};

/// A layer driven by an external executor.
///
/// `finalize` runs once per topology change and is the only place a layer
/// decides shapes and requests storage. The remaining entry points are
/// called repeatedly and reach every tensor through the context.
pub trait Layer: Send + Sync {
    /// Short type name, e.g. `"fully_connected"`.
    fn layer_type(&self) -> &'static str;

    /// Infer output dimensions and request weights and scratch tensors.
    fn finalize(&mut self, ctx: &mut InitLayerContext) -> Result<()>;

    /// Compute outputs from inputs.
    fn forwarding(&self, ctx: &mut RunLayerContext, training: bool) -> Result<()>;

    /// Forward over the steps `[from, to)` of the height axis only.
    fn incremental_forwarding(&self, ctx: &mut RunLayerContext, from: usize, to: usize, training: bool) -> Result<()>;

    /// Outgoing derivative from the incoming one.
    fn calc_derivative(&self, ctx: &mut RunLayerContext) -> Result<()>;

    /// Parameter gradients; layers without weights keep the default.
    fn calc_gradient(&self, _ctx: &mut RunLayerContext) -> Result<()> {
        Ok(())
    }
}

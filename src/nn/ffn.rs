//! Position-wise feed-forward block.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module};

use super::dropout::{Dropout, ForwardContext};
use super::params::ParamStore;

/// `linear2(drop(gelu(linear1(drop(x)))))`, both linears `dim -> dim`.
///
/// Call sites add the residual themselves.
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        Ok(Self {
            linear1: store.linear(&format!("{}.linear1", prefix), dim, dim)?,
            linear2: store.linear(&format!("{}.linear2", prefix), dim, dim)?,
            dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        let h = self.linear1.forward(&self.dropout.forward(x, ctx)?)?;
        let h = h.gelu_erf()?;
        self.linear2.forward(&self.dropout.forward(&h, ctx)?)
    }
}

//! Self-attention among the particles of a set.

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module};

use super::params::ParamStore;

/// Scaled dot-product attention with independent query/key/value maps.
///
/// Input and output are `[batch, n, dim]`. No mask and no positions, so
/// permuting the particles permutes the output the same way.
#[derive(Debug, Clone)]
pub struct SetSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    scale: f64,
}

impl SetSelfAttention {
    pub fn build(store: &mut ParamStore, prefix: &str, dim: usize) -> crate::Result<Self> {
        Ok(Self {
            query: store.linear(&format!("{}.query", prefix), dim, dim)?,
            key: store.linear(&format!("{}.key", prefix), dim, dim)?,
            value: store.linear(&format!("{}.value", prefix), dim, dim)?,
            scale: 1.0 / (dim as f64).sqrt(),
        })
    }
}

impl Module for SetSelfAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;

        // [batch, n, n]
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        weights.matmul(&v)
    }
}

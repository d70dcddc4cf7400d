//! Layer normalization with epsilon inside the square root.

use candle_core::{Result, Tensor, D};
use candle_nn::Module;

use super::params::ParamStore;

/// Normalizes over the last axis, then applies a learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f64 = 1e-12;

    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Register `{prefix}.weight` (ones) and `{prefix}.bias` (zeros).
    pub fn build(store: &mut ParamStore, prefix: &str, dim: usize) -> crate::Result<Self> {
        let weight = store.ones(&format!("{}.weight", prefix), &[dim])?;
        let bias = store.zeros(&format!("{}.bias", prefix), &[dim])?;
        Ok(Self::new(weight, bias, Self::DEFAULT_EPS))
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

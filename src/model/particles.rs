//! Expansion of one embedding into a set of particles.

use candle_core::{Result, Tensor};

use crate::nn::ParamStore;

/// Adds `num_particles` learned offsets to a single vector.
#[derive(Debug, Clone)]
pub struct ParticleExpansion {
    /// `[1, num_particles, dim]`, zero-initialised
    offsets: Tensor,
}

impl ParticleExpansion {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        num_particles: usize,
        dim: usize,
    ) -> crate::Result<Self> {
        let offsets = store.zeros(&format!("{}.offsets", prefix), &[1, num_particles, dim])?;
        Ok(Self { offsets })
    }

    /// `[batch, dim]` to `[batch, num_particles, dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.unsqueeze(1)?.broadcast_add(&self.offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_expand_shape_and_values() {
        let mut store = ParamStore::new(0, &Device::Cpu);
        let expand = ParticleExpansion::build(&mut store, "to_particles", 2, 4).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();

        let p = expand.forward(&x).unwrap();
        assert_eq!(p.dims(), &[1, 2, 4]);
        let rows: Vec<Vec<f32>> = p.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rows[1], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dim_mismatch_is_error() {
        let mut store = ParamStore::new(0, &Device::Cpu);
        let expand = ParticleExpansion::build(&mut store, "to_particles", 2, 4).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        assert!(expand.forward(&x).is_err());
    }
}

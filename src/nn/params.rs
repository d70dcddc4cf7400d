//! Named parameter store.
//!
//! Every learnable tensor of a model is a [`Var`] registered here under a
//! flat dotted name (`projection.wz.weight`). Layers hold clones of the
//! Var's tensor, which share storage with the Var, so optimizer updates via
//! `Var::set` are seen by every layer without re-binding.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::Linear;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Q2PError, Result};

/// Ordered mapping from parameter name to learnable variable.
pub struct ParamStore {
    device: Device,
    params: IndexMap<String, Var>,
    /// Source for initial values, seeded so construction is reproducible
    rng: StdRng,
}

impl ParamStore {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            device: device.clone(),
            params: IndexMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Wrap `tensor` in a Var and register it; returns the tracked tensor.
    fn register(&mut self, name: &str, tensor: Tensor) -> Result<Tensor> {
        if self.params.contains_key(name) {
            return Err(Q2PError::Config(format!(
                "parameter {} registered twice",
                name
            )));
        }
        let var = Var::from_tensor(&tensor)?;
        let tracked = var.as_tensor().clone();
        self.params.insert(name.to_string(), var);
        Ok(tracked)
    }

    fn from_values(&self, values: Vec<f32>, shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::from_vec(values, shape, &self.device)?)
    }

    pub fn zeros(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let t = Tensor::zeros(shape, DType::F32, &self.device)?;
        self.register(name, t)
    }

    pub fn ones(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let t = Tensor::ones(shape, DType::F32, &self.device)?;
        self.register(name, t)
    }

    /// Normal(0, std) initialisation.
    pub fn normal(&mut self, name: &str, shape: &[usize], std: f32) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n)
            .map(|_| {
                let z: f32 = self.rng.sample(StandardNormal);
                z * std
            })
            .collect();
        let t = self.from_values(values, shape)?;
        self.register(name, t)
    }

    /// Uniform(-bound, bound) initialisation.
    pub fn uniform(&mut self, name: &str, shape: &[usize], bound: f32) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|_| self.rng.gen_range(-bound..=bound)).collect();
        let t = self.from_values(values, shape)?;
        self.register(name, t)
    }

    /// Affine layer `[out, in]` with bias, both Uniform(±1/sqrt(in)).
    ///
    /// Registers `{prefix}.weight` and `{prefix}.bias`.
    pub fn linear(&mut self, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Linear> {
        let bound = 1.0 / (in_dim as f32).sqrt();
        let weight = self.uniform(&format!("{}.weight", prefix), &[out_dim, in_dim], bound)?;
        let bias = self.uniform(&format!("{}.bias", prefix), &[out_dim], bound)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.params.get(name)
    }

    /// Parameter names in registration order.
    pub fn names(&self) -> Vec<&String> {
        self.params.keys().collect()
    }

    /// All variables, for handing to an optimizer.
    pub fn all_vars(&self) -> Vec<Var> {
        self.params.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.params.values().map(|v| v.elem_count()).sum()
    }

    /// Name and shape of every parameter, in registration order.
    pub fn shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.params
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect()
    }

    /// Create an AdamW optimizer over every parameter.
    pub fn create_adamw(&self, lr: f64, weight_decay: f64) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
        };
        Ok(AdamW::new(self.all_vars(), params)?)
    }

    /// Save every parameter to a safetensors file.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.params.is_empty() {
            return Err(Q2PError::Checkpoint("no parameters to save".into()));
        }
        let tensors: std::collections::HashMap<String, Tensor> = self
            .params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    /// Load parameter values from a safetensors file into the existing Vars.
    ///
    /// The file must contain exactly this store's names with identical
    /// shapes; nothing is written unless the whole file matches.
    pub fn load_safetensors(&self, path: impl AsRef<Path>) -> Result<usize> {
        let loaded = candle_core::safetensors::load(path.as_ref(), &self.device)?;

        for (name, var) in &self.params {
            let tensor = loaded
                .get(name)
                .ok_or_else(|| Q2PError::Checkpoint(format!("missing parameter {}", name)))?;
            if tensor.dims() != var.dims() {
                return Err(Q2PError::Checkpoint(format!(
                    "parameter {} has shape {:?} in checkpoint, model expects {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                )));
            }
        }
        if let Some(extra) = loaded.keys().find(|k| !self.params.contains_key(*k)) {
            return Err(Q2PError::Checkpoint(format!(
                "unexpected parameter {} in checkpoint",
                extra
            )));
        }

        for (name, var) in &self.params {
            let tensor = loaded[name].to_dtype(DType::F32)?;
            var.set(&tensor)?;
        }
        Ok(self.params.len())
    }
}

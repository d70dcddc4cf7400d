//! Inverted dropout with an explicit random source.

use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-forward-call state: whether dropout is active, and its RNG.
///
/// `eval()` disables dropout; `train(seed)` enables it with a seeded
/// generator, so two forward passes with the same seed drop the same units.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    rng: Option<StdRng>,
}

impl ForwardContext {
    pub fn eval() -> Self {
        Self { rng: None }
    }

    pub fn train(seed: u64) -> Self {
        Self {
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }
}

/// Zeroes each element with probability `p` and scales survivors by
/// `1 / (1 - p)`. Identity when the context is in eval mode.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn forward(&self, x: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        let rng = match ctx.rng.as_mut() {
            Some(rng) if self.p > 0.0 => rng,
            _ => return Ok(x.clone()),
        };
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { scale })
            .collect();
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?;
        x.mul(&mask)
    }
}

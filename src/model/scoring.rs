//! Decoding particles into entity scores, and the training loss.

use candle_core::{Tensor, D};

use crate::error::{Q2PError, Result};

/// Max over the particle axis: `[batch, n, E]` to `[batch, E]`.
///
/// An entity scores as high as its best-matching particle.
pub fn max_pool_particles(logits: &Tensor) -> candle_core::Result<Tensor> {
    logits.max(1)
}

/// Score every entity against every particle with the (tied) entity table
/// as decoder weight, then max-pool over particles.
///
/// `particles` is `[batch, n, dim]`, `entity_table` is `[E, dim]`.
pub fn score_particles(particles: &Tensor, entity_table: &Tensor) -> candle_core::Result<Tensor> {
    let logits = particles.broadcast_matmul(&entity_table.t()?.contiguous()?)?;
    max_pool_particles(&logits)
}

/// Cross-entropy against a smoothed one-hot target.
#[derive(Debug, Clone, Copy)]
pub struct LabelSmoothingLoss {
    smoothing: f32,
}

impl LabelSmoothingLoss {
    pub fn new(smoothing: f32) -> Self {
        Self { smoothing }
    }

    /// Target distribution `[batch, E]`: `1 - ε` on the gold entity and
    /// `ε / (E - 1)` elsewhere.
    fn target(&self, labels: &[usize], classes: usize, scores: &Tensor) -> Result<Tensor> {
        let (on, off) = if classes > 1 {
            (1.0 - self.smoothing, self.smoothing / (classes - 1) as f32)
        } else {
            (1.0, 0.0)
        };
        let mut target = vec![off; labels.len() * classes];
        for (row, &label) in labels.iter().enumerate() {
            target[row * classes + label] = on;
        }
        Ok(Tensor::from_vec(target, (labels.len(), classes), scores.device())?)
    }

    /// Scalar batch-mean loss for `scores` `[batch, E]`.
    pub fn forward(&self, scores: &Tensor, labels: &[usize]) -> Result<Tensor> {
        let (batch, classes) = scores.dims2()?;
        if labels.len() != batch {
            return Err(Q2PError::BatchMismatch {
                expected: batch,
                got: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= classes) {
            return Err(Q2PError::IdOutOfRange {
                kind: "label",
                id: label,
                limit: classes,
            });
        }

        let target = self.target(labels, classes, scores)?;
        let log_probs = candle_nn::ops::log_softmax(scores, D::Minus1)?;
        Ok((target * log_probs)?.sum(1)?.neg()?.mean_all()?)
    }
}

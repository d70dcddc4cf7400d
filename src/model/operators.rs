//! Learned logical operators over particle sets.
//!
//! Every operator maps `[batch, n, dim]` particle sets to particle sets of
//! the same `dim`. Projection and negation keep `n`; intersection and union
//! concatenate their operands, so their output holds the sum of the operand
//! particle counts.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module};

use crate::nn::{Dropout, FeedForward, ForwardContext, LayerNorm, ParamStore, SetSelfAttention};

/// Relational projection: a gated recurrent update of the particles with the
/// relation embedding as input, followed by attention among the particles.
#[derive(Debug, Clone)]
pub struct Projection {
    /// Shared with the model's relation table
    relation_embedding: Tensor,
    wz: Linear,
    uz: Linear,
    wr: Linear,
    ur: Linear,
    wh: Linear,
    uh: Linear,
    layer_norm_1: LayerNorm,
    layer_norm_2: LayerNorm,
    self_attn: SetSelfAttention,
    dropout: Dropout,
}

impl Projection {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        relation_embedding: Tensor,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        let mut linear = |name: &str| store.linear(&format!("{}.{}", prefix, name), dim, dim);
        let (wz, uz) = (linear("wz")?, linear("uz")?);
        let (wr, ur) = (linear("wr")?, linear("ur")?);
        let (wh, uh) = (linear("wh")?, linear("uh")?);
        Ok(Self {
            relation_embedding,
            wz,
            uz,
            wr,
            ur,
            wh,
            uh,
            layer_norm_1: LayerNorm::build(store, &format!("{}.layer_norm_1", prefix), dim)?,
            layer_norm_2: LayerNorm::build(store, &format!("{}.layer_norm_2", prefix), dim)?,
            self_attn: SetSelfAttention::build(store, &format!("{}.self_attn", prefix), dim)?,
            dropout,
        })
    }

    /// `relation_ids` is a `[batch]` u32 tensor; `particles` is `[batch, n, dim]`.
    pub fn forward(
        &self,
        relation_ids: &Tensor,
        particles: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        // [batch, 1, dim], broadcast over the particle slots
        let r = self
            .relation_embedding
            .index_select(relation_ids, 0)?
            .unsqueeze(1)?;
        let h = particles;
        let d = self.dropout;

        let z = candle_nn::ops::sigmoid(
            &self
                .wz
                .forward(&d.forward(&r, ctx)?)?
                .broadcast_add(&self.uz.forward(&d.forward(h, ctx)?)?)?,
        )?;
        let reset = candle_nn::ops::sigmoid(
            &self
                .wr
                .forward(&d.forward(&r, ctx)?)?
                .broadcast_add(&self.ur.forward(&d.forward(h, ctx)?)?)?,
        )?;
        let h_hat = self
            .wh
            .forward(&d.forward(&r, ctx)?)?
            .broadcast_add(&self.uh.forward(&d.forward(&(h * &reset)?, ctx)?)?)?
            .tanh()?;

        // (1 - z) * h + z * h_hat
        let keep = z.affine(-1.0, 1.0)?;
        let h = ((keep * h)? + (z * h_hat)?)?;

        let h = self.layer_norm_1.forward(&h)?;
        let h = self.self_attn.forward(&d.forward(&h, ctx)?)?;
        self.layer_norm_2.forward(&h)
    }
}

/// Refines the particles of a projected sub-query before projecting again.
#[derive(Debug, Clone)]
pub struct HigherProjection {
    attn: SetSelfAttention,
    ffn: FeedForward,
    layer_norm_1: LayerNorm,
    layer_norm_2: LayerNorm,
}

impl HigherProjection {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        Ok(Self {
            attn: SetSelfAttention::build(store, &format!("{}.attn", prefix), dim)?,
            ffn: FeedForward::build(store, &format!("{}.ffn", prefix), dim, dropout)?,
            layer_norm_1: LayerNorm::build(store, &format!("{}.layer_norm_1", prefix), dim)?,
            layer_norm_2: LayerNorm::build(store, &format!("{}.layer_norm_2", prefix), dim)?,
        })
    }

    pub fn forward(
        &self,
        projection: &Projection,
        relation_ids: &Tensor,
        particles: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let x = self.layer_norm_1.forward(&self.attn.forward(particles)?)?;
        let x = self.layer_norm_2.forward(&(self.ffn.forward(&x, ctx)? + &x)?)?;
        projection.forward(relation_ids, &x, ctx)
    }
}

/// Two rounds of attention + feed-forward over one particle set.
///
/// The attention and feed-forward weights are reused by both rounds; each
/// round has its own pair of layer norms.
#[derive(Debug, Clone)]
pub struct SetRefiner {
    attn: SetSelfAttention,
    ffn: FeedForward,
    layer_norms: [LayerNorm; 4],
    dropout: Dropout,
}

impl SetRefiner {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        let attn = SetSelfAttention::build(store, &format!("{}.attn", prefix), dim)?;
        let ffn = FeedForward::build(store, &format!("{}.ffn", prefix), dim, dropout)?;
        let mut norm = |i: usize| {
            LayerNorm::build(&mut *store, &format!("{}.layer_norm_{}", prefix, i), dim)
        };
        let layer_norms = [norm(1)?, norm(2)?, norm(3)?, norm(4)?];
        Ok(Self {
            attn,
            ffn,
            layer_norms,
            dropout,
        })
    }

    pub fn forward(&self, particles: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        let mut x = particles.clone();
        for norms in self.layer_norms.chunks(2) {
            x = norms[0].forward(&self.attn.forward(&self.dropout.forward(&x, ctx)?)?)?;
            x = norms[1].forward(&(self.ffn.forward(&x, ctx)? + &x)?)?;
        }
        Ok(x)
    }
}

/// Conjunction: concatenate the operand sets, then refine them jointly.
#[derive(Debug, Clone)]
pub struct Intersection {
    refiner: SetRefiner,
}

impl Intersection {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        Ok(Self {
            refiner: SetRefiner::build(store, prefix, dim, dropout)?,
        })
    }

    pub fn forward(&self, sets: &[Tensor], ctx: &mut ForwardContext) -> Result<Tensor> {
        self.refiner.forward(&Tensor::cat(sets, 1)?, ctx)
    }
}

/// Complement of one set.
#[derive(Debug, Clone)]
pub struct Negation {
    refiner: SetRefiner,
}

impl Negation {
    pub fn build(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        dropout: Dropout,
    ) -> crate::Result<Self> {
        Ok(Self {
            refiner: SetRefiner::build(store, prefix, dim, dropout)?,
        })
    }

    pub fn forward(&self, particles: &Tensor, ctx: &mut ForwardContext) -> Result<Tensor> {
        self.refiner.forward(particles, ctx)
    }
}

/// Disjunction keeps every particle of every operand, in operand order.
pub fn union(sets: &[Tensor]) -> Result<Tensor> {
    Tensor::cat(sets, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    const DIM: usize = 4;

    fn store() -> ParamStore {
        ParamStore::new(1, &Device::Cpu)
    }

    fn particles(batch: usize, n: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (batch, n, DIM), &Device::Cpu).unwrap()
    }

    fn relation_table(store: &mut ParamStore) -> Tensor {
        store.normal("relation_embedding", &[3, DIM], 1.0).unwrap()
    }

    /// Scalar f32 versions of each layer, reading weights from the store.
    mod reference {
        use crate::nn::ParamStore;

        pub fn matrix(store: &ParamStore, name: &str) -> Vec<Vec<f32>> {
            store.get(name).unwrap().as_tensor().to_vec2().unwrap()
        }

        pub fn vector(store: &ParamStore, name: &str) -> Vec<f32> {
            store.get(name).unwrap().as_tensor().to_vec1().unwrap()
        }

        /// `W x + b` for the linear registered under `prefix`.
        pub fn affine(store: &ParamStore, prefix: &str, x: &[f32]) -> Vec<f32> {
            let w = matrix(store, &format!("{}.weight", prefix));
            let b = vector(store, &format!("{}.bias", prefix));
            w.iter()
                .zip(b)
                .map(|(row, b)| row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + b)
                .collect()
        }

        pub fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
            a.iter().zip(b).map(|(x, y)| x + y).collect()
        }

        pub fn sigmoid(x: f32) -> f32 {
            1.0 / (1.0 + (-x).exp())
        }

        // Abramowitz & Stegun 7.1.26, |error| < 1.5e-7
        fn erf(x: f32) -> f32 {
            let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
            let poly = t
                * (0.254_829_6
                    + t * (-0.284_496_7 + t * (1.421_413_8 + t * (-1.453_152 + t * 1.061_405_4))));
            let y = 1.0 - poly * (-x * x).exp();
            if x < 0.0 {
                -y
            } else {
                y
            }
        }

        pub fn gelu(x: f32) -> f32 {
            0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2))
        }

        pub fn layer_norm(store: &ParamStore, prefix: &str, x: &[f32]) -> Vec<f32> {
            let n = x.len() as f32;
            let mean = x.iter().sum::<f32>() / n;
            let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let w = vector(store, &format!("{}.weight", prefix));
            let b = vector(store, &format!("{}.bias", prefix));
            x.iter()
                .zip(w.iter().zip(b))
                .map(|(v, (w, b))| w * (v - mean) / (var + 1e-12).sqrt() + b)
                .collect()
        }

        pub fn attention(store: &ParamStore, prefix: &str, xs: &[Vec<f32>]) -> Vec<Vec<f32>> {
            let map = |name: &str| -> Vec<Vec<f32>> {
                xs.iter()
                    .map(|x| affine(store, &format!("{}.{}", prefix, name), x))
                    .collect()
            };
            let (q, k, v) = (map("query"), map("key"), map("value"));
            let scale = 1.0 / (xs[0].len() as f32).sqrt();

            q.iter()
                .map(|qi| {
                    let logits: Vec<f32> = k
                        .iter()
                        .map(|kj| qi.iter().zip(kj).map(|(a, b)| a * b).sum::<f32>() * scale)
                        .collect();
                    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
                    let total: f32 = exp.iter().sum();

                    let mut out = vec![0.0; v[0].len()];
                    for (e, vj) in exp.iter().zip(&v) {
                        for (o, x) in out.iter_mut().zip(vj) {
                            *o += e / total * x;
                        }
                    }
                    out
                })
                .collect()
        }

        pub fn ffn(store: &ParamStore, prefix: &str, x: &[f32]) -> Vec<f32> {
            let h: Vec<f32> = affine(store, &format!("{}.linear1", prefix), x)
                .into_iter()
                .map(gelu)
                .collect();
            affine(store, &format!("{}.linear2", prefix), &h)
        }

        /// `x = LNa(Attn(x))`, `x = LNb(FFN(x) + x)` with the block under `prefix`.
        pub fn refine_round(
            store: &ParamStore,
            prefix: &str,
            xs: &[Vec<f32>],
            norm_a: usize,
            norm_b: usize,
        ) -> Vec<Vec<f32>> {
            let norm = |i: usize, x: &[f32]| {
                layer_norm(store, &format!("{}.layer_norm_{}", prefix, i), x)
            };
            attention(store, &format!("{}.attn", prefix), xs)
                .iter()
                .map(|a| norm(norm_a, a.as_slice()))
                .map(|x| norm(norm_b, add(&ffn(store, &format!("{}.ffn", prefix), &x), &x).as_slice()))
                .collect()
        }
    }

    fn to_tensor(xs: &[Vec<f32>]) -> Tensor {
        let (n, d) = (xs.len(), xs[0].len());
        Tensor::from_vec(xs.concat(), (1, n, d), &Device::Cpu).unwrap()
    }

    fn assert_close(got: &Tensor, expected: &[Vec<f32>]) {
        let got: Vec<Vec<f32>> = got.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            for (a, b) in g.iter().zip(e) {
                assert!((a - b).abs() < 1e-4, "{:?} vs {:?}", got, expected);
            }
        }
    }

    fn fill(store: &ParamStore, name: &str, value: f32) {
        let var = store.get(name).unwrap();
        let t = Tensor::full(value, var.dims(), &Device::Cpu).unwrap();
        var.set(&t).unwrap();
    }

    /// Give `layer_norm_1..=count` distinct scales and shifts so their order matters.
    fn distinct_norms(store: &ParamStore, prefix: &str, count: usize) {
        for i in 1..=count {
            fill(store, &format!("{}.layer_norm_{}.weight", prefix, i), 0.5 * i as f32);
            fill(store, &format!("{}.layer_norm_{}.bias", prefix, i), 0.1 * i as f32 - 0.2);
        }
    }

    fn sample_particles() -> Vec<Vec<f32>> {
        vec![
            vec![0.3, -1.2, 0.8, 0.1],
            vec![-0.5, 0.4, 1.5, -0.9],
            vec![1.1, 0.0, -0.7, 0.6],
        ]
    }

    #[test]
    fn test_projection_matches_reference() {
        use reference::*;

        let mut store = store();
        let rel = relation_table(&mut store);
        let proj = Projection::build(&mut store, "projection", rel, DIM, Dropout::new(0.0)).unwrap();
        distinct_norms(&store, "projection", 2);

        let h = sample_particles();
        let r = matrix(&store, "relation_embedding")[2].clone();
        let gate = |w: &str, u: &str, x: &[f32]| {
            add(
                &affine(&store, &format!("projection.{}", w), &r),
                &affine(&store, &format!("projection.{}", u), x),
            )
        };

        let updated: Vec<Vec<f32>> = h
            .iter()
            .map(|particle| {
                let z: Vec<f32> = gate("wz", "uz", particle.as_slice()).into_iter().map(sigmoid).collect();
                let reset: Vec<f32> = gate("wr", "ur", particle.as_slice()).into_iter().map(sigmoid).collect();
                let gated: Vec<f32> = particle.iter().zip(&reset).map(|(h, r)| h * r).collect();
                let h_hat: Vec<f32> = gate("wh", "uh", gated.as_slice()).into_iter().map(f32::tanh).collect();
                (0..DIM)
                    .map(|i| (1.0 - z[i]) * particle[i] + z[i] * h_hat[i])
                    .collect()
            })
            .collect();
        let normed: Vec<Vec<f32>> = updated
            .iter()
            .map(|x| layer_norm(&store, "projection.layer_norm_1", x))
            .collect();
        let expected: Vec<Vec<f32>> = attention(&store, "projection.self_attn", &normed)
            .iter()
            .map(|x| layer_norm(&store, "projection.layer_norm_2", x))
            .collect();

        // p = 0 keeps training mode deterministic
        let ids = Tensor::new(&[2u32], &Device::Cpu).unwrap();
        let got = proj
            .forward(&ids, &to_tensor(&h), &mut ForwardContext::train(0))
            .unwrap();
        assert_close(&got, &expected);
    }

    #[test]
    fn test_refiner_matches_reference() {
        use reference::refine_round;

        let mut store = store();
        let refiner = SetRefiner::build(&mut store, "intersection", DIM, Dropout::new(0.0)).unwrap();
        distinct_norms(&store, "intersection", 4);

        let x = sample_particles();
        let first = refine_round(&store, "intersection", &x, 1, 2);
        let expected = refine_round(&store, "intersection", &first, 3, 4);

        let got = refiner
            .forward(&to_tensor(&x), &mut ForwardContext::eval())
            .unwrap();
        assert_close(&got, &expected);
    }

    #[test]
    fn test_higher_projection_refines_then_projects() {
        use reference::refine_round;

        let mut store = store();
        let rel = relation_table(&mut store);
        let proj = Projection::build(&mut store, "projection", rel, DIM, Dropout::new(0.0)).unwrap();
        let higher =
            HigherProjection::build(&mut store, "higher_projection", DIM, Dropout::new(0.0)).unwrap();
        distinct_norms(&store, "higher_projection", 2);

        let x = sample_particles();
        let refined = refine_round(&store, "higher_projection", &x, 1, 2);
        let ids = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let mut ctx = ForwardContext::eval();

        let expected = proj.forward(&ids, &to_tensor(&refined), &mut ctx).unwrap();
        let expected: Vec<Vec<f32>> = expected.squeeze(0).unwrap().to_vec2().unwrap();
        let got = higher
            .forward(&proj, &ids, &to_tensor(&x), &mut ctx)
            .unwrap();
        assert_close(&got, &expected);
    }

    #[test]
    fn test_projection_shape() {
        let mut store = store();
        let rel = relation_table(&mut store);
        let proj = Projection::build(&mut store, "projection", rel, DIM, Dropout::new(0.3)).unwrap();
        let ids = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();

        let out = proj
            .forward(&ids, &particles(2, 3), &mut ForwardContext::train(0))
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, DIM]);
    }

    #[test]
    fn test_projection_depends_on_relation() {
        let mut store = store();
        let rel = relation_table(&mut store);
        let proj = Projection::build(&mut store, "projection", rel, DIM, Dropout::new(0.0)).unwrap();
        let x = particles(1, 2);

        let a = proj
            .forward(&Tensor::new(&[0u32], &Device::Cpu).unwrap(), &x, &mut ForwardContext::eval())
            .unwrap();
        let b = proj
            .forward(&Tensor::new(&[1u32], &Device::Cpu).unwrap(), &x, &mut ForwardContext::eval())
            .unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 1e-4);
    }

    #[test]
    fn test_higher_projection_shape() {
        let mut store = store();
        let rel = relation_table(&mut store);
        let proj = Projection::build(&mut store, "projection", rel, DIM, Dropout::new(0.3)).unwrap();
        let higher =
            HigherProjection::build(&mut store, "higher_projection", DIM, Dropout::new(0.3)).unwrap();
        let ids = Tensor::new(&[1u32], &Device::Cpu).unwrap();

        let out = higher
            .forward(&proj, &ids, &particles(1, 5), &mut ForwardContext::eval())
            .unwrap();
        assert_eq!(out.dims(), &[1, 5, DIM]);
    }

    #[test]
    fn test_intersection_concatenates() {
        let mut store = store();
        let inter = Intersection::build(&mut store, "intersection", DIM, Dropout::new(0.3)).unwrap();
        let out = inter
            .forward(&[particles(1, 2), particles(1, 2)], &mut ForwardContext::eval())
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, DIM]);

        let three = inter
            .forward(
                &[particles(2, 2), particles(2, 3), particles(2, 1)],
                &mut ForwardContext::train(4),
            )
            .unwrap();
        assert_eq!(three.dims(), &[2, 6, DIM]);
    }

    #[test]
    fn test_intersection_rejects_batch_mismatch() {
        let mut store = store();
        let inter = Intersection::build(&mut store, "intersection", DIM, Dropout::new(0.3)).unwrap();
        assert!(inter
            .forward(&[particles(1, 2), particles(2, 2)], &mut ForwardContext::eval())
            .is_err());
    }

    #[test]
    fn test_negation_keeps_count() {
        let mut store = store();
        let neg = Negation::build(&mut store, "negation", DIM, Dropout::new(0.3)).unwrap();
        let out = neg
            .forward(&particles(3, 5), &mut ForwardContext::eval())
            .unwrap();
        assert_eq!(out.dims(), &[3, 5, DIM]);
    }

    #[test]
    fn test_refiner_registers_four_norms() {
        let mut store = store();
        SetRefiner::build(&mut store, "negation", DIM, Dropout::new(0.0)).unwrap();
        let names: Vec<String> = store.names().into_iter().cloned().collect();
        for i in 1..=4 {
            assert!(names.contains(&format!("negation.layer_norm_{}.weight", i)));
        }
        // attn (3 linears) + ffn (2 linears) + 4 norms, two tensors each
        assert_eq!(names.len(), 2 * (3 + 2 + 4));
    }

    #[test]
    fn test_union_preserves_order() {
        let a = Tensor::zeros((1, 2, DIM), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::ones((1, 1, DIM), DType::F32, &Device::Cpu).unwrap();
        let out = union(&[a, b]).unwrap();
        assert_eq!(out.dims(), &[1, 3, DIM]);

        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0; DIM]);
        assert_eq!(rows[2], vec![1.0; DIM]);
    }
}

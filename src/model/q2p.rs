//! The Query2Particles model and its recursive query interpreter.

use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::optim::AdamW;
use tracing::{debug, info};

use super::config::Q2PConfig;
use super::operators::{union, HigherProjection, Intersection, Negation, Projection};
use super::particles::ParticleExpansion;
use super::scoring::{score_particles, LabelSmoothingLoss};
use crate::error::{Q2PError, Result};
use crate::nn::{Dropout, ForwardContext, ParamStore};
use crate::syntax::StructuredQuery;

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Metal when built with the `metal` feature and a GPU is present, else CPU.
pub fn default_device() -> Device {
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0).unwrap_or(Device::Cpu);
    #[cfg(not(feature = "metal"))]
    let device = Device::Cpu;
    device
}

/// Encodes structured queries as particle sets and scores entities.
///
/// The entity table doubles as the decoder weight: both lookups and
/// scoring read the same `entity_embedding` Var, so an optimizer step can
/// never make them diverge.
pub struct Q2P {
    config: Q2PConfig,
    device: Device,
    params: ParamStore,
    /// `[num_entities, dim]`
    entity_embedding: Tensor,
    to_particles: ParticleExpansion,
    projection: Projection,
    higher_projection: HigherProjection,
    intersection: Intersection,
    negation: Negation,
    loss: LabelSmoothingLoss,
}

impl Q2P {
    pub fn new(config: Q2PConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let dim = config.embedding_dim;
        let dropout = Dropout::new(config.dropout);
        let mut params = ParamStore::new(config.seed, device);

        let entity_embedding =
            params.normal("entity_embedding", &[config.num_entities, dim], 1.0)?;
        let relation_embedding =
            params.normal("relation_embedding", &[config.num_relations, dim], 1.0)?;
        let to_particles =
            ParticleExpansion::build(&mut params, "to_particles", config.num_particles, dim)?;
        let projection =
            Projection::build(&mut params, "projection", relation_embedding, dim, dropout)?;
        let higher_projection =
            HigherProjection::build(&mut params, "higher_projection", dim, dropout)?;
        let intersection = Intersection::build(&mut params, "intersection", dim, dropout)?;
        let negation = Negation::build(&mut params, "negation", dim, dropout)?;

        info!(
            entities = config.num_entities,
            relations = config.num_relations,
            dim,
            particles = config.num_particles,
            tensors = params.len(),
            scalars = params.num_elements(),
            "built q2p model"
        );

        Ok(Self {
            loss: LabelSmoothingLoss::new(config.label_smoothing),
            config,
            device: device.clone(),
            params,
            entity_embedding,
            to_particles,
            projection,
            higher_projection,
            intersection,
            negation,
        })
    }

    pub fn config(&self) -> &Q2PConfig {
        &self.config
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// The entity table, `[num_entities, dim]`.
    pub fn entity_embedding(&self) -> &Tensor {
        &self.entity_embedding
    }

    /// The decoder weight. Same storage as [`Q2P::entity_embedding`].
    pub fn decoder_weight(&self) -> &Tensor {
        &self.entity_embedding
    }

    /// Check arity, batch consistency and id bounds of the whole tree.
    pub fn validate(&self, query: &StructuredQuery) -> Result<usize> {
        let batch = query.batch_size()?;
        let bounds = [
            ("entity", query.entity_ids(), self.config.num_entities),
            ("relation", query.relation_ids(), self.config.num_relations),
        ];
        for (kind, ids, limit) in bounds {
            if let Some(&id) = ids.iter().find(|&&id| id >= limit) {
                return Err(Q2PError::IdOutOfRange { kind, id, limit });
            }
        }
        Ok(batch)
    }

    fn id_tensor(&self, ids: &[usize]) -> Result<Tensor> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        let len = ids.len();
        Ok(Tensor::from_vec(ids, len, &self.device)?)
    }

    /// Encode a query as a particle set `[batch, n, dim]`.
    pub fn forward(&self, query: &StructuredQuery, ctx: &mut ForwardContext) -> Result<Tensor> {
        self.validate(query)?;
        self.encode(query, ctx)
    }

    fn encode(&self, query: &StructuredQuery, ctx: &mut ForwardContext) -> Result<Tensor> {
        let particles = match query {
            StructuredQuery::Entity { anchors } => {
                let ids = self.id_tensor(anchors)?;
                let embeddings = self.entity_embedding.index_select(&ids, 0)?;
                self.to_particles.forward(&embeddings)?
            }
            StructuredQuery::Projection { relations, query: sub } => {
                let sub_particles = self.encode(sub, ctx)?;
                let ids = self.id_tensor(relations)?;
                match sub.as_ref() {
                    StructuredQuery::Entity { .. } => {
                        self.projection.forward(&ids, &sub_particles, ctx)?
                    }
                    _ => self
                        .higher_projection
                        .forward(&self.projection, &ids, &sub_particles, ctx)?,
                }
            }
            StructuredQuery::Intersection(queries) => {
                let sets = self.encode_all(queries, ctx)?;
                self.intersection.forward(&sets, ctx)?
            }
            StructuredQuery::Union(queries) => union(&self.encode_all(queries, ctx)?)?,
            StructuredQuery::Negation(sub) => {
                let sub_particles = self.encode(sub, ctx)?;
                self.negation.forward(&sub_particles, ctx)?
            }
        };
        debug!(tag = %query.tag(), particles = particles.dim(1)?, "encoded query node");
        Ok(particles)
    }

    fn encode_all(
        &self,
        queries: &[StructuredQuery],
        ctx: &mut ForwardContext,
    ) -> Result<Vec<Tensor>> {
        queries.iter().map(|q| self.encode(q, ctx)).collect()
    }

    /// Entity scores `[batch, num_entities]` for an encoded particle set.
    pub fn scores_for(&self, particles: &Tensor) -> Result<Tensor> {
        Ok(score_particles(particles, &self.entity_embedding)?)
    }

    /// Entity scores `[batch, num_entities]` for a query.
    pub fn score(&self, query: &StructuredQuery, ctx: &mut ForwardContext) -> Result<Tensor> {
        let particles = self.forward(query, ctx)?;
        self.scores_for(&particles)
    }

    /// Label-smoothed loss of a query against one gold entity per batch element.
    pub fn loss(
        &self,
        query: &StructuredQuery,
        labels: &[usize],
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let batch = self.validate(query)?;
        if labels.len() != batch {
            return Err(Q2PError::BatchMismatch {
                expected: batch,
                got: labels.len(),
            });
        }
        let scores = self.scores_for(&self.encode(query, ctx)?)?;
        self.loss.forward(&scores, labels)
    }

    /// Highest-scoring `k` entities per batch element, in eval mode.
    pub fn top_k(&self, query: &StructuredQuery, k: usize) -> Result<Vec<Vec<(usize, f32)>>> {
        let scores: Vec<Vec<f32>> = self.score(query, &mut ForwardContext::eval())?.to_vec2()?;
        Ok(scores
            .into_iter()
            .map(|row| {
                let mut ranked: Vec<(usize, f32)> = row.into_iter().enumerate().collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                ranked.truncate(k);
                ranked
            })
            .collect())
    }

    /// AdamW over every parameter, the tied entity table included once.
    pub fn create_adamw(&self, lr: f64, weight_decay: f64) -> Result<AdamW> {
        self.params.create_adamw(lr, weight_decay)
    }

    /// Write all parameters to a safetensors file.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.params.save_safetensors(path)?;
        info!(path = %path.display(), tensors = self.params.len(), "saved checkpoint");
        Ok(())
    }

    /// Restore parameters from a safetensors file written for the same config.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let count = self.params.load_safetensors(path)?;
        info!(path = %path.display(), tensors = count, "loaded checkpoint");
        Ok(count)
    }

    /// Save `config.json` and `model.safetensors` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.config.save_json(dir.join(CONFIG_FILE))?;
        self.save_checkpoint(dir.join(WEIGHTS_FILE))
    }

    /// Rebuild a model from a directory written by [`Q2P::save`].
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config = Q2PConfig::from_json_file(dir.join(CONFIG_FILE))?;
        let model = Self::new(config, device)?;
        model.load_checkpoint(dir.join(WEIGHTS_FILE))?;
        Ok(model)
    }
}

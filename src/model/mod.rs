//! The Query2Particles model: particle expansion, logical operators,
//! scoring and the query interpreter that ties them together.

mod config;
mod operators;
mod particles;
mod q2p;
mod scoring;

pub use config::Q2PConfig;
pub use operators::{union, HigherProjection, Intersection, Negation, Projection, SetRefiner};
pub use particles::ParticleExpansion;
pub use q2p::{default_device, Q2P};
pub use scoring::{max_pool_particles, score_particles, LabelSmoothingLoss};

//! Neural building blocks shared by the query operators.
//!
//! All layers read their weights from a [`ParamStore`]; none of them own
//! learnable state directly.

mod attention;
mod dropout;
mod ffn;
mod norm;
mod params;

pub use attention::SetSelfAttention;
pub use dropout::{Dropout, ForwardContext};
pub use ffn::FeedForward;
pub use norm::LayerNorm;
pub use params::ParamStore;

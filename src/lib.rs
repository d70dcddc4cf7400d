//! q2p: complex logical query answering with particle embeddings.
//!
//! A query such as "which entities are related by r2 to something related
//! by r1 to e, but not reachable from f" is written as a nested literal
//!
//! ```text
//! ("i", ("p", [2], ("p", [1], ("e", [[4]]))), ("n", ("p", [0], ("e", [[7]]))))
//! ```
//!
//! and encoded bottom-up as a set of particles: every anchor entity becomes
//! a few vectors, and each logical operator is a learned network mapping
//! particle sets to particle sets. Entities are scored by their best
//! matching particle.
//!
//! ```no_run
//! use candle_core::Device;
//! use q2p::{parse_query, ForwardContext, Q2PConfig, Q2P};
//!
//! let model = Q2P::new(Q2PConfig::new(100, 10, 32), &Device::Cpu)?;
//! let query = parse_query(r#"("p", [3], ("e", [[42]]))"#)?;
//! let loss = model.loss(&query, &[7], &mut ForwardContext::train(0))?;
//! let answers = model.top_k(&query, 5)?;
//! # Ok::<(), q2p::Q2PError>(())
//! ```

pub mod error;
pub mod model;
pub mod nn;
pub mod syntax;

pub use error::{Q2PError, Result};
pub use model::{default_device, Q2PConfig, Q2P};
pub use nn::{Dropout, ForwardContext, ParamStore};
pub use syntax::{parse_query, QueryTag, StructuredQuery};

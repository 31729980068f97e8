//! `ember-sampler` - Token sampling for ember.
//!
//! A session's sampler turns one logits vector into one token ID:
//! - temperature 0 selects the argmax
//! - otherwise logits are tempered and softmaxed, then drawn multinomially
//!   or by nucleus (top-p) truncation
//!
//! Randomness comes from a per-session xorshift* generator so that a fixed
//! seed reproduces a generation exactly.

pub mod rng;
pub mod sampler;

pub use rng::Xorshift64Star;
pub use sampler::{ProbIndex, Sampler};

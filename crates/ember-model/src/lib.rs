//! `ember-model` - Checkpoint loading, weight access, and the tokenizer for ember.
//!
//! This crate provides:
//! - Parsing of the two checkpoint formats (legacy float32 and int8-grouped)
//! - Typed weight handles resolved through mmap, a budgeted read-cache, or a
//!   caller-supplied address region
//! - The SentencePiece-style BPE tokenizer and its on-disk vocabulary format
//! - The immutable `Model` bundle shared by every generation session

pub mod access;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod model;
pub mod tokenizer;
pub mod weights;

pub use access::{AccessMode, TensorSpan, WeightStore};
pub use checkpoint::layout::{F32Handle, MatHandle, Q8Handle};
pub use config::{ModelConfig, ModelKind, WeightFormat};
pub use error::{ModelError, Result};
pub use model::{MatSpan, Model, ModelOptions};
pub use tokenizer::{Tokenizer, TOKEN_BOS, TOKEN_EOS, TOKEN_UNK};

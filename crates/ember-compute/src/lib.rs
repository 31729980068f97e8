//! `ember-compute` - Matmul kernels, quantization, and the worker pool for ember.
//!
//! This crate provides:
//! - Row-range matmul kernels for float32 and group-quantized int8 weights
//! - Group quantization of activation vectors (`QuantBuf`)
//! - The element-wise math of the forward pass (RMSNorm, softmax, RoPE, SwiGLU)
//! - A fixed worker pool with a bounded job ring and per-caller barriers

pub mod error;
pub mod kernels;
pub mod ops;
pub mod pool;
pub mod quant;

pub use error::{ComputeError, Result};
pub use pool::{Completion, WorkerPool, DEFAULT_THREADS};
pub use quant::QuantBuf;

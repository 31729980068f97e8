//! Typed weight handles for the forward pass.
//!
//! Matrices stay on disk (or in the caller's region) and are resolved to
//! spans per use; only the token-embedding table is materialized to f32 at
//! construction, since every step starts by copying one of its rows.

use byteorder::{ByteOrder, LittleEndian};

use ember_compute::quant;

use crate::access::WeightStore;
use crate::checkpoint::layout::{F32Handle, MatHandle, WeightLayout};
use crate::config::ModelConfig;
use crate::error::Result;

/// All weight tensors of one model, as resolution-ready handles.
pub struct Weights {
    /// Token embedding table, dequantized to f32 at load, `[vocab, dim]`.
    pub token_embedding: Vec<f32>,
    /// Per-layer attention RMSNorm weights.
    pub rms_att: Vec<F32Handle>,
    /// Per-layer FFN RMSNorm weights.
    pub rms_ffn: Vec<F32Handle>,
    /// Final RMSNorm weights.
    pub rms_final: F32Handle,
    /// Query projections, `[dim, dim]` per layer.
    pub wq: Vec<MatHandle>,
    /// Key projections, `[kv_dim, dim]` per layer.
    pub wk: Vec<MatHandle>,
    /// Value projections, `[kv_dim, dim]` per layer.
    pub wv: Vec<MatHandle>,
    /// Attention output projections, `[dim, dim]` per layer.
    pub wo: Vec<MatHandle>,
    /// FFN gate projections, `[hidden_dim, dim]` per layer.
    pub w1: Vec<MatHandle>,
    /// FFN down projections, `[dim, hidden_dim]` per layer.
    pub w2: Vec<MatHandle>,
    /// FFN up projections, `[hidden_dim, dim]` per layer.
    pub w3: Vec<MatHandle>,
    /// Classifier head, `[vocab, dim]`; aliases the embedding handles when
    /// the checkpoint shares them.
    pub wcls: MatHandle,
}

impl Weights {
    /// Build the weight bundle from a computed layout, materializing the
    /// embedding table through the store.
    pub(crate) fn from_layout(
        layout: WeightLayout,
        store: &WeightStore,
        config: &ModelConfig,
    ) -> Result<Weights> {
        let token_embedding = materialize_f32(&layout.token_embedding, store, config.group_size)?;

        Ok(Weights {
            token_embedding,
            rms_att: layout.rms_att,
            rms_ffn: layout.rms_ffn,
            rms_final: layout.rms_final,
            wq: layout.wq,
            wk: layout.wk,
            wv: layout.wv,
            wo: layout.wo,
            w1: layout.w1,
            w2: layout.w2,
            w3: layout.w3,
            wcls: layout.wcls,
        })
    }
}

/// Copy a matrix out of the store as f32, dequantizing if needed.
fn materialize_f32(
    handle: &MatHandle,
    store: &WeightStore,
    group_size: usize,
) -> Result<Vec<f32>> {
    match handle {
        MatHandle::F32(h) => {
            let bytes = store.read_bytes(h.offset, h.byte_len())?;
            let mut out = vec![0.0f32; h.len];
            LittleEndian::read_f32_into(&bytes, &mut out);
            Ok(out)
        }
        MatHandle::Q8(h) => {
            let q_bytes = store.read_bytes(h.q_offset, h.len)?;
            let s_bytes = store.read_bytes(h.s_offset, h.len / group_size * 4)?;

            // Safety: i8 and u8 share size and alignment.
            let q = unsafe {
                std::slice::from_raw_parts(q_bytes.as_ptr() as *const i8, q_bytes.len())
            };
            let mut s = vec![0.0f32; h.len / group_size];
            LittleEndian::read_f32_into(&s_bytes, &mut s);

            let mut out = vec![0.0f32; h.len];
            quant::dequantize(q, &s, group_size, &mut out);
            Ok(out)
        }
    }
}

//! Walks a checkpoint body in file order, producing `(offset, length)`
//! descriptors for every weight tensor. Nothing is read here; the handles
//! are resolved lazily through the weight store.

use crate::config::{ModelConfig, WeightFormat};
use crate::error::{ModelError, Result};

/// A contiguous float32 run in the checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct F32Handle {
    /// Absolute file offset of the first element.
    pub offset: u64,
    /// Element count.
    pub len: usize,
}

impl F32Handle {
    /// Size of the run in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * 4
    }
}

/// A quantized tensor: int8 values followed by one float32 scale per group.
#[derive(Debug, Clone, Copy)]
pub struct Q8Handle {
    /// Absolute file offset of the quantized values.
    pub q_offset: u64,
    /// Absolute file offset of the scales.
    pub s_offset: u64,
    /// Element count (quant count; the scale count is `len / group_size`).
    pub len: usize,
}

/// A weight matrix in whichever format the checkpoint stores it.
#[derive(Debug, Clone, Copy)]
pub enum MatHandle {
    F32(F32Handle),
    Q8(Q8Handle),
}

/// All tensor descriptors of one checkpoint, in resolution-ready form.
pub struct WeightLayout {
    pub token_embedding: MatHandle,
    pub rms_att: Vec<F32Handle>,
    pub rms_ffn: Vec<F32Handle>,
    pub rms_final: F32Handle,
    pub wq: Vec<MatHandle>,
    pub wk: Vec<MatHandle>,
    pub wv: Vec<MatHandle>,
    pub wo: Vec<MatHandle>,
    pub w1: Vec<MatHandle>,
    pub w2: Vec<MatHandle>,
    pub w3: Vec<MatHandle>,
    pub wcls: MatHandle,
    /// One past the last weight byte; validated against the file length.
    pub end: u64,
}

/// File-order cursor over the checkpoint body.
struct Cursor {
    offset: u64,
    group_size: usize,
}

impl Cursor {
    fn f32_run(&mut self, len: usize) -> Result<F32Handle> {
        if self.offset % 4 != 0 {
            return Err(ModelError::Misaligned {
                offset: self.offset,
            });
        }
        let handle = F32Handle {
            offset: self.offset,
            len,
        };
        self.offset += len as u64 * 4;
        Ok(handle)
    }

    fn f32_layers(&mut self, n_layers: usize, len: usize) -> Result<Vec<F32Handle>> {
        (0..n_layers).map(|_| self.f32_run(len)).collect()
    }

    fn skip_f32(&mut self, len: usize) {
        self.offset += len as u64 * 4;
    }

    fn q8_run(&mut self, len: usize) -> Result<Q8Handle> {
        let q_offset = self.offset;
        self.offset += len as u64;
        if self.offset % 4 != 0 {
            return Err(ModelError::Misaligned {
                offset: self.offset,
            });
        }
        let s_offset = self.offset;
        self.offset += (len / self.group_size) as u64 * 4;
        Ok(Q8Handle {
            q_offset,
            s_offset,
            len,
        })
    }

    fn q8_layers(&mut self, n_layers: usize, len: usize) -> Result<Vec<MatHandle>> {
        (0..n_layers)
            .map(|_| self.q8_run(len).map(MatHandle::Q8))
            .collect()
    }
}

/// Compute the layout of a checkpoint whose weight data begins at
/// `data_start`.
pub fn layout(config: &ModelConfig, data_start: u64) -> Result<WeightLayout> {
    match config.format {
        WeightFormat::Float32 => layout_float(config, data_start),
        WeightFormat::Int8Grouped => layout_int8(config, data_start),
    }
}

/// Legacy float32 body: embedding, attention tensors, FFN tensors, final
/// norm, then two legacy RoPE tables (skipped) and the optional unshared
/// classifier.
fn layout_float(config: &ModelConfig, data_start: u64) -> Result<WeightLayout> {
    let dim = config.dim;
    let hidden = config.hidden_dim;
    let l = config.n_layers;
    let kv_dim = config.kv_dim();
    let head_size = config.head_size();

    let mut cur = Cursor {
        offset: data_start,
        group_size: 0,
    };

    let token_embedding = cur.f32_run(config.vocab_size * dim)?;
    let rms_att = cur.f32_layers(l, dim)?;
    let wq = cur.f32_layers(l, dim * dim)?;
    let wk = cur.f32_layers(l, dim * kv_dim)?;
    let wv = cur.f32_layers(l, dim * kv_dim)?;
    let wo = cur.f32_layers(l, dim * dim)?;
    let rms_ffn = cur.f32_layers(l, dim)?;
    let w1 = cur.f32_layers(l, dim * hidden)?;
    let w2 = cur.f32_layers(l, hidden * dim)?;
    let w3 = cur.f32_layers(l, dim * hidden)?;
    let rms_final = cur.f32_run(dim)?;

    // Legacy RoPE frequency tables, real and imaginary halves.
    cur.skip_f32(config.seq_len * head_size / 2);
    cur.skip_f32(config.seq_len * head_size / 2);

    let wcls = if config.shared_classifier {
        token_embedding
    } else {
        cur.f32_run(config.vocab_size * dim)?
    };

    Ok(WeightLayout {
        token_embedding: MatHandle::F32(token_embedding),
        rms_att,
        rms_ffn,
        rms_final,
        wq: wq.into_iter().map(MatHandle::F32).collect(),
        wk: wk.into_iter().map(MatHandle::F32).collect(),
        wv: wv.into_iter().map(MatHandle::F32).collect(),
        wo: wo.into_iter().map(MatHandle::F32).collect(),
        w1: w1.into_iter().map(MatHandle::F32).collect(),
        w2: w2.into_iter().map(MatHandle::F32).collect(),
        w3: w3.into_iter().map(MatHandle::F32).collect(),
        wcls: MatHandle::F32(wcls),
        end: cur.offset,
    })
}

/// Int8-grouped body: the three norm families stay float32, then every
/// matrix follows as per-layer `(quants, scales)` tuples.
fn layout_int8(config: &ModelConfig, data_start: u64) -> Result<WeightLayout> {
    let dim = config.dim;
    let hidden = config.hidden_dim;
    let l = config.n_layers;
    let kv_dim = config.kv_dim();

    let mut cur = Cursor {
        offset: data_start,
        group_size: config.group_size,
    };

    let rms_att = cur.f32_layers(l, dim)?;
    let rms_ffn = cur.f32_layers(l, dim)?;
    let rms_final = cur.f32_run(dim)?;

    let token_embedding = cur.q8_run(config.vocab_size * dim)?;
    let wq = cur.q8_layers(l, dim * dim)?;
    let wk = cur.q8_layers(l, dim * kv_dim)?;
    let wv = cur.q8_layers(l, dim * kv_dim)?;
    let wo = cur.q8_layers(l, dim * dim)?;
    let w1 = cur.q8_layers(l, dim * hidden)?;
    let w2 = cur.q8_layers(l, hidden * dim)?;
    let w3 = cur.q8_layers(l, dim * hidden)?;

    let wcls = if config.shared_classifier {
        token_embedding
    } else {
        cur.q8_run(config.vocab_size * dim)?
    };

    Ok(WeightLayout {
        token_embedding: MatHandle::Q8(token_embedding),
        rms_att,
        rms_ffn,
        rms_final,
        wq,
        wk,
        wv,
        wo,
        w1,
        w2,
        w3,
        wcls: MatHandle::Q8(wcls),
        end: cur.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::header::{INT8_HEADER_BYTES, LEGACY_HEADER_BYTES};
    use crate::config::{ModelConfig, WeightFormat};

    fn float_config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 8,
            seq_len: 16,
            group_size: 0,
            shared_classifier: true,
            format: WeightFormat::Float32,
        }
    }

    #[test]
    fn test_float_layout_offsets() {
        let cfg = float_config();
        let lay = layout(&cfg, LEGACY_HEADER_BYTES).unwrap();

        let MatHandle::F32(emb) = lay.token_embedding else {
            panic!("float checkpoint produced quantized embedding");
        };
        assert_eq!(emb.offset, LEGACY_HEADER_BYTES);
        assert_eq!(emb.len, 64);

        // rms_att starts right after the embedding table.
        assert_eq!(lay.rms_att[0].offset, LEGACY_HEADER_BYTES + 64 * 4);
        assert_eq!(lay.rms_att[1].offset, lay.rms_att[0].offset + 8 * 4);

        // Shared classifier aliases the embedding.
        let MatHandle::F32(cls) = lay.wcls else {
            panic!()
        };
        assert_eq!(cls.offset, emb.offset);

        // Total: header + all tensors + the two skipped RoPE tables.
        let f32_count = 64 // embedding
            + 2 * 8            // rms_att
            + 2 * 64           // wq
            + 2 * 32 * 2       // wk, wv
            + 2 * 64           // wo
            + 2 * 8            // rms_ffn
            + 2 * 128 * 2      // w1, w3
            + 2 * 128          // w2
            + 8                // rms_final
            + 16 * 4 / 2 * 2; // rope tables
        assert_eq!(lay.end, LEGACY_HEADER_BYTES + f32_count as u64 * 4);
    }

    #[test]
    fn test_float_layout_unshared_classifier() {
        let mut cfg = float_config();
        cfg.shared_classifier = false;
        let lay = layout(&cfg, LEGACY_HEADER_BYTES).unwrap();
        let (MatHandle::F32(cls), MatHandle::F32(emb)) = (lay.wcls, lay.token_embedding) else {
            panic!()
        };
        assert_ne!(cls.offset, emb.offset);
        assert_eq!(lay.end, cls.offset + 64 * 4);
    }

    #[test]
    fn test_int8_layout_interleaves_quants_and_scales() {
        let mut cfg = float_config();
        cfg.format = WeightFormat::Int8Grouped;
        cfg.group_size = 4;
        let lay = layout(&cfg, INT8_HEADER_BYTES).unwrap();

        // Norms first, all float32.
        assert_eq!(lay.rms_att[0].offset, INT8_HEADER_BYTES);
        let norms_bytes = (2 * 8 + 2 * 8 + 8) as u64 * 4;

        let MatHandle::Q8(emb) = lay.token_embedding else {
            panic!()
        };
        assert_eq!(emb.q_offset, INT8_HEADER_BYTES + norms_bytes);
        assert_eq!(emb.s_offset, emb.q_offset + 64);
        assert_eq!(emb.len, 64);

        // wq layer 0 follows the embedding tuple.
        let MatHandle::Q8(wq0) = lay.wq[0] else {
            panic!()
        };
        assert_eq!(wq0.q_offset, emb.s_offset + (64 / 4) as u64 * 4);
    }
}

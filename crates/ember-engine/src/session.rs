use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ember_compute::{Completion, QuantBuf};
use ember_model::{Model, WeightFormat};
use ember_sampler::Sampler;

use crate::error::Result;
use crate::kv_cache::KvCache;

/// Receives every generated piece, and the one-byte terminal marker. The
/// return value is reserved; the engine never treats it as fatal.
pub type TokenSink = Box<dyn FnMut(&[u8]) -> i32 + Send>;

/// Hook run exactly once when the session is destroyed, however that
/// happens. Embedders use it to clear their handle to the session.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Stable identifier for a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Everything needed to start a generation session.
pub struct SessionOptions {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub topp: f32,
    /// RNG seed; 0 draws one from the clock.
    pub rng_seed: u64,
    /// Maximum positions to run; 0 and anything beyond the model's sequence
    /// length clamp to the sequence length.
    pub limit: usize,
    pub sink: TokenSink,
    pub on_release: Option<ReleaseHook>,
}

/// One generation context: activation scratch, KV cache, sampler state, and
/// token-stream bookkeeping. Only the scheduler thread touches this outside
/// of matmul kernels.
pub struct Session {
    // Activation buffers, sized once from the model config.
    pub(crate) x: Vec<f32>,
    pub(crate) xb: Vec<f32>,
    pub(crate) xb2: Vec<f32>,
    pub(crate) hb: Vec<f32>,
    pub(crate) hb2: Vec<f32>,
    pub(crate) q: Vec<f32>,
    pub(crate) att: Vec<f32>,
    pub(crate) logits: Vec<f32>,
    // Quantized activation scratch, present only for int8 models.
    pub(crate) xq: QuantBuf,
    pub(crate) hq: QuantBuf,
    pub(crate) kv: KvCache,
    pub(crate) sampler: Sampler,
    pub(crate) done: Arc<Completion>,
    pub(crate) prompt_tokens: Vec<u32>,
    pub(crate) pos: usize,
    pub(crate) limit: usize,
    /// Input token of the next step.
    pub(crate) token: u32,
    sink: TokenSink,
    on_release: Option<ReleaseHook>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: &Model,
        prompt_tokens: Vec<u32>,
        temperature: f32,
        topp: f32,
        rng_seed: u64,
        limit: usize,
        sink: TokenSink,
        on_release: Option<ReleaseHook>,
    ) -> Result<Session> {
        let cfg = &model.config;
        let kv_dim = cfg.kv_dim();

        let limit = if limit == 0 || limit > cfg.seq_len {
            cfg.seq_len
        } else {
            limit
        };
        let seed = if rng_seed != 0 {
            rng_seed
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        };

        // Quant scratch only carries weight for int8 models; float models
        // keep zero-length buffers that the forward pass never reads.
        let (xq, hq) = match cfg.format {
            WeightFormat::Int8Grouped => (
                QuantBuf::new(cfg.dim, cfg.group_size),
                QuantBuf::new(cfg.hidden_dim, cfg.group_size),
            ),
            WeightFormat::Float32 => (QuantBuf::new(0, 1), QuantBuf::new(0, 1)),
        };

        let first = prompt_tokens.first().copied().unwrap_or(0);

        Ok(Session {
            x: vec![0.0; cfg.dim],
            xb: vec![0.0; cfg.dim],
            xb2: vec![0.0; cfg.dim],
            hb: vec![0.0; cfg.hidden_dim],
            hb2: vec![0.0; cfg.hidden_dim],
            q: vec![0.0; cfg.dim],
            att: vec![0.0; cfg.n_heads * cfg.seq_len],
            logits: vec![0.0; cfg.vocab_size],
            xq,
            hq,
            kv: KvCache::new(cfg.n_layers, kv_dim, cfg.seq_len)?,
            sampler: Sampler::new(cfg.vocab_size, temperature, topp, seed),
            done: Arc::new(Completion::new()),
            prompt_tokens,
            pos: 0,
            limit,
            token: first,
            sink,
            on_release,
        })
    }

    /// Deliver a decoded piece, suppressing lone unprintable bytes.
    ///
    /// Multi-byte pieces pass through untouched; partial UTF-8 sequences are
    /// the receiver's concern, as with any byte stream.
    pub(crate) fn issue(&mut self, piece: &[u8]) {
        if piece.is_empty() {
            return;
        }
        if piece.len() == 1 {
            let b = piece[0];
            if !(b.is_ascii_graphic() || b.is_ascii_whitespace()) {
                return;
            }
        }
        let _ = (self.sink)(piece);
    }

    /// Deliver the synthesized one-byte terminal marker. Always sent, never
    /// filtered.
    pub(crate) fn issue_terminal(&mut self) {
        let _ = (self.sink)(b"\n");
    }

    /// Run the release hook. Safe to call more than once; the hook itself
    /// runs exactly once.
    pub(crate) fn release(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

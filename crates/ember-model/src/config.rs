use crate::error::{ModelError, Result};

/// How weight matrices are stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// Contiguous float32 in file order (legacy checkpoint).
    Float32,
    /// Int8 quants with one float32 scale per `group_size` values.
    Int8Grouped,
}

/// Prompt-shaping mode for a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Raw continuation: system and user text are concatenated.
    Generate,
    /// Llama-2 chat: the prompt is wrapped in `[INST]` / `<<SYS>>` markers.
    Chat,
}

/// Transformer hyperparameters parsed from the checkpoint header.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Feed-forward intermediate dimension.
    pub hidden_dim: usize,
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads (grouped-query attention).
    pub n_kv_heads: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length the KV cache is sized for.
    pub seq_len: usize,
    /// Quantization group size; 0 in float32 checkpoints.
    pub group_size: usize,
    /// Whether the classifier head aliases the token-embedding table.
    pub shared_classifier: bool,
    /// On-disk weight format.
    pub format: WeightFormat,
}

impl ModelConfig {
    /// Dimension of a single attention head.
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Combined key/value dimension per position.
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query heads served by each key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Check the structural invariants the forward pass relies on.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0
            || self.hidden_dim == 0
            || self.n_layers == 0
            || self.n_heads == 0
            || self.n_kv_heads == 0
            || self.vocab_size == 0
            || self.seq_len == 0
        {
            return Err(ModelError::ConfigInvalid(format!(
                "zero dimension in config: {:?}",
                self
            )));
        }
        if self.dim % self.n_heads != 0 {
            return Err(ModelError::ConfigInvalid(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::ConfigInvalid(format!(
                "n_heads {} not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.format == WeightFormat::Int8Grouped {
            if self.group_size == 0 {
                return Err(ModelError::ConfigInvalid(
                    "int8 checkpoint with group size 0".to_string(),
                ));
            }
            // Every quantized tensor's element count must split into whole
            // groups; activation vectors (dim and hidden_dim long) too.
            let gs = self.group_size;
            let sizes = [
                ("token embedding", self.vocab_size * self.dim),
                ("attention", self.dim * self.dim),
                ("kv projection", self.dim * self.kv_dim()),
                ("ffn", self.dim * self.hidden_dim),
                ("dim", self.dim),
                ("hidden_dim", self.hidden_dim),
            ];
            for (what, size) in sizes {
                if size % gs != 0 {
                    return Err(ModelError::ConfigInvalid(format!(
                        "{} size {} not divisible by group size {}",
                        what, size, gs
                    )));
                }
            }
        }
        Ok(())
    }
}

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;

use memmap2::Mmap;
use tracing::info;

use crate::access::{AccessMode, DirectRegion, ReadCacheStore, TensorSpan, WeightStore};
use crate::checkpoint::{self, layout::MatHandle};
use crate::checkpoint::layout::F32Handle;
use crate::config::{ModelConfig, ModelKind};
use crate::error::{ModelError, Result};
use crate::tokenizer::Tokenizer;
use crate::weights::Weights;

/// Everything needed to open a model.
pub struct ModelOptions {
    /// Checkpoint file (ignored in direct access mode, where the blob is
    /// already in memory).
    pub checkpoint: PathBuf,
    /// Tokenizer vocabulary file.
    pub tokenizer: PathBuf,
    /// How weight bytes are reached after construction.
    pub access: AccessMode,
    /// Registry name.
    pub name: String,
    /// Prompt-shaping mode.
    pub kind: ModelKind,
    /// Cap on concurrent sessions, if any.
    pub max_sessions: Option<usize>,
}

/// An immutable model: config, weight handles, their backing store, and the
/// tokenizer. Shared by every session; nothing here mutates after `open`.
pub struct Model {
    pub config: ModelConfig,
    pub name: String,
    pub kind: ModelKind,
    pub max_sessions: Option<usize>,
    weights: Weights,
    store: WeightStore,
    tokenizer: Tokenizer,
}

/// A resolved weight matrix in whichever format the checkpoint stores it.
pub enum MatSpan<'m> {
    F32(TensorSpan<'m>),
    Q8 {
        q: TensorSpan<'m>,
        s: TensorSpan<'m>,
    },
}

impl Model {
    /// Open a checkpoint and its tokenizer.
    ///
    /// Any failure drops the partially built state and surfaces the error;
    /// there is nothing to tear down by hand.
    pub fn open(opts: ModelOptions) -> Result<Model> {
        let (config, data_start, store, file_len) = match opts.access {
            AccessMode::Direct { base, len } => {
                // Safety: the embedder guarantees the region per the
                // AccessMode::Direct contract.
                let region = unsafe { DirectRegion::new(base, len) };
                let (config, data_start) =
                    checkpoint::read_header(&mut Cursor::new(region.bytes()))?;
                (config, data_start, WeightStore::Direct(region), len as u64)
            }
            AccessMode::Mmap => {
                let file = File::open(&opts.checkpoint)?;
                let file_len = file.metadata()?.len();
                let (config, data_start) =
                    checkpoint::read_header(&mut BufReader::new(&file))?;
                // Safety: the map is read-only and private to this model.
                let map = unsafe { Mmap::map(&file)? };
                (config, data_start, WeightStore::Mmap(map), file_len)
            }
            AccessMode::ReadCache { limit } => {
                let file = File::open(&opts.checkpoint)?;
                let file_len = file.metadata()?.len();
                let (config, data_start) =
                    checkpoint::read_header(&mut BufReader::new(&file))?;
                (
                    config,
                    data_start,
                    WeightStore::ReadCache(ReadCacheStore::new(file, limit)),
                    file_len,
                )
            }
        };

        config.validate()?;

        let layout = checkpoint::layout(&config, data_start)?;
        if layout.end > file_len {
            return Err(ModelError::ShortFile {
                need: layout.end,
                have: file_len,
            });
        }

        let weights = Weights::from_layout(layout, &store, &config)?;
        let tokenizer = Tokenizer::load(&opts.tokenizer, config.vocab_size)?;

        info!(
            name = %opts.name,
            format = ?config.format,
            dim = config.dim,
            layers = config.n_layers,
            vocab = config.vocab_size,
            "model loaded"
        );

        Ok(Model {
            config,
            name: opts.name,
            kind: opts.kind,
            max_sessions: opts.max_sessions,
            weights,
            store,
            tokenizer,
        })
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    /// Resolve a float tensor handle to a span.
    pub fn span(&self, handle: &F32Handle) -> Result<TensorSpan<'_>> {
        self.store.resolve(handle.offset, handle.byte_len())
    }

    /// Resolve a weight matrix to its span(s). The caller must keep the
    /// result alive across any matmul dispatched against it.
    pub fn mat_span(&self, handle: &MatHandle) -> Result<MatSpan<'_>> {
        match handle {
            MatHandle::F32(h) => Ok(MatSpan::F32(self.span(h)?)),
            MatHandle::Q8(h) => Ok(MatSpan::Q8 {
                q: self.store.resolve(h.q_offset, h.len)?,
                s: self
                    .store
                    .resolve(h.s_offset, h.len / self.config.group_size * 4)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DIM: usize = 8;
    const HIDDEN: usize = 16;
    const LAYERS: usize = 2;
    const VOCAB: usize = 8;
    const SEQ: usize = 16;
    const KV_DIM: usize = 4;

    fn wval(i: usize) -> f32 {
        ((i * 13 + 5) % 19) as f32 / 19.0 - 0.5
    }

    fn write_checkpoint(shared: bool) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        let vocab_field = if shared { VOCAB as i32 } else { -(VOCAB as i32) };
        for v in [8i32, 16, 2, 2, 1, vocab_field, 16] {
            f.write_i32::<LittleEndian>(v).unwrap();
        }
        let per_layer =
            DIM + DIM * DIM * 2 + DIM * KV_DIM * 2 + DIM + DIM * HIDDEN * 2 + HIDDEN * DIM;
        let mut total = VOCAB * DIM + LAYERS * per_layer + DIM + SEQ * (DIM / 2) / 2 * 2;
        if !shared {
            total += VOCAB * DIM;
        }
        for i in 0..total {
            f.write_f32::<LittleEndian>(wval(i)).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn write_tokenizer() -> NamedTempFile {
        let entries: [(f32, &[u8]); VOCAB] = [
            (0.0, b"<unk>"),
            (0.0, b"<s>"),
            (0.0, b"</s>"),
            (-1.0, b" "),
            (0.1, b"a"),
            (0.2, b"b"),
            (0.3, b"c"),
            (1.0, b"ab"),
        ];
        let mut f = NamedTempFile::new().unwrap();
        f.write_u32::<LittleEndian>(5).unwrap();
        for (score, piece) in entries {
            f.write_f32::<LittleEndian>(score).unwrap();
            f.write_u32::<LittleEndian>(piece.len() as u32).unwrap();
            f.write_all(piece).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn opts(ckpt: &NamedTempFile, tok: &NamedTempFile, access: AccessMode) -> ModelOptions {
        ModelOptions {
            checkpoint: ckpt.path().to_path_buf(),
            tokenizer: tok.path().to_path_buf(),
            access,
            name: "test".to_string(),
            kind: ModelKind::Generate,
            max_sessions: None,
        }
    }

    #[test]
    fn test_open_float_model() {
        let ckpt = write_checkpoint(true);
        let tok = write_tokenizer();
        let model = Model::open(opts(&ckpt, &tok, AccessMode::Mmap)).unwrap();

        assert_eq!(model.config.dim, DIM);
        assert_eq!(model.config.n_layers, LAYERS);
        assert!(model.config.shared_classifier);
        assert_eq!(model.weights().token_embedding.len(), VOCAB * DIM);
        // First embedding value comes straight from the weight stream.
        assert_eq!(model.weights().token_embedding[0], wval(0));
        assert_eq!(model.tokenizer().vocab().len(), VOCAB);
    }

    #[test]
    fn test_open_rejects_truncated_checkpoint() {
        let ckpt = write_checkpoint(true);
        let tok = write_tokenizer();
        let len = std::fs::metadata(ckpt.path()).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(ckpt.path())
            .unwrap()
            .set_len(len / 2)
            .unwrap();

        assert!(matches!(
            Model::open(opts(&ckpt, &tok, AccessMode::Mmap)),
            Err(ModelError::ShortFile { .. })
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let tok = write_tokenizer();
        let mut o = opts(&tok, &tok, AccessMode::Mmap);
        o.checkpoint = PathBuf::from("/nonexistent/checkpoint.bin");
        assert!(matches!(Model::open(o), Err(ModelError::Io(_))));
    }

    #[test]
    fn test_spans_identical_across_access_modes() {
        let ckpt = write_checkpoint(true);
        let tok = write_tokenizer();

        let mmap = Model::open(opts(&ckpt, &tok, AccessMode::Mmap)).unwrap();
        let cached =
            Model::open(opts(&ckpt, &tok, AccessMode::ReadCache { limit: 256 })).unwrap();

        let a = mmap.span(&mmap.weights().rms_att[1]).unwrap();
        let b = cached.span(&cached.weights().rms_att[1]).unwrap();
        assert_eq!(a.as_f32().unwrap(), b.as_f32().unwrap());
    }

    #[test]
    fn test_unshared_classifier_resolves_distinct_bytes() {
        let ckpt = write_checkpoint(false);
        let tok = write_tokenizer();
        let model = Model::open(opts(&ckpt, &tok, AccessMode::Mmap)).unwrap();
        assert!(!model.config.shared_classifier);

        let cls = model.mat_span(&model.weights().wcls).unwrap();
        let MatSpan::F32(cls) = cls else { panic!() };
        // The head was written after the whole body, so it differs from the
        // embedding table built from the start of the stream.
        assert_ne!(cls.as_f32().unwrap()[0], model.weights().token_embedding[0]);
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid model config: {0}")]
    ConfigInvalid(String),
    #[error("checkpoint truncated: weights end at byte {need}, file has {have}")]
    ShortFile { need: u64, have: u64 },
    #[error("tensor at offset {offset} is not 4-byte aligned")]
    Misaligned { offset: u64 },
    #[error("weight span out of bounds: offset {offset} + {len} exceeds {total} bytes")]
    SpanOutOfBounds { offset: u64, len: usize, total: u64 },
    #[error("out of memory caching {len} weight bytes")]
    CacheAlloc { len: usize },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("dimension mismatch: {what} has length {got}, expected {expected}")]
    DimMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("job ring full: {queued} jobs queued, capacity {capacity}")]
    RingFull { queued: usize, capacity: usize },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ComputeError>;

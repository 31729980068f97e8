use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ember_model::ModelError),
    #[error("compute error: {0}")]
    Compute(#[from] ember_compute::ComputeError),
    #[error("session limit reached for model '{model}': {limit} live")]
    SessionLimit { model: String, limit: usize },
    #[error("out of memory allocating session state: {0}")]
    SessionAlloc(String),
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! The two on-disk checkpoint formats: the legacy float32 layout and the
//! 256-byte-header int8-grouped layout.

pub mod header;
pub mod layout;

pub use header::{read_header, CHECKPOINT_MAGIC};
pub use layout::{layout, WeightLayout};

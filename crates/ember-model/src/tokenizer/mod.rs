pub mod bpe;
pub mod vocab;

pub use bpe::Tokenizer;
pub use vocab::{Vocab, TOKEN_BOS, TOKEN_EOS, TOKEN_UNK};

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{ModelError, Result};

/// Reserved unknown-token ID.
pub const TOKEN_UNK: u32 = 0;
/// Reserved begin-of-sequence ID (`<s>`).
pub const TOKEN_BOS: u32 = 1;
/// Reserved end-of-sequence ID (`</s>`).
pub const TOKEN_EOS: u32 = 2;

/// Token vocabulary: piece bytes and merge scores by ID, plus a
/// sorted-by-piece index for binary-search lookup.
pub struct Vocab {
    pieces: Vec<Vec<u8>>,
    scores: Vec<f32>,
    /// Token IDs ordered by their piece bytes.
    sorted: Vec<u32>,
    max_piece_len: usize,
}

impl Vocab {
    /// Load a vocabulary file: `u32 max_token_length`, then per entry
    /// `{f32 score, u32 len, len piece bytes}` in ID order.
    pub fn load(path: &Path, vocab_size: usize) -> Result<Vocab> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let max_piece_len = reader.read_u32::<LittleEndian>()? as usize;

        let mut pieces = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            let score = reader.read_f32::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()? as usize;
            if len > max_piece_len {
                return Err(ModelError::Tokenizer(format!(
                    "piece length {} exceeds declared maximum {}",
                    len, max_piece_len
                )));
            }
            let mut piece = vec![0u8; len];
            reader.read_exact(&mut piece)?;
            scores.push(score);
            pieces.push(piece);
        }

        Ok(Vocab::from_entries(pieces, scores, max_piece_len))
    }

    /// Build a vocabulary from in-memory pieces and scores.
    pub fn from_entries(pieces: Vec<Vec<u8>>, scores: Vec<f32>, max_piece_len: usize) -> Vocab {
        debug_assert_eq!(pieces.len(), scores.len());
        let mut sorted: Vec<u32> = (0..pieces.len() as u32).collect();
        sorted.sort_unstable_by(|&a, &b| pieces[a as usize].cmp(&pieces[b as usize]));
        Vocab {
            pieces,
            scores,
            sorted,
            max_piece_len,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Longest piece in bytes, as declared by the file.
    pub fn max_piece_len(&self) -> usize {
        self.max_piece_len
    }

    /// Raw bytes of a token's piece.
    pub fn piece(&self, id: u32) -> &[u8] {
        &self.pieces[id as usize]
    }

    /// Merge score of a token.
    pub fn score(&self, id: u32) -> f32 {
        self.scores[id as usize]
    }

    /// Find the token whose piece is exactly `piece`.
    pub fn lookup(&self, piece: &[u8]) -> Option<u32> {
        self.sorted
            .binary_search_by(|&id| self.pieces[id as usize].as_slice().cmp(piece))
            .ok()
            .map(|slot| self.sorted[slot])
    }
}

use std::borrow::Cow;
use std::path::Path;

use crate::error::Result;
use super::vocab::{Vocab, TOKEN_BOS, TOKEN_EOS};

/// Reserved IDs precede the byte-fallback range, so raw byte `b` encodes as
/// token `b + 3`.
const BYTE_FALLBACK_OFFSET: u32 = 3;

/// SentencePiece-style BPE encoder/decoder over a score-ranked vocabulary.
pub struct Tokenizer {
    vocab: Vocab,
}

impl Tokenizer {
    pub fn new(vocab: Vocab) -> Tokenizer {
        Tokenizer { vocab }
    }

    /// Load the tokenizer's vocabulary file.
    pub fn load(path: &Path, vocab_size: usize) -> Result<Tokenizer> {
        Ok(Tokenizer {
            vocab: Vocab::load(path, vocab_size)?,
        })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Encode text to token IDs by greedy highest-score pair merging.
    ///
    /// A literal `" "` piece is prepended to non-empty input (the dummy-prefix
    /// convention; kept even where it is not the ideal BPE choice). Unknown
    /// codepoints fall back to one token per raw byte.
    pub fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<u32> {
        let mut tokens = Vec::new();

        if add_bos {
            tokens.push(TOKEN_BOS);
        }
        if !text.is_empty() {
            if let Some(id) = self.vocab.lookup(b" ") {
                tokens.push(id);
            }
        }

        // Emit one token per codepoint (leading byte has its top bits not
        // equal to 10), or per raw byte where the piece is absent.
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] & 0xC0 == 0x80 && j - i < 4 {
                j += 1;
            }
            match self.vocab.lookup(&bytes[i..j]) {
                Some(id) => tokens.push(id),
                None => {
                    for &b in &bytes[i..j] {
                        tokens.push(b as u32 + BYTE_FALLBACK_OFFSET);
                    }
                }
            }
            i = j;
        }

        // Greedily merge the adjacent pair whose concatenation has the
        // highest score; ties keep the earliest pair.
        let mut merged = Vec::with_capacity(self.vocab.max_piece_len() * 2);
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best: Option<(usize, u32)> = None;

            for idx in 0..tokens.len().saturating_sub(1) {
                merged.clear();
                merged.extend_from_slice(self.vocab.piece(tokens[idx]));
                merged.extend_from_slice(self.vocab.piece(tokens[idx + 1]));
                if let Some(id) = self.vocab.lookup(&merged) {
                    let score = self.vocab.score(id);
                    if score > best_score {
                        best_score = score;
                        best = Some((idx, id));
                    }
                }
            }

            match best {
                Some((idx, id)) => {
                    tokens[idx] = id;
                    tokens.remove(idx + 1);
                }
                None => break,
            }
        }

        if add_eos {
            tokens.push(TOKEN_EOS);
        }
        tokens
    }

    /// Decode one token in sequence context.
    ///
    /// Following a BOS, the piece's leading space is stripped (undoing the
    /// dummy prefix). `<0xHH>` and `<0xHHHH>` escape pieces decode to their
    /// raw bytes; everything else is the piece verbatim.
    pub fn decode(&self, prev: u32, token: u32) -> Cow<'_, [u8]> {
        let mut piece = self.vocab.piece(token);
        if prev == TOKEN_BOS && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        match parse_byte_escape(piece) {
            Some(bytes) => Cow::Owned(bytes),
            None => Cow::Borrowed(piece),
        }
    }
}

/// Parse `<0xHH>` or `<0xHHHH>` into the bytes they stand for.
fn parse_byte_escape(piece: &[u8]) -> Option<Vec<u8>> {
    if !(piece.starts_with(b"<0x") && piece.ends_with(b">")) {
        return None;
    }
    let hex = std::str::from_utf8(&piece[3..piece.len() - 1]).ok()?;
    match hex.len() {
        2 => {
            let b = u8::from_str_radix(hex, 16).ok()?;
            Some(vec![b])
        }
        4 => {
            let v = u16::from_str_radix(hex, 16).ok()?;
            Some(v.to_be_bytes().to_vec())
        }
        _ => None,
    }
}

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::config::{ModelConfig, WeightFormat};
use crate::error::{ModelError, Result};

/// Magic number at offset 0 of int8-grouped checkpoints ("ak42" as LE bytes).
pub const CHECKPOINT_MAGIC: u32 = 0x616b_3432;

/// Only int8-grouped version currently produced.
const INT8_VERSION: u32 = 2;

/// Header size of the legacy float32 format: seven u32 fields.
pub const LEGACY_HEADER_BYTES: u64 = 28;

/// Fixed header size of the int8-grouped format.
pub const INT8_HEADER_BYTES: u64 = 256;

/// Parse a checkpoint header, returning the config and the byte offset at
/// which weight data begins.
///
/// The first word decides the format: the magic selects the 256-byte
/// int8-grouped header, anything else is read as the `dim` field of the
/// legacy layout. In the legacy layout a negative `vocab_size` signals that
/// the classifier head is stored separately from the embedding table.
pub fn read_header<R: Read>(reader: &mut R) -> Result<(ModelConfig, u64)> {
    let first = reader.read_u32::<LittleEndian>()?;
    if first == CHECKPOINT_MAGIC {
        read_int8_header(reader)
    } else {
        read_legacy_header(first as i32, reader)
    }
}

fn read_legacy_header<R: Read>(dim: i32, reader: &mut R) -> Result<(ModelConfig, u64)> {
    let hidden_dim = reader.read_i32::<LittleEndian>()?;
    let n_layers = reader.read_i32::<LittleEndian>()?;
    let n_heads = reader.read_i32::<LittleEndian>()?;
    let n_kv_heads = reader.read_i32::<LittleEndian>()?;
    let vocab_size = reader.read_i32::<LittleEndian>()?;
    let seq_len = reader.read_i32::<LittleEndian>()?;

    for (what, v) in [
        ("dim", dim),
        ("hidden_dim", hidden_dim),
        ("n_layers", n_layers),
        ("n_heads", n_heads),
        ("n_kv_heads", n_kv_heads),
        ("seq_len", seq_len),
    ] {
        if v <= 0 {
            return Err(ModelError::ConfigInvalid(format!(
                "non-positive {} in checkpoint header: {}",
                what, v
            )));
        }
    }
    if vocab_size == 0 {
        return Err(ModelError::ConfigInvalid(
            "zero vocab_size in checkpoint header".to_string(),
        ));
    }

    let config = ModelConfig {
        dim: dim as usize,
        hidden_dim: hidden_dim as usize,
        n_layers: n_layers as usize,
        n_heads: n_heads as usize,
        n_kv_heads: n_kv_heads as usize,
        vocab_size: vocab_size.unsigned_abs() as usize,
        seq_len: seq_len as usize,
        group_size: 0,
        shared_classifier: vocab_size > 0,
        format: WeightFormat::Float32,
    };
    Ok((config, LEGACY_HEADER_BYTES))
}

fn read_int8_header<R: Read>(reader: &mut R) -> Result<(ModelConfig, u64)> {
    let version = reader.read_u32::<LittleEndian>()?;
    if version != INT8_VERSION {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let dim = reader.read_u32::<LittleEndian>()? as usize;
    let hidden_dim = reader.read_u32::<LittleEndian>()? as usize;
    let n_layers = reader.read_u32::<LittleEndian>()? as usize;
    let n_heads = reader.read_u32::<LittleEndian>()? as usize;
    let n_kv_heads = reader.read_u32::<LittleEndian>()? as usize;
    let vocab_size = reader.read_u32::<LittleEndian>()? as usize;
    let seq_len = reader.read_u32::<LittleEndian>()? as usize;
    let shared_classifier = reader.read_u8()? != 0;
    let group_size = reader.read_u32::<LittleEndian>()? as usize;

    // Consume the padding up to the fixed header size.
    let consumed: usize = 4 + 4 + 7 * 4 + 1 + 4;
    let mut pad = [0u8; INT8_HEADER_BYTES as usize];
    reader.read_exact(&mut pad[..INT8_HEADER_BYTES as usize - consumed])?;

    let config = ModelConfig {
        dim,
        hidden_dim,
        n_layers,
        n_heads,
        n_kv_heads,
        vocab_size,
        seq_len,
        group_size,
        shared_classifier,
        format: WeightFormat::Int8Grouped,
    };
    Ok((config, INT8_HEADER_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn legacy_bytes(vocab: i32) -> Vec<u8> {
        let mut out = Vec::new();
        for v in [8i32, 16, 2, 2, 1, vocab, 16] {
            out.write_i32::<LittleEndian>(v).unwrap();
        }
        out
    }

    #[test]
    fn test_legacy_header_shared_classifier() {
        let bytes = legacy_bytes(8);
        let (cfg, data_start) = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(cfg.format, WeightFormat::Float32);
        assert_eq!(cfg.vocab_size, 8);
        assert!(cfg.shared_classifier);
        assert_eq!(data_start, LEGACY_HEADER_BYTES);
    }

    #[test]
    fn test_legacy_header_negative_vocab_sentinel() {
        let bytes = legacy_bytes(-8);
        let (cfg, _) = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(cfg.vocab_size, 8);
        assert!(!cfg.shared_classifier);
    }

    #[test]
    fn test_legacy_header_rejects_bad_dims() {
        let mut out = Vec::new();
        for v in [0i32, 16, 2, 2, 1, 8, 16] {
            out.write_i32::<LittleEndian>(v).unwrap();
        }
        assert!(matches!(
            read_header(&mut Cursor::new(out)),
            Err(ModelError::ConfigInvalid(_))
        ));
    }

    fn int8_bytes(version: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(CHECKPOINT_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(version).unwrap();
        for v in [8u32, 16, 2, 2, 1, 8, 16] {
            out.write_u32::<LittleEndian>(v).unwrap();
        }
        out.write_u8(1).unwrap();
        out.write_u32::<LittleEndian>(4).unwrap();
        out.resize(INT8_HEADER_BYTES as usize, 0);
        out
    }

    #[test]
    fn test_int8_header() {
        let (cfg, data_start) = read_header(&mut Cursor::new(int8_bytes(2))).unwrap();
        assert_eq!(cfg.format, WeightFormat::Int8Grouped);
        assert_eq!(cfg.group_size, 4);
        assert!(cfg.shared_classifier);
        assert_eq!(data_start, INT8_HEADER_BYTES);
    }

    #[test]
    fn test_int8_header_rejects_unknown_version() {
        assert!(matches!(
            read_header(&mut Cursor::new(int8_bytes(3))),
            Err(ModelError::UnsupportedVersion(3))
        ));
    }
}

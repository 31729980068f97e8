//! Shared test fixtures: tiny synthetic checkpoints and a matching
//! tokenizer file, written to temp files in the real on-disk formats.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use tempfile::NamedTempFile;

use ember_compute::quant::{quantize, QuantBuf};
use ember_model::{AccessMode, ModelKind, ModelOptions};

pub(crate) const DIM: usize = 8;
pub(crate) const HIDDEN: usize = 16;
pub(crate) const LAYERS: usize = 2;
pub(crate) const HEADS: usize = 2;
pub(crate) const KV_HEADS: usize = 1;
/// Three reserved tokens, the 256 byte pieces at IDs 3..258 (so byte
/// fallback always lands in range), and five word pieces.
pub(crate) const VOCAB: usize = 3 + 256 + 5;
pub(crate) const SEQ: usize = 32;
pub(crate) const GS: usize = 4;

const KV_DIM: usize = DIM * KV_HEADS / HEADS;

/// Deterministic, small, mixed-sign weight stream.
fn wval(i: usize) -> f32 {
    (((i * 37 + 11) % 41) as f32 / 41.0 - 0.5) * 0.8
}

fn put_f32s(out: &mut impl Write, idx: &mut usize, n: usize) {
    for _ in 0..n {
        out.write_f32::<LittleEndian>(wval(*idx)).unwrap();
        *idx += 1;
    }
}

/// Write a legacy float32 checkpoint for the fixture config.
pub(crate) fn write_float_checkpoint(shared_classifier: bool) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    let vocab_field = if shared_classifier {
        VOCAB as i32
    } else {
        -(VOCAB as i32)
    };
    for v in [
        DIM as i32,
        HIDDEN as i32,
        LAYERS as i32,
        HEADS as i32,
        KV_HEADS as i32,
        vocab_field,
        SEQ as i32,
    ] {
        f.write_i32::<LittleEndian>(v).unwrap();
    }

    let mut idx = 0;
    put_f32s(&mut f, &mut idx, VOCAB * DIM); // embedding
    put_f32s(&mut f, &mut idx, LAYERS * DIM); // rms_att
    put_f32s(&mut f, &mut idx, LAYERS * DIM * DIM); // wq
    put_f32s(&mut f, &mut idx, LAYERS * DIM * KV_DIM); // wk
    put_f32s(&mut f, &mut idx, LAYERS * DIM * KV_DIM); // wv
    put_f32s(&mut f, &mut idx, LAYERS * DIM * DIM); // wo
    put_f32s(&mut f, &mut idx, LAYERS * DIM); // rms_ffn
    put_f32s(&mut f, &mut idx, LAYERS * DIM * HIDDEN); // w1
    put_f32s(&mut f, &mut idx, LAYERS * HIDDEN * DIM); // w2
    put_f32s(&mut f, &mut idx, LAYERS * DIM * HIDDEN); // w3
    put_f32s(&mut f, &mut idx, DIM); // rms_final

    // Legacy RoPE tables, skipped by the loader but present in the file.
    for _ in 0..SEQ * (DIM / HEADS) {
        f.write_f32::<LittleEndian>(0.0).unwrap();
    }

    if !shared_classifier {
        put_f32s(&mut f, &mut idx, VOCAB * DIM);
    }

    f.flush().unwrap();
    f
}

fn put_q8(out: &mut impl Write, idx: &mut usize, n: usize) {
    let vals: Vec<f32> = (0..n)
        .map(|_| {
            let v = wval(*idx);
            *idx += 1;
            v
        })
        .collect();
    let mut buf = QuantBuf::new(n, GS);
    quantize(&mut buf, &vals, GS);
    for &q in &buf.q {
        out.write_i8(q).unwrap();
    }
    for &s in &buf.s {
        out.write_f32::<LittleEndian>(s).unwrap();
    }
}

/// Write an int8-grouped checkpoint for the fixture config.
pub(crate) fn write_int8_checkpoint(shared_classifier: bool) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_u32::<LittleEndian>(0x616b_3432).unwrap();
    f.write_u32::<LittleEndian>(2).unwrap();
    for v in [DIM, HIDDEN, LAYERS, HEADS, KV_HEADS, VOCAB, SEQ] {
        f.write_u32::<LittleEndian>(v as u32).unwrap();
    }
    f.write_u8(shared_classifier as u8).unwrap();
    f.write_u32::<LittleEndian>(GS as u32).unwrap();
    f.write_all(&vec![0u8; 256 - 41]).unwrap();

    let mut idx = 0;
    put_f32s(&mut f, &mut idx, LAYERS * DIM); // rms_att
    put_f32s(&mut f, &mut idx, LAYERS * DIM); // rms_ffn
    put_f32s(&mut f, &mut idx, DIM); // rms_final

    put_q8(&mut f, &mut idx, VOCAB * DIM); // q_tokens
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * DIM); // wq
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * KV_DIM); // wk
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * KV_DIM); // wv
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * DIM); // wo
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * HIDDEN); // w1
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, HIDDEN * DIM); // w2
    }
    for _ in 0..LAYERS {
        put_q8(&mut f, &mut idx, DIM * HIDDEN); // w3
    }
    if !shared_classifier {
        put_q8(&mut f, &mut idx, VOCAB * DIM);
    }

    f.flush().unwrap();
    f
}

/// Write the fixture vocabulary: reserved tokens, the byte-piece range, and
/// a handful of letter pieces with one merge target.
pub(crate) fn write_tokenizer() -> NamedTempFile {
    let mut entries: Vec<(f32, Vec<u8>)> = vec![
        (0.0, b"<unk>".to_vec()),
        (0.0, b"<s>".to_vec()),
        (0.0, b"</s>".to_vec()),
    ];
    for b in 0u16..=255 {
        entries.push((-1_000_000.0, format!("<0x{:02X}>", b).into_bytes()));
    }
    entries.push((-1.0, b" ".to_vec()));
    entries.push((0.1, b"a".to_vec()));
    entries.push((0.2, b"b".to_vec()));
    entries.push((0.3, b"c".to_vec()));
    entries.push((1.0, b"ab".to_vec()));
    assert_eq!(entries.len(), VOCAB);

    let mut f = NamedTempFile::new().unwrap();
    let max_len = entries.iter().map(|(_, p)| p.len()).max().unwrap();
    f.write_u32::<LittleEndian>(max_len as u32).unwrap();
    for (score, piece) in entries {
        f.write_f32::<LittleEndian>(score).unwrap();
        f.write_u32::<LittleEndian>(piece.len() as u32).unwrap();
        f.write_all(&piece).unwrap();
    }
    f.flush().unwrap();
    f
}

pub(crate) fn model_options(
    checkpoint: &NamedTempFile,
    tokenizer: &NamedTempFile,
    access: AccessMode,
    name: &str,
) -> ModelOptions {
    ModelOptions {
        checkpoint: checkpoint.path().to_path_buf(),
        tokenizer: tokenizer.path().to_path_buf(),
        access,
        name: name.to_string(),
        kind: ModelKind::Generate,
        max_sessions: None,
    }
}

//! Group quantization of activation vectors.
//!
//! Weights arrive pre-quantized in the checkpoint; activations are quantized
//! on the fly before every int8 matmul. A vector of length `n` is split into
//! `n / group_size` runs, each sharing one f32 scale, so the inner kernel can
//! accumulate whole groups in i32 before touching floats.

/// Largest magnitude representable in a signed 8-bit quant.
pub const Q_MAX: f32 = 127.0;

/// A group-quantized vector: `q[i]` reconstructs as `q[i] as f32 * s[i / group_size]`.
pub struct QuantBuf {
    /// Quantized values.
    pub q: Vec<i8>,
    /// One scale per group of `group_size` consecutive values.
    pub s: Vec<f32>,
}

impl QuantBuf {
    /// Allocate a zeroed quantization buffer for vectors of length `len`.
    ///
    /// `len` must be a multiple of `group_size`; the model config validates
    /// this once at load time.
    pub fn new(len: usize, group_size: usize) -> QuantBuf {
        debug_assert!(group_size > 0 && len % group_size == 0);
        QuantBuf {
            q: vec![0; len],
            s: vec![0.0; len / group_size],
        }
    }
}

/// Quantize `x` into `buf` with one scale per `group_size` values.
///
/// Each group's scale is `max|x| / 127`; an all-zero group keeps scale 0 and
/// quantizes to zeros rather than dividing by it.
pub fn quantize(buf: &mut QuantBuf, x: &[f32], group_size: usize) {
    debug_assert_eq!(buf.q.len(), x.len());
    debug_assert_eq!(x.len() % group_size, 0);

    for (group, chunk) in x.chunks_exact(group_size).enumerate() {
        let wmax = chunk.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let scale = wmax / Q_MAX;
        buf.s[group] = scale;

        let out = &mut buf.q[group * group_size..(group + 1) * group_size];
        if scale == 0.0 {
            out.fill(0);
        } else {
            for (q, &v) in out.iter_mut().zip(chunk) {
                *q = (v / scale).round() as i8;
            }
        }
    }
}

/// Reconstruct floats from a quantized run: `out[i] = q[i] * s[i / group_size]`.
pub fn dequantize(q: &[i8], s: &[f32], group_size: usize, out: &mut [f32]) {
    debug_assert_eq!(q.len(), out.len());
    debug_assert_eq!(q.len() % group_size, 0);

    for (i, (&qv, o)) in q.iter().zip(out.iter_mut()).enumerate() {
        *o = qv as f32 * s[i / group_size];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_dequantize_close() {
        let x: Vec<f32> = (0..16).map(|i| (i as f32 - 8.0) / 3.0).collect();
        let mut buf = QuantBuf::new(16, 4);
        quantize(&mut buf, &x, 4);

        let mut back = vec![0.0f32; 16];
        dequantize(&buf.q, &buf.s, 4, &mut back);

        // One quantization step per group is bounded by scale / 2.
        for (group, chunk) in x.chunks_exact(4).enumerate() {
            let tol = buf.s[group] / 2.0 + 1e-6;
            for (a, b) in chunk.iter().zip(&back[group * 4..(group + 1) * 4]) {
                assert!((a - b).abs() <= tol, "{} vs {} (tol {})", a, b, tol);
            }
        }
    }

    #[test]
    fn test_quantize_zero_group() {
        let x = vec![0.0f32; 8];
        let mut buf = QuantBuf::new(8, 4);
        quantize(&mut buf, &x, 4);
        assert!(buf.q.iter().all(|&q| q == 0));
        assert!(buf.s.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_quantize_saturates_at_q_max() {
        let x = vec![1.0f32, -1.0, 0.5, 0.25];
        let mut buf = QuantBuf::new(4, 4);
        quantize(&mut buf, &x, 4);
        assert_eq!(buf.q[0], 127);
        assert_eq!(buf.q[1], -127);
    }
}

//! Row-range matrix-vector kernels.
//!
//! Both kernels compute a contiguous band of output rows of `y = W . x` for a
//! weight matrix of shape `(d, n)`. The caller passes only the band: `out`
//! holds `rows` output values and the weight slices cover exactly those rows,
//! which lets the worker pool hand disjoint bands to different threads.

/// Float path: `out[i] = sum_j w[i*n + j] * x[j]` for each row in the band.
///
/// `w.len()` must equal `out.len() * n` and `x.len()` must equal `n`.
pub fn matmul_rows(out: &mut [f32], x: &[f32], w: &[f32], n: usize) {
    debug_assert_eq!(x.len(), n);
    debug_assert_eq!(w.len(), out.len() * n);

    for (i, o) in out.iter_mut().enumerate() {
        let row = &w[i * n..(i + 1) * n];
        let mut sum = 0.0f32;
        for (wv, xv) in row.iter().zip(x) {
            sum += wv * xv;
        }
        *o = sum;
    }
}

/// Int8-grouped path over a pre-quantized activation vector.
///
/// For each output row, whole groups of `group_size` products are accumulated
/// in i32 and only then scaled by the weight-group and activation-group
/// scales. `wq`/`ws` cover exactly the band (`out.len() * n` quants and the
/// matching scales); `n` must be a multiple of `group_size`.
pub fn matmul_q8_rows(
    out: &mut [f32],
    xq: &[i8],
    xs: &[f32],
    wq: &[i8],
    ws: &[f32],
    n: usize,
    group_size: usize,
) {
    debug_assert_eq!(xq.len(), n);
    debug_assert_eq!(wq.len(), out.len() * n);
    debug_assert_eq!(n % group_size, 0);

    for (i, o) in out.iter_mut().enumerate() {
        let i_n = i * n;
        let mut val = 0.0f32;
        let mut j = 0;
        while j < n {
            let mut ival = 0i32;
            for k in 0..group_size {
                ival += xq[j + k] as i32 * wq[i_n + j + k] as i32;
            }
            val += ival as f32 * ws[(i_n + j) / group_size] * xs[j / group_size];
            j += group_size;
        }
        *o = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{quantize, QuantBuf};
    use approx::assert_relative_eq;

    #[test]
    fn test_matmul_identity() {
        // 2x2 identity times [3, 4]
        let w = vec![1.0, 0.0, 0.0, 1.0];
        let x = vec![3.0, 4.0];
        let mut out = vec![0.0; 2];
        matmul_rows(&mut out, &x, &w, 2);
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn test_matmul_basic() {
        // [1,2;3,4] . [5,6] = [17, 39]
        let w = vec![1.0, 2.0, 3.0, 4.0];
        let x = vec![5.0, 6.0];
        let mut out = vec![0.0; 2];
        matmul_rows(&mut out, &x, &w, 2);
        assert_eq!(out, vec![17.0, 39.0]);
    }

    #[test]
    fn test_matmul_band_matches_full() {
        let n = 8;
        let d = 6;
        let w: Vec<f32> = (0..d * n).map(|i| ((i * 7 + 3) % 11) as f32 - 5.0).collect();
        let x: Vec<f32> = (0..n).map(|i| (i as f32 + 1.0) / 4.0).collect();

        let mut full = vec![0.0; d];
        matmul_rows(&mut full, &x, &w, n);

        // Same result computed as two bands.
        let mut banded = vec![0.0; d];
        matmul_rows(&mut banded[..3], &x, &w[..3 * n], n);
        matmul_rows(&mut banded[3..], &x, &w[3 * n..], n);
        assert_eq!(full, banded);
    }

    #[test]
    fn test_matmul_q8_tracks_float() {
        let n = 8;
        let d = 4;
        let gs = 4;
        let w: Vec<f32> = (0..d * n).map(|i| ((i * 13 + 5) % 17) as f32 / 17.0 - 0.5).collect();
        let x: Vec<f32> = (0..n).map(|i| ((i * 3 + 1) % 7) as f32 / 7.0 - 0.5).collect();

        let mut expect = vec![0.0; d];
        matmul_rows(&mut expect, &x, &w, n);

        let mut wbuf = QuantBuf::new(d * n, gs);
        quantize(&mut wbuf, &w, gs);
        let mut xbuf = QuantBuf::new(n, gs);
        quantize(&mut xbuf, &x, gs);

        let mut out = vec![0.0; d];
        matmul_q8_rows(&mut out, &xbuf.q, &xbuf.s, &wbuf.q, &wbuf.s, n, gs);

        for (a, b) in expect.iter().zip(&out) {
            assert_relative_eq!(a, b, epsilon = 0.05);
        }
    }
}

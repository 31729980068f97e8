//! Element-wise math of the forward pass.
//!
//! Everything here runs on the scheduler thread between matmul barriers, so
//! the functions are plain single-vector loops with no synchronization.

/// Epsilon added to the mean square before the root.
const RMS_NORM_EPS: f32 = 1e-5;

/// RMS normalization: `out[j] = w[j] * x[j] / sqrt(mean(x^2) + eps)`.
pub fn rms_norm(out: &mut [f32], x: &[f32], w: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(w.len(), x.len());

    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    ss = 1.0 / (ss / x.len() as f32 + RMS_NORM_EPS).sqrt();

    for ((o, &xv), &wv) in out.iter_mut().zip(x).zip(w) {
        *o = wv * (ss * xv);
    }
}

/// In-place softmax with max-shift for numerical stability.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Rotary positional encoding at position `pos`.
///
/// Rotates adjacent channel pairs of `q` (and of `k` while the pair index is
/// below `k.len()`, the key/value dimension) by
/// `theta = pos * 10000^(-(i mod head_size) / head_size)`.
pub fn rope(q: &mut [f32], k: &mut [f32], pos: usize, head_size: usize) {
    debug_assert!(k.len() <= q.len());

    let mut i = 0;
    while i < q.len() {
        let head_dim = (i % head_size) as f32;
        let freq = 1.0 / 10000.0f32.powf(head_dim / head_size as f32);
        let theta = pos as f32 * freq;
        let (fci, fcr) = theta.sin_cos();

        let (v0, v1) = (q[i], q[i + 1]);
        q[i] = v0 * fcr - v1 * fci;
        q[i + 1] = v0 * fci + v1 * fcr;

        if i < k.len() {
            let (v0, v1) = (k[i], k[i + 1]);
            k[i] = v0 * fcr - v1 * fci;
            k[i + 1] = v0 * fci + v1 * fcr;
        }
        i += 2;
    }
}

/// SwiGLU gate: `hb[i] = hb[i] * sigmoid(hb[i]) * hb2[i]`.
pub fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    debug_assert_eq!(hb.len(), hb2.len());
    for (g, &u) in hb.iter_mut().zip(hb2) {
        let v = *g;
        *g = v * (1.0 / (1.0 + (-v).exp())) * u;
    }
}

/// Residual accumulate: `x[i] += y[i]`.
pub fn accum(x: &mut [f32], y: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    for (a, &b) in x.iter_mut().zip(y) {
        *a += b;
    }
}

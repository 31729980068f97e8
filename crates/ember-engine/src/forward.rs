//! The single-token forward pass.
//!
//! One call advances a session by one position: embedding lookup, every
//! transformer layer (attention and FFN, each as dispatch/barrier pairs
//! around the scheduler-thread math), final norm, and the classifier.
//! Weight spans resolved for a dispatch are held until its barrier so the
//! bytes cannot be released while workers read them.

use std::sync::Arc;

use ember_compute::{ops, quant, Completion, QuantBuf, WorkerPool};
use ember_model::{MatHandle, MatSpan, Model, WeightFormat};

use crate::error::{EngineError, Result};
use crate::session::Session;

/// Advance `s` by one token at position `pos`, leaving next-token logits in
/// `s.logits`.
pub(crate) fn forward(
    model: &Model,
    pool: &WorkerPool,
    s: &mut Session,
    token: u32,
    pos: usize,
) -> Result<()> {
    let cfg = &model.config;
    let dim = cfg.dim;
    let hidden = cfg.hidden_dim;
    let head_size = cfg.head_size();
    let kv_mul = cfg.kv_mul();
    let seq_len = cfg.seq_len;
    let gs = cfg.group_size;
    let quantized = cfg.format == WeightFormat::Int8Grouped;
    let w = model.weights();

    // Embedding lookup; the table is f32 in memory for both formats.
    let row = &w.token_embedding[token as usize * dim..(token as usize + 1) * dim];
    s.x.copy_from_slice(row);

    for l in 0..cfg.n_layers {
        {
            let rms = model.span(&w.rms_att[l])?;
            ops::rms_norm(&mut s.xb, &s.x, rms.as_f32()?);
        }

        // QKV burst: three dispatches, one barrier. Keys and values land
        // directly in this position's cache rows.
        if quantized {
            quant::quantize(&mut s.xq, &s.xb, gs);
        }
        {
            let (k_row, v_row) = s.kv.rows_mut(l, pos);
            let mut burst = MatmulBurst::new(pool, &s.done, model);
            burst.dispatch(&w.wq[l], &s.xb, &s.xq, &mut s.q, dim);
            burst.dispatch(&w.wk[l], &s.xb, &s.xq, k_row, dim);
            burst.dispatch(&w.wv[l], &s.xb, &s.xq, v_row, dim);
            burst.barrier()?;
        }

        ops::rope(&mut s.q, s.kv.key_row_mut(l, pos), pos, head_size);

        // Multi-head attention over the cache, grouped-query: each KV head
        // serves kv_mul query heads.
        let scale = (head_size as f32).sqrt();
        for h in 0..cfg.n_heads {
            let q = &s.q[h * head_size..(h + 1) * head_size];
            let kv_head = h / kv_mul;
            let att = &mut s.att[h * seq_len..h * seq_len + pos + 1];

            for (t, slot) in att.iter_mut().enumerate() {
                let k = &s.kv.key_row(l, t)[kv_head * head_size..(kv_head + 1) * head_size];
                let mut score = 0.0f32;
                for (qv, kval) in q.iter().zip(k) {
                    score += qv * kval;
                }
                *slot = score / scale;
            }

            ops::softmax(att);

            let out = &mut s.xb[h * head_size..(h + 1) * head_size];
            out.fill(0.0);
            for (t, &a) in att.iter().enumerate() {
                let v = &s.kv.value_row(l, t)[kv_head * head_size..(kv_head + 1) * head_size];
                for (o, vv) in out.iter_mut().zip(v) {
                    *o += a * vv;
                }
            }
        }

        // Attention output projection and residual.
        if quantized {
            quant::quantize(&mut s.xq, &s.xb, gs);
        }
        {
            let mut burst = MatmulBurst::new(pool, &s.done, model);
            burst.dispatch(&w.wo[l], &s.xb, &s.xq, &mut s.xb2, dim);
            burst.barrier()?;
        }
        ops::accum(&mut s.x, &s.xb2);

        // FFN: norm, gate/up under one barrier, SwiGLU, down, residual.
        {
            let rms = model.span(&w.rms_ffn[l])?;
            ops::rms_norm(&mut s.xb, &s.x, rms.as_f32()?);
        }
        if quantized {
            quant::quantize(&mut s.xq, &s.xb, gs);
        }
        {
            let mut burst = MatmulBurst::new(pool, &s.done, model);
            burst.dispatch(&w.w1[l], &s.xb, &s.xq, &mut s.hb, dim);
            burst.dispatch(&w.w3[l], &s.xb, &s.xq, &mut s.hb2, dim);
            burst.barrier()?;
        }
        ops::swiglu(&mut s.hb, &s.hb2);
        if quantized {
            quant::quantize(&mut s.hq, &s.hb, gs);
        }
        {
            let mut burst = MatmulBurst::new(pool, &s.done, model);
            burst.dispatch(&w.w2[l], &s.hb, &s.hq, &mut s.xb, hidden);
            burst.barrier()?;
        }
        ops::accum(&mut s.x, &s.xb);
    }

    // Final norm into xb, then the classifier head.
    {
        let rms = model.span(&w.rms_final)?;
        ops::rms_norm(&mut s.xb, &s.x, rms.as_f32()?);
    }
    if quantized {
        quant::quantize(&mut s.xq, &s.xb, gs);
    }
    {
        let mut burst = MatmulBurst::new(pool, &s.done, model);
        burst.dispatch(&w.wcls, &s.xb, &s.xq, &mut s.logits, dim);
        burst.barrier()?;
    }

    Ok(())
}

/// One dispatch-until-barrier unit.
///
/// Collects the weight spans of every dispatched matmul and refuses to give
/// them up before the barrier, so a mid-burst failure still drains the jobs
/// that did enqueue before the error surfaces. Without that, a failed `wk`
/// resolve could tear down the session while `wq`'s workers were still
/// writing into it.
struct MatmulBurst<'m> {
    pool: &'m WorkerPool,
    done: Arc<Completion>,
    model: &'m Model,
    held: Vec<MatSpan<'m>>,
    failed: Option<EngineError>,
}

impl<'m> MatmulBurst<'m> {
    fn new(pool: &'m WorkerPool, done: &Arc<Completion>, model: &'m Model) -> MatmulBurst<'m> {
        MatmulBurst {
            pool,
            done: done.clone(),
            model,
            held: Vec::with_capacity(3),
            failed: None,
        }
    }

    /// Resolve `handle` and dispatch `out = w . x` (or its quantized form).
    /// After a failure the burst goes inert; the error comes out of
    /// [`MatmulBurst::barrier`].
    fn dispatch(&mut self, handle: &MatHandle, x: &[f32], xq: &QuantBuf, out: &mut [f32], n: usize) {
        if self.failed.is_some() {
            return;
        }
        match self.begin(handle, x, xq, out, n) {
            Ok(span) => self.held.push(span),
            Err(err) => self.failed = Some(err),
        }
    }

    fn begin(
        &self,
        handle: &MatHandle,
        x: &[f32],
        xq: &QuantBuf,
        out: &mut [f32],
        n: usize,
    ) -> Result<MatSpan<'m>> {
        let span = self.model.mat_span(handle)?;
        match &span {
            MatSpan::F32(w) => {
                // Safety: barrier() waits on `done` before the spans drop,
                // and the caller touches `out` only after barrier().
                unsafe { self.pool.dispatch_f32(&self.done, out, x, w.as_f32()?, n)? };
            }
            MatSpan::Q8 { q, s } => {
                // Safety: as above.
                unsafe {
                    self.pool.dispatch_q8(
                        &self.done,
                        out,
                        &xq.q,
                        &xq.s,
                        q.as_i8(),
                        s.as_f32()?,
                        n,
                        self.model.config.group_size,
                    )?
                };
            }
        }
        Ok(span)
    }

    /// Wait for every dispatched job, release the spans, and surface any
    /// dispatch failure.
    fn barrier(mut self) -> Result<()> {
        self.done.wait();
        self.held.clear();
        match self.failed.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

//! Fixed worker pool with a bounded job ring.
//!
//! Every matmul dispatch partitions its output dimension into one contiguous
//! band per worker, enqueues exactly one job record per worker, and wakes
//! every worker. Workers drain the ring until it is observed empty, then
//! sleep on their own start semaphore. Callers synchronize at a per-caller
//! [`Completion`] barrier: a dispatch adds `threads` to the counter, each
//! finished job subtracts one, and the barrier returns at zero. Because each
//! dispatch carries its caller's completion handle, several callers' jobs can
//! coexist in the ring without their barriers interfering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{ComputeError, Result};
use crate::kernels;

/// Worker count used when the host does not specify one.
pub const DEFAULT_THREADS: usize = 8;

/// Ring slots per worker. The forward pass issues at most three dispatches
/// between barriers (the QKV burst), so four leaves headroom; overflowing
/// the ring is rejected as a programming error, never dropped.
const RING_SLOTS_PER_WORKER: usize = 4;

/// A counting semaphore. One per worker for starts.
struct Semaphore {
    count: Mutex<u32>,
    posted: Condvar,
}

impl Semaphore {
    fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            posted: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.posted.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.posted.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Per-caller barrier over outstanding jobs.
///
/// Posts for earlier dispatches can wake the waiter spuriously, so the wait
/// loop re-reads the counter under the lock until it reaches zero.
pub struct Completion {
    queued: Mutex<usize>,
    done: Condvar,
}

impl Completion {
    pub fn new() -> Completion {
        Completion {
            queued: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    fn add(&self, n: usize) {
        *self.queued.lock().unwrap() += n;
    }

    fn finish_one(&self) {
        let mut queued = self.queued.lock().unwrap();
        *queued -= 1;
        if *queued == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every job dispatched against this completion has run.
    ///
    /// This is the only point at which matmul output becomes visible to the
    /// caller.
    pub fn wait(&self) {
        let mut queued = self.queued.lock().unwrap();
        while *queued != 0 {
            queued = self.done.wait(queued).unwrap();
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw-pointer wrappers so job records can cross to worker threads. Validity
/// is the dispatching caller's contract (see the dispatch safety docs).
#[derive(Clone, Copy)]
struct ConstPtr<T>(*const T);
#[derive(Clone, Copy)]
struct MutPtr<T>(*mut T);

unsafe impl<T> Send for ConstPtr<T> {}
unsafe impl<T> Send for MutPtr<T> {}

/// One band of one matmul call. All pointers are pre-offset to the band, so
/// no two jobs from the same dispatch ever alias their output.
enum JobKind {
    F32 {
        w: ConstPtr<f32>,
        x: ConstPtr<f32>,
        out: MutPtr<f32>,
        rows: usize,
        n: usize,
    },
    Q8 {
        wq: ConstPtr<i8>,
        ws: ConstPtr<f32>,
        xq: ConstPtr<i8>,
        xs: ConstPtr<f32>,
        out: MutPtr<f32>,
        rows: usize,
        n: usize,
        group_size: usize,
    },
}

struct Job {
    kind: JobKind,
    done: Arc<Completion>,
}

impl Job {
    /// Run the kernel for this band and report completion.
    ///
    /// # Safety
    /// The dispatching caller guarantees the pointers stay valid until its
    /// barrier returns, and bands from one dispatch are disjoint.
    unsafe fn run(self) {
        match self.kind {
            JobKind::F32 { w, x, out, rows, n } => {
                let out = std::slice::from_raw_parts_mut(out.0, rows);
                let w = std::slice::from_raw_parts(w.0, rows * n);
                let x = std::slice::from_raw_parts(x.0, n);
                kernels::matmul_rows(out, x, w, n);
            }
            JobKind::Q8 {
                wq,
                ws,
                xq,
                xs,
                out,
                rows,
                n,
                group_size,
            } => {
                let out = std::slice::from_raw_parts_mut(out.0, rows);
                let wq = std::slice::from_raw_parts(wq.0, rows * n);
                let ws = std::slice::from_raw_parts(ws.0, rows * n / group_size);
                let xq = std::slice::from_raw_parts(xq.0, n);
                let xs = std::slice::from_raw_parts(xs.0, n / group_size);
                kernels::matmul_q8_rows(out, xq, xs, wq, ws, n, group_size);
            }
        }
        self.done.finish_one();
    }
}

struct PoolShared {
    ring: Mutex<VecDeque<Job>>,
    capacity: usize,
    starts: Vec<Semaphore>,
    exiting: AtomicBool,
}

/// Fixed set of long-lived worker threads shared by every session.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers (0 selects [`DEFAULT_THREADS`]).
    pub fn new(threads: usize) -> Result<WorkerPool> {
        let threads = if threads == 0 { DEFAULT_THREADS } else { threads };

        let shared = Arc::new(PoolShared {
            ring: Mutex::new(VecDeque::with_capacity(threads * RING_SLOTS_PER_WORKER)),
            capacity: threads * RING_SLOTS_PER_WORKER,
            starts: (0..threads).map(|_| Semaphore::new()).collect(),
            exiting: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ember-worker-{idx}"))
                .spawn(move || worker_loop(shared, idx))?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            shared,
            workers,
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Dispatch a float matmul: `out = w . x`, `w` shaped `(out.len(), n)`.
    ///
    /// Returns as soon as the jobs are enqueued and the workers are woken.
    ///
    /// # Safety
    /// The caller must call `done.wait()` before reading `out`, mutating any
    /// of the slices, or letting any of them drop. The borrows escape to the
    /// worker threads until that barrier.
    pub unsafe fn dispatch_f32(
        &self,
        done: &Arc<Completion>,
        out: &mut [f32],
        x: &[f32],
        w: &[f32],
        n: usize,
    ) -> Result<()> {
        check_len("x", x.len(), n)?;
        check_len("w", w.len(), out.len() * n)?;

        let d = out.len();
        let (w, x, out) = (w.as_ptr(), x.as_ptr(), out.as_mut_ptr());
        self.enqueue(done, |i0, rows| JobKind::F32 {
            // Safety: i0 + rows never exceeds d, checked against the slice
            // lengths above.
            w: ConstPtr(unsafe { w.add(i0 * n) }),
            x: ConstPtr(x),
            out: MutPtr(unsafe { out.add(i0) }),
            rows,
            n,
        }, d)
    }

    /// Dispatch an int8-grouped matmul over a pre-quantized activation.
    ///
    /// # Safety
    /// Same contract as [`WorkerPool::dispatch_f32`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn dispatch_q8(
        &self,
        done: &Arc<Completion>,
        out: &mut [f32],
        xq: &[i8],
        xs: &[f32],
        wq: &[i8],
        ws: &[f32],
        n: usize,
        group_size: usize,
    ) -> Result<()> {
        debug_assert_eq!(n % group_size, 0);
        check_len("xq", xq.len(), n)?;
        check_len("wq", wq.len(), out.len() * n)?;
        check_len("ws", ws.len(), out.len() * n / group_size)?;

        let d = out.len();
        let (wq, ws, xq, xs, out) =
            (wq.as_ptr(), ws.as_ptr(), xq.as_ptr(), xs.as_ptr(), out.as_mut_ptr());
        self.enqueue(done, |i0, rows| JobKind::Q8 {
            // Safety: as in dispatch_f32; band offsets stay in bounds and
            // i0 * n is a multiple of group_size because n is.
            wq: ConstPtr(unsafe { wq.add(i0 * n) }),
            ws: ConstPtr(unsafe { ws.add(i0 * n / group_size) }),
            xq: ConstPtr(xq),
            xs: ConstPtr(xs),
            out: MutPtr(unsafe { out.add(i0) }),
            rows,
            n,
            group_size,
        }, d)
    }

    /// Partition `d` rows into one band per worker (the last band absorbs the
    /// remainder), enqueue a job per worker, and post every start semaphore.
    fn enqueue(
        &self,
        done: &Arc<Completion>,
        mut band: impl FnMut(usize, usize) -> JobKind,
        d: usize,
    ) -> Result<()> {
        let t = self.threads;
        let per = d / t;

        {
            let mut ring = self.shared.ring.lock().unwrap();
            if ring.len() + t > self.shared.capacity {
                return Err(ComputeError::RingFull {
                    queued: ring.len(),
                    capacity: self.shared.capacity,
                });
            }
            done.add(t);
            for j in 0..t {
                let i0 = j * per;
                let rows = if j == t - 1 { d - i0 } else { per };
                ring.push_back(Job {
                    kind: band(i0, rows),
                    done: done.clone(),
                });
            }
        }

        for sem in &self.shared.starts {
            sem.post();
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.exiting.store(true, Ordering::Release);
        for sem in &self.shared.starts {
            sem.post();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, idx: usize) {
    loop {
        shared.starts[idx].wait();
        if shared.exiting.load(Ordering::Acquire) {
            return;
        }
        loop {
            let job = shared.ring.lock().unwrap().pop_front();
            match job {
                // Safety: upheld by the dispatching caller, see Job::run.
                Some(job) => unsafe { job.run() },
                None => break,
            }
        }
    }
}

fn check_len(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(ComputeError::DimMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use crate::quant::{quantize, QuantBuf};

    fn reference(x: &[f32], w: &[f32], d: usize, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; d];
        kernels::matmul_rows(&mut out, x, w, n);
        out
    }

    fn fixture(d: usize, n: usize) -> (Vec<f32>, Vec<f32>) {
        let w: Vec<f32> = (0..d * n).map(|i| ((i * 31 + 7) % 23) as f32 / 23.0 - 0.5).collect();
        let x: Vec<f32> = (0..n).map(|i| ((i * 5 + 2) % 13) as f32 / 13.0 - 0.5).collect();
        (w, x)
    }

    #[test]
    fn test_dispatch_matches_reference_across_thread_counts() {
        let (w, x) = fixture(10, 8);
        let expect = reference(&x, &w, 10, 8);

        for threads in [1, 2, 4, 8] {
            let pool = WorkerPool::new(threads).unwrap();
            let done = Arc::new(Completion::new());
            let mut out = vec![0.0; 10];
            unsafe {
                pool.dispatch_f32(&done, &mut out, &x, &w, 8).unwrap();
            }
            done.wait();
            // Bands do not change per-row summation order, so this is
            // bit-exact, not approximate.
            assert_eq!(out, expect, "threads = {}", threads);
        }
    }

    #[test]
    fn test_dispatch_with_more_threads_than_rows() {
        let (w, x) = fixture(3, 4);
        let expect = reference(&x, &w, 3, 4);

        let pool = WorkerPool::new(8).unwrap();
        let done = Arc::new(Completion::new());
        let mut out = vec![0.0; 3];
        unsafe {
            pool.dispatch_f32(&done, &mut out, &x, &w, 4).unwrap();
        }
        done.wait();
        assert_eq!(out, expect);
    }

    #[test]
    fn test_back_to_back_dispatches_one_barrier() {
        let (w, x) = fixture(6, 4);
        let expect = reference(&x, &w, 6, 4);

        let pool = WorkerPool::new(2).unwrap();
        let done = Arc::new(Completion::new());
        let mut out_a = vec![0.0; 6];
        let mut out_b = vec![0.0; 6];
        let mut out_c = vec![0.0; 6];
        unsafe {
            pool.dispatch_f32(&done, &mut out_a, &x, &w, 4).unwrap();
            pool.dispatch_f32(&done, &mut out_b, &x, &w, 4).unwrap();
            pool.dispatch_f32(&done, &mut out_c, &x, &w, 4).unwrap();
        }
        done.wait();
        assert_eq!(out_a, expect);
        assert_eq!(out_b, expect);
        assert_eq!(out_c, expect);
    }

    #[test]
    fn test_independent_completions_do_not_interfere() {
        let (w, x) = fixture(8, 4);
        let expect = reference(&x, &w, 8, 4);

        let pool = WorkerPool::new(4).unwrap();
        let done_a = Arc::new(Completion::new());
        let done_b = Arc::new(Completion::new());
        let mut out_a = vec![0.0; 8];
        let mut out_b = vec![0.0; 8];
        unsafe {
            pool.dispatch_f32(&done_a, &mut out_a, &x, &w, 4).unwrap();
            pool.dispatch_f32(&done_b, &mut out_b, &x, &w, 4).unwrap();
        }
        done_a.wait();
        assert_eq!(out_a, expect);
        done_b.wait();
        assert_eq!(out_b, expect);
    }

    #[test]
    fn test_q8_dispatch_matches_serial_kernel() {
        let n = 8;
        let d = 6;
        let gs = 4;
        let (w, x) = fixture(d, n);

        let mut wbuf = QuantBuf::new(d * n, gs);
        quantize(&mut wbuf, &w, gs);
        let mut xbuf = QuantBuf::new(n, gs);
        quantize(&mut xbuf, &x, gs);

        let mut expect = vec![0.0; d];
        kernels::matmul_q8_rows(&mut expect, &xbuf.q, &xbuf.s, &wbuf.q, &wbuf.s, n, gs);

        let pool = WorkerPool::new(3).unwrap();
        let done = Arc::new(Completion::new());
        let mut out = vec![0.0; d];
        unsafe {
            pool.dispatch_q8(&done, &mut out, &xbuf.q, &xbuf.s, &wbuf.q, &wbuf.s, n, gs)
                .unwrap();
        }
        done.wait();
        assert_eq!(out, expect);
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let pool = WorkerPool::new(2).unwrap();
        let done = Arc::new(Completion::new());
        let w = vec![0.0; 8];
        let x = vec![0.0; 3]; // wrong: n is 4
        let mut out = vec![0.0; 2];
        let err = unsafe { pool.dispatch_f32(&done, &mut out, &x, &w, 4) };
        assert!(matches!(err, Err(ComputeError::DimMismatch { .. })));
        // Nothing was enqueued; the barrier must not block.
        done.wait();
    }
}

//! The runtime handle: model registry, session run queue, and the
//! round-robin stepper.
//!
//! Everything process-wide in spirit is owned here instead: hosts create one
//! `Runtime`, register models against it, and drive generation by calling
//! [`Runtime::step_next`] at whatever cadence suits them. Sessions advance
//! one token per step and rotate to the back of the queue, so `N` live
//! sessions share the worker pool fairly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use ember_compute::WorkerPool;
use ember_model::{Model, ModelOptions, TOKEN_BOS, TOKEN_EOS};

use crate::error::{EngineError, Result};
use crate::forward::forward;
use crate::prompt;
use crate::session::{Session, SessionId, SessionOptions};

/// Version of the embedding surface; hosts built against another version are
/// rejected at runtime construction.
pub const API_VERSION: u32 = 1;

/// Positions a session must pass before a sampled EOS ends it; earlier EOS
/// draws are treated as noise.
const EOS_MIN_POS: usize = 5;

/// Result of one scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No live sessions.
    Idle,
    /// The session advanced one token and rotated to the back of the queue.
    Stepped(SessionId),
    /// The session reached a terminal state and was destroyed.
    Finished(SessionId),
}

struct SessionHandle {
    id: SessionId,
    model: Arc<Model>,
    cancelled: AtomicBool,
    state: Mutex<Session>,
}

/// Engine-scoped owner of the worker pool, model registry, and session
/// queue.
pub struct Runtime {
    pool: WorkerPool,
    models: Mutex<HashMap<String, Arc<Model>>>,
    queue: Mutex<VecDeque<Arc<SessionHandle>>>,
    registry: Mutex<HashMap<u64, Arc<SessionHandle>>>,
    next_id: AtomicU64,
}

impl Runtime {
    /// Create a runtime with `threads` workers (0 selects the default).
    pub fn new(threads: usize) -> Result<Runtime> {
        Ok(Runtime {
            pool: WorkerPool::new(threads)?,
            models: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Open a model and register it under its name.
    pub fn open_model(&self, opts: ModelOptions) -> Result<Arc<Model>> {
        let mut models = self.models.lock().unwrap();
        if models.contains_key(&opts.name) {
            return Err(EngineError::ConfigInvalid(format!(
                "model '{}' is already registered",
                opts.name
            )));
        }
        let model = Arc::new(Model::open(opts)?);
        models.insert(model.name.clone(), model.clone());
        Ok(model)
    }

    /// Look up a registered model by name.
    pub fn model(&self, name: &str) -> Option<Arc<Model>> {
        self.models.lock().unwrap().get(name).cloned()
    }

    /// Unregister a model. Live sessions keep their shared reference; the
    /// model is freed once the last of them finishes.
    pub fn close_model(&self, name: &str) -> bool {
        let removed = self.models.lock().unwrap().remove(name);
        if removed.is_some() {
            debug!(name, "model closed");
        }
        removed.is_some()
    }

    /// Create a session against a model and link it at the back of the run
    /// queue.
    pub fn open_session(&self, model: &Arc<Model>, opts: SessionOptions) -> Result<SessionId> {
        if let Some(cap) = model.max_sessions {
            let live = self
                .registry
                .lock()
                .unwrap()
                .values()
                .filter(|h| Arc::ptr_eq(&h.model, model))
                .count();
            if live >= cap {
                return Err(EngineError::SessionLimit {
                    model: model.name.clone(),
                    limit: cap,
                });
            }
        }

        let rendered = prompt::render(model.kind, opts.system_prompt.as_deref(), &opts.prompt);
        let prompt_tokens = model.tokenizer().encode(&rendered, true, false);

        let session = Session::new(
            model,
            prompt_tokens,
            opts.temperature,
            opts.topp,
            opts.rng_seed,
            opts.limit,
            opts.sink,
            opts.on_release,
        )?;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(SessionHandle {
            id,
            model: model.clone(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(session),
        });

        self.registry.lock().unwrap().insert(id.0, handle.clone());
        self.queue.lock().unwrap().push_back(handle);
        debug!(session = id.0, model = %model.name, "session opened");
        Ok(id)
    }

    /// Mark a session for termination. It is destroyed by the next
    /// `step_next` that targets it; its destructor runs exactly once.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.registry.lock().unwrap().get(&id.0) {
            Some(handle) => {
                handle.cancelled.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Number of live sessions across all models.
    pub fn live_sessions(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Advance the head session one token, then rotate it to the tail.
    ///
    /// Terminal transitions (limit, sampled BOS, late sampled EOS,
    /// cancellation, or a transient forward failure) destroy the session
    /// after pushing the one-byte terminal marker through its sink.
    pub fn step_next(&self) -> StepOutcome {
        let handle = match self.queue.lock().unwrap().pop_front() {
            Some(handle) => handle,
            None => return StepOutcome::Idle,
        };

        if handle.cancelled.load(Ordering::Acquire) {
            self.finish(&handle);
            return StepOutcome::Finished(handle.id);
        }

        let terminal = {
            let mut session = handle.state.lock().unwrap();
            match self.step_session(&handle, &mut session) {
                Ok(terminal) => terminal,
                Err(err) => {
                    // A step that cannot reach its weights ends the session
                    // the same way a sampled BOS would. A distinct error
                    // channel would let hosts tell these apart.
                    warn!(session = handle.id.0, error = %err, "forward step failed");
                    true
                }
            }
        };

        if terminal || handle.cancelled.load(Ordering::Acquire) {
            self.finish(&handle);
            StepOutcome::Finished(handle.id)
        } else {
            self.queue.lock().unwrap().push_back(handle.clone());
            StepOutcome::Stepped(handle.id)
        }
    }

    /// One token for one session. Returns whether the session is terminal.
    fn step_session(&self, handle: &SessionHandle, s: &mut Session) -> Result<bool> {
        let token = s.token;
        let pos = s.pos;
        forward(&handle.model, &self.pool, s, token, pos)?;

        // While the prompt is being fed, the next input comes from the
        // prompt and the logits are discarded.
        let next = if s.pos + 1 < s.prompt_tokens.len() {
            s.prompt_tokens[s.pos + 1]
        } else {
            s.sampler.sample(&mut s.logits)
        };
        s.pos += 1;

        if next == TOKEN_BOS {
            return Ok(true);
        }
        if next == TOKEN_EOS && s.pos > EOS_MIN_POS {
            return Ok(true);
        }

        if s.pos >= s.prompt_tokens.len() {
            // Issue boundary: re-check cancellation before delivering.
            if handle.cancelled.load(Ordering::Acquire) {
                return Ok(true);
            }
            let piece = handle.model.tokenizer().decode(token, next);
            s.issue(&piece);
        }

        s.token = next;
        Ok(s.pos >= s.limit)
    }

    /// Destroy a session: deliver the terminal marker, run the release hook,
    /// and drop it from the registry. The handle is already off the queue.
    fn finish(&self, handle: &Arc<SessionHandle>) {
        self.registry.lock().unwrap().remove(&handle.id.0);
        let mut session = handle.state.lock().unwrap();
        session.issue_terminal();
        session.release();
        debug!(session = handle.id.0, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TokenSink;
    use crate::testutil;
    use ember_model::AccessMode;
    use tempfile::NamedTempFile;

    struct Fixture {
        runtime: Runtime,
        model: Arc<Model>,
        _files: (NamedTempFile, NamedTempFile),
    }

    fn fixture(threads: usize, max_sessions: Option<usize>) -> Fixture {
        let ckpt = testutil::write_float_checkpoint(true);
        let tok = testutil::write_tokenizer();
        let runtime = Runtime::new(threads).unwrap();
        let mut opts = testutil::model_options(&ckpt, &tok, AccessMode::Mmap, "test");
        opts.max_sessions = max_sessions;
        let model = runtime.open_model(opts).unwrap();
        Fixture {
            runtime,
            model,
            _files: (ckpt, tok),
        }
    }

    fn collecting_sink() -> (TokenSink, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: TokenSink = Box::new(move |piece: &[u8]| {
            sink_seen.lock().unwrap().push(piece.to_vec());
            0
        });
        (sink, seen)
    }

    fn session_opts(prompt: &str, seed: u64, temperature: f32, sink: TokenSink) -> SessionOptions {
        SessionOptions {
            prompt: prompt.to_string(),
            system_prompt: None,
            temperature,
            topp: 0.9,
            rng_seed: seed,
            limit: 0,
            sink,
            on_release: None,
        }
    }

    fn drain(runtime: &Runtime) {
        let mut guard = 0;
        while runtime.live_sessions() > 0 {
            runtime.step_next();
            guard += 1;
            assert!(guard < 1000, "sessions failed to terminate");
        }
    }

    #[test]
    fn test_idle_runtime() {
        let f = fixture(1, None);
        assert_eq!(f.runtime.step_next(), StepOutcome::Idle);
        assert_eq!(f.runtime.live_sessions(), 0);
    }

    #[test]
    fn test_round_robin_rotation() {
        let f = fixture(2, None);
        // Long prompts keep all nine steps inside the feeding state.
        let ids: Vec<SessionId> = (0..3)
            .map(|i| {
                let (sink, _) = collecting_sink();
                f.runtime
                    .open_session(&f.model, session_opts("abcabcabc", i + 1, 0.0, sink))
                    .unwrap()
            })
            .collect();

        let mut order = Vec::new();
        for _ in 0..9 {
            match f.runtime.step_next() {
                StepOutcome::Stepped(id) => order.push(id),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        // Strict rotation: 1 2 3 1 2 3 1 2 3.
        let expect: Vec<SessionId> = ids.iter().cycle().take(9).copied().collect();
        assert_eq!(order, expect);

        for id in ids {
            f.runtime.cancel(id);
        }
        drain(&f.runtime);
    }

    #[test]
    fn test_cancel_destroys_within_one_targeted_step() {
        let f = fixture(2, None);
        let hook_count = Arc::new(Mutex::new(0));
        let (sink_a, seen_a) = collecting_sink();
        let hc = hook_count.clone();
        let mut opts = session_opts("abcabc", 1, 0.0, sink_a);
        opts.on_release = Some(Box::new(move || *hc.lock().unwrap() += 1));
        let a = f.runtime.open_session(&f.model, opts).unwrap();

        let (sink_b, _) = collecting_sink();
        let b = f
            .runtime
            .open_session(&f.model, session_opts("abcabc", 2, 0.0, sink_b))
            .unwrap();

        assert!(f.runtime.cancel(a));
        // The next step targets the head session, which is the cancelled one.
        assert_eq!(f.runtime.step_next(), StepOutcome::Finished(a));
        assert_eq!(*hook_count.lock().unwrap(), 1);
        assert_eq!(f.runtime.live_sessions(), 1);
        // The terminal marker was delivered despite zero generated pieces.
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[b"\n".to_vec()]);

        // Cancelling an already-destroyed session is a no-op.
        assert!(!f.runtime.cancel(a));

        assert_eq!(f.runtime.step_next(), StepOutcome::Stepped(b));
        f.runtime.cancel(b);
        drain(&f.runtime);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let f = fixture(2, None);
        let (sink_a, seen_a) = collecting_sink();
        let (sink_b, seen_b) = collecting_sink();
        let mut opts_a = session_opts("ab", 77, 0.8, sink_a);
        opts_a.limit = 12;
        let mut opts_b = session_opts("ab", 77, 0.8, sink_b);
        opts_b.limit = 12;

        f.runtime.open_session(&f.model, opts_a).unwrap();
        f.runtime.open_session(&f.model, opts_b).unwrap();
        drain(&f.runtime);

        assert_eq!(*seen_a.lock().unwrap(), *seen_b.lock().unwrap());
        // Something was generated, then the terminal marker.
        assert!(!seen_a.lock().unwrap().is_empty());
    }

    #[test]
    fn test_temperature_zero_ignores_seed() {
        let f = fixture(2, None);
        let (sink_a, seen_a) = collecting_sink();
        let (sink_b, seen_b) = collecting_sink();
        let mut opts_a = session_opts("ab", 1, 0.0, sink_a);
        opts_a.limit = 10;
        let mut opts_b = session_opts("ab", 999_999, 0.0, sink_b);
        opts_b.limit = 10;

        f.runtime.open_session(&f.model, opts_a).unwrap();
        f.runtime.open_session(&f.model, opts_b).unwrap();
        drain(&f.runtime);

        assert_eq!(*seen_a.lock().unwrap(), *seen_b.lock().unwrap());
    }

    #[test]
    fn test_limit_terminates_session() {
        let f = fixture(2, None);
        let (sink, seen) = collecting_sink();
        let mut opts = session_opts("ab", 5, 0.0, sink);
        opts.limit = 6;
        let id = f.runtime.open_session(&f.model, opts).unwrap();

        let mut finished = false;
        for _ in 0..8 {
            if f.runtime.step_next() == StepOutcome::Finished(id) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(f.runtime.live_sessions(), 0);
        // The last delivery is the terminal marker.
        assert_eq!(seen.lock().unwrap().last().unwrap(), &b"\n".to_vec());
    }

    #[test]
    fn test_session_cap_enforced() {
        let f = fixture(1, Some(1));
        let (sink_a, _) = collecting_sink();
        let a = f
            .runtime
            .open_session(&f.model, session_opts("ab", 1, 0.0, sink_a))
            .unwrap();

        let (sink_b, _) = collecting_sink();
        let err = f
            .runtime
            .open_session(&f.model, session_opts("ab", 2, 0.0, sink_b));
        assert!(matches!(err, Err(EngineError::SessionLimit { .. })));

        // Destroying the first session frees a slot.
        f.runtime.cancel(a);
        drain(&f.runtime);
        let (sink_c, _) = collecting_sink();
        assert!(f
            .runtime
            .open_session(&f.model, session_opts("ab", 3, 0.0, sink_c))
            .is_ok());
        drain_all(&f.runtime);
    }

    fn drain_all(runtime: &Runtime) {
        let ids: Vec<u64> = runtime.registry.lock().unwrap().keys().copied().collect();
        for id in ids {
            runtime.cancel(SessionId(id));
        }
        drain(runtime);
    }

    #[test]
    fn test_model_registry() {
        let f = fixture(1, None);
        assert!(f.runtime.model("test").is_some());
        assert!(f.runtime.model("absent").is_none());

        // A second model under the same name is rejected.
        let ckpt = testutil::write_float_checkpoint(true);
        let tok = testutil::write_tokenizer();
        let dup = f
            .runtime
            .open_model(testutil::model_options(&ckpt, &tok, AccessMode::Mmap, "test"));
        assert!(matches!(dup, Err(EngineError::ConfigInvalid(_))));

        assert!(f.runtime.close_model("test"));
        assert!(!f.runtime.close_model("test"));
        assert!(f.runtime.model("test").is_none());
    }

    #[test]
    fn test_transient_forward_failure_finishes_cleanly() {
        let ckpt = testutil::write_float_checkpoint(true);
        let tok = testutil::write_tokenizer();
        let runtime = Runtime::new(2).unwrap();
        let model = runtime
            .open_model(testutil::model_options(
                &ckpt,
                &tok,
                AccessMode::ReadCache { limit: 4096 },
                "trunc",
            ))
            .unwrap();

        let (sink, seen) = collecting_sink();
        let id = runtime
            .open_session(&model, session_opts("ab", 1, 0.0, sink))
            .unwrap();

        // Truncate the checkpoint under the read-cache: the next resolve
        // cannot be served and the step aborts.
        std::fs::OpenOptions::new()
            .write(true)
            .open(ckpt.path())
            .unwrap()
            .set_len(100)
            .unwrap();

        assert_eq!(runtime.step_next(), StepOutcome::Finished(id));
        assert_eq!(runtime.live_sessions(), 0);
        // Only the terminal marker reached the sink.
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"\n".to_vec()]);
    }

    #[test]
    fn test_chat_kind_wraps_prompt() {
        let ckpt = testutil::write_float_checkpoint(true);
        let tok = testutil::write_tokenizer();
        let runtime = Runtime::new(1).unwrap();
        let mut opts = testutil::model_options(&ckpt, &tok, AccessMode::Mmap, "chat");
        opts.kind = ember_model::ModelKind::Chat;
        let model = runtime.open_model(opts).unwrap();

        // The wrapped prompt is longer than the bare text, so the session
        // spends more steps feeding it.
        let (sink, _) = collecting_sink();
        let id = runtime
            .open_session(&model, session_opts("ab", 1, 0.0, sink))
            .unwrap();
        // "[INST] ab [/INST]\n" has well over four codepoints of prompt.
        for _ in 0..4 {
            assert_eq!(runtime.step_next(), StepOutcome::Stepped(id));
        }
        runtime.cancel(id);
        drain(&runtime);
    }
}

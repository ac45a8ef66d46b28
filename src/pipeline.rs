//! Inference pipeline.
//!
//! One run decodes one source end to end: resolve, reset prior results,
//! stream frames through pace/detect/persist, drain. Runs execute on
//! background threads off the request path, one at a time per source, and
//! are advisory: the trigger returns nothing, and success is observable only
//! through the inference cursor.
//!
//! Cancellation is cooperative. Each loop iteration re-checks three signals:
//! the run token (a newer run for the same source invalidates this one), the
//! watchdog budget, and the source's live flag in the registry. None of the
//! blocking operations (decode, detect, commit) are interrupted preemptively.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::decode::VideoStream;
use crate::detect::{Detector, StubDetector};
use crate::objectstore::ObjectStore;
use crate::sources::{ResolvedSource, SourceRegistry};
use crate::store::{InferenceRecord, InferenceStore, SqliteInferenceStore};
use crate::SourceKind;

/// Frame pacing against wall-clock time.
///
/// Decode plus inference can be slower than realtime; rather than queuing
/// unbounded catch-up work, the pipeline discards frames whose presentation
/// offset has fallen behind the wall clock. Best effort only: lag is not
/// bounded, the pipeline just never processes a frame it is already late for.
pub struct Pacer {
    rt_start: Instant,
    first_frame: bool,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            rt_start: Instant::now(),
            first_frame: true,
        }
    }

    /// Decide whether the frame at `position_secs` should be processed.
    /// The first frame is always kept; elapsed wall time is near zero there.
    pub fn keep(&mut self, position_secs: f64) -> bool {
        if self.first_frame {
            self.first_frame = false;
            return true;
        }
        Self::keep_at(position_secs, self.rt_start.elapsed())
    }

    /// Pure form of the keep decision, for tests with a controlled clock.
    pub fn keep_at(position_secs: f64, elapsed_wall: Duration) -> bool {
        let elapsed = elapsed_wall.as_secs_f64();
        if elapsed <= f64::EPSILON {
            return true;
        }
        position_secs / elapsed >= 1.0
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

/// How one run ended. Only `Skipped` leaves the store untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stream exhausted or failed; everything persisted so far stands.
    Completed { frames: u64 },
    /// The source was deactivated or deleted mid-run.
    Canceled { frames: u64 },
    /// A newer run for the same source invalidated this one.
    Superseded { frames: u64 },
    /// The watchdog budget ran out.
    TimedOut { frames: u64 },
    /// Source absent, deleted, or inactive at start. No side effects.
    Skipped,
}

impl RunOutcome {
    pub fn frames(&self) -> u64 {
        match self {
            RunOutcome::Completed { frames }
            | RunOutcome::Canceled { frames }
            | RunOutcome::Superseded { frames }
            | RunOutcome::TimedOut { frames } => *frames,
            RunOutcome::Skipped => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunLimits {
    /// Watchdog for a whole run; decode can block indefinitely on a stalled
    /// live source. `None` disables the watchdog.
    pub max_runtime: Option<Duration>,
}

/// Serializes runs per source identity.
///
/// Two overlapping runs for one source would both `reset` and `append`
/// against the same rows and corrupt the result set. `begin` hands the new
/// run a generation token and bumps the slot's generation, invalidating any
/// run already streaming; the invalidated run observes the stale token at
/// its next poll and drains. The per-source gate then makes the newcomer
/// wait until the old run has released the store before its own `reset`.
#[derive(Clone, Default)]
pub struct RunCoordinator {
    slots: Arc<Mutex<HashMap<(SourceKind, i64), Arc<SourceSlot>>>>,
}

#[derive(Default)]
struct SourceSlot {
    generation: AtomicU64,
    gate: Mutex<()>,
}

pub struct RunToken {
    slot: Arc<SourceSlot>,
    generation: u64,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, kind: SourceKind, id: i64) -> RunToken {
        let slot = lock_unpoisoned(&self.slots)
            .entry((kind, id))
            .or_default()
            .clone();
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunToken { slot, generation }
    }
}

impl RunToken {
    /// False once a newer run has begun for the same source.
    pub fn is_current(&self) -> bool {
        self.slot.generation.load(Ordering::SeqCst) == self.generation
    }

    fn enter(&self) -> MutexGuard<'_, ()> {
        lock_unpoisoned(&self.slot.gate)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Execute one inference run synchronously.
///
/// State machine: resolve the source (absent/inactive terminates with no
/// side effects), reset prior results, stream frames, drain. The stream is
/// closed on every exit path, including store failures.
#[allow(clippy::too_many_arguments)]
pub fn run_inference(
    registry: &SourceRegistry,
    store: &mut dyn InferenceStore,
    detector: &mut dyn Detector,
    object_store: &dyn ObjectStore,
    coordinator: &RunCoordinator,
    kind: SourceKind,
    id: i64,
    limits: &RunLimits,
) -> Result<RunOutcome> {
    let token = coordinator.begin(kind, id);
    let _gate = token.enter();
    if !token.is_current() {
        // Another run arrived while this one waited on the gate.
        return Ok(RunOutcome::Superseded { frames: 0 });
    }

    let Some(resolved) = registry.resolve(kind, id, object_store)? else {
        log::debug!("run for {} {}: source not runnable, skipping", kind, id);
        return Ok(RunOutcome::Skipped);
    };

    // Replace-on-rerun: prior results must be fully gone before the first
    // frame, or not at all.
    store.reset(kind, id)?;

    let mut stream = match VideoStream::open(&resolved.url) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("run for {} {}: failed to open stream: {}", kind, id, e);
            return Ok(RunOutcome::Completed { frames: 0 });
        }
    };

    let result = stream_frames(registry, store, detector, &mut stream, &resolved, &token, limits);
    stream.close();

    let outcome = result?;
    log::info!(
        "run for {} {} finished: {:?} ({} frames)",
        kind,
        id,
        outcome,
        outcome.frames()
    );
    Ok(outcome)
}

fn stream_frames(
    registry: &SourceRegistry,
    store: &mut dyn InferenceStore,
    detector: &mut dyn Detector,
    stream: &mut VideoStream,
    source: &ResolvedSource,
    token: &RunToken,
    limits: &RunLimits,
) -> Result<RunOutcome> {
    let mut pacer = Pacer::new();
    let started = Instant::now();
    let mut frames = 0u64;
    let mut last_t = f64::NEG_INFINITY;

    loop {
        if !token.is_current() {
            return Ok(RunOutcome::Superseded { frames });
        }
        if let Some(max_runtime) = limits.max_runtime {
            if started.elapsed() >= max_runtime {
                log::warn!(
                    "run for {} {}: exceeded {:.0}s budget",
                    source.kind,
                    source.id,
                    max_runtime.as_secs_f64()
                );
                return Ok(RunOutcome::TimedOut { frames });
            }
        }
        if !registry.is_live(source.kind, source.id)? {
            return Ok(RunOutcome::Canceled { frames });
        }

        if !stream.grab() {
            return Ok(RunOutcome::Completed { frames });
        }
        let position = stream.position_secs();
        if !pacer.keep(position) {
            continue;
        }

        let Some(frame) = stream.decode() else {
            log::warn!(
                "run for {} {}: decode produced no frame at {:.3}s, stopping",
                source.kind,
                source.id,
                position
            );
            return Ok(RunOutcome::Completed { frames });
        };

        let t = source.t_start + position;
        if t <= last_t {
            // Out-of-order or duplicate presentation timestamp; the cursor
            // relies on strictly increasing t within a run.
            log::debug!(
                "run for {} {}: dropping non-monotonic frame at {:.3}s",
                source.kind,
                source.id,
                position
            );
            continue;
        }

        let hits = match detector.infer(&frame, position) {
            Ok(hits) => hits,
            Err(e) => {
                log::warn!(
                    "detector '{}' failed at {:.3}s: {}",
                    detector.name(),
                    position,
                    e
                );
                Vec::new()
            }
        };

        store.append(&InferenceRecord {
            t,
            source_kind: source.kind,
            source_id: source.id,
            hits,
        })?;
        last_t = t;
        frames += 1;
        if frames % 100 == 0 {
            log::info!("run for {} {}: processed {} frames", source.kind, source.id, frames);
        }
    }
}

pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn Detector> + Send + Sync>;

/// Shared handle for triggering runs from the API and the daemon.
///
/// Each run opens its own registry and store connections against the shared
/// database, builds a fresh detector, and goes through the coordinator, so
/// triggers may arrive from any thread.
#[derive(Clone)]
pub struct Pipeline {
    db_path: String,
    coordinator: RunCoordinator,
    object_store: Arc<dyn ObjectStore>,
    detector_factory: DetectorFactory,
    limits: RunLimits,
}

impl Pipeline {
    pub fn new(db_path: &str, object_store: Arc<dyn ObjectStore>, limits: RunLimits) -> Self {
        Self {
            db_path: db_path.to_string(),
            coordinator: RunCoordinator::new(),
            object_store,
            detector_factory: Arc::new(|| Box::new(StubDetector::new())),
            limits,
        }
    }

    pub fn with_detector_factory(mut self, factory: DetectorFactory) -> Self {
        self.detector_factory = factory;
        self
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Fire-and-forget trigger. The caller gets no completion signal.
    pub fn schedule(&self, kind: SourceKind, id: i64) {
        let pipeline = self.clone();
        thread::spawn(move || {
            if let Err(e) = pipeline.run(kind, id) {
                log::warn!("run for {} {} failed: {}", kind, id, e);
            }
        });
    }

    /// Run synchronously on the calling thread.
    pub fn run(&self, kind: SourceKind, id: i64) -> Result<RunOutcome> {
        let registry = SourceRegistry::open(&self.db_path)?;
        let mut store = SqliteInferenceStore::open(&self.db_path)?;
        let mut detector = (self.detector_factory)();
        run_inference(
            &registry,
            &mut store,
            detector.as_mut(),
            self.object_store.as_ref(),
            &self.coordinator,
            kind,
            id,
            &self.limits,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn pacer_keeps_when_decode_is_ahead_of_wall_clock() {
        assert!(Pacer::keep_at(1.0, Duration::from_millis(10)));
        assert!(Pacer::keep_at(5.0, Duration::from_secs(5)));
    }

    #[test]
    fn pacer_skips_when_decode_has_fallen_behind() {
        assert!(!Pacer::keep_at(0.1, Duration::from_secs(5)));
        assert!(!Pacer::keep_at(4.9, Duration::from_secs(5)));
    }

    #[test]
    fn pacer_guards_zero_elapsed_and_first_frame() {
        assert!(Pacer::keep_at(0.0, Duration::ZERO));
        // The first frame is kept even though its offset is behind.
        let mut pacer = Pacer::new();
        assert!(pacer.keep(0.0));
    }

    #[test]
    fn newer_run_invalidates_the_older_token() {
        let coordinator = RunCoordinator::new();
        let token_a = coordinator.begin(SourceKind::Video, 1);
        assert!(token_a.is_current());

        let token_b = coordinator.begin(SourceKind::Video, 1);
        assert!(!token_a.is_current());
        assert!(token_b.is_current());

        // Other sources are unaffected.
        let other = coordinator.begin(SourceKind::Camera, 1);
        assert!(other.is_current());
        assert!(token_b.is_current());
    }

    #[test]
    fn gate_serializes_runs_for_one_source() {
        let coordinator = RunCoordinator::new();
        let token_a = coordinator.begin(SourceKind::Video, 7);
        let guard = token_a.enter();

        let (tx, rx) = mpsc::channel();
        let coordinator_b = coordinator.clone();
        let handle = std::thread::spawn(move || {
            let token_b = coordinator_b.begin(SourceKind::Video, 7);
            let _guard = token_b.enter();
            tx.send(()).ok();
        });

        // The second run cannot enter while the first holds the gate.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().expect("join");
    }
}

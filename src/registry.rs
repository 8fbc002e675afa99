//! Concurrent per-line counting registry
//!
//! Maps (source path, line) pairs to process-unique [`LineIndex`] values and
//! counts visits against them from any number of threads without locks. A
//! single updater periodically flips the active counter generation, folds the
//! frozen generation into the accumulated totals and hands the delta to every
//! registered [`DeltaListener`].
//!
//! # Layout
//!
//! ```text
//!                      active ──┐
//!                               ▼
//! generation[0]  [chunk 0][chunk 1][  ..  ]     chunk = 4096 AtomicU64
//! generation[1]  [chunk 0][chunk 1][  ..  ]
//!
//! visit_line(i):  phaser.writer_enter(); generation[active][i] += 1
//! update:         active ^= 1; phaser.flip_phase(); drain generation[old]
//! ```
//!
//! Chunks are allocated in both generations when a line is registered, so a
//! visit never allocates and never takes a lock.

use crate::phaser::Phaser;
use fnv::FnvHashMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tracing::{trace, warn};

const CHUNK_BITS: u32 = 12;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
const CHUNK_MASK: usize = CHUNK_SIZE - 1;
const MAX_CHUNKS: usize = 4096;

/// Maximum number of distinct lines a registry can hold
pub const MAX_LINES: usize = CHUNK_SIZE * MAX_CHUNKS;

/// source path → line → visit count
pub type SourceCounts = HashMap<String, BTreeMap<u32, u64>>;

/// Error returned by a failing listener
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Process-unique identifier of one (source path, line) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineIndex(pub u32);

impl fmt::Display for LineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Line {path}:{line} is already registered as {existing}")]
    DuplicateLine {
        path: String,
        line: u32,
        existing: LineIndex,
    },

    #[error("Registry capacity of {capacity} lines exhausted")]
    CapacityExceeded { capacity: usize },
}

/// Subscriber for incremental coverage deltas
///
/// Invoked on the updater thread, outside every registry lock.
pub trait DeltaListener: Send + Sync {
    fn on_delta(&self, delta: &SourceCounts) -> Result<(), ListenerError>;
}

impl<F> DeltaListener for F
where
    F: Fn(&SourceCounts) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_delta(&self, delta: &SourceCounts) -> Result<(), ListenerError> {
        self(delta)
    }
}

/// One of the two counter tables
struct Generation {
    chunks: Box<[OnceLock<Box<[AtomicU64]>>]>,
}

impl Generation {
    fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
        }
    }

    fn ensure_chunk(&self, chunk: usize) {
        self.chunks[chunk].get_or_init(|| (0..CHUNK_SIZE).map(|_| AtomicU64::new(0)).collect());
    }

    #[inline]
    fn counter(&self, slot: usize) -> Option<&AtomicU64> {
        self.chunks
            .get(slot >> CHUNK_BITS)?
            .get()
            .map(|chunk| &chunk[slot & CHUNK_MASK])
    }
}

#[derive(Default)]
struct Identity {
    by_line: FnvHashMap<Arc<str>, FnvHashMap<u32, LineIndex>>,
    lines: Vec<(Arc<str>, u32)>,
}

#[derive(Default)]
struct State {
    accumulated: SourceCounts,
    listeners: Vec<Arc<dyn DeltaListener>>,
}

/// Concurrent visit counting registry
pub struct Registry {
    generations: [Generation; 2],
    active: AtomicUsize,
    registered: AtomicU32,
    phaser: Phaser,
    identity: RwLock<Identity>,
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            generations: [Generation::new(), Generation::new()],
            active: AtomicUsize::new(0),
            registered: AtomicU32::new(0),
            phaser: Phaser::new(),
            identity: RwLock::new(Identity::default()),
            state: Mutex::new(State::default()),
        }
    }

    /// Register a line and return its new index
    ///
    /// # Panics
    ///
    /// Panics if the line is already registered. Each line marker produces
    /// exactly one registration, so a duplicate is a logic error.
    pub fn register_line(&self, path: &str, line: u32) -> LineIndex {
        match self.try_register_line(path, line) {
            Ok(index) => index,
            Err(e) => panic!("register_line: {e}"),
        }
    }

    /// Register a line, reporting a duplicate together with its existing index
    pub fn try_register_line(&self, path: &str, line: u32) -> Result<LineIndex, RegistryError> {
        let index = {
            let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = identity.by_line.get(path).and_then(|lines| lines.get(&line)) {
                return Err(RegistryError::DuplicateLine {
                    path: path.to_string(),
                    line,
                    existing: *existing,
                });
            }

            let slot = identity.lines.len();
            if slot >= MAX_LINES {
                return Err(RegistryError::CapacityExceeded {
                    capacity: MAX_LINES,
                });
            }
            for generation in &self.generations {
                generation.ensure_chunk(slot >> CHUNK_BITS);
            }

            let index = LineIndex(slot as u32);
            let key: Arc<str> = match identity.by_line.get_key_value(path) {
                Some((existing, _)) => existing.clone(),
                None => Arc::from(path),
            };
            identity.lines.push((key.clone(), line));
            identity.by_line.entry(key).or_default().insert(line, index);
            self.registered.store(slot as u32 + 1, Ordering::Release);
            index
        };

        self.lock_state()
            .accumulated
            .entry(path.to_string())
            .or_default()
            .entry(line)
            .or_insert(0);

        Ok(index)
    }

    /// Count one visit (wait-free)
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by a prior registration.
    #[inline]
    pub fn visit_line(&self, index: LineIndex) {
        self.add_visits(index, 1);
    }

    /// Count `count` visits at once; used when flushing batched local counts
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by a prior registration.
    #[inline]
    pub fn add_visits(&self, index: LineIndex, count: u64) {
        let slot = index.0 as usize;
        if slot >= self.registered.load(Ordering::Acquire) as usize {
            panic!("visit of unregistered line index {index}");
        }
        if count == 0 {
            return;
        }

        let _writer = self.phaser.writer_enter();
        let generation = &self.generations[self.active.load(Ordering::SeqCst)];
        if let Some(counter) = generation.counter(slot) {
            counter.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Flip generations, fold the frozen one into `delta` and the accumulated
    /// totals, then invoke every listener with `delta`
    ///
    /// `delta` is cleared first so callers can reuse one buffer across cycles.
    /// Listeners are only invoked when the delta is non-empty. A listener that
    /// fails or panics is logged and the remaining listeners still run.
    /// Returns the number of lines in the delta.
    pub fn update_listeners(&self, delta: &mut SourceCounts) -> usize {
        delta.clear();

        let (listeners, changed) = {
            // Held until the drain is done so no other updater can reactivate
            // the frozen generation. The flip waits on in-flight writers and
            // must not hold the state lock that registration takes.
            let reader = self.phaser.reader_lock();
            let frozen = self.active.load(Ordering::SeqCst);
            self.active.store(frozen ^ 1, Ordering::SeqCst);
            self.phaser.flip_phase(&reader);

            let mut state = self.lock_state();
            let mut changed = 0;
            let registered = self.registered.load(Ordering::Acquire) as usize;
            let identity = self.identity.read().unwrap_or_else(PoisonError::into_inner);
            let generation = &self.generations[frozen];
            for slot in 0..registered {
                let Some(counter) = generation.counter(slot) else {
                    continue;
                };
                if counter.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                let count = counter.swap(0, Ordering::Relaxed);
                let (path, line) = &identity.lines[slot];
                add_count(delta, path, *line, count);
                add_count(&mut state.accumulated, path, *line, count);
                changed += 1;
            }

            (state.listeners.clone(), changed)
        };

        trace!(
            lines = changed,
            listeners = listeners.len(),
            "registry update cycle"
        );

        if delta.is_empty() {
            return 0;
        }

        for listener in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_delta(delta))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Delta listener failed, continuing fan-out"),
                Err(_) => warn!("Delta listener panicked, continuing fan-out"),
            }
        }

        changed
    }

    /// Register `listener` and return the accumulated totals as of the same
    /// instant
    ///
    /// The listener receives every delta folded after the snapshot and none
    /// folded before it.
    pub fn current_snapshot(&self, listener: Arc<dyn DeltaListener>) -> SourceCounts {
        let mut state = self.lock_state();
        state.listeners.push(listener);
        state.accumulated.clone()
    }

    /// Remove a listener; returns whether it was registered
    pub fn unregister_listener(&self, listener: &Arc<dyn DeltaListener>) -> bool {
        let mut state = self.lock_state();
        let before = state.listeners.len();
        state
            .listeners
            .retain(|registered| !same_listener(registered, listener));
        state.listeners.len() != before
    }

    /// Accumulated totals as of the last update cycle
    pub fn accumulated(&self) -> SourceCounts {
        self.lock_state().accumulated.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.lock_state().listeners.len()
    }

    pub fn line_index(&self, path: &str, line: u32) -> Option<LineIndex> {
        let identity = self.identity.read().unwrap_or_else(PoisonError::into_inner);
        identity.by_line.get(path)?.get(&line).copied()
    }

    /// (source path, line) for a registered index
    pub fn line_identity(&self, index: LineIndex) -> Option<(String, u32)> {
        let identity = self.identity.read().unwrap_or_else(PoisonError::into_inner);
        identity
            .lines
            .get(index.0 as usize)
            .map(|(path, line)| (path.to_string(), *line))
    }

    /// Number of registered lines
    pub fn line_count(&self) -> usize {
        self.registered.load(Ordering::Acquire) as usize
    }

    /// Handle for a registered index
    pub fn counter(self: &Arc<Self>, index: LineIndex) -> LineCounter {
        LineCounter {
            registry: Arc::clone(self),
            index,
        }
    }

    /// Resolve a dynamically linked call site to the counter of its line
    ///
    /// Returns `None` if the line was never registered.
    pub fn bootstrap(self: &Arc<Self>, path: &str, line: u32) -> Option<LineCounter> {
        self.line_index(path, line).map(|index| self.counter(index))
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("lines", &self.line_count())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Bound handle to one line's counter
#[derive(Clone)]
pub struct LineCounter {
    registry: Arc<Registry>,
    index: LineIndex,
}

impl LineCounter {
    #[inline]
    pub fn increment(&self) {
        self.registry.visit_line(self.index);
    }

    #[inline]
    pub fn add(&self, count: u64) {
        self.registry.add_visits(self.index, count);
    }

    pub fn index(&self) -> LineIndex {
        self.index
    }
}

impl fmt::Debug for LineCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LineCounter").field(&self.index).finish()
    }
}

fn add_count(counts: &mut SourceCounts, path: &str, line: u32, count: u64) {
    let lines = match counts.get_mut(path) {
        Some(lines) => lines,
        None => counts.entry(path.to_string()).or_default(),
    };
    *lines.entry(line).or_insert(0) += count;
}

fn same_listener(a: &Arc<dyn DeltaListener>, b: &Arc<dyn DeltaListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

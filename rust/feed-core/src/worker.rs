// rust/feed-core/src/worker.rs

//! Cancellable background workers.
//!
//! A [`Worker`] owns one OS thread running a caller-supplied body. The body
//! receives a [`StopToken`]; it is expected to check the token at every loop
//! iteration and to block only through interruptible waits (see
//! [`BoundedSyncQueue::pop_interruptible`](crate::queue::BoundedSyncQueue::pop_interruptible)),
//! so that [`Worker::stop`] never deadlocks on an item that will not arrive.
//!
//! A worker started from a thread bound to a device runs bound to that same
//! device, and with a [`ThreadContext`] derived from the starting thread's.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{FeedError, Result};
use crate::memory::device;

/// Solver settings of the calling thread, passed on to the workers it
/// starts.
///
/// A started worker copies `solver_count` and `root_solver` and takes its
/// seed from the starting thread's seed sequence, so a fixed seed on the
/// main thread fixes the seeds of every thread below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    /// Current state of this thread's seed sequence.
    pub seed: u64,
    /// Number of solver replicas training together.
    pub solver_count: usize,
    pub root_solver: bool,
}

thread_local! {
    static CONTEXT: Cell<ThreadContext> = const { Cell::new(ThreadContext::DEFAULT) };
}

impl ThreadContext {
    const DEFAULT: Self = Self {
        seed: 0,
        solver_count: 1,
        root_solver: true,
    };

    /// Returns the calling thread's context.
    pub fn current() -> Self {
        CONTEXT.with(Cell::get)
    }

    /// Makes `self` the calling thread's context until the guard drops.
    pub fn install(self) -> ContextGuard {
        let previous = CONTEXT.with(|context| context.replace(self));
        ContextGuard { previous }
    }

    /// Advances the calling thread's seed sequence and returns the next seed.
    pub fn next_seed() -> u64 {
        CONTEXT.with(|context| {
            let mut current = context.get();
            let seed = splitmix64(&mut current.seed);
            context.set(current);
            seed
        })
    }

    /// Context for a worker started from the calling thread.
    fn for_child() -> Self {
        let seed = Self::next_seed();
        Self {
            seed,
            ..Self::current()
        }
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Restores the previous thread context on drop.
#[must_use = "the context is restored when the guard is dropped"]
pub struct ContextGuard {
    previous: ThreadContext,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CONTEXT.with(|context| context.set(previous));
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Something a blocked thread may be waiting on, which can be woken so the
/// waiter re-checks its stop token.
pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

struct StopState {
    requested: AtomicBool,
    watched: Mutex<Vec<Weak<dyn Interrupt>>>,
}

/// Cooperative cancellation flag shared between a worker and its owner.
#[derive(Clone)]
pub struct StopToken {
    state: Arc<StopState>,
}

impl StopToken {
    /// Creates a token with no stop requested.
    pub fn new() -> Self {
        Self {
            state: Arc::new(StopState {
                requested: AtomicBool::new(false),
                watched: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns true once a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    /// Requests a stop and wakes every wait currently watched by this token.
    pub fn request_stop(&self) {
        self.state.requested.store(true, Ordering::Release);

        let watched: Vec<_> = self.state.watched.lock().iter().filter_map(Weak::upgrade).collect();
        for target in watched {
            target.interrupt();
        }
    }

    /// Registers a wait target so a later stop request wakes it.
    pub(crate) fn watch(&self, target: Weak<dyn Interrupt>) {
        let mut watched = self.state.watched.lock();
        if watched.iter().any(|w| w.ptr_eq(&target)) {
            return;
        }
        watched.retain(|w| w.strong_count() > 0);
        watched.push(target);
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("requested", &self.is_stop_requested())
            .finish()
    }
}

/// A named background thread with start / request-stop / join.
pub struct Worker {
    name: String,
    stop: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates an idle worker. Nothing runs until [`Worker::start`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: StopToken::new(),
            handle: None,
        }
    }

    /// Spawns the worker thread running `body`.
    ///
    /// The thread inherits the device bound to the calling thread and a
    /// [`ThreadContext`] derived from the calling thread's.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is already running or the OS refuses
    /// to spawn the thread.
    pub fn start<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        if self.is_started() {
            return Err(FeedError::config(format!(
                "worker '{}' is already running",
                self.name
            )));
        }

        self.stop = StopToken::new();
        let stop = self.stop.clone();
        let bound_device = device::current();
        let context = ThreadContext::for_child();
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _binding = bound_device.map(device::bind);
                let _context = context.install();
                tracing::debug!(worker = %name, "worker started");
                body(stop);
                tracing::debug!(worker = %name, "worker exited");
            })
            .map_err(|e| FeedError::worker(&self.name, e))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Returns true while the worker thread has been started and not joined.
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns the worker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the worker to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Waits for the worker thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Requests a stop and blocks until the thread has fully exited.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.request_stop();
            self.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Transfer handle - the caller's view of one fetch
//!
//! The engine queues [`TransferEvent`]s on the handle; whoever is entitled to
//! deliver them (an engine worker, or the thread blocked in [`Fetch::wait`])
//! drains the queue under a re-entrant delivery lock, filling in the visible
//! fields right before each callback runs.

use crate::attr::{FetchAttr, FetchCallback, UserData};
use crate::error::{FetchError, OperationError};
use crate::event::TransferEvent;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::any::Any;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handles still waiting for their terminal callback, by id
pub(crate) type Registry = Mutex<HashMap<u32, Fetch>>;

static NEXT_FETCH_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// Set on every thread of an engine runtime
    static ENGINE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as part of an engine's driving context
pub(crate) fn mark_engine_thread() {
    ENGINE_THREAD.with(|flag| flag.set(true));
}

fn on_engine_thread() -> bool {
    ENGINE_THREAD.with(Cell::get)
}

/// Handle to a submitted fetch.
///
/// Clones refer to the same transfer. Fields are filled in for the duration
/// of each callback; after the success callback the body (if it was loaded
/// to memory) and the totals stay readable until [`Fetch::close`], after
/// which every field reads as empty.
#[derive(Clone)]
pub struct Fetch {
    inner: Arc<FetchInner>,
}

struct FetchInner {
    id: u32,
    url: String,
    user_data: Option<UserData>,
    onsuccess: Option<FetchCallback>,
    onerror: Option<FetchCallback>,
    onprogress: Option<FetchCallback>,
    state: Mutex<HandleState>,
    changed: Condvar,
    delivery: ReentrantMutex<()>,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Terminal callback delivered (or being delivered)
    Finished,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deliverer {
    Engine,
    Waiter,
}

struct HandleState {
    phase: Phase,
    queue: VecDeque<TransferEvent>,
    terminal_queued: bool,
    waiters: usize,
    view: FetchView,
}

#[derive(Default)]
struct FetchView {
    data: Option<Bytes>,
    num_bytes: u64,
    data_offset: u64,
    total_bytes: Option<u64>,
    status: u16,
    status_text: String,
    error: Option<Arc<FetchError>>,
}

impl Fetch {
    pub(crate) fn new(attr: &FetchAttr, url: &str, registry: Weak<Registry>) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                id: NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed),
                url: url.to_string(),
                user_data: attr.user_data.clone(),
                onsuccess: attr.onsuccess.clone(),
                onerror: attr.onerror.clone(),
                onprogress: attr.onprogress.clone(),
                state: Mutex::new(HandleState {
                    phase: Phase::Running,
                    queue: VecDeque::new(),
                    terminal_queued: false,
                    waiters: 0,
                    view: FetchView::default(),
                }),
                changed: Condvar::new(),
                delivery: ReentrantMutex::new(()),
                cancel: CancellationToken::new(),
                registry,
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Process-wide unique id, assigned at submission
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn user_data(&self) -> Option<&UserData> {
        self.inner.user_data.as_ref()
    }

    /// User data downcast to its concrete type
    pub fn user_data_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.user_data.as_ref()?.downcast_ref::<T>()
    }

    /// Chunk bytes in a streaming progress callback, or the full body after
    /// success when it was loaded to memory
    pub fn data(&self) -> Option<Bytes> {
        self.inner.state.lock().view.data.clone()
    }

    /// Length of [`Fetch::data`]; in non-streaming progress callbacks the
    /// number of bytes received so far, after success the body size
    pub fn num_bytes(&self) -> u64 {
        self.inner.state.lock().view.num_bytes
    }

    /// Offset of the current chunk within the whole body
    pub fn data_offset(&self) -> u64 {
        self.inner.state.lock().view.data_offset
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.inner.state.lock().view.total_bytes
    }

    /// HTTP status, 0 while unknown
    pub fn status(&self) -> u16 {
        self.inner.state.lock().view.status
    }

    pub fn status_text(&self) -> String {
        self.inner.state.lock().view.status_text.clone()
    }

    /// Failure reason, set for the error callback
    pub fn error(&self) -> Option<Arc<FetchError>> {
        self.inner.state.lock().view.error.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.state.lock().phase != Phase::Running
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Closed
    }

    // ========================================================================
    // Wait / Close
    // ========================================================================

    /// Block until the transfer reaches its terminal callback.
    ///
    /// `None` waits without bound. Callbacks still pending for this handle
    /// run on the calling thread before this returns. Returns
    /// [`OperationError::NotSupported`] when called from an engine thread
    /// (callbacks delivered by the engine included) and
    /// [`OperationError::TimedOut`] when the budget runs out; the transfer
    /// keeps going in that case.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), OperationError> {
        if on_engine_thread() {
            debug!("Refusing to block on fetch {} from an engine thread", self.inner.id);
            return Err(OperationError::NotSupported);
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Err(OperationError::InvalidHandle);
            }
            state.waiters += 1;
        }

        let result = self.wait_for_terminal(deadline);

        let leftover = {
            let mut state = self.inner.state.lock();
            state.waiters -= 1;
            state.phase == Phase::Running && !state.queue.is_empty()
        };
        if leftover {
            self.deliver_pending(Deliverer::Waiter);
        }

        match result {
            Err(OperationError::TimedOut) if self.is_terminal() => Ok(()),
            other => other,
        }
    }

    /// [`Fetch::wait`] with a millisecond budget; infinite, NaN or budgets
    /// too large for a [`Duration`] wait without bound, negative values are
    /// treated as zero
    pub fn wait_ms(&self, timeout_ms: f64) -> Result<(), OperationError> {
        if timeout_ms.is_nan() {
            return self.wait(None);
        }
        match Duration::try_from_secs_f64(timeout_ms.max(0.0) / 1000.0) {
            Ok(timeout) => self.wait(Some(timeout)),
            Err(_) => self.wait(None),
        }
    }

    fn wait_for_terminal(&self, deadline: Option<Instant>) -> Result<(), OperationError> {
        loop {
            self.deliver_pending(Deliverer::Waiter);

            let mut state = self.inner.state.lock();
            if state.phase != Phase::Running {
                drop(state);
                // The terminal callback may still be running on a worker
                drop(self.inner.delivery.lock());
                return Ok(());
            }
            if !state.queue.is_empty() {
                continue;
            }

            match deadline {
                None => self.inner.changed.wait(&mut state),
                Some(deadline) => {
                    let timed_out = self.inner.changed.wait_until(&mut state, deadline).timed_out();
                    if timed_out && state.phase == Phase::Running && state.queue.is_empty() {
                        return Err(OperationError::TimedOut);
                    }
                }
            }
        }
    }

    /// Release the handle.
    ///
    /// If the transfer is still running it is aborted and `onerror` runs on
    /// the calling thread before this returns. Closing twice returns
    /// [`OperationError::InvalidHandle`].
    pub fn close(&self) -> Result<(), OperationError> {
        let _delivery = self.inner.delivery.lock();

        let aborted = {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Closed => return Err(OperationError::InvalidHandle),
                Phase::Finished => false,
                Phase::Running => {
                    state.phase = Phase::Finished;
                    state.queue.clear();
                    state.view.data = None;
                    state.view.data_offset = 0;
                    state.view.error = Some(Arc::new(FetchError::Aborted));
                    state.view.status_text = FetchError::Aborted.to_string();
                    true
                }
            }
        };

        self.inner.cancel.cancel();

        if aborted {
            debug!("Fetch {} closed while in flight", self.inner.id);
            self.unregister();
            self.inner.changed.notify_all();
            if let Some(onerror) = &self.inner.onerror {
                onerror(self);
            }
        }

        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Closed {
                state.phase = Phase::Closed;
                state.queue.clear();
                state.view = FetchView::default();
            }
        }
        self.inner.changed.notify_all();

        trace!("Fetch {} released", self.inner.id);
        Ok(())
    }

    // ========================================================================
    // Engine side
    // ========================================================================

    /// Token cancelled once the handle is closed
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Queue an event and deliver it unless a waiter will.
    ///
    /// Events after the terminal one are dropped.
    pub(crate) fn push_event(&self, event: TransferEvent) {
        let deliver_now = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Running || state.terminal_queued {
                trace!("Dropping event for finished fetch {}", self.inner.id);
                return;
            }
            if event.is_terminal() {
                state.terminal_queued = true;
            }
            state.queue.push_back(event);
            state.waiters == 0
        };
        self.inner.changed.notify_all();

        if deliver_now {
            self.deliver_pending(Deliverer::Engine);
        }
    }

    fn deliver_pending(&self, by: Deliverer) {
        let _delivery = self.inner.delivery.lock();

        loop {
            let (callback, is_progress, is_terminal) = {
                let mut state = self.inner.state.lock();
                // A waiter showed up: leave the rest to its thread
                if by == Deliverer::Engine && state.waiters > 0 {
                    return;
                }
                if state.phase != Phase::Running {
                    state.queue.clear();
                    return;
                }
                let Some(event) = state.queue.pop_front() else {
                    return;
                };

                let is_progress = matches!(event, TransferEvent::Progress { .. });
                let is_terminal = event.is_terminal();
                let callback = match &event {
                    TransferEvent::Progress { .. } => self.inner.onprogress.clone(),
                    TransferEvent::Success { .. } => self.inner.onsuccess.clone(),
                    TransferEvent::Error { .. } => self.inner.onerror.clone(),
                };
                state.apply(event);
                (callback, is_progress, is_terminal)
            };

            if is_terminal {
                self.unregister();
                self.inner.changed.notify_all();
            }

            if let Some(callback) = callback {
                callback(self);
            }

            if is_progress {
                let mut state = self.inner.state.lock();
                if state.phase == Phase::Running {
                    state.view.data = None;
                }
            }
        }
    }

    fn unregister(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.lock().remove(&self.inner.id);
        }
    }
}

impl HandleState {
    fn apply(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                data,
                num_bytes,
                data_offset,
                total_bytes,
                status,
            } => {
                self.view.data = data;
                self.view.num_bytes = num_bytes;
                self.view.data_offset = data_offset;
                self.view.total_bytes = total_bytes;
                self.view.status = status;
            }
            TransferEvent::Success {
                data,
                num_bytes,
                total_bytes,
                status,
                status_text,
            } => {
                self.phase = Phase::Finished;
                self.view.data = data;
                self.view.num_bytes = num_bytes;
                self.view.data_offset = 0;
                self.view.total_bytes = total_bytes;
                self.view.status = status;
                self.view.status_text = status_text;
            }
            TransferEvent::Error {
                error,
                num_bytes,
                total_bytes,
                status,
                status_text,
            } => {
                self.phase = Phase::Finished;
                self.view.data = None;
                self.view.num_bytes = num_bytes;
                self.view.data_offset = 0;
                self.view.total_bytes = total_bytes;
                self.view.status = status;
                self.view.status_text = status_text;
                self.view.error = Some(error);
            }
        }
    }
}

impl fmt::Debug for Fetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Fetch")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("phase", &state.phase)
            .field("num_bytes", &state.view.num_bytes)
            .field("total_bytes", &state.view.total_bytes)
            .field("status", &state.view.status)
            .finish()
    }
}

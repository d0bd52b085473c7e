//! Async reader/writer lock with writer priority and cancellation
//!
//! One of these guards each database name. Waiters park on a `Notify` rather
//! than a thread, and every wait can be abandoned through a
//! `CancellationToken` or by dropping the acquiring future (e.g. under
//! `tokio::time::timeout`).
//!
//! # Admission rules
//! - read: admitted iff no active writer and no queued writer
//! - write: admitted iff no active writer and no active readers
//! - last reader out: grants one queued writer
//! - writer out: grants one queued writer, otherwise every queued reader at once
//!
//! Each queued waiter carries a tri-state flag (pending/granted/cancelled)
//! resolved by compare-and-swap, so a grant racing a cancellation has exactly
//! one winner and the counters never leak.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const PENDING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Lock acquisition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock acquisition was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct Waiter {
    state: AtomicU8,
    notify: Notify,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            notify: Notify::new(),
        })
    }

    /// Pending -> granted; wakes the waiter on success
    fn try_grant(&self) -> bool {
        let granted = self
            .state
            .compare_exchange(PENDING, GRANTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if granted {
            // notify_one stores a permit if the waiter is not parked yet
            self.notify.notify_one();
        }
        granted
    }

    /// Pending -> cancelled
    fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

#[derive(Default)]
struct LockState {
    active_readers: usize,
    active_writer: bool,
    readers: VecDeque<Arc<Waiter>>,
    writers: VecDeque<Arc<Waiter>>,
}

impl LockState {
    fn prune_cancelled_writers(&mut self) {
        while self.writers.front().is_some_and(|w| w.is_cancelled()) {
            self.writers.pop_front();
        }
    }

    /// Hand the lock to whoever is next in line
    fn dispatch(&mut self) {
        if self.active_writer {
            return;
        }
        self.prune_cancelled_writers();

        if !self.writers.is_empty() {
            if self.active_readers > 0 {
                return;
            }
            while let Some(writer) = self.writers.pop_front() {
                if writer.try_grant() {
                    self.active_writer = true;
                    return;
                }
            }
        }

        // No writer waiting: release the whole reader queue as one batch
        while let Some(reader) = self.readers.pop_front() {
            if reader.try_grant() {
                self.active_readers += 1;
            }
        }
    }
}

struct LockInner {
    name: String,
    state: Mutex<LockState>,
}

impl LockInner {
    fn release(&self, mode: Mode) {
        let mut state = self.state.lock();
        match mode {
            Mode::Read => {
                debug_assert!(state.active_readers > 0, "read release without a reader");
                state.active_readers = state.active_readers.saturating_sub(1);
                if state.active_readers == 0 {
                    state.dispatch();
                }
            }
            Mode::Write => {
                debug_assert!(state.active_writer, "write release without a writer");
                state.active_writer = false;
                state.dispatch();
            }
        }
    }

    /// Remove cancelled waiters and let anyone they were blocking through
    fn forget_cancelled(&self, mode: Mode) {
        let mut state = self.state.lock();
        match mode {
            Mode::Read => state.readers.retain(|w| !w.is_cancelled()),
            Mode::Write => state.writers.retain(|w| !w.is_cancelled()),
        }
        state.dispatch();
    }
}

/// Point-in-time view of a lock, for tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    pub active_readers: usize,
    pub active_writer: bool,
    pub queued_readers: usize,
    pub queued_writers: usize,
}

/// Cloneable handle to one async reader/writer lock
#[derive(Clone)]
pub struct AsyncRwLock {
    inner: Arc<LockInner>,
}

impl fmt::Debug for AsyncRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRwLock")
            .field("name", &self.inner.name)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl AsyncRwLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                name: name.into(),
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Acquire shared access
    pub async fn read(&self, cancel: &CancellationToken) -> Result<ReadGuard, LockError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            state.prune_cancelled_writers();
            if !state.active_writer && state.writers.is_empty() {
                state.active_readers += 1;
                return Ok(ReadGuard {
                    inner: Arc::clone(&self.inner),
                });
            }
            let waiter = Waiter::new();
            state.readers.push_back(Arc::clone(&waiter));
            waiter
        };

        trace!(lock = %self.inner.name, "Reader queued");
        self.wait(waiter, Mode::Read, cancel).await?;
        Ok(ReadGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquire exclusive access
    pub async fn write(&self, cancel: &CancellationToken) -> Result<WriteGuard, LockError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if !state.active_writer && state.active_readers == 0 {
                state.active_writer = true;
                return Ok(WriteGuard {
                    inner: Arc::clone(&self.inner),
                });
            }
            let waiter = Waiter::new();
            state.writers.push_back(Arc::clone(&waiter));
            waiter
        };

        trace!(lock = %self.inner.name, "Writer queued");
        self.wait(waiter, Mode::Write, cancel).await?;
        Ok(WriteGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn wait(&self, waiter: Arc<Waiter>, mode: Mode, cancel: &CancellationToken) -> Result<(), LockError> {
        let mut pending = PendingWait {
            inner: Arc::clone(&self.inner),
            waiter: Arc::clone(&waiter),
            mode,
            armed: true,
        };

        tokio::select! {
            biased;
            _ = waiter.notify.notified() => {}
            _ = cancel.cancelled() => {
                if waiter.try_cancel() {
                    pending.armed = false;
                    self.inner.forget_cancelled(mode);
                    return Err(LockError::Cancelled);
                }
                // Lost the race to a grant: the lock is ours, keep it
            }
        }

        pending.armed = false;
        Ok(())
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.inner.state.lock();
        LockSnapshot {
            active_readers: state.active_readers,
            active_writer: state.active_writer,
            queued_readers: state.readers.iter().filter(|w| !w.is_cancelled()).count(),
            queued_writers: state.writers.iter().filter(|w| !w.is_cancelled()).count(),
        }
    }
}

/// Undoes a queued wait whose future was dropped before it resolved
struct PendingWait {
    inner: Arc<LockInner>,
    waiter: Arc<Waiter>,
    mode: Mode,
    armed: bool,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.waiter.try_cancel() {
            self.inner.forget_cancelled(self.mode);
        } else {
            // Granted but never handed out as a guard
            self.inner.release(self.mode);
        }
    }
}

/// Shared access; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    inner: Arc<LockInner>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.inner.release(Mode::Read);
    }
}

/// Exclusive access; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    inner: Arc<LockInner>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.inner.release(Mode::Write);
    }
}

/// Either kind of held lock
pub enum HeldLock {
    Read(ReadGuard),
    Write(WriteGuard),
}

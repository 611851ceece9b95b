use anyhow::{Context, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Something that can be cancelled once scheduled
pub trait Cancel: Send {
    /// Returns true if the timer was still armed
    fn cancel_timer(&mut self) -> bool;
}

/// Owned handle to a scheduled callback. Dropping it cancels the timer.
pub struct TimerHandle {
    inner: Box<dyn Cancel>,
}

impl TimerHandle {
    pub fn new(inner: impl Cancel + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.inner.cancel_timer()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.inner.cancel_timer();
    }
}

/// Timer service running callbacks outside the caller's context.
/// Callbacks must not block.
pub trait TimerService: Send + Sync {
    fn schedule_once(&self, after: Duration, f: Box<dyn FnOnce() + Send>) -> Result<TimerHandle>;
    fn schedule_periodic(&self, period: Duration, f: Box<dyn FnMut() + Send>) -> Result<TimerHandle>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot cancellation flag with an interruptible wait
#[derive(Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true on the first call only
    pub fn cancel(&self) -> bool {
        let mut cancelled = lock(&self.cancelled);
        let first = !*cancelled;
        *cancelled = true;
        self.cv.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    /// Sleep up to `timeout`; returns true if cancelled meanwhile
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.cancelled);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl Cancel for Arc<CancelToken> {
    fn cancel_timer(&mut self) -> bool {
        CancelToken::cancel(self)
    }
}

/// Timer service backed by one std thread per timer
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimers;

impl ThreadTimers {
    pub fn new() -> Self {
        Self
    }
}

impl TimerService for ThreadTimers {
    fn schedule_once(&self, after: Duration, f: Box<dyn FnOnce() + Send>) -> Result<TimerHandle> {
        let token = CancelToken::new();
        let waiter = token.clone();
        thread::Builder::new()
            .name("ota-timer".into())
            .spawn(move || {
                // Claiming the token marks the timer as spent, so a racing
                // cancel either wins or reports that nothing was armed
                if !waiter.wait(after) && waiter.cancel() {
                    f();
                }
            })
            .context("failed to spawn timer thread")?;
        Ok(TimerHandle::new(token))
    }

    fn schedule_periodic(&self, period: Duration, mut f: Box<dyn FnMut() + Send>) -> Result<TimerHandle> {
        let token = CancelToken::new();
        let waiter = token.clone();
        thread::Builder::new()
            .name("ota-timer".into())
            .spawn(move || {
                while !waiter.wait(period) {
                    f();
                }
            })
            .context("failed to spawn timer thread")?;
        Ok(TimerHandle::new(token))
    }
}
